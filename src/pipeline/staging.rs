//! Staging bulk loads
//!
//! Two loads land the raw JSON into the staging tables. Each commits on its
//! own, so a failed songs load leaves the events load in place.

use tracing::info;

use super::{PipelineError, PipelineResult};
use crate::config::{ConfigError, LoadSection, WarehouseConfig};
use crate::schema::{STAGING_EVENTS, STAGING_SONGS};
use crate::warehouse::{BackendKind, CopyCommand, LoadStats, Warehouse};

/// Where the staging loads read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingSources {
    pub log_data: String,
    pub song_data: String,
    pub log_jsonpath: String,
    /// Role the warehouse assumes to read object storage
    pub iam_role: Option<String>,
    /// Region of the song catalog bucket
    pub region: Option<String>,
}

impl StagingSources {
    /// Object storage inputs from `[s3]`, read with the provisioned role
    pub fn s3(config: &WarehouseConfig) -> PipelineResult<Self> {
        let required = [
            ("s3.log_data", &config.s3.log_data),
            ("s3.song_data", &config.s3.song_data),
            ("s3.log_jsonpath", &config.s3.log_jsonpath),
        ];
        if let Some((field, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(ConfigError::MissingField(*field).into());
        }

        Ok(Self {
            log_data: config.s3.log_data.clone(),
            song_data: config.s3.song_data.clone(),
            log_jsonpath: config.s3.log_jsonpath.clone(),
            iam_role: Some(config.role_arn()?.to_string()),
            region: Some(config.aws.region.clone()),
        })
    }

    /// Local file inputs from `[local]`
    pub fn local(config: &WarehouseConfig) -> PipelineResult<Self> {
        let get = |value: &Option<String>, field: &'static str| {
            value
                .clone()
                .filter(|v| !v.trim().is_empty())
                .ok_or(PipelineError::Config(ConfigError::MissingField(field)))
        };

        Ok(Self {
            log_data: get(&config.local.log_data, "local.log_data")?,
            song_data: get(&config.local.song_data, "local.song_data")?,
            log_jsonpath: get(&config.local.log_jsonpath, "local.log_jsonpath")?,
            iam_role: None,
            region: None,
        })
    }

    /// Inputs matching the selected backend
    pub fn for_backend(kind: BackendKind, config: &WarehouseConfig) -> PipelineResult<Self> {
        match kind {
            BackendKind::Redshift => Self::s3(config),
            BackendKind::DuckDb => Self::local(config),
        }
    }
}

/// Issues the two staging bulk loads
pub struct StagingLoader<'a, W: Warehouse + ?Sized> {
    warehouse: &'a W,
    load: &'a LoadSection,
    sources: &'a StagingSources,
}

impl<'a, W: Warehouse + ?Sized> StagingLoader<'a, W> {
    pub fn new(warehouse: &'a W, load: &'a LoadSection, sources: &'a StagingSources) -> Self {
        Self {
            warehouse,
            load,
            sources,
        }
    }

    /// Event log load: JSONPaths layout, tolerating `max_errors` bad records
    pub fn events_copy(&self) -> CopyCommand {
        let mut copy = CopyCommand::new(&STAGING_EVENTS, self.sources.log_data.clone())
            .json_paths(self.sources.log_jsonpath.clone())
            .max_errors(self.load.max_errors);
        if let Some(arn) = &self.sources.iam_role {
            copy = copy.iam_role(arn.clone());
        }
        copy
    }

    /// Song catalog load: automatic mapping with over-width strings truncated
    pub fn songs_copy(&self) -> CopyCommand {
        let mut copy = CopyCommand::new(&STAGING_SONGS, self.sources.song_data.clone())
            .truncate_columns(true)
            .compupdate(self.load.songs_compupdate);
        if let Some(arn) = &self.sources.iam_role {
            copy = copy.iam_role(arn.clone());
        }
        if let Some(region) = &self.sources.region {
            copy = copy.region(region.clone());
        }
        copy
    }

    /// Load both staging tables, events first
    pub async fn load_staging(&self) -> PipelineResult<Vec<LoadStats>> {
        let mut stats = Vec::with_capacity(2);
        for copy in [self.events_copy(), self.songs_copy()] {
            info!(table = copy.table.name, source = %copy.source, "loading staging table");
            let loaded = self
                .warehouse
                .bulk_load(&copy)
                .await
                .map_err(PipelineError::Load)?;
            info!(
                table = copy.table.name,
                rows = loaded.rows_loaded,
                errors = loaded.errors,
                "staging table loaded"
            );
            stats.push(loaded);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::sample_config;
    use crate::warehouse::JsonMapping;
    use crate::warehouse::testing::RecordingWarehouse;

    fn config() -> WarehouseConfig {
        let mut config = WarehouseConfig::parse(sample_config()).unwrap();
        config.iam_role.arn = Some("arn:aws:iam::123456789012:role/redjam".to_string());
        config
    }

    #[test]
    fn test_s3_sources_need_role_arn() {
        let mut config = config();
        config.iam_role.arn = None;
        assert!(matches!(
            StagingSources::s3(&config),
            Err(PipelineError::Config(ConfigError::MissingField("iam_role.arn")))
        ));
    }

    #[test]
    fn test_local_sources_need_paths() {
        let mut config = config();
        assert!(matches!(
            StagingSources::local(&config),
            Err(PipelineError::Config(ConfigError::MissingField("local.log_data")))
        ));

        config.local.log_data = Some("data/log_data".to_string());
        config.local.song_data = Some("data/song_data".to_string());
        config.local.log_jsonpath = Some("data/log_json_path.json".to_string());
        let sources = StagingSources::for_backend(BackendKind::DuckDb, &config).unwrap();
        assert_eq!(sources.song_data, "data/song_data");
        assert!(sources.iam_role.is_none());
    }

    #[test]
    fn test_copy_commands_follow_load_settings() {
        let config = config();
        let sources = StagingSources::s3(&config).unwrap();
        let warehouse = RecordingWarehouse::new();
        let loader = StagingLoader::new(&warehouse, &config.load, &sources);

        let events = loader.events_copy();
        assert_eq!(events.max_errors, Some(250));
        assert_eq!(
            events.mapping,
            JsonMapping::Paths("s3://udacity-dend/log_json_path.json".to_string())
        );
        assert!(!events.truncate_columns);

        let songs = loader.songs_copy();
        assert_eq!(songs.mapping, JsonMapping::Auto);
        assert!(songs.truncate_columns);
        assert_eq!(songs.compupdate, Some(false));
        assert_eq!(songs.region.as_deref(), Some("us-west-2"));
        assert_eq!(songs.max_errors, None);
    }

    #[tokio::test]
    async fn test_events_committed_when_songs_fail() {
        let config = config();
        let sources = StagingSources::s3(&config).unwrap();
        let warehouse = RecordingWarehouse::new();
        warehouse.load_result("staging_songs", Err("timeout".to_string()));

        let loader = StagingLoader::new(&warehouse, &config.load, &sources);
        assert!(loader.load_staging().await.is_err());

        let loads = warehouse.loads.lock().unwrap();
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0].table.name, "staging_events");
    }
}
