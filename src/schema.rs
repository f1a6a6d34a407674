//! Star schema table definitions
//!
//! Tables are described as data and rendered to DDL per [`Dialect`]. The
//! fixed order of [`ALL_TABLES`] is the order used for both drop and create:
//! two staging tables followed by the fact table and the four dimensions.
//!
//! Distribution and sort keys are physical-layout metadata. They are emitted
//! for Redshift only and carry no meaning for the transform.

use tracing::{debug, info};

use crate::pipeline::{PipelineError, PipelineResult};
use crate::warehouse::{Dialect, Warehouse};

/// Column data types used by the schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    BigInt,
    /// Variable-length string with a maximum width in bytes
    Varchar(u32),
    Double,
    Timestamp,
    Boolean,
}

impl ColumnType {
    /// Render the type name for a dialect
    pub fn sql(&self, dialect: Dialect) -> String {
        match (self, dialect) {
            (ColumnType::Integer, _) => "INTEGER".to_string(),
            (ColumnType::BigInt, _) => "BIGINT".to_string(),
            (ColumnType::Varchar(width), _) => format!("VARCHAR({})", width),
            (ColumnType::Double, Dialect::Redshift) => "DOUBLE PRECISION".to_string(),
            (ColumnType::Double, Dialect::DuckDb) => "DOUBLE".to_string(),
            (ColumnType::Timestamp, _) => "TIMESTAMP".to_string(),
            (ColumnType::Boolean, _) => "BOOLEAN".to_string(),
        }
    }
}

/// A column definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub data_type: ColumnType,
    pub nullable: bool,
}

const fn col(name: &'static str, data_type: ColumnType) -> ColumnDef {
    ColumnDef {
        name,
        data_type,
        nullable: true,
    }
}

const fn key(name: &'static str, data_type: ColumnType) -> ColumnDef {
    ColumnDef {
        name,
        data_type,
        nullable: false,
    }
}

/// Role of a table in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Staging,
    Fact,
    Dimension,
}

/// Row distribution across cluster nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    /// Full copy on every node
    All,
    /// Round robin
    Even,
    /// Hash on one column
    Key(&'static str),
}

/// A table definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    pub kind: TableKind,
    pub columns: &'static [ColumnDef],
    /// Natural key, unique after the transform (staging tables have none)
    pub natural_key: Option<&'static str>,
    pub distribution: Distribution,
    pub sort_key: Option<&'static str>,
}

/// Names that must be quoted when used as identifiers
const QUOTED_NAMES: &[&str] = &["time", "user", "order"];

/// Quote an identifier when it collides with a keyword
pub fn quote_ident(name: &str) -> String {
    if QUOTED_NAMES.contains(&name) {
        format!("\"{}\"", name)
    } else {
        name.to_string()
    }
}

impl TableDef {
    /// Identifier for use in SQL text
    pub fn ident(&self) -> String {
        quote_ident(self.name)
    }

    /// Look up a column by name
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Comma-separated column list in definition order
    pub fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", self.ident())
    }

    pub fn create_sql(&self, dialect: Dialect) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut line = format!("    {} {}", c.name, c.data_type.sql(dialect));
                if !c.nullable {
                    line.push_str(" NOT NULL");
                }
                if dialect.declares_primary_keys() && self.natural_key == Some(c.name) {
                    line.push_str(" PRIMARY KEY");
                }
                line
            })
            .collect();

        let mut sql = format!("CREATE TABLE {} (\n{}\n)", self.ident(), columns.join(",\n"));

        if dialect.supports_table_attributes() {
            match self.distribution {
                Distribution::All => sql.push_str(" DISTSTYLE ALL"),
                Distribution::Even => sql.push_str(" DISTSTYLE EVEN"),
                Distribution::Key(column) => {
                    sql.push_str(&format!(" DISTSTYLE KEY DISTKEY ({})", column))
                }
            }
            if let Some(column) = self.sort_key {
                sql.push_str(&format!(" SORTKEY ({})", column));
            }
        }

        sql
    }
}

pub const STAGING_EVENTS: TableDef = TableDef {
    name: "staging_events",
    kind: TableKind::Staging,
    // Column order follows the event JSONPaths layout
    columns: &[
        col("artist", ColumnType::Varchar(512)),
        col("auth", ColumnType::Varchar(32)),
        col("first_name", ColumnType::Varchar(64)),
        col("gender", ColumnType::Varchar(8)),
        col("item_in_session", ColumnType::Integer),
        col("last_name", ColumnType::Varchar(64)),
        col("length", ColumnType::Double),
        col("level", ColumnType::Varchar(16)),
        col("location", ColumnType::Varchar(256)),
        col("method", ColumnType::Varchar(16)),
        col("page", ColumnType::Varchar(32)),
        col("registration", ColumnType::Double),
        col("session_id", ColumnType::Integer),
        col("song", ColumnType::Varchar(512)),
        col("status", ColumnType::Integer),
        col("ts", ColumnType::BigInt),
        col("user_agent", ColumnType::Varchar(512)),
        col("user_id", ColumnType::Integer),
    ],
    natural_key: None,
    distribution: Distribution::Even,
    sort_key: None,
};

pub const STAGING_SONGS: TableDef = TableDef {
    name: "staging_songs",
    kind: TableKind::Staging,
    columns: &[
        col("num_songs", ColumnType::Integer),
        col("artist_id", ColumnType::Varchar(32)),
        col("artist_latitude", ColumnType::Double),
        col("artist_longitude", ColumnType::Double),
        col("artist_location", ColumnType::Varchar(512)),
        col("artist_name", ColumnType::Varchar(512)),
        col("song_id", ColumnType::Varchar(32)),
        col("title", ColumnType::Varchar(512)),
        col("duration", ColumnType::Double),
        col("year", ColumnType::Integer),
    ],
    natural_key: None,
    distribution: Distribution::Even,
    sort_key: None,
};

pub const SONGPLAYS: TableDef = TableDef {
    name: "songplays",
    kind: TableKind::Fact,
    columns: &[
        key("songplay_id", ColumnType::BigInt),
        key("start_time", ColumnType::Timestamp),
        col("user_id", ColumnType::Integer),
        col("level", ColumnType::Varchar(16)),
        col("song_id", ColumnType::Varchar(32)),
        col("artist_id", ColumnType::Varchar(32)),
        col("session_id", ColumnType::Integer),
        col("location", ColumnType::Varchar(256)),
        col("user_agent", ColumnType::Varchar(512)),
    ],
    natural_key: Some("songplay_id"),
    distribution: Distribution::Key("song_id"),
    sort_key: Some("start_time"),
};

pub const USERS: TableDef = TableDef {
    name: "users",
    kind: TableKind::Dimension,
    columns: &[
        key("user_id", ColumnType::Integer),
        col("first_name", ColumnType::Varchar(64)),
        col("last_name", ColumnType::Varchar(64)),
        col("gender", ColumnType::Varchar(8)),
        col("level", ColumnType::Varchar(16)),
    ],
    natural_key: Some("user_id"),
    distribution: Distribution::All,
    sort_key: Some("user_id"),
};

pub const SONGS: TableDef = TableDef {
    name: "songs",
    kind: TableKind::Dimension,
    columns: &[
        key("song_id", ColumnType::Varchar(32)),
        col("title", ColumnType::Varchar(512)),
        col("artist_id", ColumnType::Varchar(32)),
        col("year", ColumnType::Integer),
        col("duration", ColumnType::Double),
    ],
    natural_key: Some("song_id"),
    distribution: Distribution::Key("song_id"),
    sort_key: Some("song_id"),
};

pub const ARTISTS: TableDef = TableDef {
    name: "artists",
    kind: TableKind::Dimension,
    columns: &[
        key("artist_id", ColumnType::Varchar(32)),
        col("name", ColumnType::Varchar(512)),
        col("location", ColumnType::Varchar(512)),
        col("latitude", ColumnType::Double),
        col("longitude", ColumnType::Double),
    ],
    natural_key: Some("artist_id"),
    distribution: Distribution::All,
    sort_key: Some("artist_id"),
};

pub const TIME: TableDef = TableDef {
    name: "time",
    kind: TableKind::Dimension,
    columns: &[
        key("start_time", ColumnType::Timestamp),
        col("hour", ColumnType::Integer),
        col("day", ColumnType::Integer),
        col("week", ColumnType::Integer),
        col("month", ColumnType::Integer),
        col("year", ColumnType::Integer),
        col("weekday", ColumnType::Boolean),
    ],
    natural_key: Some("start_time"),
    distribution: Distribution::All,
    sort_key: Some("start_time"),
};

/// Every table in drop/create order
pub const ALL_TABLES: [&TableDef; 7] = [
    &STAGING_EVENTS,
    &STAGING_SONGS,
    &SONGPLAYS,
    &USERS,
    &SONGS,
    &ARTISTS,
    &TIME,
];

/// The five star schema tables, fact first
pub const STAR_TABLES: [&TableDef; 5] = [&SONGPLAYS, &USERS, &SONGS, &ARTISTS, &TIME];

/// Drops and creates the warehouse tables
///
/// Each statement commits on its own. `drop_all` is always safe to repeat;
/// `create_all` fails on a table that already exists, so repeatable setup
/// goes through [`SchemaManager::reset`].
pub struct SchemaManager<'a, W: Warehouse + ?Sized> {
    warehouse: &'a W,
}

impl<'a, W: Warehouse + ?Sized> SchemaManager<'a, W> {
    pub fn new(warehouse: &'a W) -> Self {
        Self { warehouse }
    }

    /// Table names in drop/create order
    pub fn table_names() -> Vec<&'static str> {
        ALL_TABLES.iter().map(|t| t.name).collect()
    }

    /// Drop every table that exists
    pub async fn drop_all(&self) -> PipelineResult<()> {
        for table in ALL_TABLES {
            let sql = table.drop_sql();
            debug!(table = table.name, %sql, "dropping table");
            self.warehouse
                .execute(&sql)
                .await
                .map_err(|source| PipelineError::Schema {
                    table: table.name,
                    source,
                })?;
        }
        info!(tables = ALL_TABLES.len(), "dropped tables");
        Ok(())
    }

    /// Create every table
    pub async fn create_all(&self) -> PipelineResult<()> {
        let dialect = self.warehouse.dialect();
        for table in ALL_TABLES {
            let sql = table.create_sql(dialect);
            debug!(table = table.name, %sql, "creating table");
            self.warehouse
                .execute(&sql)
                .await
                .map_err(|source| PipelineError::Schema {
                    table: table.name,
                    source,
                })?;
        }
        info!(tables = ALL_TABLES.len(), %dialect, "created tables");
        Ok(())
    }

    /// Drop then create, leaving an empty schema
    pub async fn reset(&self) -> PipelineResult<()> {
        self.drop_all().await?;
        self.create_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::testing::RecordingWarehouse;

    #[test]
    fn test_table_order() {
        assert_eq!(
            SchemaManager::<RecordingWarehouse>::table_names(),
            vec![
                "staging_events",
                "staging_songs",
                "songplays",
                "users",
                "songs",
                "artists",
                "time"
            ]
        );
    }

    #[test]
    fn test_redshift_ddl_carries_layout() {
        let sql = SONGPLAYS.create_sql(Dialect::Redshift);
        assert!(sql.starts_with("CREATE TABLE songplays ("));
        assert!(sql.contains("songplay_id BIGINT NOT NULL PRIMARY KEY"));
        assert!(sql.contains("start_time TIMESTAMP NOT NULL,"));
        assert!(sql.contains("user_id INTEGER,"));
        assert!(sql.ends_with("DISTSTYLE KEY DISTKEY (song_id) SORTKEY (start_time)"));

        let sql = USERS.create_sql(Dialect::Redshift);
        assert!(sql.contains("DISTSTYLE ALL"));
    }

    #[test]
    fn test_duckdb_ddl_is_plain() {
        let sql = ARTISTS.create_sql(Dialect::DuckDb);
        assert!(sql.contains("artist_id VARCHAR(32) NOT NULL,"));
        assert!(sql.contains("latitude DOUBLE,"));
        assert!(!sql.contains("PRIMARY KEY"));
        assert!(!sql.contains("DIST"));
        assert!(!sql.contains("SORTKEY"));
    }

    #[test]
    fn test_time_table_is_quoted() {
        assert_eq!(TIME.drop_sql(), "DROP TABLE IF EXISTS \"time\"");
        assert!(TIME.create_sql(Dialect::DuckDb).starts_with("CREATE TABLE \"time\" ("));
        assert!(TIME.create_sql(Dialect::DuckDb).contains("weekday BOOLEAN"));
    }

    #[test]
    fn test_every_star_table_has_a_natural_key_column() {
        for table in STAR_TABLES {
            let key = table.natural_key.expect("star tables have natural keys");
            let column = table.column(key).expect("key column exists");
            assert!(!column.nullable, "{}.{} should be NOT NULL", table.name, key);
        }
        assert!(STAGING_EVENTS.natural_key.is_none());
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let warehouse = RecordingWarehouse::new();
        let schema = SchemaManager::new(&warehouse);

        schema.create_all().await.unwrap();
        let err = schema.create_all().await.unwrap_err();
        match err {
            PipelineError::Schema { table, .. } => assert_eq!(table, "staging_events"),
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let warehouse = RecordingWarehouse::new();
        let schema = SchemaManager::new(&warehouse);

        schema.reset().await.unwrap();
        schema.reset().await.unwrap();

        assert_eq!(warehouse.tables().len(), 7);
        let statements = warehouse.statements();
        assert_eq!(statements.len(), 28);
        assert!(statements[0].starts_with("DROP TABLE IF EXISTS staging_events"));
        assert!(statements[7].starts_with("CREATE TABLE staging_events"));
    }

    #[tokio::test]
    async fn test_drop_failure_aborts() {
        let warehouse = RecordingWarehouse::new();
        warehouse.fail_on("DROP TABLE IF EXISTS users");
        let schema = SchemaManager::new(&warehouse);

        assert!(schema.drop_all().await.is_err());
        // songplays was dropped before users failed; nothing after users ran
        assert_eq!(warehouse.statements().len(), 4);
    }
}
