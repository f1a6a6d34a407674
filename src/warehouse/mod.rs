//! Warehouse connection abstraction
//!
//! Every pipeline step runs over one shared [`Warehouse`] connection:
//! - Redshift: the provisioned cluster, reached over the Postgres wire protocol
//! - DuckDB: an embedded database used for local runs and tests
//!
//! SQL that differs between the two is rendered through [`Dialect`]; the
//! provider bulk load is described by a [`CopyCommand`] so that each backend
//! can execute it natively (Redshift) or emulate it over local files (DuckDB).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::schema::TableDef;

#[cfg(feature = "duckdb-backend")]
pub mod duckdb;

#[cfg(feature = "duckdb-backend")]
pub mod local_copy;

#[cfg(feature = "postgres-backend")]
pub mod redshift;

#[cfg(feature = "duckdb-backend")]
pub use self::duckdb::DuckDbWarehouse;

#[cfg(feature = "postgres-backend")]
pub use self::redshift::RedshiftWarehouse;

/// Error type for warehouse operations
#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    /// Failed to connect to the warehouse
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Statement execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Bulk load failed for a reason other than the error threshold
    #[error("Load into {table} failed: {message}")]
    LoadFailed { table: String, message: String },

    /// Bulk load rejected more records than the configured threshold
    #[error("Load into {table} failed: {errors} malformed records exceed the limit of {max_errors}")]
    TooManyLoadErrors {
        table: String,
        errors: usize,
        max_errors: u32,
    },

    /// Operation not available on this backend
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// IO error reading local load sources
    #[error("IO error: {0}")]
    Io(String),
}

/// Result type for warehouse operations
pub type WarehouseResult<T> = Result<T, WarehouseError>;

/// Query result row as a JSON value
pub type QueryRow = serde_json::Value;

/// Query result set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names
    pub columns: Vec<String>,
    /// Rows of data
    pub rows: Vec<QueryRow>,
    /// Number of rows affected (for INSERT/UPDATE/DELETE)
    pub rows_affected: Option<u64>,
    /// Execution time in milliseconds
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Create a new query result
    pub fn new(columns: Vec<String>, rows: Vec<QueryRow>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: None,
            execution_time_ms: 0,
        }
    }

    /// Create an empty result
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// Get the number of rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result is empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Read a non-negative integer from the first row
    ///
    /// Accepts JSON numbers and numeric strings, since wide integer types
    /// come back as strings from some drivers.
    pub fn first_u64(&self, column: &str) -> Option<u64> {
        let value = self.rows.first()?.get(column)?;
        match value {
            serde_json::Value::Number(n) => n.as_u64().or_else(|| {
                n.as_i64()
                    .and_then(|i| u64::try_from(i).ok())
                    .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            }),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// SQL dialect spoken by a warehouse backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Redshift,
    DuckDb,
}

impl Dialect {
    /// Convert an epoch-millisecond expression to a timestamp at whole-second precision
    pub fn epoch_ms_to_timestamp(&self, expr: &str) -> String {
        match self {
            Dialect::Redshift => {
                format!("TIMESTAMP 'epoch' + ({} / 1000) * INTERVAL '1 second'", expr)
            }
            Dialect::DuckDb => format!("epoch_ms(({e}) - (({e}) % 1000))", e = expr),
        }
    }

    /// Whether table DDL carries distribution and sort annotations
    pub fn supports_table_attributes(&self) -> bool {
        matches!(self, Dialect::Redshift)
    }

    /// Whether natural keys are declared as PRIMARY KEY
    ///
    /// Redshift treats the declaration as informational. DuckDB would enforce
    /// it, so it is left off there and uniqueness is checked after the transform.
    pub fn declares_primary_keys(&self) -> bool {
        matches!(self, Dialect::Redshift)
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::Redshift => write!(f, "redshift"),
            Dialect::DuckDb => write!(f, "duckdb"),
        }
    }
}

/// Warehouse backend selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// The provisioned Redshift cluster
    #[default]
    Redshift,
    /// The local DuckDB file from `[local].database`
    DuckDb,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redshift" => Ok(BackendKind::Redshift),
            "duckdb" => Ok(BackendKind::DuckDb),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Redshift => write!(f, "redshift"),
            BackendKind::DuckDb => write!(f, "duckdb"),
        }
    }
}

/// How JSON records map onto the target table's columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonMapping {
    /// Match top-level keys to column names
    Auto,
    /// Map columns in order through a JSONPaths file
    Paths(String),
}

/// A provider bulk load of JSON files into one table
#[derive(Debug, Clone)]
pub struct CopyCommand {
    /// Target table
    pub table: &'static TableDef,
    /// Source prefix, file, directory or glob
    pub source: String,
    /// Role the warehouse assumes to read the source
    pub iam_role: Option<String>,
    /// Region of the source bucket
    pub region: Option<String>,
    /// Record layout
    pub mapping: JsonMapping,
    /// Malformed records tolerated before the load fails
    pub max_errors: Option<u32>,
    /// Truncate over-width strings instead of rejecting the record
    pub truncate_columns: bool,
    /// Explicit COMPUPDATE setting
    pub compupdate: Option<bool>,
}

impl CopyCommand {
    /// Start a load of `source` into `table` with automatic mapping
    pub fn new(table: &'static TableDef, source: impl Into<String>) -> Self {
        Self {
            table,
            source: source.into(),
            iam_role: None,
            region: None,
            mapping: JsonMapping::Auto,
            max_errors: None,
            truncate_columns: false,
            compupdate: None,
        }
    }

    pub fn iam_role(mut self, arn: impl Into<String>) -> Self {
        self.iam_role = Some(arn.into());
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn json_paths(mut self, paths: impl Into<String>) -> Self {
        self.mapping = JsonMapping::Paths(paths.into());
        self
    }

    pub fn max_errors(mut self, max_errors: u32) -> Self {
        self.max_errors = Some(max_errors);
        self
    }

    pub fn truncate_columns(mut self, truncate: bool) -> Self {
        self.truncate_columns = truncate;
        self
    }

    pub fn compupdate(mut self, enabled: bool) -> Self {
        self.compupdate = Some(enabled);
        self
    }

    /// Render the Redshift COPY statement
    pub fn to_sql(&self) -> String {
        let mut sql = format!(
            "COPY {} FROM {}",
            self.table.name,
            quote_literal(&self.source)
        );
        if let Some(arn) = &self.iam_role {
            sql.push_str(&format!(" IAM_ROLE {}", quote_literal(arn)));
        }
        if let Some(enabled) = self.compupdate {
            sql.push_str(if enabled { " COMPUPDATE ON" } else { " COMPUPDATE OFF" });
        }
        if let Some(region) = &self.region {
            sql.push_str(&format!(" REGION {}", quote_literal(region)));
        }
        match &self.mapping {
            JsonMapping::Auto => sql.push_str(" JSON 'auto'"),
            JsonMapping::Paths(paths) => sql.push_str(&format!(" JSON {}", quote_literal(paths))),
        }
        if let Some(max_errors) = self.max_errors {
            sql.push_str(&format!(" MAXERROR AS {}", max_errors));
        }
        if self.truncate_columns {
            sql.push_str(" TRUNCATECOLUMNS");
        }
        sql
    }
}

/// Quote a string literal
///
/// One pair of surrounding quotes is taken as a config-file convention and
/// stripped; every quote left inside is escaped.
pub fn quote_literal(value: &str) -> String {
    let trimmed = value.trim();
    let inner = trimmed
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .unwrap_or(trimmed);
    format!("'{}'", inner.replace('\'', "''"))
}

/// Outcome of one bulk load
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadStats {
    /// Target table
    pub table: String,
    /// Number of source files read (0 when the provider does not report it)
    pub files: usize,
    /// Rows written to the table
    pub rows_loaded: u64,
    /// Malformed records skipped under the error threshold
    pub errors: usize,
    /// Error samples (limited to the first 20)
    pub error_samples: Vec<String>,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl LoadStats {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Record a rejected record
    pub fn add_error(&mut self, error: String) {
        self.errors += 1;
        if self.error_samples.len() < 20 {
            self.error_samples.push(error);
        }
    }
}

/// Warehouse backend trait
///
/// One connection per pipeline run. Every statement commits on its own;
/// there is no transaction scope spanning statements.
#[async_trait(?Send)]
pub trait Warehouse: Send + Sync {
    /// Execute a statement that returns no rows
    ///
    /// # Returns
    /// Number of rows affected
    async fn execute(&self, sql: &str) -> WarehouseResult<u64>;

    /// Execute a query and return its rows
    async fn query(&self, sql: &str) -> WarehouseResult<QueryResult>;

    /// Run a provider bulk load
    async fn bulk_load(&self, copy: &CopyCommand) -> WarehouseResult<LoadStats>;

    /// SQL dialect spoken by this backend
    fn dialect(&self) -> Dialect;

    /// Backend type name ("redshift" or "duckdb")
    fn backend_type(&self) -> &'static str;

    /// Check that the connection is usable
    async fn health_check(&self) -> WarehouseResult<bool> {
        let result = self.query("SELECT 1 AS healthy").await?;
        Ok(!result.is_empty())
    }

    /// Close the connection
    async fn close(&self) -> WarehouseResult<()>;
}

/// Output format for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
    /// CSV format
    Csv,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

/// Format query results for display
pub fn format_query_result(result: &QueryResult, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(&result.rows).unwrap_or_else(|_| "[]".to_string())
        }
        OutputFormat::Csv => format_as_csv(result),
        OutputFormat::Table => format_as_table(result),
    }
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn format_as_csv(result: &QueryResult) -> String {
    let mut output = String::new();

    output.push_str(&result.columns.join(","));
    output.push('\n');

    for row in &result.rows {
        let values: Vec<String> = result
            .columns
            .iter()
            .map(|col| match row.get(col).unwrap_or(&serde_json::Value::Null) {
                serde_json::Value::String(s) => {
                    if s.contains(',') || s.contains('"') || s.contains('\n') {
                        format!("\"{}\"", s.replace('"', "\"\""))
                    } else {
                        s.clone()
                    }
                }
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            })
            .collect();
        output.push_str(&values.join(","));
        output.push('\n');
    }

    output
}

fn format_as_table(result: &QueryResult) -> String {
    if result.is_empty() {
        return "(0 rows)".to_string();
    }

    let cells: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| {
            result
                .columns
                .iter()
                .map(|col| display_value(row.get(col).unwrap_or(&serde_json::Value::Null)))
                .collect()
        })
        .collect();

    let mut widths: Vec<usize> = result.columns.iter().map(|c| c.chars().count()).collect();
    for row in &cells {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let mut output = String::new();

    let header: Vec<String> = result
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{:width$}", c, width = widths[i]))
        .collect();
    output.push_str(&header.join(" | "));
    output.push('\n');

    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    output.push_str(&separator.join("-+-"));
    output.push('\n');

    for row in &cells {
        let values: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{:width$}", s, width = widths[i]))
            .collect();
        output.push_str(&values.join(" | "));
        output.push('\n');
    }

    output.push_str(&format!("({} rows)", result.row_count()));

    output
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording warehouse used by unit tests across the crate

    use super::*;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Mutex;

    /// In-memory warehouse that records statements and tracks table existence
    ///
    /// Understands just enough SQL to model DROP/CREATE idempotence. Query
    /// answers and failures are scripted per statement prefix.
    #[derive(Default)]
    pub struct RecordingWarehouse {
        pub statements: Mutex<Vec<String>>,
        pub loads: Mutex<Vec<CopyCommand>>,
        tables: Mutex<BTreeSet<String>>,
        answers: Mutex<HashMap<String, QueryResult>>,
        failures: Mutex<Vec<String>>,
        load_results: Mutex<HashMap<String, Result<LoadStats, String>>>,
    }

    impl RecordingWarehouse {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail every statement that contains `fragment`
        pub fn fail_on(&self, fragment: &str) {
            self.failures.lock().unwrap().push(fragment.to_string());
        }

        /// Answer queries containing `fragment` with a single-row count
        pub fn answer_count(&self, fragment: &str, column: &str, value: u64) {
            let mut row = serde_json::Map::new();
            row.insert(column.to_string(), serde_json::Value::from(value));
            let result = QueryResult::new(
                vec![column.to_string()],
                vec![serde_json::Value::Object(row)],
            );
            self.answers
                .lock()
                .unwrap()
                .insert(fragment.to_string(), result);
        }

        /// Script the outcome of a bulk load into `table`
        pub fn load_result(&self, table: &str, result: Result<LoadStats, String>) {
            self.load_results
                .lock()
                .unwrap()
                .insert(table.to_string(), result);
        }

        pub fn statements(&self) -> Vec<String> {
            self.statements.lock().unwrap().clone()
        }

        pub fn tables(&self) -> Vec<String> {
            self.tables.lock().unwrap().iter().cloned().collect()
        }

        fn check_failure(&self, sql: &str) -> WarehouseResult<()> {
            let failures = self.failures.lock().unwrap();
            if let Some(fragment) = failures.iter().find(|f| sql.contains(f.as_str())) {
                return Err(WarehouseError::QueryFailed(format!(
                    "injected failure on '{}'",
                    fragment
                )));
            }
            Ok(())
        }

        fn table_name_after(sql: &str, keyword: &str) -> Option<String> {
            let rest = sql.split_once(keyword)?.1.trim_start();
            let name: String = rest
                .trim_start_matches('"')
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            (!name.is_empty()).then_some(name)
        }
    }

    #[async_trait(?Send)]
    impl Warehouse for RecordingWarehouse {
        async fn execute(&self, sql: &str) -> WarehouseResult<u64> {
            self.statements.lock().unwrap().push(sql.to_string());
            self.check_failure(sql)?;

            let mut tables = self.tables.lock().unwrap();
            if let Some(name) = Self::table_name_after(sql, "DROP TABLE IF EXISTS") {
                tables.remove(&name);
            } else if let Some(name) = Self::table_name_after(sql, "CREATE TABLE")
                && !tables.insert(name.clone())
            {
                return Err(WarehouseError::QueryFailed(format!(
                    "relation \"{}\" already exists",
                    name
                )));
            }
            Ok(0)
        }

        async fn query(&self, sql: &str) -> WarehouseResult<QueryResult> {
            self.statements.lock().unwrap().push(sql.to_string());
            self.check_failure(sql)?;
            let answers = self.answers.lock().unwrap();
            Ok(answers
                .iter()
                .find(|(fragment, _)| sql.contains(fragment.as_str()))
                .map(|(_, result)| result.clone())
                .unwrap_or_else(QueryResult::empty))
        }

        async fn bulk_load(&self, copy: &CopyCommand) -> WarehouseResult<LoadStats> {
            self.loads.lock().unwrap().push(copy.clone());
            self.statements.lock().unwrap().push(copy.to_sql());
            match self.load_results.lock().unwrap().get(copy.table.name) {
                Some(Ok(stats)) => Ok(stats.clone()),
                Some(Err(message)) => Err(WarehouseError::LoadFailed {
                    table: copy.table.name.to_string(),
                    message: message.clone(),
                }),
                None => Ok(LoadStats::new(copy.table.name)),
            }
        }

        fn dialect(&self) -> Dialect {
            Dialect::Redshift
        }

        fn backend_type(&self) -> &'static str {
            "recording"
        }

        async fn close(&self) -> WarehouseResult<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{STAGING_EVENTS, STAGING_SONGS};
    use std::str::FromStr;

    #[test]
    fn test_output_format_from_str() {
        assert_eq!(
            OutputFormat::from_str("table").unwrap(),
            OutputFormat::Table
        );
        assert_eq!(OutputFormat::from_str("JSON").unwrap(), OutputFormat::Json);
        assert_eq!(OutputFormat::from_str("csv").unwrap(), OutputFormat::Csv);
        assert!(OutputFormat::from_str("yaml").is_err());
    }

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!(BackendKind::from_str("duckdb").unwrap(), BackendKind::DuckDb);
        assert_eq!(
            BackendKind::from_str("Redshift").unwrap(),
            BackendKind::Redshift
        );
        assert!(BackendKind::from_str("sqlite").is_err());
    }

    #[test]
    fn test_first_u64_accepts_numbers_and_strings() {
        let result = QueryResult::new(
            vec!["n".to_string()],
            vec![serde_json::json!({"n": 42})],
        );
        assert_eq!(result.first_u64("n"), Some(42));

        let result = QueryResult::new(
            vec!["n".to_string()],
            vec![serde_json::json!({"n": "7"})],
        );
        assert_eq!(result.first_u64("n"), Some(7));

        assert_eq!(QueryResult::empty().first_u64("n"), None);
    }

    #[test]
    fn test_events_copy_sql() {
        let copy = CopyCommand::new(&STAGING_EVENTS, "s3://udacity-dend/log_data")
            .iam_role("arn:aws:iam::123456789012:role/redjam")
            .json_paths("s3://udacity-dend/log_json_path.json")
            .max_errors(250);

        assert_eq!(
            copy.to_sql(),
            "COPY staging_events FROM 's3://udacity-dend/log_data' \
             IAM_ROLE 'arn:aws:iam::123456789012:role/redjam' \
             JSON 's3://udacity-dend/log_json_path.json' MAXERROR AS 250"
        );
    }

    #[test]
    fn test_songs_copy_sql() {
        let copy = CopyCommand::new(&STAGING_SONGS, "'s3://udacity-dend/song_data'")
            .iam_role("arn:aws:iam::123456789012:role/redjam")
            .compupdate(false)
            .region("us-west-2")
            .truncate_columns(true);

        let sql = copy.to_sql();
        assert!(sql.starts_with("COPY staging_songs FROM 's3://udacity-dend/song_data' "));
        assert!(sql.contains("COMPUPDATE OFF REGION 'us-west-2' JSON 'auto'"));
        assert!(sql.ends_with("TRUNCATECOLUMNS"));
        assert!(!sql.contains("MAXERROR"));
    }

    #[test]
    fn test_quote_literal_escapes() {
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal("'already'"), "'already'");
        assert_eq!(quote_literal("'s3://bucket/o'brien'"), "'s3://bucket/o''brien'");
        assert_eq!(quote_literal("'x' OR '1'='1'"), "'x'' OR ''1''=''1'");
    }

    #[test]
    fn test_epoch_conversion_per_dialect() {
        assert_eq!(
            Dialect::Redshift.epoch_ms_to_timestamp("e.ts"),
            "TIMESTAMP 'epoch' + (e.ts / 1000) * INTERVAL '1 second'"
        );
        assert_eq!(
            Dialect::DuckDb.epoch_ms_to_timestamp("ts"),
            "epoch_ms((ts) - ((ts) % 1000))"
        );
    }

    #[test]
    fn test_load_stats_caps_samples() {
        let mut stats = LoadStats::new("staging_events");
        for i in 0..30 {
            stats.add_error(format!("bad record {}", i));
        }
        assert_eq!(stats.errors, 30);
        assert_eq!(stats.error_samples.len(), 20);
    }

    #[test]
    fn test_format_as_table() {
        let result = QueryResult::new(
            vec!["table".to_string(), "row_count".to_string()],
            vec![
                serde_json::json!({"table": "users", "row_count": 96}),
                serde_json::json!({"table": "songplays", "row_count": 333}),
            ],
        );

        let output = format_query_result(&result, OutputFormat::Table);
        assert!(output.contains("row_count"));
        assert!(output.contains("songplays"));
        assert!(output.contains("(2 rows)"));
    }

    #[test]
    fn test_format_as_csv() {
        let result = QueryResult::new(
            vec!["key".to_string(), "value".to_string()],
            vec![
                serde_json::json!({"key": "NodeType", "value": "dc2.large"}),
                serde_json::json!({"key": "Endpoint", "value": "host, 5439"}),
            ],
        );

        let output = format_query_result(&result, OutputFormat::Csv);
        assert!(output.contains("key,value"));
        assert!(output.contains("NodeType,dc2.large"));
        assert!(output.contains("\"host, 5439\""));
    }
}
