//! Local emulation of the provider JSON COPY
//!
//! Reads JSON records from local files and shapes them into rows for a
//! target table the way the provider load does:
//! - `auto` maps top-level keys to column names, `jsonpaths` maps columns in order
//! - malformed records are counted and skipped up to MAXERROR; one more fails
//!   the whole load and nothing is written
//! - over-width strings are truncated (TRUNCATECOLUMNS) or rejected

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use super::{CopyCommand, JsonMapping, LoadStats, WarehouseError, WarehouseResult};
use crate::schema::{ColumnDef, ColumnType};

/// A single typed cell ready for insertion
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

/// One step of a JSONPath expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parsed JSONPaths file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPaths {
    pub paths: Vec<Vec<PathSegment>>,
}

impl JsonPaths {
    /// Parse the `{"jsonpaths": [...]}` document
    pub fn parse(content: &str) -> Result<Self, String> {
        let doc: Value =
            serde_json::from_str(content).map_err(|e| format!("invalid JSONPaths file: {}", e))?;
        let entries = doc
            .get("jsonpaths")
            .and_then(|v| v.as_array())
            .ok_or_else(|| "JSONPaths file has no \"jsonpaths\" array".to_string())?;

        let paths = entries
            .iter()
            .map(|entry| {
                entry
                    .as_str()
                    .ok_or_else(|| format!("JSONPath entry is not a string: {}", entry))
                    .and_then(parse_json_path)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { paths })
    }

    pub fn from_file(path: &Path) -> WarehouseResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| WarehouseError::Io(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content).map_err(|message| WarehouseError::LoadFailed {
            table: String::new(),
            message,
        })
    }
}

/// Parse one JSONPath expression: `$['a']`, `$["a"]`, `$.a.b`, `$['a'][0]`
pub fn parse_json_path(expr: &str) -> Result<Vec<PathSegment>, String> {
    let rest = expr
        .trim()
        .strip_prefix('$')
        .ok_or_else(|| format!("JSONPath must start with '$': {}", expr))?;
    let chars: Vec<char> = rest.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
                    end += 1;
                }
                if end == start {
                    return Err(format!("empty key in JSONPath: {}", expr));
                }
                segments.push(PathSegment::Key(chars[start..end].iter().collect()));
                i = end;
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|p| p + i)
                    .ok_or_else(|| format!("unclosed bracket in JSONPath: {}", expr))?;
                let inner: String = chars[i + 1..close].iter().collect();
                let inner = inner.trim();
                let quoted = inner.len() >= 2
                    && ((inner.starts_with('\'') && inner.ends_with('\''))
                        || (inner.starts_with('"') && inner.ends_with('"')));
                if quoted {
                    segments.push(PathSegment::Key(inner[1..inner.len() - 1].to_string()));
                } else {
                    let index = inner
                        .parse::<usize>()
                        .map_err(|_| format!("invalid array index in JSONPath: {}", expr))?;
                    segments.push(PathSegment::Index(index));
                }
                i = close + 1;
            }
            other => return Err(format!("unexpected '{}' in JSONPath: {}", other, expr)),
        }
    }

    if segments.is_empty() {
        return Err(format!("JSONPath selects nothing: {}", expr));
    }
    Ok(segments)
}

fn select<'v>(record: &'v Value, path: &[PathSegment]) -> Option<&'v Value> {
    path.iter().try_fold(record, |value, segment| match segment {
        PathSegment::Key(key) => value.get(key.as_str()),
        PathSegment::Index(index) => value.get(*index),
    })
}

/// Files named by a load source: a file, a directory of `*.json`, or a glob
pub fn discover_sources(source: &str) -> WarehouseResult<Vec<PathBuf>> {
    let source = source.trim().trim_matches('\'');
    if source.contains("://") {
        return Err(WarehouseError::Unsupported(format!(
            "local loads read files on disk, not {}",
            source
        )));
    }

    let path = Path::new(source);
    let pattern = if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    } else if path.is_dir() {
        format!("{}/**/*.json", source.trim_end_matches('/'))
    } else {
        source.to_string()
    };

    let entries = glob::glob(&pattern)
        .map_err(|e| WarehouseError::Io(format!("invalid source pattern {}: {}", pattern, e)))?;

    let mut files = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(_) => {}
            Err(e) => warn!("Error accessing path: {}", e),
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(WarehouseError::Io(format!("no files match {}", source)));
    }
    Ok(files)
}

/// Read the records of one file
///
/// A file holding a single JSON object (or an array of objects) yields those
/// records. Anything else is read line by line; each unparseable line becomes
/// an `Err` entry rather than failing the file.
pub fn read_records(path: &Path) -> WarehouseResult<Vec<Result<Value, String>>> {
    let io_err = |e: std::io::Error| WarehouseError::Io(format!("{}: {}", path.display(), e));

    let content = fs::read_to_string(path).map_err(io_err)?;
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Array(items)) => return Ok(items.into_iter().map(Ok).collect()),
        Ok(value @ Value::Object(_)) => return Ok(vec![Ok(value)]),
        _ => {}
    }

    let reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(io_err)?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        records.push(
            serde_json::from_str::<Value>(trimmed)
                .map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e)),
        );
    }
    Ok(records)
}

fn integral(f: f64) -> Option<i64> {
    (f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64).then_some(f as i64)
}

fn coerce_int(value: &Value) -> Result<Option<i64>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().and_then(integral))
            .map(Some)
            .ok_or_else(|| format!("{} is not an integer", n)),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(integral))
                .map(Some)
                .ok_or_else(|| format!("'{}' is not an integer", s))
        }
        other => Err(format!("{} is not an integer", other)),
    }
}

/// Convert a JSON value to the column's type
pub fn coerce(value: &Value, column: &ColumnDef, truncate: bool) -> Result<CellValue, String> {
    let cell = match column.data_type {
        ColumnType::Integer => match coerce_int(value)? {
            Some(i) if i32::try_from(i).is_err() => {
                return Err(format!("{} out of range for INTEGER", i));
            }
            Some(i) => CellValue::Int(i),
            None => CellValue::Null,
        },
        ColumnType::BigInt => coerce_int(value)?.map_or(CellValue::Null, CellValue::Int),
        ColumnType::Double => match value {
            Value::Null => CellValue::Null,
            Value::Number(n) => n
                .as_f64()
                .map(CellValue::Float)
                .ok_or_else(|| format!("{} is not a number", n))?,
            Value::String(s) if s.trim().is_empty() => CellValue::Null,
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(CellValue::Float)
                .map_err(|_| format!("'{}' is not a number", s))?,
            other => return Err(format!("{} is not a number", other)),
        },
        ColumnType::Boolean => match value {
            Value::Null => CellValue::Null,
            Value::Bool(b) => CellValue::Bool(*b),
            Value::Number(n) if n.as_i64() == Some(0) => CellValue::Bool(false),
            Value::Number(n) if n.as_i64() == Some(1) => CellValue::Bool(true),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "" => CellValue::Null,
                "true" | "t" | "1" => CellValue::Bool(true),
                "false" | "f" | "0" => CellValue::Bool(false),
                _ => return Err(format!("'{}' is not a boolean", s)),
            },
            other => return Err(format!("{} is not a boolean", other)),
        },
        ColumnType::Varchar(width) => {
            let text = match value {
                Value::Null => return Ok(CellValue::Null),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            CellValue::Text(fit_width(text, width as usize, truncate, column.name)?)
        }
        ColumnType::Timestamp => match value {
            Value::Null => CellValue::Null,
            Value::String(s) => CellValue::Text(s.clone()),
            Value::Number(n) => n
                .as_i64()
                .map(CellValue::Int)
                .ok_or_else(|| format!("{} is not a timestamp", n))?,
            other => return Err(format!("{} is not a timestamp", other)),
        },
    };

    if cell == CellValue::Null && !column.nullable {
        return Err(format!("NULL in NOT NULL column {}", column.name));
    }
    Ok(cell)
}

/// Enforce a byte width, cutting on a char boundary when truncation is on
fn fit_width(
    mut text: String,
    width: usize,
    truncate: bool,
    column: &str,
) -> Result<String, String> {
    if text.len() <= width {
        return Ok(text);
    }
    if !truncate {
        return Err(format!(
            "value of {} bytes exceeds VARCHAR({}) for {}",
            text.len(),
            width,
            column
        ));
    }
    let mut cut = width;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    Ok(text)
}

fn map_record(
    record: &Value,
    columns: &[ColumnDef],
    paths: Option<&JsonPaths>,
    truncate: bool,
) -> Result<Vec<CellValue>, String> {
    if !record.is_object() {
        return Err(format!("record is not a JSON object: {}", record));
    }

    columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let value = match paths {
                Some(paths) => select(record, &paths.paths[i]),
                None => record.get(column.name),
            };
            coerce(value.unwrap_or(&Value::Null), column, truncate)
                .map_err(|e| format!("column {}: {}", column.name, e))
        })
        .collect()
}

/// Rows shaped for one table, plus the load statistics
#[derive(Debug)]
pub struct PreparedLoad {
    pub rows: Vec<Vec<CellValue>>,
    pub stats: LoadStats,
}

/// Read and shape every record a COPY names
///
/// Fails with [`WarehouseError::TooManyLoadErrors`] when the malformed
/// records exceed the command's MAXERROR (zero when unset).
pub fn prepare(copy: &CopyCommand) -> WarehouseResult<PreparedLoad> {
    let table = copy.table;
    let mut stats = LoadStats::new(table.name);

    let paths = match &copy.mapping {
        JsonMapping::Auto => None,
        JsonMapping::Paths(location) => {
            let location = location.trim().trim_matches('\'');
            if location.contains("://") {
                return Err(WarehouseError::Unsupported(format!(
                    "local loads read JSONPaths from disk, not {}",
                    location
                )));
            }
            let paths = JsonPaths::from_file(Path::new(location)).map_err(|e| match e {
                WarehouseError::LoadFailed { message, .. } => WarehouseError::LoadFailed {
                    table: table.name.to_string(),
                    message,
                },
                other => other,
            })?;
            if paths.paths.len() != table.columns.len() {
                return Err(WarehouseError::LoadFailed {
                    table: table.name.to_string(),
                    message: format!(
                        "JSONPaths has {} entries but {} has {} columns",
                        paths.paths.len(),
                        table.name,
                        table.columns.len()
                    ),
                });
            }
            Some(paths)
        }
    };

    let files = discover_sources(&copy.source)?;
    let mut rows = Vec::new();

    for file in &files {
        debug!(table = table.name, file = %file.display(), "reading load source");
        for record in read_records(file)? {
            let row = record
                .and_then(|r| map_record(&r, table.columns, paths.as_ref(), copy.truncate_columns));
            match row {
                Ok(row) => rows.push(row),
                Err(e) => stats.add_error(format!("{}: {}", file.display(), e)),
            }
        }
    }
    stats.files = files.len();

    // MAXERROR is an inclusive allowance here: exactly max_errors rejected
    // records still load, one more fails. Redshift may count differently at the limit.
    let max_errors = copy.max_errors.unwrap_or(0);
    if stats.errors > max_errors as usize {
        return Err(WarehouseError::TooManyLoadErrors {
            table: table.name.to_string(),
            errors: stats.errors,
            max_errors,
        });
    }
    if stats.errors > 0 {
        warn!(
            table = table.name,
            errors = stats.errors,
            max_errors,
            "skipped malformed records"
        );
    }

    stats.rows_loaded = rows.len() as u64;
    Ok(PreparedLoad { rows, stats })
}
