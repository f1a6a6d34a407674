//! Post-transform checks on the star schema

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{PipelineError, PipelineResult};
use crate::schema::{SONGPLAYS, STAR_TABLES, TIME, TableDef};
use crate::warehouse::{QueryResult, Warehouse};

/// Counts for one star schema table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableQuality {
    pub table: String,
    pub natural_key: String,
    pub row_count: u64,
    /// Natural key values present more than once
    pub duplicate_keys: u64,
}

/// Quality report over the star schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityReport {
    pub tables: Vec<TableQuality>,
    /// Facts whose start_time has no row in the time dimension
    pub facts_without_time: u64,
}

impl QualityReport {
    /// Row count for a table, if it was checked
    pub fn row_count(&self, table: &str) -> Option<u64> {
        self.tables
            .iter()
            .find(|t| t.table == table)
            .map(|t| t.row_count)
    }

    pub fn is_clean(&self) -> bool {
        self.facts_without_time == 0 && self.tables.iter().all(|t| t.duplicate_keys == 0)
    }

    /// Fail on the first table holding a duplicated natural key
    pub fn ensure_unique_keys(&self) -> PipelineResult<()> {
        for (quality, table) in self.tables.iter().zip(STAR_TABLES) {
            if quality.duplicate_keys > 0 {
                return Err(PipelineError::DuplicateKeys {
                    table: table.name,
                    key: table.natural_key.unwrap_or_default(),
                    duplicates: quality.duplicate_keys,
                });
            }
        }
        Ok(())
    }

    /// Tabular view for CLI output
    pub fn to_query_result(&self) -> QueryResult {
        let rows = self
            .tables
            .iter()
            .map(|t| {
                serde_json::json!({
                    "table": t.table,
                    "natural_key": t.natural_key,
                    "row_count": t.row_count,
                    "duplicate_keys": t.duplicate_keys,
                })
            })
            .collect();
        QueryResult::new(
            vec![
                "table".to_string(),
                "natural_key".to_string(),
                "row_count".to_string(),
                "duplicate_keys".to_string(),
            ],
            rows,
        )
    }
}

async fn count<W: Warehouse + ?Sized>(
    warehouse: &W,
    table: &'static TableDef,
    sql: &str,
    column: &str,
) -> PipelineResult<u64> {
    let result = warehouse
        .query(sql)
        .await
        .map_err(|source| PipelineError::Verify {
            table: table.name,
            source,
        })?;
    Ok(result.first_u64(column).unwrap_or(0))
}

/// Count rows and duplicated natural keys in every star table
pub async fn verify_star_schema<W: Warehouse + ?Sized>(
    warehouse: &W,
) -> PipelineResult<QualityReport> {
    let mut tables = Vec::with_capacity(STAR_TABLES.len());

    for table in STAR_TABLES {
        let key = table.natural_key.unwrap_or_default();
        let row_count = count(
            warehouse,
            table,
            &format!("SELECT COUNT(*) AS row_count FROM {}", table.ident()),
            "row_count",
        )
        .await?;
        let duplicate_keys = count(
            warehouse,
            table,
            &format!(
                "SELECT COUNT(*) AS duplicate_keys FROM (SELECT {key} FROM {table} GROUP BY {key} HAVING COUNT(*) > 1) dup",
                key = key,
                table = table.ident()
            ),
            "duplicate_keys",
        )
        .await?;

        if duplicate_keys > 0 {
            warn!(table = table.name, key, duplicate_keys, "duplicated natural keys");
        }
        tables.push(TableQuality {
            table: table.name.to_string(),
            natural_key: key.to_string(),
            row_count,
            duplicate_keys,
        });
    }

    let facts_without_time = count(
        warehouse,
        &SONGPLAYS,
        &format!(
            "SELECT COUNT(*) AS orphans FROM {facts} f LEFT JOIN {time} t ON f.start_time = t.start_time WHERE t.start_time IS NULL",
            facts = SONGPLAYS.ident(),
            time = TIME.ident()
        ),
        "orphans",
    )
    .await?;
    if facts_without_time > 0 {
        warn!(facts_without_time, "facts reference timestamps missing from the time dimension");
    }

    let report = QualityReport {
        tables,
        facts_without_time,
    };
    info!(clean = report.is_clean(), "star schema verified");
    Ok(report)
}
