//! Star schema population
//!
//! Five INSERT ... SELECT statements, each reading staging and writing one
//! target table. None of them reads another target table, so their order
//! carries no referential dependency.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{PipelineError, PipelineResult};
use crate::schema::{ARTISTS, SONGPLAYS, SONGS, TIME, TableDef, USERS};
use crate::warehouse::{Dialect, Warehouse};

/// Page value of a track play event
pub const NEXT_SONG_PAGE: &str = "NextSong";

/// Rows written into one target table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertStats {
    pub table: String,
    pub rows: u64,
}

/// Plays matched exactly on (title, artist name) against the catalog
///
/// The catalog is reduced to one song per (title, artist name), lowest
/// song_id first, so a play yields exactly one fact row. Unmatched plays
/// are dropped.
pub fn songplays_insert_sql(dialect: Dialect) -> String {
    format!(
        r#"INSERT INTO songplays (songplay_id, start_time, user_id, level, song_id, artist_id, session_id, location, user_agent)
SELECT ROW_NUMBER() OVER (ORDER BY e.ts, e.session_id, e.item_in_session, e.user_id) AS songplay_id,
       {start_time} AS start_time,
       e.user_id, e.level, s.song_id, s.artist_id, e.session_id, e.location, e.user_agent
FROM staging_events e
JOIN (
    SELECT song_id, artist_id, title, artist_name,
           ROW_NUMBER() OVER (PARTITION BY title, artist_name ORDER BY song_id) AS catalog_rank
    FROM staging_songs
    WHERE song_id IS NOT NULL
) s ON e.song = s.title AND e.artist = s.artist_name AND s.catalog_rank = 1
WHERE e.page = '{page}' AND e.ts IS NOT NULL"#,
        start_time = dialect.epoch_ms_to_timestamp("e.ts"),
        page = NEXT_SONG_PAGE,
    )
}

/// Latest observed profile per user: greatest ts, then session and item
pub fn users_insert_sql(_dialect: Dialect) -> String {
    r#"INSERT INTO users (user_id, first_name, last_name, gender, level)
SELECT user_id, first_name, last_name, gender, level
FROM (
    SELECT user_id, first_name, last_name, gender, level,
           ROW_NUMBER() OVER (
               PARTITION BY user_id
               ORDER BY ts DESC NULLS LAST, session_id DESC NULLS LAST, item_in_session DESC NULLS LAST
           ) AS recency
    FROM staging_events
    WHERE user_id IS NOT NULL
) latest
WHERE recency = 1"#
        .to_string()
}

/// Catalog passthrough
///
/// Catalog records without a song_id have no key to store under and are
/// skipped, here and in the fact join.
pub fn songs_insert_sql(_dialect: Dialect) -> String {
    r#"INSERT INTO songs (song_id, title, artist_id, year, duration)
SELECT song_id, title, artist_id, year, duration
FROM staging_songs
WHERE song_id IS NOT NULL"#
        .to_string()
}

/// Artist attributes from the most recent release year, lowest song_id on ties
pub fn artists_insert_sql(_dialect: Dialect) -> String {
    r#"INSERT INTO artists (artist_id, name, location, latitude, longitude)
SELECT artist_id, artist_name, artist_location, artist_latitude, artist_longitude
FROM (
    SELECT artist_id, artist_name, artist_location, artist_latitude, artist_longitude,
           ROW_NUMBER() OVER (
               PARTITION BY artist_id
               ORDER BY year DESC NULLS LAST, song_id ASC
           ) AS release_rank
    FROM staging_songs
    WHERE artist_id IS NOT NULL
) ranked
WHERE release_rank = 1"#
        .to_string()
}

/// Calendar fields for each distinct play timestamp
///
/// Uses the same conversion and filter as the fact insert, so every fact
/// start_time has a time row. Day of week numbering starts at 0 = Sunday.
pub fn time_insert_sql(dialect: Dialect) -> String {
    format!(
        r#"INSERT INTO "time" (start_time, hour, day, week, month, year, weekday)
SELECT start_time,
       EXTRACT(hour FROM start_time),
       EXTRACT(day FROM start_time),
       EXTRACT(week FROM start_time),
       EXTRACT(month FROM start_time),
       EXTRACT(year FROM start_time),
       EXTRACT(dow FROM start_time) BETWEEN 1 AND 5
FROM (
    SELECT DISTINCT {start_time} AS start_time
    FROM staging_events
    WHERE page = '{page}' AND ts IS NOT NULL
) plays"#,
        start_time = dialect.epoch_ms_to_timestamp("ts"),
        page = NEXT_SONG_PAGE,
    )
}

type InsertBuilder = fn(Dialect) -> String;

/// Inserts in execution order
pub const INSERT_STEPS: [(&TableDef, InsertBuilder); 5] = [
    (&SONGPLAYS, songplays_insert_sql),
    (&USERS, users_insert_sql),
    (&SONGS, songs_insert_sql),
    (&ARTISTS, artists_insert_sql),
    (&TIME, time_insert_sql),
];

/// Populates the fact and dimension tables from staging
pub struct Transformer<'a, W: Warehouse + ?Sized> {
    warehouse: &'a W,
}

impl<'a, W: Warehouse + ?Sized> Transformer<'a, W> {
    pub fn new(warehouse: &'a W) -> Self {
        Self { warehouse }
    }

    /// Run the five inserts; the first failure aborts
    pub async fn populate_star_schema(&self) -> PipelineResult<Vec<InsertStats>> {
        let dialect = self.warehouse.dialect();
        let mut stats = Vec::with_capacity(INSERT_STEPS.len());

        for (table, build) in INSERT_STEPS {
            let sql = build(dialect);
            debug!(table = table.name, %sql, "inserting");
            let rows = self
                .warehouse
                .execute(&sql)
                .await
                .map_err(|source| PipelineError::Transform {
                    table: table.name,
                    source,
                })?;
            info!(table = table.name, rows, "table populated");
            stats.push(InsertStats {
                table: table.name.to_string(),
                rows,
            });
        }

        Ok(stats)
    }
}
