//! Run history stored in SQLite

use crate::checker::models::RunResults;
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;

/// Summary of one completed run
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct HistoryRecord {
    pub id: i64,
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub input_file: String,
    pub total_keys: i64,
    pub valid_keys: i64,
    pub invalid_keys: i64,
    pub error_keys: i64,
    pub duration: f64,
    pub avg_speed: f64,
    pub api_endpoint: String,
}

impl HistoryRecord {
    /// Build an unsaved record (id 0) from a finished run
    pub fn from_results(
        session_id: impl Into<String>,
        input_file: impl Into<String>,
        api_endpoint: impl Into<String>,
        results: &RunResults,
    ) -> Self {
        let stats = &results.stats;
        Self {
            id: 0,
            session_id: session_id.into(),
            start_time: stats.start_time,
            end_time: stats.end_time.unwrap_or_else(Utc::now),
            input_file: input_file.into(),
            total_keys: stats.total as i64,
            valid_keys: stats.valid as i64,
            invalid_keys: stats.invalid as i64,
            error_keys: stats.error as i64,
            duration: stats.duration_secs,
            avg_speed: stats.avg_speed,
            api_endpoint: api_endpoint.into(),
        }
    }

    /// Case-insensitive match against the session, input file, endpoint
    /// and start time
    pub fn matches(&self, filter: &str) -> bool {
        let filter = filter.to_lowercase();
        let started = self.start_time.format("%Y-%m-%d %H:%M:%S").to_string();
        [
            self.session_id.as_str(),
            self.input_file.as_str(),
            self.api_endpoint.as_str(),
            started.as_str(),
        ]
        .iter()
        .any(|field| field.to_lowercase().contains(&filter))
    }

    /// Full text report of this run
    pub fn report(&self) -> String {
        format!(
            "=== Key Check History Record ===\n\n\
             Record ID: {}\n\
             Session: {}\n\
             Started: {}\n\
             Finished: {}\n\
             Input file: {}\n\
             Endpoint: {}\n\
             Total keys: {}\n\
             Valid: {}\n\
             Invalid: {}\n\
             Error: {}\n\
             Duration: {:.2} s\n\
             Average speed: {:.1} keys/s\n",
            self.id,
            self.session_id,
            self.start_time.format("%Y-%m-%d %H:%M:%S"),
            self.end_time.format("%Y-%m-%d %H:%M:%S"),
            self.input_file,
            self.api_endpoint,
            self.total_keys,
            self.valid_keys,
            self.invalid_keys,
            self.error_keys,
            self.duration,
            self.avg_speed
        )
    }
}

/// Summary report covering several runs
pub fn history_summary(records: &[HistoryRecord]) -> String {
    let mut out = format!(
        "=== Key Check History Summary ===\n\nTotal records: {}\n\n",
        records.len()
    );
    for record in records {
        out.push_str(&format!(
            "--- Record {} ---\n\
             Time: {}\n\
             Total: {} | Valid: {} | Invalid: {} | Error: {}\n\
             Duration: {:.2}s | Speed: {:.1} keys/s\n\n",
            record.id,
            record.start_time.format("%Y-%m-%d %H:%M:%S"),
            record.total_keys,
            record.valid_keys,
            record.invalid_keys,
            record.error_keys,
            record.duration,
            record.avg_speed
        ));
    }
    out
}

/// History database handle
pub struct HistoryDatabase {
    pool: SqlitePool,
}

impl HistoryDatabase {
    /// Open (creating if needed) the database file at `path`
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every connection would get its own memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL UNIQUE,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                input_file TEXT NOT NULL,
                total_keys INTEGER NOT NULL,
                valid_keys INTEGER NOT NULL,
                invalid_keys INTEGER NOT NULL,
                error_keys INTEGER NOT NULL,
                duration REAL NOT NULL,
                avg_speed REAL NOT NULL,
                api_endpoint TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Store a record, returning its id.
    ///
    /// A session has at most one row: recording the same session again
    /// replaces the earlier summary and keeps its id.
    pub async fn add_record(&self, record: &HistoryRecord) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO history (session_id, start_time, end_time, input_file, total_keys,
                                 valid_keys, invalid_keys, error_keys, duration, avg_speed,
                                 api_endpoint)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                input_file = excluded.input_file,
                total_keys = excluded.total_keys,
                valid_keys = excluded.valid_keys,
                invalid_keys = excluded.invalid_keys,
                error_keys = excluded.error_keys,
                duration = excluded.duration,
                avg_speed = excluded.avg_speed,
                api_endpoint = excluded.api_endpoint
            RETURNING id
            "#,
        )
        .bind(&record.session_id)
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(&record.input_file)
        .bind(record.total_keys)
        .bind(record.valid_keys)
        .bind(record.invalid_keys)
        .bind(record.error_keys)
        .bind(record.duration)
        .bind(record.avg_speed)
        .bind(&record.api_endpoint)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// All records, newest run first
    pub async fn get_all_records(&self) -> Result<Vec<HistoryRecord>> {
        let records = sqlx::query_as::<_, HistoryRecord>(
            "SELECT * FROM history ORDER BY start_time DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn get_record(&self, id: i64) -> Result<Option<HistoryRecord>> {
        let record = sqlx::query_as::<_, HistoryRecord>("SELECT * FROM history WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Delete one record; `false` if it did not exist
    pub async fn delete_record(&self, id: i64) -> Result<bool> {
        let done = sqlx::query("DELETE FROM history WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Delete every record, returning how many were removed
    pub async fn clear(&self) -> Result<u64> {
        let done = sqlx::query("DELETE FROM history")
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}
