//! SQLite storage layer for Aquamon.
//!
//! Two tables: `readings` holds persisted telemetry (timestamps as unix
//! milliseconds so sub-second samples survive the round trip), and
//! `preferences` is the opaque key-value store the alert configuration
//! blob lives in.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::model::{Reading, Severity, StoredReading};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:aquamon.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                ph REAL NOT NULL,
                temp_c REAL,
                do_mg_l REAL NOT NULL,
                fish_health REAL,
                quality_ai REAL,
                status_ai TEXT,
                user_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for efficient time-range queries
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_readings_ts
            ON readings(ts)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a batch of readings. Returns the number persisted.
    pub async fn insert_readings(&self, records: &[StoredReading]) -> anyhow::Result<u64> {
        let mut saved = 0u64;
        for record in records {
            let reading = &record.reading;
            sqlx::query(
                r#"
                INSERT INTO readings (ts, ph, temp_c, do_mg_l, fish_health, quality_ai, status_ai, user_id)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(reading.timestamp.timestamp_millis())
            .bind(reading.ph)
            .bind(reading.temp_c)
            .bind(reading.do_mg_l)
            .bind(reading.fish_health)
            .bind(reading.quality_ai)
            .bind(reading.status_ai.map(severity_text))
            .bind(record.user_id.as_deref())
            .execute(&self.pool)
            .await?;
            saved += 1;
        }
        Ok(saved)
    }

    /// Query readings in `[from, to]`, ascending by timestamp.
    ///
    /// # Arguments
    ///
    /// * `from` / `to` - inclusive time range
    /// * `user_id` - optional per-user filter
    /// * `max` - row cap
    pub async fn query_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        user_id: Option<&str>,
        max: u32,
    ) -> anyhow::Result<Vec<Reading>> {
        let from_ts = from.timestamp_millis();
        let to_ts = to.timestamp_millis();

        let rows = match user_id {
            Some(user) => {
                sqlx::query(
                    r#"
                    SELECT ts, ph, temp_c, do_mg_l, fish_health, quality_ai, status_ai
                    FROM readings
                    WHERE ts >= ? AND ts <= ? AND user_id = ?
                    ORDER BY ts ASC
                    LIMIT ?
                    "#,
                )
                .bind(from_ts)
                .bind(to_ts)
                .bind(user)
                .bind(i64::from(max))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT ts, ph, temp_c, do_mg_l, fish_health, quality_ai, status_ai
                    FROM readings
                    WHERE ts >= ? AND ts <= ?
                    ORDER BY ts ASC
                    LIMIT ?
                    "#,
                )
                .bind(from_ts)
                .bind(to_ts)
                .bind(i64::from(max))
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.iter().map(reading_from_row).collect())
    }

    /// The most recent stored reading, optionally filtered by user.
    pub async fn latest(&self, user_id: Option<&str>) -> anyhow::Result<Option<Reading>> {
        let row = match user_id {
            Some(user) => {
                sqlx::query(
                    r#"
                    SELECT ts, ph, temp_c, do_mg_l, fish_health, quality_ai, status_ai
                    FROM readings
                    WHERE user_id = ?
                    ORDER BY ts DESC
                    LIMIT 1
                    "#,
                )
                .bind(user)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT ts, ph, temp_c, do_mg_l, fish_health, quality_ai, status_ai
                    FROM readings
                    ORDER BY ts DESC
                    LIMIT 1
                    "#,
                )
                .fetch_optional(&self.pool)
                .await?
            }
        };

        Ok(row.as_ref().map(reading_from_row))
    }

    /// Total number of stored readings.
    pub async fn total_count(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as total FROM readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("total"))
    }

    /// Number of readings at or after `since`.
    pub async fn count_since(&self, since: DateTime<Utc>) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as total FROM readings WHERE ts >= ?")
            .bind(since.timestamp_millis())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("total"))
    }

    /// Timestamp of the oldest stored reading, if any.
    pub async fn oldest_timestamp(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MIN(ts) as oldest FROM readings")
            .fetch_one(&self.pool)
            .await?;
        let oldest: Option<i64> = row.get("oldest");
        Ok(oldest.and_then(DateTime::from_timestamp_millis))
    }

    /// Load an opaque preference blob.
    pub async fn load_preference(&self, key: &str) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM preferences WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    /// Save (overwrite) an opaque preference blob.
    pub async fn save_preference(&self, key: &str, value: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO preferences (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn severity_text(severity: Severity) -> &'static str {
    match severity {
        Severity::Good => "good",
        Severity::Average => "average",
        Severity::Alert => "alert",
    }
}

fn severity_from_text(text: &str) -> Option<Severity> {
    match text {
        "good" => Some(Severity::Good),
        "average" => Some(Severity::Average),
        "alert" => Some(Severity::Alert),
        _ => None,
    }
}

fn reading_from_row(row: &SqliteRow) -> Reading {
    let ts: i64 = row.get("ts");
    let status_ai: Option<String> = row.get("status_ai");
    Reading {
        timestamp: DateTime::from_timestamp_millis(ts).unwrap_or_default(),
        ph: row.get("ph"),
        temp_c: row.get("temp_c"),
        do_mg_l: row.get("do_mg_l"),
        fish_health: row.get("fish_health"),
        quality_ai: row.get("quality_ai"),
        status_ai: status_ai.as_deref().and_then(severity_from_text),
    }
}
