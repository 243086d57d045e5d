use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::JournalError;
use crate::store::Journal;
use crate::types::{EventKind, EventRecord, StrategyId};

/// SQLite-backed event journal. `seq` is the insertion order.
pub struct SqliteJournal {
    pool: SqlitePool,
    location: String,
    /// Highest `seq` whose INSERT was acknowledged.
    committed_seq: i64,
    dirty: bool,
}

impl SqliteJournal {
    /// Open (or create) a database file.
    pub async fn open(path: &Path) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect(options, path.display().to_string()).await
    }

    /// Private in-memory database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, JournalError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(options, ":memory:".to_string()).await
    }

    async fn connect(options: SqliteConnectOptions, location: String) -> Result<Self, JournalError> {
        info!("Initializing SQLite event journal at: {}", location);

        // One connection: keeps an in-memory database alive and serialises writers.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let mut journal = Self {
            pool,
            location,
            committed_seq: 0,
            dirty: false,
        };
        journal.create_schema().await?;
        journal.committed_seq = journal.max_seq().await?;
        Ok(journal)
    }

    async fn create_schema(&self) -> Result<(), JournalError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                event TEXT NOT NULL,
                equity TEXT,
                drawdown TEXT,
                order_action TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_events_strategy ON events(strategy_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn max_seq(&self) -> Result<i64, JournalError> {
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) as max_seq FROM events")
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get("max_seq"))
    }
}

#[async_trait]
impl Journal for SqliteJournal {
    async fn append(&mut self, record: &EventRecord) -> Result<(), JournalError> {
        self.discard_pending().await?;

        self.dirty = true;
        let result = sqlx::query(
            r#"
            INSERT INTO events (timestamp, strategy_id, event, equity, drawdown, order_action)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .bind(record.strategy_id.as_str())
        .bind(record.event.as_str())
        .bind(record.equity.map(|e| e.to_string()))
        .bind(record.drawdown.map(|d| d.to_string()))
        .bind(&record.order_action)
        .execute(&self.pool)
        .await?;

        self.committed_seq = result.last_insert_rowid();
        self.dirty = false;
        Ok(())
    }

    async fn load_all(&mut self) -> Result<Vec<EventRecord>, JournalError> {
        let rows = sqlx::query(
            r#"
            SELECT seq, timestamp, strategy_id, event, equity, drawdown, order_action
            FROM events
            ORDER BY seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.get("seq");
            let corrupt = |reason: String| JournalError::Corrupt {
                location: format!("{}#{}", self.location, seq),
                reason,
            };

            let timestamp: String = row.get("timestamp");
            let strategy_id: String = row.get("strategy_id");
            let event: String = row.get("event");

            records.push(EventRecord {
                sequence: 0,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map_err(|e| corrupt(e.to_string()))?
                    .with_timezone(&Utc),
                strategy_id: StrategyId::parse(&strategy_id).map_err(|e| corrupt(e.to_string()))?,
                event: EventKind::from_str(&event).map_err(|e| corrupt(e.to_string()))?,
                equity: parse_decimal(row.get("equity")).map_err(&corrupt)?,
                drawdown: parse_decimal(row.get("drawdown")).map_err(&corrupt)?,
                order_action: row.get("order_action"),
            });
        }

        Ok(records)
    }

    async fn discard_pending(&mut self) -> Result<(), JournalError> {
        if !self.dirty {
            return Ok(());
        }

        // A cancelled INSERT may still have committed.
        let removed = sqlx::query("DELETE FROM events WHERE seq > ?")
            .bind(self.committed_seq)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if removed > 0 {
            debug!("Discarded {} unacknowledged row(s) from {}", removed, self.location);
        }
        self.dirty = false;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), JournalError> {
        // Each INSERT commits on its own; nothing is buffered.
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.location)
    }
}

fn parse_decimal(raw: Option<String>) -> Result<Option<Decimal>, String> {
    raw.map(|s| Decimal::from_str(&s).map_err(|e| format!("invalid decimal '{}': {}", s, e)))
        .transpose()
}
