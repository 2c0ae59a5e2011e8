//! Log consumer and the encrypted log store
//!
//! Structured log events arrive on the `logs.entries.v1` subject, get
//! validated, batched, and written in one transaction per batch by a
//! single writer. The store runs SQLite in WAL mode with
//! `synchronous=FULL`, so a committed batch survives an OS crash and at
//! most one uncommitted batch can be lost. Event payloads are sealed with
//! the store key before they touch disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::BusClient;
use crate::config::{DatabaseConfig, LoggingConfig};
use crate::container::{ComponentHealth, Service};
use crate::crypto::handshake::SessionKey;
use crate::crypto::{Direction, EncryptedPayload, PayloadCipher};
use crate::error::{Error, Result};

/// Subject log events are published on
pub const LOG_SUBJECT: &str = "logs.entries.v1";

const VALID_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// One structured log event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub subsystem: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<serde_json::Map<String, serde_json::Value>>,
}

impl LogEvent {
    pub fn new(
        level: impl Into<String>,
        subsystem: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            level: level.into(),
            subsystem: subsystem.into(),
            message: message.into(),
            extras: None,
        }
    }

    /// Reject events that would poison the store
    pub fn validate(&self) -> Result<()> {
        if !VALID_LEVELS.contains(&self.level.as_str()) {
            return Err(Error::BadPayload {
                pointer: "/level".into(),
                message: format!("unknown level '{}'", self.level),
            });
        }
        if self.subsystem.is_empty() {
            return Err(Error::BadPayload {
                pointer: "/subsystem".into(),
                message: "subsystem must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// Publish a log event onto the bus, best effort
pub async fn publish_log(bus: &BusClient, event: &LogEvent) {
    if let Ok(value) = serde_json::to_value(event) {
        if let Err(e) = bus.publish_json(LOG_SUBJECT, &value).await {
            tracing::warn!(error = %e, "Failed to publish log event");
        }
    }
}

/// Encrypted SQLite store with crash-safe durability settings
pub struct LogStore {
    pool: SqlitePool,
    cipher: PayloadCipher,
}

impl LogStore {
    /// Open (creating if needed) with WAL + synchronous=FULL and the
    /// configured auto-checkpoint threshold
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        let key = Self::store_key(config)?;

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .pragma("wal_autocheckpoint", config.wal_autocheckpoint.to_string());

        // one connection: the store is single-writer by design
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS log_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                level TEXT NOT NULL,
                subsystem TEXT NOT NULL,
                nonce TEXT NOT NULL,
                ciphertext TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            cipher: PayloadCipher::new(&key),
        })
    }

    fn store_key(config: &DatabaseConfig) -> Result<SessionKey> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
        match &config.crypto_key {
            Some(encoded) => {
                let bytes = BASE64.decode(encoded).map_err(|e| {
                    Error::Config(Box::new(figment::Error::from(format!(
                        "database.crypto_key is not valid base64: {}",
                        e
                    ))))
                })?;
                let key: [u8; 32] = bytes.try_into().map_err(|_| {
                    Error::Config(Box::new(figment::Error::from(
                        "database.crypto_key must decode to 32 bytes".to_string(),
                    )))
                })?;
                Ok(SessionKey(key))
            }
            None => {
                tracing::warn!(
                    "database.crypto_key not set; generating an ephemeral store key (events from prior runs will be unreadable)"
                );
                let mut key = [0u8; 32];
                use rand::RngCore;
                rand::rngs::OsRng.fill_bytes(&mut key);
                Ok(SessionKey(key))
            }
        }
    }

    /// Write one batch in a single transaction
    pub async fn write_batch(&self, events: &[LogEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for event in events {
            let sealed = self.seal(event)?;
            sqlx::query(
                "INSERT INTO log_events (timestamp, level, subsystem, nonce, ciphertext) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(event.timestamp.to_rfc3339())
            .bind(&event.level)
            .bind(&event.subsystem)
            .bind(&sealed.nonce)
            .bind(&sealed.ciphertext)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn seal(&self, event: &LogEvent) -> Result<EncryptedPayload> {
        let value = serde_json::to_value(event)?;
        self.cipher.seal_json(&value, LOG_SUBJECT, Direction::S2C)
    }

    /// Number of persisted events
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM log_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Read and decrypt the most recent events, newest first
    pub async fn recent(&self, limit: i64) -> Result<Vec<LogEvent>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT nonce, ciphertext FROM log_events ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for (nonce, ciphertext) in rows {
            let sealed = EncryptedPayload {
                nonce,
                alg: crate::crypto::envelope::ALGORITHM.to_string(),
                ciphertext,
            };
            let value = self
                .cipher
                .open_json(&sealed, LOG_SUBJECT, Direction::S2C)?;
            events.push(serde_json::from_value(value)?);
        }
        Ok(events)
    }

    /// Verify the durability pragmas actually took effect
    pub async fn durability(&self) -> Result<(String, i64)> {
        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        let synchronous: i64 = sqlx::query_scalar("PRAGMA synchronous")
            .fetch_one(&self.pool)
            .await?;
        Ok((journal_mode, synchronous))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Pure service draining the log subject into the store
pub struct LogConsumer {
    bus: BusClient,
    store: Arc<LogStore>,
    batch_size: usize,
    flush_interval: std::time::Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LogConsumer {
    pub fn new(bus: BusClient, store: Arc<LogStore>, config: &LoggingConfig) -> Self {
        Self {
            bus,
            store,
            batch_size: config.batch_size.max(1),
            flush_interval: std::time::Duration::from_millis(config.flush_interval_ms.max(10)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    async fn run(
        bus: BusClient,
        store: Arc<LogStore>,
        batch_size: usize,
        flush_interval: std::time::Duration,
        cancel: CancellationToken,
    ) {
        let mut subscription = bus.subscribe(LOG_SUBJECT);
        let mut batch: Vec<LogEvent> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    Self::flush(&store, &mut batch).await;
                    tracing::debug!("Log consumer stopped");
                    return;
                }
                _ = ticker.tick() => {
                    Self::flush(&store, &mut batch).await;
                }
                message = subscription.next() => {
                    let Some(message) = message else {
                        Self::flush(&store, &mut batch).await;
                        return;
                    };
                    match message
                        .json()
                        .and_then(|v| serde_json::from_value::<LogEvent>(v).map_err(Into::into))
                    {
                        Ok(event) => {
                            if let Err(e) = event.validate() {
                                tracing::warn!(error = %e, "Dropping invalid log event");
                                continue;
                            }
                            batch.push(event);
                            if batch.len() >= batch_size {
                                Self::flush(&store, &mut batch).await;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Dropping unparseable log event");
                        }
                    }
                }
            }
        }
    }

    async fn flush(store: &LogStore, batch: &mut Vec<LogEvent>) {
        if batch.is_empty() {
            return;
        }
        let events = std::mem::take(batch);
        if let Err(e) = store.write_batch(&events).await {
            tracing::error!(error = %e, count = events.len(), "Log batch write failed");
        }
    }
}

#[async_trait::async_trait]
impl Service for LogConsumer {
    async fn start(&self) -> Result<()> {
        let handle = tokio::spawn(Self::run(
            self.bus.clone(),
            self.store.clone(),
            self.batch_size,
            self.flush_interval,
            self.cancel.clone(),
        ));
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        self.store.close().await;
        Ok(())
    }

    async fn health(&self) -> ComponentHealth {
        match self.task.lock().await.as_ref() {
            Some(handle) if !handle.is_finished() => ComponentHealth::ok(),
            _ => ComponentHealth::down("consumer task not running"),
        }
    }
}
