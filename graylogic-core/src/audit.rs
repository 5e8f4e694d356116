//! Append-only audit logging
//!
//! Records flow through a bounded channel to a single writer task, so
//! emitting an audit row never blocks a request handler. A full channel
//! drops the record and counts the loss; the audit trail is best-effort
//! by design, the security log of record is the database table.

use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

const CHANNEL_CAPACITY: usize = 1024;

/// One audit event
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub user_id: Option<String>,
    pub source: String,
    pub details: serde_json::Value,
}

impl AuditRecord {
    /// A new record for an entity mutation
    #[must_use]
    pub fn new(action: &str, entity_type: &str, entity_id: &str) -> Self {
        Self {
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: Some(entity_id.to_string()),
            user_id: None,
            source: "api".to_string(),
            details: serde_json::json!({}),
        }
    }

    /// A record for an auth event
    #[must_use]
    pub fn auth(action: &str, user_id: &str) -> Self {
        Self {
            action: action.to_string(),
            entity_type: "user".to_string(),
            entity_id: Some(user_id.to_string()),
            user_id: Some(user_id.to_string()),
            source: "auth".to_string(),
            details: serde_json::json!({}),
        }
    }

    #[must_use]
    pub fn by_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

enum Message {
    Record(AuditRecord),
    Shutdown,
}

/// Handle for emitting audit records
#[derive(Clone)]
pub struct AuditLogger {
    sender: Option<mpsc::Sender<Message>>,
    dropped: Arc<AtomicU64>,
}

/// Owns the writer task; kept by the server for shutdown
pub struct AuditWriter {
    task: JoinHandle<()>,
    sender: mpsc::Sender<Message>,
}

impl AuditLogger {
    /// Start the writer task over the given pool
    #[must_use]
    pub fn start(pool: SqlitePool) -> (Self, AuditWriter) {
        let (sender, mut receiver) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
        let task = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match message {
                    Message::Record(record) => {
                        if let Err(e) = insert(&pool, &record).await {
                            tracing::warn!(error = %e, action = %record.action, "audit insert failed");
                        }
                    }
                    Message::Shutdown => break,
                }
            }
        });
        let logger = Self {
            sender: Some(sender.clone()),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (logger, AuditWriter { task, sender })
    }

    /// A logger that discards everything; for tests and tooling
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            sender: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit a record without blocking; a full channel drops it
    pub async fn log(&self, record: AuditRecord) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.try_send(Message::Record(record)).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(dropped, "audit channel full, record dropped");
        }
    }

    /// Records dropped due to backpressure
    #[must_use]
    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditWriter {
    /// Drain the channel and stop the writer
    pub async fn stop(self) {
        let _ = self.sender.send(Message::Shutdown).await;
        let _ = self.task.await;
        tracing::info!("audit writer stopped");
    }
}

async fn insert(pool: &SqlitePool, record: &AuditRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO audit_logs (action, entity_type, entity_id, user_id, source, details, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(&record.action)
    .bind(&record.entity_type)
    .bind(&record.entity_id)
    .bind(&record.user_id)
    .bind(&record.source)
    .bind(record.details.to_string())
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::db::connect_memory;
    use sqlx::Row;

    #[tokio::test]
    async fn records_land_in_the_table() {
        let pool = connect_memory().await;
        let (logger, writer) = AuditLogger::start(pool.clone());

        logger
            .log(AuditRecord::new("create", "device", "d1").by_user("u1"))
            .await;
        logger.log(AuditRecord::auth("login", "u1")).await;
        writer.stop().await;

        let rows = sqlx::query("SELECT action, entity_type, user_id FROM audit_logs ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get::<String, _>("action"), "create");
        assert_eq!(rows[1].get::<String, _>("entity_type"), "user");
    }

    #[tokio::test]
    async fn disabled_logger_is_silent() {
        let logger = AuditLogger::disabled();
        logger.log(AuditRecord::auth("login", "u1")).await;
        assert_eq!(logger.dropped_records(), 0);
    }

    #[test]
    fn builder_sets_fields() {
        let record = AuditRecord::new("update", "scene", "s1")
            .by_user("u2")
            .with_source("scene")
            .with_details(serde_json::json!({ "field": "name" }));
        assert_eq!(record.user_id.as_deref(), Some("u2"));
        assert_eq!(record.source, "scene");
        assert_eq!(record.details["field"], "name");
    }
}
