//! Append-only tables: state history, scene executions, passive discovery
//!
//! State history is pruned by a daily background task owned by the pipeline;
//! pruning is transactional and chunked so a large backlog never holds the
//! writer for long.

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::registry::models::{
    DiscoveredGroup, DiscoveredIndividual, StateHistoryEntry, StateSource,
};

const PRUNE_CHUNK: i64 = 5_000;

/// Repository over the append-only tables
#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a state snapshot row
    pub async fn append_state(
        &self,
        device_id: &str,
        state: &serde_json::Map<String, serde_json::Value>,
        source: StateSource,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO state_history (device_id, state, source, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(device_id)
        .bind(serde_json::to_string(state)?)
        .bind(source.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent snapshots for one device, newest first
    pub async fn device_history(
        &self,
        device_id: &str,
        limit: i64,
    ) -> Result<Vec<StateHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT id, device_id, state, source, created_at FROM state_history \
             WHERE device_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(device_id)
        .bind(limit.clamp(1, 1_000))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let state: String = row.get("state");
                let source: String = row.get("source");
                Ok(StateHistoryEntry {
                    id: row.get("id"),
                    device_id: row.get("device_id"),
                    state: serde_json::from_str(&state)
                        .map_err(|e| Error::Internal(format!("corrupt state row: {e}")))?,
                    source: source.parse()?,
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    /// Delete rows older than the retention window, in bounded chunks.
    ///
    /// Returns the number of rows removed.
    pub async fn prune_state_history(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let mut total = 0u64;
        loop {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                "DELETE FROM state_history WHERE id IN \
                 (SELECT id FROM state_history WHERE created_at < ?1 LIMIT ?2)",
            )
            .bind(cutoff)
            .bind(PRUNE_CHUNK)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            total += result.rows_affected();
            if result.rows_affected() < PRUNE_CHUNK as u64 {
                break;
            }
        }
        Ok(total)
    }

    /// Record a scene run outcome
    pub async fn record_scene_execution(
        &self,
        scene_id: &str,
        triggered_by: Option<&str>,
        source: StateSource,
        actions_total: usize,
        actions_failed: usize,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO scene_executions (scene_id, triggered_by, source, actions_total, actions_failed, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(scene_id)
        .bind(triggered_by)
        .bind(source.as_str())
        .bind(actions_total as i64)
        .bind(actions_failed as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Passive discovery
    // ------------------------------------------------------------------

    pub async fn touch_individual(&self, address: &str, seen: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO knx_discovered_individuals (individual_address, last_seen, message_count) \
             VALUES (?1, ?2, 1) \
             ON CONFLICT(individual_address) DO UPDATE SET \
             last_seen = excluded.last_seen, message_count = message_count + 1",
        )
        .bind(address)
        .bind(seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn touch_group(
        &self,
        address: &str,
        seen: DateTime<Utc>,
        saw_response: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO knx_discovered_groups (group_address, last_seen, message_count, has_read_response) \
             VALUES (?1, ?2, 1, ?3) \
             ON CONFLICT(group_address) DO UPDATE SET \
             last_seen = excluded.last_seen, \
             message_count = message_count + 1, \
             has_read_response = MAX(has_read_response, excluded.has_read_response)",
        )
        .bind(address)
        .bind(seen)
        .bind(saw_response)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn discovered_individuals(&self) -> Result<Vec<DiscoveredIndividual>> {
        let rows = sqlx::query(
            "SELECT individual_address, last_seen, message_count \
             FROM knx_discovered_individuals ORDER BY individual_address",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| DiscoveredIndividual {
                individual_address: row.get("individual_address"),
                last_seen: row.get("last_seen"),
                message_count: row.get("message_count"),
            })
            .collect())
    }

    pub async fn discovered_groups(&self) -> Result<Vec<DiscoveredGroup>> {
        let rows = sqlx::query(
            "SELECT group_address, last_seen, message_count, has_read_response \
             FROM knx_discovered_groups ORDER BY group_address",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| DiscoveredGroup {
                group_address: row.get("group_address"),
                last_seen: row.get("last_seen"),
                message_count: row.get("message_count"),
                has_read_response: row.get("has_read_response"),
            })
            .collect())
    }
}
