//! One-shot WebSocket tickets
//!
//! A ticket is a short opaque secret minted for an authenticated caller,
//! valid for sixty seconds and consumed on first use. The WebSocket
//! handshake burns it atomically, so a replayed ticket never opens a second
//! socket.

use chrono::{Duration, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::auth::refresh::{generate_secret, hash_secret};
use crate::error::{Error, Result};

const TICKET_TTL_SECS: i64 = 60;

#[derive(Clone)]
pub struct TicketStore {
    pool: SqlitePool,
}

impl TicketStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Mint a ticket for a user; returns the secret handed to the client
    pub async fn issue(&self, user_id: &str) -> Result<String> {
        let secret = generate_secret();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO ws_tickets (id, user_id, ticket_hash, expires_at, consumed, created_at) \
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(hash_secret(&secret))
        .bind(now + Duration::seconds(TICKET_TTL_SECS))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(secret)
    }

    /// Consume a presented ticket and return the owning user id.
    ///
    /// The guarded UPDATE makes consumption single-use under concurrency.
    pub async fn consume(&self, secret: &str) -> Result<String> {
        let hash = hash_secret(secret);
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id, user_id, expires_at, consumed FROM ws_tickets WHERE ticket_hash = ?1",
        )
        .bind(&hash)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::Unauthenticated("unknown ws ticket".to_string()))?;

        let id: String = row.get("id");
        let user_id: String = row.get("user_id");
        let expires_at: chrono::DateTime<Utc> = row.get("expires_at");
        let consumed: bool = row.get("consumed");

        if consumed {
            tx.commit().await?;
            return Err(Error::Unauthenticated("ws ticket already used".to_string()));
        }
        if expires_at <= now {
            tx.commit().await?;
            return Err(Error::Unauthenticated("ws ticket expired".to_string()));
        }

        let updated = sqlx::query("UPDATE ws_tickets SET consumed = 1 WHERE id = ?1 AND consumed = 0")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            tx.commit().await?;
            return Err(Error::Unauthenticated("ws ticket already used".to_string()));
        }
        tx.commit().await?;
        Ok(user_id)
    }

    /// Remove expired and consumed tickets
    pub async fn cleanup(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM ws_tickets WHERE consumed = 1 OR expires_at < ?1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
