//! Refresh token storage with family rotation and reuse detection
//!
//! Tokens are opaque 256-bit secrets stored as SHA-256 hashes. Every token
//! belongs to a family rooted at one login. Rotation consumes the presented
//! token with a guarded `UPDATE ... WHERE revoked = 0`; the rows-affected
//! count is the linearization point, so two racing rotations of the same
//! token cannot both succeed. Presenting a consumed token while a live
//! successor exists revokes the whole family — the theft signal.

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Generate an opaque 256-bit secret, URL-safe base64 without padding
#[must_use]
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 of a secret, hex-encoded; the only form that touches disk
#[must_use]
pub fn hash_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// A successfully rotated pair
#[derive(Debug)]
pub struct Rotation {
    pub user_id: String,
    pub family_id: String,
    pub new_secret: String,
}

/// Outcome of presenting a refresh token
#[derive(Debug)]
pub enum RotationOutcome {
    Rotated(Rotation),
    /// A consumed token was replayed while its family had a live successor;
    /// the family has been revoked.
    TheftDetected { user_id: String, family_id: String },
}

/// An active session as shown to `users:manage`
#[derive(Debug, serde::Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub family_id: String,
    pub device_info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RefreshStore {
    pool: SqlitePool,
    ttl: Duration,
}

impl RefreshStore {
    #[must_use]
    pub fn new(pool: SqlitePool, ttl_days: i64) -> Self {
        Self {
            pool,
            ttl: Duration::days(ttl_days),
        }
    }

    /// Issue the first token of a new family (login)
    pub async fn issue_family(
        &self,
        user_id: &str,
        device_info: Option<&str>,
    ) -> Result<(String, String)> {
        let family_id = Uuid::new_v4().to_string();
        let secret = self.insert_token(user_id, &family_id, device_info).await?;
        Ok((secret, family_id))
    }

    async fn insert_token(
        &self,
        user_id: &str,
        family_id: &str,
        device_info: Option<&str>,
    ) -> Result<String> {
        let secret = generate_secret();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO refresh_tokens (id, user_id, family_id, token_hash, device_info, expires_at, revoked, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(family_id)
        .bind(hash_secret(&secret))
        .bind(device_info)
        .bind(now + self.ttl)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(secret)
    }

    /// Rotate a presented token.
    ///
    /// The whole step runs in one transaction; the guarded UPDATE is the
    /// atomic consume. A replayed token triggers family revocation and is
    /// reported as theft rather than a plain failure.
    pub async fn rotate(&self, presented_secret: &str) -> Result<RotationOutcome> {
        let hash = hash_secret(presented_secret);
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id, user_id, family_id, expires_at, revoked FROM refresh_tokens WHERE token_hash = ?1",
        )
        .bind(&hash)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::Unauthenticated("unknown refresh token".to_string()))?;

        let token_id: String = row.get("id");
        let user_id: String = row.get("user_id");
        let family_id: String = row.get("family_id");
        let expires_at: DateTime<Utc> = row.get("expires_at");
        let revoked: bool = row.get("revoked");

        if !revoked && expires_at <= now {
            tx.commit().await?;
            return Err(Error::Unauthenticated("refresh token expired".to_string()));
        }

        if revoked {
            // Reuse. If a live successor exists this is the theft signal.
            let successors: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM refresh_tokens WHERE family_id = ?1 AND revoked = 0 AND expires_at > ?2",
            )
            .bind(&family_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            if successors > 0 {
                sqlx::query("UPDATE refresh_tokens SET revoked = 1 WHERE family_id = ?1")
                    .bind(&family_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                tracing::warn!(family = %family_id, user = %user_id, "refresh token reuse, family revoked");
                return Ok(RotationOutcome::TheftDetected { user_id, family_id });
            }
            tx.commit().await?;
            return Err(Error::Unauthenticated("refresh token revoked".to_string()));
        }

        // Atomic consume: rows_affected 0 means someone beat us to it
        let consumed = sqlx::query(
            "UPDATE refresh_tokens SET revoked = 1 WHERE id = ?1 AND revoked = 0",
        )
        .bind(&token_id)
        .execute(&mut *tx)
        .await?;
        if consumed.rows_affected() == 0 {
            tx.commit().await?;
            return Err(Error::Conflict("refresh token already consumed".to_string()));
        }

        let new_secret = generate_secret();
        sqlx::query(
            "INSERT INTO refresh_tokens (id, user_id, family_id, token_hash, device_info, expires_at, revoked, created_at) \
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, 0, ?6)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&user_id)
        .bind(&family_id)
        .bind(hash_secret(&new_secret))
        .bind(now + self.ttl)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(RotationOutcome::Rotated(Rotation {
            user_id,
            family_id,
            new_secret,
        }))
    }

    /// Revoke the family a presented token belongs to (logout)
    pub async fn revoke_by_secret(&self, presented_secret: &str) -> Result<()> {
        let hash = hash_secret(presented_secret);
        sqlx::query(
            "UPDATE refresh_tokens SET revoked = 1 WHERE family_id = \
             (SELECT family_id FROM refresh_tokens WHERE token_hash = ?1)",
        )
        .bind(&hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Revoke everything a user holds (password change, admin action)
    pub async fn revoke_all_for_user(&self, user_id: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE refresh_tokens SET revoked = 1 WHERE user_id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Active (non-revoked, unexpired) sessions for a user
    pub async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<SessionInfo>> {
        let rows = sqlx::query(
            "SELECT id, family_id, device_info, created_at, expires_at FROM refresh_tokens \
             WHERE user_id = ?1 AND revoked = 0 AND expires_at > ?2 ORDER BY created_at",
        )
        .bind(user_id)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| SessionInfo {
                id: row.get("id"),
                family_id: row.get("family_id"),
                device_info: row.get("device_info"),
                created_at: row.get("created_at"),
                expires_at: row.get("expires_at"),
            })
            .collect())
    }

    /// Drop rows whose hard TTL has lapsed
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < ?1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Count of non-revoked tokens in a family (test/introspection)
    pub async fn active_in_family(&self, family_id: &str) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM refresh_tokens WHERE family_id = ?1 AND revoked = 0",
        )
        .bind(family_id)
        .fetch_one(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::db::connect_memory;

    async fn store_with_user() -> RefreshStore {
        let pool = connect_memory().await;
        sqlx::query(
            "INSERT INTO users (id, username, display_name, password_hash, role, created_at, updated_at) \
             VALUES ('u1', 'alice', 'Alice', 'x', 'user', ?1, ?1)",
        )
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();
        RefreshStore::new(pool, 30)
    }

    #[test]
    fn secrets_hash_deterministically() {
        let secret = generate_secret();
        assert_eq!(hash_secret(&secret), hash_secret(&secret));
        assert_ne!(hash_secret(&secret), hash_secret("other"));
        // 256-bit secret in URL-safe base64 without padding
        assert_eq!(secret.len(), 43);
    }

    #[tokio::test]
    async fn family_invariant_holds_through_rotation() {
        let store = store_with_user().await;
        let (r1, family) = store.issue_family("u1", Some("test")).await.unwrap();
        assert_eq!(store.active_in_family(&family).await.unwrap(), 1);

        let outcome = store.rotate(&r1).await.unwrap();
        let rotation = match outcome {
            RotationOutcome::Rotated(r) => r,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(rotation.family_id, family);
        // At most one non-revoked token per family
        assert_eq!(store.active_in_family(&family).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replay_with_live_successor_revokes_family() {
        let store = store_with_user().await;
        let (r1, family) = store.issue_family("u1", None).await.unwrap();

        let r2 = match store.rotate(&r1).await.unwrap() {
            RotationOutcome::Rotated(r) => r.new_secret,
            other => panic!("unexpected {other:?}"),
        };

        // Stolen copy of r1 is replayed
        match store.rotate(&r1).await.unwrap() {
            RotationOutcome::TheftDetected { family_id, .. } => {
                assert_eq!(family_id, family);
            }
            other => panic!("expected theft, got {other:?}"),
        }
        assert_eq!(store.active_in_family(&family).await.unwrap(), 0);

        // The legitimate holder's r2 is now dead too
        assert!(store.rotate(&r2).await.is_err());
    }

    #[tokio::test]
    async fn unknown_token_is_unauthenticated() {
        let store = store_with_user().await;
        let err = store.rotate("bogus-secret").await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn logout_revokes_family_without_theft() {
        let store = store_with_user().await;
        let (r1, family) = store.issue_family("u1", None).await.unwrap();
        store.revoke_by_secret(&r1).await.unwrap();
        assert_eq!(store.active_in_family(&family).await.unwrap(), 0);

        // Replay after logout: no live successor, so plain rejection
        let err = store.rotate(&r1).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn sessions_listing_and_bulk_revoke() {
        let store = store_with_user().await;
        store.issue_family("u1", Some("phone")).await.unwrap();
        store.issue_family("u1", Some("laptop")).await.unwrap();

        let sessions = store.sessions_for_user("u1").await.unwrap();
        assert_eq!(sessions.len(), 2);

        let revoked = store.revoke_all_for_user("u1").await.unwrap();
        assert_eq!(revoked, 2);
        assert!(store.sessions_for_user("u1").await.unwrap().is_empty());
    }
}
