//! User accounts and per-user room access

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::auth::roles::Role;
use crate::error::{Error, Result};

/// A user account; the password hash never serializes
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One room grant
#[derive(Debug, Clone, Serialize)]
pub struct RoomGrant {
    pub room_id: String,
    pub can_manage_scenes: bool,
}

#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
    let role: String = row.get("role");
    Ok(User {
        id: row.get("id"),
        username: row.get("username"),
        display_name: row.get("display_name"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        role: role.parse()?,
        is_active: row.get("is_active"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

impl UserStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn list(&self) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY username")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(user_from_row).collect()
    }

    pub async fn get(&self, id: &str) -> Result<User> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user '{id}'")))?;
        user_from_row(&row)
    }

    /// Lookup by username; usernames are stored lowercased
    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?1")
            .bind(username.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn create(
        &self,
        username: &str,
        display_name: &str,
        email: Option<&str>,
        password_hash: &str,
        role: Role,
        created_by: Option<&str>,
    ) -> Result<User> {
        let username = username.to_lowercase();
        if username.is_empty() || username.len() > 64 {
            return Err(Error::Validation(
                "username must be 1-64 characters".to_string(),
            ));
        }
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO users (id, username, display_name, email, password_hash, role, is_active, created_by, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?8)",
        )
        .bind(&id)
        .bind(&username)
        .bind(display_name)
        .bind(email)
        .bind(password_hash)
        .bind(role.as_str())
        .bind(created_by)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.get(&id).await
    }

    pub async fn update(
        &self,
        id: &str,
        display_name: Option<&str>,
        email: Option<Option<&str>>,
        role: Option<Role>,
        is_active: Option<bool>,
    ) -> Result<User> {
        let current = self.get(id).await?;
        sqlx::query(
            "UPDATE users SET display_name = ?1, email = ?2, role = ?3, is_active = ?4, updated_at = ?5 WHERE id = ?6",
        )
        .bind(display_name.unwrap_or(&current.display_name))
        .bind(match email {
            Some(value) => value.map(str::to_string),
            None => current.email.clone(),
        })
        .bind(role.unwrap_or(current.role).as_str())
        .bind(is_active.unwrap_or(current.is_active))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get(id).await
    }

    pub async fn set_password_hash(&self, id: &str, password_hash: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(password_hash)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("user '{id}'")));
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("user '{id}'")));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Room access
    // ------------------------------------------------------------------

    pub async fn room_grants(&self, user_id: &str) -> Result<Vec<RoomGrant>> {
        let rows = sqlx::query(
            "SELECT room_id, can_manage_scenes FROM user_room_access WHERE user_id = ?1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| RoomGrant {
                room_id: row.get("room_id"),
                can_manage_scenes: row.get("can_manage_scenes"),
            })
            .collect())
    }

    /// Replace all grants for a user in one transaction
    pub async fn replace_room_grants(&self, user_id: &str, grants: &[RoomGrant]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_room_access WHERE user_id = ?1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        for grant in grants {
            sqlx::query(
                "INSERT INTO user_room_access (user_id, room_id, can_manage_scenes) VALUES (?1, ?2, ?3)",
            )
            .bind(user_id)
            .bind(&grant.room_id)
            .bind(grant.can_manage_scenes)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
