//! Scene persistence
//!
//! Scenes and their ordered actions live in two tables; actions are loaded
//! eagerly since scenes are small and activation needs the full list.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::registry::models::{validate_slug, Scene, SceneAction};

#[derive(Clone)]
pub struct SceneStore {
    pool: SqlitePool,
}

fn scene_from_row(row: &SqliteRow) -> Scene {
    Scene {
        id: row.get("id"),
        name: row.get("name"),
        slug: row.get("slug"),
        room_id: row.get("room_id"),
        area_id: row.get("area_id"),
        enabled: row.get("enabled"),
        priority: row.get("priority"),
        icon: row.get("icon"),
        actions: Vec::new(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn action_from_row(row: &SqliteRow) -> Result<SceneAction> {
    let target: String = row.get("target");
    let parameters: String = row.get("parameters");
    Ok(SceneAction {
        id: row.get("id"),
        scene_id: row.get("scene_id"),
        target: serde_json::from_str(&target)
            .map_err(|e| Error::Internal(format!("corrupt action target: {e}")))?,
        command: row.get("command"),
        parameters: serde_json::from_str(&parameters)
            .map_err(|e| Error::Internal(format!("corrupt action parameters: {e}")))?,
        delay_ms: row.get::<i64, _>("delay_ms") as u64,
        fade_ms: row.get::<i64, _>("fade_ms") as u64,
        parallel: row.get("parallel"),
        continue_on_error: row.get("continue_on_error"),
        sort_order: row.get("sort_order"),
    })
}

impl SceneStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<Scene>> {
        let rows = sqlx::query("SELECT * FROM scenes ORDER BY priority DESC, slug")
            .fetch_all(&self.pool)
            .await?;
        let mut scenes: Vec<Scene> = rows.iter().map(scene_from_row).collect();

        let action_rows =
            sqlx::query("SELECT * FROM scene_actions ORDER BY scene_id, sort_order, id")
                .fetch_all(&self.pool)
                .await?;
        for row in &action_rows {
            let action = action_from_row(row)?;
            if let Some(scene) = scenes.iter_mut().find(|s| s.id == action.scene_id) {
                scene.actions.push(action);
            }
        }
        Ok(scenes)
    }

    pub async fn get(&self, id: &str) -> Result<Scene> {
        let row = sqlx::query("SELECT * FROM scenes WHERE id = ?1 OR slug = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("scene '{id}'")))?;
        let mut scene = scene_from_row(&row);

        let action_rows =
            sqlx::query("SELECT * FROM scene_actions WHERE scene_id = ?1 ORDER BY sort_order, id")
                .bind(&scene.id)
                .fetch_all(&self.pool)
                .await?;
        scene.actions = action_rows
            .iter()
            .map(action_from_row)
            .collect::<Result<_>>()?;
        Ok(scene)
    }

    pub async fn create(&self, scene: &Scene) -> Result<Scene> {
        validate_slug(&scene.slug)?;
        if !(1..=100).contains(&scene.priority) {
            return Err(Error::Validation(format!(
                "scene priority {} out of range 1-100",
                scene.priority
            )));
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO scenes (id, name, slug, room_id, area_id, enabled, priority, icon, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&scene.id)
        .bind(&scene.name)
        .bind(&scene.slug)
        .bind(&scene.room_id)
        .bind(&scene.area_id)
        .bind(scene.enabled)
        .bind(scene.priority)
        .bind(&scene.icon)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for action in &scene.actions {
            insert_action(&mut tx, &scene.id, action).await?;
        }
        tx.commit().await?;
        self.get(&scene.id).await
    }

    /// Replace mutable fields and the full action list; slug stays fixed
    pub async fn update(&self, scene: &Scene) -> Result<Scene> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE scenes SET name = ?1, room_id = ?2, area_id = ?3, enabled = ?4, \
             priority = ?5, icon = ?6, updated_at = ?7 WHERE id = ?8",
        )
        .bind(&scene.name)
        .bind(&scene.room_id)
        .bind(&scene.area_id)
        .bind(scene.enabled)
        .bind(scene.priority)
        .bind(&scene.icon)
        .bind(Utc::now())
        .bind(&scene.id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("scene '{}'", scene.id)));
        }

        sqlx::query("DELETE FROM scene_actions WHERE scene_id = ?1")
            .bind(&scene.id)
            .execute(&mut *tx)
            .await?;
        for action in &scene.actions {
            insert_action(&mut tx, &scene.id, action).await?;
        }
        tx.commit().await?;
        self.get(&scene.id).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM scenes WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("scene '{id}'")));
        }
        Ok(())
    }
}

async fn insert_action(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    scene_id: &str,
    action: &SceneAction,
) -> Result<()> {
    let id = if action.id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        action.id.clone()
    };
    sqlx::query(
        "INSERT INTO scene_actions (id, scene_id, target, command, parameters, delay_ms, fade_ms, parallel, continue_on_error, sort_order) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )
    .bind(id)
    .bind(scene_id)
    .bind(serde_json::to_string(&action.target)?)
    .bind(&action.command)
    .bind(serde_json::to_string(&action.parameters)?)
    .bind(action.delay_ms as i64)
    .bind(action.fade_ms as i64)
    .bind(action.parallel)
    .bind(action.continue_on_error)
    .bind(action.sort_order)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::db::connect_memory;
    use crate::registry::models::ActionTarget;

    fn scene(slug: &str) -> Scene {
        Scene {
            id: Uuid::new_v4().to_string(),
            name: slug.to_string(),
            slug: slug.to_string(),
            room_id: None,
            area_id: None,
            enabled: true,
            priority: 50,
            icon: None,
            actions: vec![SceneAction {
                id: String::new(),
                scene_id: String::new(),
                target: ActionTarget::Device {
                    device_id: "light-1".into(),
                },
                command: "on".into(),
                parameters: serde_json::Map::new(),
                delay_ms: 0,
                fade_ms: 500,
                parallel: false,
                continue_on_error: true,
                sort_order: 0,
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn scene_crud_round_trip() {
        let store = SceneStore::new(connect_memory().await);
        let created = store.create(&scene("evening")).await.unwrap();
        assert_eq!(created.actions.len(), 1);
        assert_eq!(created.actions[0].fade_ms, 500);

        let fetched = store.get("evening").await.unwrap();
        assert_eq!(fetched.id, created.id);

        store.delete(&created.id).await.unwrap();
        assert!(store.get(&created.id).await.is_err());
    }

    #[tokio::test]
    async fn priority_out_of_range_rejected() {
        let store = SceneStore::new(connect_memory().await);
        let mut bad = scene("bad");
        bad.priority = 0;
        assert!(store.create(&bad).await.is_err());
        bad.priority = 101;
        assert!(store.create(&bad).await.is_err());
    }

    #[tokio::test]
    async fn update_replaces_actions() {
        let store = SceneStore::new(connect_memory().await);
        let mut created = store.create(&scene("movie")).await.unwrap();
        created.actions.push(SceneAction {
            id: String::new(),
            scene_id: created.id.clone(),
            target: ActionTarget::Device {
                device_id: "light-2".into(),
            },
            command: "dim".into(),
            parameters: serde_json::Map::new(),
            delay_ms: 100,
            fade_ms: 0,
            parallel: true,
            continue_on_error: false,
            sort_order: 1,
        });
        let updated = store.update(&created).await.unwrap();
        assert_eq!(updated.actions.len(), 2);
        assert!(updated.actions[1].parallel);
    }
}
