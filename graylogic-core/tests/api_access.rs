//! End-to-end API access control
//!
//! Boots the full core (KNX disabled, TSDB pointed at nothing) against a
//! temporary database and drives the router directly. Covers the
//! room-scope contract: a scoped user sees exactly their rooms, direct
//! access outside scope is 403, and an empty grant set yields empty lists.

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use tower::ServiceExt;
use uuid::Uuid;

use graylogic_core::api;
use graylogic_core::auth::{Role, RoomGrant, AUD_USER};
use graylogic_core::config::Config;
use graylogic_core::registry::models::{
    Device, DeviceType, Domain, HealthStatus, Protocol,
};
use graylogic_core::server::GrayLogicCore;

struct Harness {
    core: GrayLogicCore,
    _dir: tempfile::TempDir,
    room_a: String,
    room_b: String,
    device_a: String,
    device_b: String,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.auth.jwt_secret = "0123456789abcdef0123456789abcdef".to_string();
    config.database.path = dir.path().join("test.db");
    config.knx.enabled = false;
    config.tsdb.url = "http://127.0.0.1:1".to_string();

    let core = GrayLogicCore::build(config).await.unwrap();
    let repo = core.state().cache.repository().clone();

    let site = repo.create_site("Home", "home").await.unwrap();
    let area = repo.create_area(&site.id, "Ground", "ground").await.unwrap();
    let room_a = repo.create_room(&area.id, "Living", "living").await.unwrap().id;
    let room_b = repo.create_room(&area.id, "Bedroom", "bedroom").await.unwrap().id;

    let mut device_a = None;
    let mut device_b = None;
    for (slug, room, out) in [
        ("light-living-01", &room_a, &mut device_a),
        ("light-bedroom-01", &room_b, &mut device_b),
    ] {
        let device = Device {
            id: Uuid::new_v4().to_string(),
            name: slug.to_string(),
            slug: slug.to_string(),
            room_id: Some(room.clone()),
            area_id: None,
            device_type: DeviceType::Light,
            domain: Domain::Lighting,
            protocol: Protocol::Knx,
            functions: HashMap::new(),
            capabilities: Vec::new(),
            config: serde_json::Map::new(),
            state: serde_json::Map::new(),
            state_updated_at: None,
            health: HealthStatus::Unknown,
            last_seen: None,
            tags: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        *out = Some(repo.create_device(&device).await.unwrap().id);
    }
    core.state().cache.refresh().await.unwrap();

    Harness {
        core,
        _dir: dir,
        room_a,
        room_b,
        device_a: device_a.unwrap(),
        device_b: device_b.unwrap(),
    }
}

impl Harness {
    async fn user_token(&self, username: &str, role: Role, rooms: &[(&str, bool)]) -> String {
        let auth = &self.core.state().auth;
        let hash = auth.hash_password("a test password").await.unwrap();
        let user = auth
            .users
            .create(username, username, None, &hash, role, None)
            .await
            .unwrap();
        let grants: Vec<RoomGrant> = rooms
            .iter()
            .map(|(room_id, manage)| RoomGrant {
                room_id: (*room_id).to_string(),
                can_manage_scenes: *manage,
            })
            .collect();
        auth.users.replace_room_grants(&user.id, &grants).await.unwrap();
        auth.tokens.issue(&user.id, role, AUD_USER).unwrap()
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let app = api::router(self.core.state().clone());
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&json).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let mut request = request;
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("127.0.0.1:9999".parse().unwrap()));

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }
}

#[tokio::test]
async fn unauthenticated_requests_are_rejected() {
    let h = harness().await;
    let (status, body) = h.request("GET", "/api/v1/devices", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthenticated");
}

#[tokio::test]
async fn scoped_user_sees_only_their_rooms() {
    let h = harness().await;
    let room_a = h.room_a.clone();
    let token = h.user_token("scoped", Role::User, &[(room_a.as_str(), false)]).await;

    let (status, body) = h.request("GET", "/api/v1/devices", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let devices = body.as_array().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["slug"], "light-living-01");

    // Direct access inside scope works
    let (status, _) = h
        .request(
            "GET",
            &format!("/api/v1/devices/{}", h.device_a),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // Direct access outside scope is 403
    let (status, body) = h
        .request(
            "GET",
            &format!("/api/v1/devices/{}", h.device_b),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    // Commands outside scope are 403 too
    let (status, _) = h
        .request(
            "PUT",
            &format!("/api/v1/devices/{}/state", h.device_b),
            Some(&token),
            Some(serde_json::json!({ "command": "on", "parameters": {} })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn empty_scope_returns_empty_lists() {
    let h = harness().await;
    let token = h.user_token("lockedout", Role::User, &[]).await;

    let (status, body) = h.request("GET", "/api/v1/devices", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 0);

    let (status, body) = h.request("GET", "/api/v1/scenes", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn admin_sees_everything() {
    let h = harness().await;
    let token = h.user_token("boss", Role::Admin, &[]).await;

    let (status, body) = h.request("GET", "/api/v1/devices", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn command_dispatch_returns_accepted_without_state_change() {
    let h = harness().await;
    let room_a = h.room_a.clone();
    let token = h.user_token("operator", Role::User, &[(room_a.as_str(), false)]).await;

    let (status, body) = h
        .request(
            "PUT",
            &format!("/api/v1/devices/{}/state", h.device_a),
            Some(&token),
            Some(serde_json::json!({ "command": "on", "parameters": {} })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["dispatched"], true);

    // No self-confirmation: the registry state is untouched until the bus
    // answers.
    let device = h.core.state().cache.get(&h.device_a).await.unwrap();
    assert!(device.state.is_empty());
}

#[tokio::test]
async fn user_management_requires_permission() {
    let h = harness().await;
    let room_a = h.room_a.clone();
    let user_token = h.user_token("plain", Role::User, &[(room_a.as_str(), false)]).await;
    let (status, _) = h.request("GET", "/api/v1/users", Some(&user_token), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin_token = h.user_token("admin2", Role::Admin, &[]).await;
    let (status, _) = h.request("GET", "/api/v1/users", Some(&admin_token), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn login_rate_limit_kicks_in() {
    let h = harness().await;
    // Five failures are allowed, the sixth is 429 with Retry-After
    for _ in 0..5 {
        let (status, _) = h
            .request(
                "POST",
                "/api/v1/auth/login",
                None,
                Some(serde_json::json!({ "username": "ghost", "password": "wrong password" })),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
    let (status, body) = h
        .request(
            "POST",
            "/api/v1/auth/login",
            None,
            Some(serde_json::json!({ "username": "ghost", "password": "wrong password" })),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "rate_limited");
}

#[tokio::test]
async fn scene_scope_filters_like_devices() {
    let h = harness().await;
    let state = h.core.state();

    // One scene per room
    for (slug, room) in [("evening-a", &h.room_a), ("evening-b", &h.room_b)] {
        let scene = graylogic_core::registry::models::Scene {
            id: Uuid::new_v4().to_string(),
            name: slug.to_string(),
            slug: slug.to_string(),
            room_id: Some(room.clone()),
            area_id: None,
            enabled: true,
            priority: 50,
            icon: None,
            actions: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        state.scenes.create(&scene).await.unwrap();
    }

    let room_a = h.room_a.clone();
    let token = h.user_token("sceneuser", Role::User, &[(room_a.as_str(), false)]).await;
    let (status, body) = h.request("GET", "/api/v1/scenes", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let scenes = body.as_array().unwrap();
    assert_eq!(scenes.len(), 1);
    assert_eq!(scenes[0]["slug"], "evening-a");
}
