use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use quotaward_backend::{AppState, Engine, EngineConfig, create_app};
use quotaward_db::{BanCategory, Database, IdentityRow, StoredPlaytime};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;
// for `oneshot` method

const ADMIN_TOKEN: &str = "test-admin-token";

/// Helper to create test database with in-memory SQLite
async fn setup_test_db() -> Database {
    Database::open_in_memory()
        .await
        .expect("Failed to create in-memory database")
}

/// Helper to start an engine over the database and wrap it in the app.
/// Seed the database first, the engine loads its caches on start.
async fn create_test_app(db: &Database, admin_token: Option<&str>) -> axum::Router {
    let config = quotaward_backend::config::Config::default();
    let engine = Engine::new(Arc::new(db.clone()), EngineConfig::default())
        .expect("Failed to create engine");
    engine.start().await;

    let state = Arc::new(AppState {
        engine,
        admin_token: admin_token.map(str::to_string),
    });
    create_app(state, config.request_body_limit, config.request_timeout, None)
}

/// Helper to seed a player with a stored playtime blob
async fn seed_player(db: &Database, device_id: &str, role_id: i64, daily: i64) {
    db.create_player(device_id.to_string(), role_id)
        .await
        .expect("Failed to create player");
    db.update_playtime(
        device_id.to_string(),
        StoredPlaytime {
            played_time: 0,
            is_vip: false,
            daily_play_time: daily,
            today_extra_time: 0,
            last_update_time: 0,
        },
    )
    .await
    .expect("Failed to store playtime");
}

/// Helper to seed an identity history
async fn seed_identity(db: &Database, device_id: &str, role_id: i64, ips: &[&str]) {
    db.create_identity(
        IdentityRow {
            device_id: device_id.to_string(),
            role_id,
            ips: ips.iter().map(|ip| ip.to_string()).collect(),
            real_device_ids: Vec::new(),
            device_infos: Vec::new(),
        },
        0,
    )
    .await
    .expect("Failed to create identity");
}

/// Helper to send a request from a client IP and get response
async fn send_request(
    app: axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    auth_token: Option<&str>,
    client_ip: &str,
) -> (StatusCode, Value) {
    let mut request_builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("CF-Connecting-IP", client_ip);

    // Add Authorization header if provided
    if let Some(token) = auth_token {
        request_builder = request_builder.header("Authorization", format!("Bearer {}", token));
    }

    // Build request with body
    let request = if let Some(json_body) = body {
        request_builder
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&json_body).unwrap()))
            .unwrap()
    } else {
        request_builder.body(Body::empty()).unwrap()
    };

    // Send request
    let response = app.oneshot(request).await.unwrap();

    // Extract status
    let status = response.status();

    // Extract body
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();

    // Try to parse as JSON, or return empty object
    let json = if body_bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(json!({}))
    };

    (status, json)
}

// =============================================================================
// HEALTH ENDPOINT TESTS
// =============================================================================

#[tokio::test]
async fn test_health_endpoint_returns_ok() {
    // GIVEN: A running application
    let db = setup_test_db().await;
    let app = create_test_app(&db, None).await;

    // WHEN: Making a GET request to /health
    let (status, _body) = send_request(app, "GET", "/health", None, None, "1.1.1.1").await;

    // THEN: Should return 200 OK
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_health_endpoint_with_post_method() {
    let db = setup_test_db().await;
    let app = create_test_app(&db, None).await;

    let (status, _body) = send_request(app, "POST", "/health", None, None, "1.1.1.1").await;

    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

// =============================================================================
// BAN TESTS
// =============================================================================

#[tokio::test]
async fn test_banned_ip_is_rejected_everywhere() {
    // GIVEN: An IP on the ban list
    let db = setup_test_db().await;
    db.ban(BanCategory::Ip, "6.6.6.6".to_string(), 0).await.unwrap();
    let app = create_test_app(&db, None).await;

    // WHEN: That IP calls any route
    let (status, body) = send_request(app.clone(), "GET", "/health", None, None, "6.6.6.6").await;

    // THEN: Should return 403 with the vague error
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Failed to fetch version info, please retry");

    // AND: Other IPs are unaffected
    let (status, _body) = send_request(app, "GET", "/health", None, None, "6.6.6.7").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_login_with_banned_device_id() {
    let db = setup_test_db().await;
    seed_player(&db, "D1", 1, 500).await;
    db.ban(BanCategory::DeviceId, "D1".to_string(), 0).await.unwrap();
    let app = create_test_app(&db, None).await;

    let (status, _body) = send_request(
        app,
        "POST",
        "/login",
        Some(json!({ "deviceID": "D1" })),
        None,
        "1.2.3.4",
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_login_with_banned_device_info_after_memory_change() {
    // GIVEN: A device-info string banned with one free-memory reading
    let db = setup_test_db().await;
    seed_player(&db, "D1", 1, 500).await;
    db.ban(
        BanCategory::DeviceInfo,
        "Xiaomi_M2012K11AC_7853MB_8".to_string(),
        0,
    )
    .await
    .unwrap();
    let app = create_test_app(&db, None).await;

    // WHEN: The same phone logs in reporting different free memory
    let (status, _body) = send_request(
        app,
        "POST",
        "/login",
        Some(json!({
            "deviceID": "D1",
            "deviceInfo": "Xiaomi_M2012K11AC_6021MB_8"
        })),
        None,
        "1.2.3.4",
    )
    .await;

    // THEN: Still banned
    assert_eq!(status, StatusCode::FORBIDDEN);
}

// =============================================================================
// LOGIN / HEARTBEAT TESTS
// =============================================================================

#[tokio::test]
async fn test_login_success() {
    // GIVEN: A player with 500 seconds left
    let db = setup_test_db().await;
    seed_player(&db, "D1", 1, 500).await;
    seed_identity(&db, "D1", 1, &["1.2.3.4"]).await;
    let app = create_test_app(&db, None).await;

    // WHEN: Logging in from a known IP
    let (status, body) = send_request(
        app,
        "POST",
        "/login",
        Some(json!({ "deviceID": "D1", "realDeviceID": "hw-1" })),
        None,
        "1.2.3.4",
    )
    .await;

    // THEN: A session starts with the stored quota
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["remainingTime"], 500);
    assert_eq!(body["inSession"], true);

    // AND: The hardware id joined the identity history
    let identity = db.get_identity("D1".to_string()).await.unwrap().unwrap();
    assert_eq!(identity.real_device_ids, vec!["hw-1"]);
}

#[tokio::test]
async fn test_login_with_exhausted_quota() {
    let db = setup_test_db().await;
    seed_player(&db, "D1", 1, 0).await;
    let app = create_test_app(&db, None).await;

    let (status, body) = send_request(
        app,
        "POST",
        "/login",
        Some(json!({ "deviceID": "D1" })),
        None,
        "1.2.3.4",
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "playtime used up, come back tomorrow");
}

#[tokio::test]
async fn test_login_rejected_when_alias_is_exhausted() {
    // GIVEN: D2 used up its playtime on 1.2.3.4, D1 has never been seen there
    let db = setup_test_db().await;
    seed_player(&db, "D1", 1, 500).await;
    seed_player(&db, "D2", 2, 0).await;
    seed_identity(&db, "D1", 1, &["9.9.9.9"]).await;
    seed_identity(&db, "D2", 2, &["1.2.3.4"]).await;
    let app = create_test_app(&db, None).await;

    // WHEN: D1 logs in from D2's IP
    let (status, body) = send_request(
        app.clone(),
        "POST",
        "/login",
        Some(json!({ "deviceID": "D1" })),
        None,
        "1.2.3.4",
    )
    .await;

    // THEN: Rejected as if its own quota were spent
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "playtime used up, come back tomorrow");

    // AND: Retrying the same login is rejected too
    let (status, _body) = send_request(
        app.clone(),
        "POST",
        "/login",
        Some(json!({ "deviceID": "D1" })),
        None,
        "1.2.3.4",
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let identity = db.get_identity("D1".to_string()).await.unwrap().unwrap();
    assert_eq!(identity.ips, vec!["9.9.9.9"]);

    // AND: D1 still logs in fine from its usual IP
    let (status, _body) = send_request(
        app,
        "POST",
        "/login",
        Some(json!({ "deviceID": "D1" })),
        None,
        "9.9.9.9",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_login_with_empty_device_id() {
    let db = setup_test_db().await;
    let app = create_test_app(&db, None).await;

    let (status, body) = send_request(
        app,
        "POST",
        "/login",
        Some(json!({ "deviceID": "" })),
        None,
        "1.2.3.4",
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Device ID cannot be empty");
}

#[tokio::test]
async fn test_heartbeat_during_session() {
    let db = setup_test_db().await;
    seed_player(&db, "D1", 1, 500).await;
    let app = create_test_app(&db, None).await;

    let (status, _body) = send_request(
        app.clone(),
        "POST",
        "/login",
        Some(json!({ "deviceID": "D1" })),
        None,
        "1.2.3.4",
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_request(
        app,
        "POST",
        "/heartbeat",
        Some(json!({ "deviceID": "D1" })),
        None,
        "1.2.3.4",
    )
    .await;

    // Seconds may tick over between the two requests
    assert_eq!(status, StatusCode::OK);
    let remaining = body["remainingTime"].as_i64().unwrap();
    assert!((498..=500).contains(&remaining));
}

#[tokio::test]
async fn test_heartbeat_with_exhausted_quota() {
    let db = setup_test_db().await;
    seed_player(&db, "D1", 1, 0).await;
    let app = create_test_app(&db, None).await;

    let (status, _body) = send_request(
        app,
        "POST",
        "/heartbeat",
        Some(json!({ "deviceID": "D1" })),
        None,
        "1.2.3.4",
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
}

// =============================================================================
// READ ENDPOINT TESTS
// =============================================================================

#[tokio::test]
async fn test_playtime_for_new_player_gets_defaults() {
    let db = setup_test_db().await;
    db.create_player("D1".to_string(), 1).await.unwrap();
    let app = create_test_app(&db, None).await;

    let (status, body) = send_request(app, "GET", "/playtime/D1", None, None, "1.2.3.4").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["remainingTime"], 5400);
    assert_eq!(body["isVIP"], false);
    assert_eq!(body["inSession"], false);
}

#[tokio::test]
async fn test_playtime_for_unknown_device_is_not_found() {
    let db = setup_test_db().await;
    let app = create_test_app(&db, None).await;

    let (status, _body) = send_request(app.clone(), "GET", "/playtime/ghost", None, None, "1.2.3.4").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _body) = send_request(
        app,
        "POST",
        "/heartbeat",
        Some(json!({ "deviceID": "ghost" })),
        None,
        "1.2.3.4",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_settings_served_from_cache() {
    // GIVEN: An empty settings table, defaults get created on start
    let db = setup_test_db().await;
    let app = create_test_app(&db, None).await;

    let (status, body) = send_request(app, "GET", "/settings", None, None, "1.2.3.4").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["graphicsOptions"].as_array().unwrap().len(), 2);
    assert_eq!(body["miscOptions"]["outline"], 1);
    assert_eq!(body["playtime"]["freePlaytimeSeconds"], 5400);
    assert_eq!(body["playtime"]["resetHour"], 1);
    assert!(db.get_server_settings().await.unwrap().is_some());
}

// =============================================================================
// ADMIN ENDPOINT TESTS
// =============================================================================

#[tokio::test]
async fn test_admin_bonus_without_token() {
    let db = setup_test_db().await;
    seed_player(&db, "D1", 1, 0).await;
    let app = create_test_app(&db, Some(ADMIN_TOKEN)).await;

    let payload = json!({ "deviceIDs": ["D1"], "seconds": 600 });
    let (status, _body) = send_request(
        app.clone(),
        "POST",
        "/admin/bonus",
        Some(payload.clone()),
        None,
        "1.2.3.4",
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _body) = send_request(
        app,
        "POST",
        "/admin/bonus",
        Some(payload),
        Some("wrong-token"),
        "1.2.3.4",
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_routes_disabled_without_configured_token() {
    let db = setup_test_db().await;
    let app = create_test_app(&db, None).await;

    let (status, _body) = send_request(
        app,
        "POST",
        "/admin/vip",
        Some(json!({ "deviceID": "D1", "isVIP": true })),
        Some(ADMIN_TOKEN),
        "1.2.3.4",
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_bonus_lets_exhausted_player_back_in() {
    // GIVEN: A player who used up today's playtime
    let db = setup_test_db().await;
    seed_player(&db, "D1", 1, 0).await;
    let app = create_test_app(&db, Some(ADMIN_TOKEN)).await;

    // WHEN: An admin grants bonus time
    let (status, body) = send_request(
        app.clone(),
        "POST",
        "/admin/bonus",
        Some(json!({ "deviceIDs": ["D1", "ghost"], "seconds": 600 })),
        Some(ADMIN_TOKEN),
        "1.2.3.4",
    )
    .await;

    // THEN: Granted to the known device, the unknown one is reported
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["granted"], 1);
    assert_eq!(body["requested"], 2);
    assert!(body.get("lastError").is_some());

    // AND: The bonus was written through
    let player = db.get_player("D1".to_string()).await.unwrap().unwrap();
    assert_eq!(player.playtime.unwrap().today_extra_time, 600);

    // AND: The player can log in again
    let (status, body) = send_request(
        app,
        "POST",
        "/login",
        Some(json!({ "deviceID": "D1" })),
        None,
        "1.2.3.4",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["todayExtraTime"], 600);
}

#[tokio::test]
async fn test_admin_bonus_for_unknown_device() {
    let db = setup_test_db().await;
    let app = create_test_app(&db, Some(ADMIN_TOKEN)).await;

    let (status, _body) = send_request(
        app,
        "POST",
        "/admin/bonus",
        Some(json!({ "deviceIDs": ["ghost"], "seconds": 600 })),
        Some(ADMIN_TOKEN),
        "1.2.3.4",
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_bonus_with_invalid_seconds() {
    let db = setup_test_db().await;
    seed_player(&db, "D1", 1, 0).await;
    let app = create_test_app(&db, Some(ADMIN_TOKEN)).await;

    let (status, _body) = send_request(
        app,
        "POST",
        "/admin/bonus",
        Some(json!({ "deviceIDs": ["D1"], "seconds": 0 })),
        Some(ADMIN_TOKEN),
        "1.2.3.4",
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_vip_upgrade() {
    let db = setup_test_db().await;
    seed_player(&db, "D1", 1, 100).await;
    let app = create_test_app(&db, Some(ADMIN_TOKEN)).await;

    let (status, body) = send_request(
        app,
        "POST",
        "/admin/vip",
        Some(json!({ "deviceID": "D1", "isVIP": true })),
        Some(ADMIN_TOKEN),
        "1.2.3.4",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isVIP"], true);
    assert_eq!(body["dailyPlayTime"], 36000);

    let player = db.get_player("D1".to_string()).await.unwrap().unwrap();
    assert!(player.playtime.unwrap().is_vip);
}
