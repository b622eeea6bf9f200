//! Control API tests through the full router with a fake worker launcher.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{Fleet, allow_status_writes, fail_status_writes, fast_policy, fleet, write_schema};
use speeddata_daemon::api::{AppState, build_router};
use speeddata_daemon::storage::ChannelStatus;

fn app(fleet: &Fleet) -> axum::Router {
    build_router(AppState {
        db: fleet.db.clone(),
        supervisor: fleet.supervisor.clone(),
    })
}

/// Send a request and return (status, parsed JSON body).
async fn send(fleet: &Fleet, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app(fleet).oneshot(request).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn avro_schema() -> Value {
    json!({
        "type": "record",
        "name": "Telemetry",
        "fields": [
            {"name": "ts", "type": "long"},
            {"name": "speed", "type": "double"}
        ]
    })
}

#[tokio::test]
async fn health_reports_service() {
    let f = fleet(fast_policy()).await;
    let (status, body) = send(&f, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "speeddata-registration-api");

    let (status, _) = send(&f, "GET", "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn register_get_delete_lifecycle() {
    let f = fleet(fast_policy()).await;
    let dir = tempfile::tempdir().unwrap();
    let schema = write_schema(dir.path(), "valid.json", &avro_schema());

    let (status, body) = send(
        &f,
        "POST",
        "/channels",
        Some(json!({"name": "s1", "port": 26001, "schema": schema})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["status"], "success");
    assert_eq!(body["port"], 26001);
    let pid = body["pid"].as_u64().unwrap();

    let (status, body) = send(&f, "GET", "/channels/s1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "active");
    assert_eq!(body["pid"].as_u64(), Some(pid));
    assert!(body.get("config_json").is_none());

    let (status, body) = send(&f, "DELETE", "/channels/s1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "s1");
    assert!(f.launcher.latest("s1").was_terminated());

    let (status, body) = send(&f, "GET", "/channels/s1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Channel not found");
    assert!(f.db.is_port_available(26001).await.unwrap());
}

#[tokio::test]
async fn worker_gets_port_and_config_through_environment() {
    let f = fleet(fast_policy()).await;
    let dir = tempfile::tempdir().unwrap();
    let schema = write_schema(dir.path(), "valid.json", &avro_schema());

    let (status, _) = send(
        &f,
        "POST",
        "/api/v1/channels",
        Some(json!({
            "name": "s1",
            "port": "26001",
            "schema": schema,
            "config": {"decimation": {"enabled": true, "factor": 3}}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let cmd = &f.launcher.commands()[0];
    assert_eq!(cmd.channel, "s1");
    let env = |k: &str| {
        cmd.env
            .iter()
            .find(|(name, _)| name == k)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(env("RELAY_RX_PORT").as_deref(), Some("26001"));
    assert_eq!(env("RELAY_DECIMATION_ENABLED").as_deref(), Some("true"));
    assert_eq!(env("RELAY_DECIMATION_FACTOR").as_deref(), Some("3"));
}

#[tokio::test]
async fn port_conflict_reports_holder() {
    let f = fleet(fast_policy()).await;
    let dir = tempfile::tempdir().unwrap();
    let schema = write_schema(dir.path(), "valid.json", &avro_schema());

    let (status, _) = send(
        &f,
        "POST",
        "/channels",
        Some(json!({"name": "s1", "port": 26001, "schema": schema})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &f,
        "POST",
        "/channels",
        Some(json!({"name": "s2", "port": 26001, "schema": schema})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["used_by"], "s1");
    assert_eq!(body["port"], 26001);

    // Same name, same port reports itself.
    let (status, body) = send(
        &f,
        "POST",
        "/channels",
        Some(json!({"name": "s1", "port": 26001, "schema": schema})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["used_by"], "s1");
    assert_eq!(f.launcher.start_count(), 1);
}

#[tokio::test]
async fn duplicate_name_on_new_port_is_conflict() {
    let f = fleet(fast_policy()).await;
    let dir = tempfile::tempdir().unwrap();
    let schema = write_schema(dir.path(), "valid.json", &avro_schema());

    send(
        &f,
        "POST",
        "/channels",
        Some(json!({"name": "s1", "port": 26001, "schema": schema})),
    )
    .await;
    let (status, body) = send(
        &f,
        "POST",
        "/channels",
        Some(json!({"name": "s1", "port": 26002, "schema": schema})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Channel name already registered");
    assert!(f.db.is_port_available(26002).await.unwrap());
}

#[tokio::test]
async fn spawn_failure_rolls_back_registration() {
    let f = fleet(fast_policy()).await;
    let dir = tempfile::tempdir().unwrap();
    let schema = write_schema(dir.path(), "valid.json", &avro_schema());
    f.launcher.set_failing(true);

    let (status, body) = send(
        &f,
        "POST",
        "/channels",
        Some(json!({"name": "s1", "port": 26001, "schema": schema})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Failed to start relay process");

    assert!(f.db.list_channels(None).await.unwrap().is_empty());
    assert!(f.db.is_port_available(26001).await.unwrap());
    assert!(f.supervisor.statuses().await.is_empty());
}

#[tokio::test]
async fn register_validation_errors() {
    let f = fleet(fast_policy()).await;
    let dir = tempfile::tempdir().unwrap();
    let schema = write_schema(dir.path(), "valid.json", &avro_schema());
    std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
    let broken = dir.path().join("broken.json").display().to_string();

    let cases = [
        (json!({"name": "s1", "port": 26001}), "Missing required fields"),
        (json!({"name": "s1", "port": "abc", "schema": schema}), "Port must be an integer"),
        (json!({"name": "s1", "port": 70000, "schema": schema}), "Port out of range"),
        (json!({"name": "s1", "port": 26001, "schema": "/nonexistent/schema.json"}), "Schema file not found"),
        (json!({"name": "s1", "port": 26001, "schema": broken}), "Invalid schema file (not valid JSON)"),
        (json!({"name": "s1", "port": 26001, "schema": schema, "config": "fast"}), "Invalid channel config"),
        (
            json!({"name": "s1", "port": 26001, "schema": schema, "config": {"rotation": {"mode": "size", "threshold": 0}}}),
            "Invalid channel config",
        ),
        (
            json!({"name": "s1", "port": 26001, "schema": schema, "config": {"multicast": {"ttl": 300}}}),
            "Invalid channel config",
        ),
    ];
    for (request, expected) in cases {
        let (status, body) = send(&f, "POST", "/channels", Some(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        assert_eq!(body["error"], expected);
    }

    let (status, body) = send(&f, "POST", "/channels", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Request body required");

    assert_eq!(f.launcher.start_count(), 0);
    assert!(f.db.list_channels(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn deregister_unknown_is_404() {
    let f = fleet(fast_policy()).await;
    let (status, body) = send(&f, "DELETE", "/channels/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["name"], "ghost");
}

#[tokio::test]
async fn stop_failure_keeps_channel_registered() {
    let f = fleet(fast_policy()).await;
    let dir = tempfile::tempdir().unwrap();
    let schema = write_schema(dir.path(), "valid.json", &avro_schema());
    let (_, body) = send(
        &f,
        "POST",
        "/channels",
        Some(json!({"name": "s1", "port": 26001, "schema": schema})),
    )
    .await;
    let pid = body["pid"].as_u64().and_then(|p| u32::try_from(p).ok());
    f.launcher.latest("s1").fail_terminate();

    let (status, body) = send(&f, "DELETE", "/channels/s1", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Failed to stop relay process");

    let ch = f.db.get_channel("s1").await.unwrap();
    assert_eq!(ch.status, ChannelStatus::Active);
    assert_eq!(ch.pid, pid);
}

#[tokio::test]
async fn registry_failure_during_stop_leaves_worker_running() {
    let f = fleet(fast_policy()).await;
    let dir = tempfile::tempdir().unwrap();
    let schema = write_schema(dir.path(), "valid.json", &avro_schema());
    let (_, body) = send(
        &f,
        "POST",
        "/channels",
        Some(json!({"name": "s1", "port": 26001, "schema": schema})),
    )
    .await;
    let pid = body["pid"].as_u64().unwrap();
    fail_status_writes(&f.db, "s1", "registered").await;

    let (status, body) = send(&f, "DELETE", "/channels/s1", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Failed to stop relay process");
    assert!(!f.launcher.latest("s1").was_terminated());

    let (_, body) = send(&f, "GET", "/channels/s1", None).await;
    assert_eq!(body["status"], "active");
    assert_eq!(body["pid"].as_u64(), Some(pid));
    assert_eq!(f.supervisor.statuses().await.len(), 1);

    allow_status_writes(&f.db, "s1", "registered").await;
    let (status, _) = send(&f, "DELETE", "/channels/s1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(f.launcher.latest("s1").was_terminated());
}

#[tokio::test]
async fn deregister_untracked_channel_skips_stop() {
    let f = fleet(fast_policy()).await;
    f.db.register("idle", 26005, "idle.json", &Value::Null)
        .await
        .unwrap();

    let (status, _) = send(&f, "DELETE", "/channels/idle", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(f.db.get_channel("idle").await.is_err());
}

#[tokio::test]
async fn list_channels_filters_by_status() {
    let f = fleet(fast_policy()).await;
    let dir = tempfile::tempdir().unwrap();
    let schema = write_schema(dir.path(), "valid.json", &avro_schema());
    send(
        &f,
        "POST",
        "/channels",
        Some(json!({"name": "live", "port": 26001, "schema": schema})),
    )
    .await;
    f.db.register("idle", 26002, "idle.json", &Value::Null)
        .await
        .unwrap();

    let (_, body) = send(&f, "GET", "/channels", None).await;
    let names: Vec<_> = body["channels"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["live", "idle"]);

    let (_, body) = send(&f, "GET", "/channels?status=active", None).await;
    assert_eq!(body["channels"].as_array().unwrap().len(), 1);
    assert_eq!(body["channels"][0]["name"], "live");

    let (_, body) = send(&f, "GET", "/channels?status=bogus", None).await;
    assert!(body["channels"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn schema_fetch_and_validation() {
    let f = fleet(fast_policy()).await;
    let dir = tempfile::tempdir().unwrap();
    let schema = write_schema(dir.path(), "valid.json", &avro_schema());
    send(
        &f,
        "POST",
        "/channels",
        Some(json!({"name": "s1", "port": 26001, "schema": schema})),
    )
    .await;

    let (status, body) = send(&f, "GET", "/channels/s1/schema", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, avro_schema());

    let (status, body) = send(
        &f,
        "POST",
        "/channels/s1/validate-schema",
        Some(json!({"schema": avro_schema()})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);

    let reordered = json!({
        "type": "record",
        "name": "Telemetry",
        "fields": [
            {"name": "speed", "type": "double"},
            {"name": "ts", "type": "long"}
        ]
    });
    let (status, body) = send(
        &f,
        "POST",
        "/channels/s1/validate-schema",
        Some(json!({"schema": reordered})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["valid"], false);
    assert_eq!(body["registered_schema"], avro_schema());
    assert_eq!(body["provided_schema"], reordered);

    let (status, _) = send(&f, "POST", "/channels/s1/validate-schema", Some(json!({"other": 1}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &f,
        "POST",
        "/channels/ghost/validate-schema",
        Some(json!({"schema": avro_schema()})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn schema_missing_on_disk_is_404() {
    let f = fleet(fast_policy()).await;
    f.db.register("s1", 26001, "/nonexistent/gone.json", &Value::Null)
        .await
        .unwrap();

    let (status, body) = send(&f, "GET", "/channels/s1/schema", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Schema file not found");

    let (status, body) = send(
        &f,
        "POST",
        "/channels/s1/validate-schema",
        Some(json!({"schema": avro_schema()})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Schema file not found");
}

#[tokio::test]
async fn port_queries() {
    let f = fleet(fast_policy()).await;
    f.db.register("s1", 26001, "a.json", &Value::Null)
        .await
        .unwrap();

    let (status, body) = send(&f, "GET", "/ports/available?start=26000&end=26003", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available"], json!([26000, 26002, 26003]));
    assert_eq!(body["count"], 3);
    assert_eq!(body["range"], json!({"start": 26000, "end": 26003}));

    let (_, body) = send(&f, "GET", "/ports/available", None).await;
    assert_eq!(body["count"], 1000);

    let (status, _) = send(&f, "GET", "/ports/available?start=26005&end=26005", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&f, "GET", "/ports/26001/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available"], false);
    assert_eq!(body["status"], "in_use");
    assert_eq!(body["channel"], "s1");

    let (_, body) = send(&f, "GET", "/ports/26002/status", None).await;
    assert_eq!(body["available"], true);
    assert_eq!(body["status"], "free");
    assert!(body.get("channel").is_none());

    let (status, body) = send(&f, "GET", "/ports/70000/status", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Port out of range");

    let (status, body) = send(&f, "GET", "/ports/abc/status", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Port must be an integer");
}

#[tokio::test]
async fn fleet_endpoint_lists_tracked_workers() {
    let f = fleet(fast_policy()).await;
    let dir = tempfile::tempdir().unwrap();
    let schema = write_schema(dir.path(), "valid.json", &avro_schema());
    send(
        &f,
        "POST",
        "/channels",
        Some(json!({"name": "s1", "port": 26001, "schema": schema})),
    )
    .await;

    let (status, body) = send(&f, "GET", "/api/v1/fleet", None).await;
    assert_eq!(status, StatusCode::OK);
    let procs = body["processes"].as_array().unwrap();
    assert_eq!(procs.len(), 1);
    assert_eq!(procs[0]["name"], "s1");
    assert_eq!(procs[0]["state"], "running");
    assert_eq!(procs[0]["restart_count"], 0);
}
