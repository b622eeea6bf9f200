//! Control API handlers.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::{Value, json};
use speeddata_core::{ChannelOverrides, WorkerSettings};
use tracing::{info, warn};

use super::AppState;
use super::error::ApiError;
use crate::storage::{Channel, ChannelStatus, Database, DatabaseError};
use crate::supervisor::ChannelSpec;

const SERVICE_NAME: &str = "speeddata-registration-api";
const DEFAULT_RANGE_START: u16 = 26000;
const DEFAULT_RANGE_END: u16 = 27000;

type ApiResult<T> = Result<T, ApiError>;

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    status: Option<String>,
}

/// `GET /channels?status=`
///
/// An unknown status matches nothing.
pub async fn list_channels(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let channels = match query.status.as_deref() {
        None | Some("") => state.db.list_channels(None).await?,
        Some(s) => match ChannelStatus::parse(s) {
            Some(status) => state.db.list_channels(Some(status)).await?,
            None => Vec::new(),
        },
    };
    Ok(Json(json!({ "channels": channels })))
}

/// `GET /channels/{name}`
pub async fn get_channel(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let channel = find_channel(&state.db, &name).await?;
    Ok(Json(channel))
}

/// `POST /channels`
///
/// Validates the request, writes the registry row and spawns the worker,
/// all under the fleet lock. A spawn failure removes the row again.
pub async fn register_channel(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let data = parse_body(&body).ok_or_else(|| ApiError::bad_request("Request body required"))?;
    let request = RegisterRequest::from_json(&data)?;
    let name = request.name.as_str();
    let port = request.port;

    WorkerSettings::resolve(name, port, state.supervisor.defaults(), &request.overrides)
        .validate()
        .map_err(|e| {
            ApiError::BadRequest(json!({
                "error": "Invalid channel config",
                "details": e.to_string(),
            }))
        })?;

    let mut fleet = state.supervisor.lock().await;

    if !state.db.is_port_available(port).await? {
        if let Some(holder) = state.db.get_channel_by_port(port).await? {
            return Err(ApiError::Conflict(json!({
                "error": "Port already in use",
                "port": port,
                "used_by": holder.name,
            })));
        }
    }

    read_schema(&request.schema)
        .await
        .map_err(|e| ApiError::BadRequest(e.into_body()))?;

    if !state
        .db
        .register(name, port, &request.schema, &request.config)
        .await?
    {
        return Err(ApiError::Conflict(json!({
            "error": "Channel name already registered",
            "name": name,
        })));
    }

    let spec = ChannelSpec {
        name: name.to_string(),
        port,
        schema_path: request.schema.clone(),
        config: request.config.clone(),
    };

    let spawned = match fleet.spawn(&spec).await {
        Ok(pid) => match state
            .db
            .update_process_info(name, pid, ChannelStatus::Active)
            .await
        {
            Ok(()) => Ok(pid),
            Err(e) => {
                if let Err(stop_err) = fleet.stop(name).await {
                    warn!(channel = name, error = %stop_err, "Failed to stop worker during rollback");
                }
                Err(e.to_string())
            }
        },
        Err(e) => Err(e.to_string()),
    };

    match spawned {
        Ok(pid) => {
            info!(channel = name, port, pid, "Channel registered");
            Ok((
                StatusCode::CREATED,
                Json(json!({
                    "status": "success",
                    "name": name,
                    "port": port,
                    "pid": pid,
                    "message": format!("Channel '{name}' registered and relay started"),
                })),
            ))
        }
        Err(details) => {
            if let Err(e) = state.db.deregister(name).await {
                warn!(channel = name, error = %e, "Failed to roll back registration");
            }
            Err(ApiError::Internal(json!({
                "error": "Failed to start relay process",
                "name": name,
                "details": details,
            })))
        }
    }
}

/// `DELETE /channels/{name}`
pub async fn deregister_channel(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let mut fleet = state.supervisor.lock().await;
    find_channel(&state.db, &name).await?;

    if fleet.is_tracked(&name) {
        fleet.stop(&name).await.map_err(|e| {
            ApiError::Internal(json!({
                "error": "Failed to stop relay process",
                "name": name,
                "details": e.to_string(),
            }))
        })?;
    }

    state.db.deregister(&name).await?;
    info!(channel = %name, "Channel deregistered");

    Ok(Json(json!({
        "status": "success",
        "name": name,
        "message": format!("Channel '{name}' de-registered and relay stopped"),
    })))
}

/// `GET /channels/{name}/schema`
pub async fn get_schema(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let channel = find_channel(&state.db, &name).await?;
    let schema = read_schema(&channel.schema_path).await?;
    Ok(Json(schema))
}

/// `POST /channels/{name}/validate-schema`
///
/// Structural equality of the two JSON documents. Object key order is
/// irrelevant, array order (e.g. a record's `fields`) is not.
pub async fn validate_schema(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let channel = find_channel(&state.db, &name).await?;

    let provided = parse_body(&body)
        .and_then(|mut data| data.get_mut("schema").map(Value::take))
        .ok_or_else(|| ApiError::bad_request("Request body must contain 'schema' field"))?;

    let registered = read_schema(&channel.schema_path).await?;

    if provided == registered {
        Ok((
            StatusCode::OK,
            Json(json!({ "valid": true, "message": "Schema matches registered schema" })),
        ))
    } else {
        Ok((
            StatusCode::CONFLICT,
            Json(json!({
                "valid": false,
                "message": "Schema does not match",
                "registered_schema": registered,
                "provided_schema": provided,
            })),
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    start: Option<String>,
    end: Option<String>,
}

/// `GET /ports/available?start=&end=`
pub async fn available_ports(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<impl IntoResponse> {
    let start = parse_range_bound(query.start.as_deref(), DEFAULT_RANGE_START, "start")?;
    let end = parse_range_bound(query.end.as_deref(), DEFAULT_RANGE_END, "end")?;
    if start >= end {
        return Err(ApiError::bad_request("Invalid range: start must be < end"));
    }

    let available = state.db.available_ports(start, end).await?;
    Ok(Json(json!({
        "range": { "start": start, "end": end },
        "count": available.len(),
        "available": available,
    })))
}

/// `GET /ports/{port}/status`
pub async fn port_status(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let port = parse_port(&Value::String(raw))?;
    let body = match state.db.get_channel_by_port(port).await? {
        Some(holder) => json!({
            "port": port,
            "available": false,
            "status": "in_use",
            "channel": holder.name,
        }),
        None => json!({ "port": port, "available": true, "status": "free" }),
    };
    Ok(Json(body))
}

/// `GET /fleet`
pub async fn fleet_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "processes": state.supervisor.statuses().await }))
}

// --- helpers ---

struct RegisterRequest {
    name: String,
    port: u16,
    schema: String,
    config: Value,
    overrides: ChannelOverrides,
}

impl RegisterRequest {
    fn from_json(data: &Value) -> ApiResult<Self> {
        let name = data.get("name").and_then(Value::as_str).unwrap_or_default();
        let schema = data.get("schema").and_then(Value::as_str).unwrap_or_default();
        let port = data.get("port").filter(|p| !p.is_null());

        let Some(port) = port.filter(|_| !name.is_empty() && !schema.is_empty()) else {
            return Err(ApiError::BadRequest(json!({
                "error": "Missing required fields",
                "required": ["name", "port", "schema"],
            })));
        };
        let port = parse_port(port)?;

        let config = data.get("config").cloned().unwrap_or(Value::Null);
        let overrides = ChannelOverrides::from_value(&config).map_err(|e| {
            ApiError::BadRequest(json!({
                "error": "Invalid channel config",
                "details": e.to_string(),
            }))
        })?;

        Ok(Self {
            name: name.to_string(),
            port,
            schema: schema.to_string(),
            config,
            overrides,
        })
    }
}

/// Accept an integer or a string holding one; reject anything outside 1..=65535.
fn parse_port(value: &Value) -> ApiResult<u16> {
    let raw = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| ApiError::bad_request("Port must be an integer"))?;

    u16::try_from(raw)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| {
            ApiError::BadRequest(json!({
                "error": "Port out of range",
                "port": raw,
                "valid_range": [1, 65535],
            }))
        })
}

fn parse_range_bound(raw: Option<&str>, default: u16, which: &str) -> ApiResult<u16> {
    match raw {
        None | Some("") => Ok(default),
        Some(s) => s
            .parse()
            .map_err(|_| ApiError::bad_request(&format!("Invalid {which} port: {s}"))),
    }
}

fn parse_body(body: &Bytes) -> Option<Value> {
    serde_json::from_slice::<Value>(body)
        .ok()
        .filter(|v| v.as_object().is_some_and(|m| !m.is_empty()))
}

/// Why a schema file could not be used.
#[derive(Debug)]
enum SchemaError {
    Missing(Value),
    Unreadable(Value),
}

impl SchemaError {
    fn into_body(self) -> Value {
        match self {
            Self::Missing(body) | Self::Unreadable(body) => body,
        }
    }
}

/// Registered schema files: missing is 404, unreadable or invalid is 500.
impl From<SchemaError> for ApiError {
    fn from(e: SchemaError) -> Self {
        match e {
            SchemaError::Missing(body) => Self::NotFound(body),
            SchemaError::Unreadable(body) => Self::Internal(body),
        }
    }
}

/// Read and parse a schema file.
async fn read_schema(path: &str) -> Result<Value, SchemaError> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SchemaError::Missing(json!({ "error": "Schema file not found", "path": path }))
        } else {
            SchemaError::Unreadable(json!({
                "error": "Failed to read schema file",
                "path": path,
                "details": e.to_string(),
            }))
        }
    })?;
    serde_json::from_str(&text).map_err(|e| {
        SchemaError::Unreadable(json!({
            "error": "Invalid schema file (not valid JSON)",
            "path": path,
            "details": e.to_string(),
        }))
    })
}

async fn find_channel(db: &Database, name: &str) -> ApiResult<Channel> {
    match db.get_channel(name).await {
        Ok(ch) => Ok(ch),
        Err(DatabaseError::NotFound(_)) => Err(ApiError::channel_not_found(name)),
        Err(e) => Err(e.into()),
    }
}
