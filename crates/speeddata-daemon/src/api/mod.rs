//! HTTP control plane.
//!
//! Handlers get the registry and the supervisor through [`AppState`]; the
//! same routes are mounted at `/` and under `/api/v1`.

mod error;
mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

pub use error::ApiError;

use crate::storage::Database;
use crate::supervisor::Supervisor;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub supervisor: Arc<Supervisor>,
}

fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(routes::health))
        .route(
            "/channels",
            get(routes::list_channels).post(routes::register_channel),
        )
        .route(
            "/channels/{name}",
            get(routes::get_channel).delete(routes::deregister_channel),
        )
        .route("/channels/{name}/schema", get(routes::get_schema))
        .route(
            "/channels/{name}/validate-schema",
            post(routes::validate_schema),
        )
        .route("/ports/available", get(routes::available_ports))
        .route("/ports/{port}/status", get(routes::port_status))
        .route("/fleet", get(routes::fleet_status))
}

/// Build the control plane router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(routes())
        .nest("/api/v1", routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
