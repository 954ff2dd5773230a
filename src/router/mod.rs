//! HTTP router
//!
//! The agent's whole surface lives under the internal prefix, behind the
//! auth gate: workspace lifecycle, managed runs, the status stream, the
//! terminal, GC triggers and the gateway port lookup.

pub mod handlers;
pub mod middleware;
pub mod sse;
pub mod websocket;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Configuration;
use crate::container::{ContainerEngine, Supervisor};
use crate::gc::OrphanCollector;
use crate::run::{RunEngine, RunObserver};
use crate::workspace::{ActivityTracker, ContainerLayout, MetaStore};

use middleware::NonceStore;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Configuration>,
    pub supervisor: Arc<Supervisor>,
    pub run_engine: Arc<RunEngine>,
    pub observer: Arc<RunObserver>,
    pub collector: Arc<OrphanCollector>,
    pub activity: Arc<ActivityTracker>,
    pub nonces: Arc<NonceStore>,
    pub meta_store: Arc<MetaStore>,
    pub engine: ContainerEngine,
    pub container_layout: ContainerLayout,
}

/// Build the HTTP router with all routes
pub fn build_router(state: AppState) -> Router {
    let internal = Router::new()
        .route("/system", get(handlers::system::system_info))
        .route("/gc/orphans", post(handlers::gc::sweep_orphans))
        .route("/lookup/:user_id", get(handlers::lookup::port_lookup))
        .nest("/workspaces/:user_id", workspace_routes())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_internal_auth,
        ));

    Router::new()
        .nest("/internal", internal)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Routes scoped to one user's workspace
fn workspace_routes() -> Router<AppState> {
    Router::new()
        .route("/ensure", post(handlers::workspaces::ensure))
        .route("/runs", post(handlers::runs::start))
        .route("/runs", delete(handlers::runs::stop))
        .route("/runs/status", get(handlers::runs::status))
        .route("/runs/stream", get(sse::status_stream))
        .route("/terminal", get(websocket::terminal_handler))
        .route("/apps/:app_id/cleanup", post(handlers::workspaces::cleanup_app))
}
