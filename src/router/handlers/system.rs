//! Agent self-description

use axum::{extract::State, Json};
use serde_json::{json, Value};

use super::super::AppState;

pub async fn system_info(State(state): State<AppState>) -> Json<Value> {
    let engine_version = state
        .engine
        .version()
        .await
        .unwrap_or_else(|_| "unavailable".to_string());

    Json(json!({
        "name": state.config.system.node_name,
        "version": env!("CARGO_PKG_VERSION"),
        "engineVersion": engine_version,
        "trackedUsers": state.activity.len(),
    }))
}
