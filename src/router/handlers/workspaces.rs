//! Workspace lifecycle handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};

use crate::error::Result;

use super::super::AppState;

/// Idempotently provision the user's container and return the meta.
pub async fn ensure(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
) -> Result<Json<Value>> {
    state.activity.touch(user_id);
    let meta = state.supervisor.ensure(user_id).await?;
    Ok(Json(json!({
        "workspace": meta,
    })))
}

/// Control-plane hook: an application was deleted upstream.
pub async fn cleanup_app(
    State(state): State<AppState>,
    Path((user_id, app_id)): Path<(u64, u64)>,
) -> Result<Json<Value>> {
    state.activity.touch(user_id);
    state.collector.cleanup_app(user_id, app_id).await?;
    Ok(Json(json!({
        "cleaned": true,
        "appId": app_id,
    })))
}
