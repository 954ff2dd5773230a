//! Managed run handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AgentError, Result};
use crate::run::{RunType, StatusSnapshot};

use super::super::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub app_id: u64,
    #[serde(rename = "type")]
    pub run_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    #[serde(default)]
    pub app_id: Option<u64>,
}

/// Launch a task. Never waits for completion; poll the status endpoint or
/// subscribe to the stream.
pub async fn start(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
    Json(request): Json<StartRunRequest>,
) -> Result<Json<Value>> {
    state.activity.touch(user_id);

    let run_type = RunType::parse(&request.run_type).ok_or_else(|| {
        AgentError::InputInvalid(format!(
            "unknown run type {:?}; expected DEV, START, BUILD or INSTALL",
            request.run_type
        ))
    })?;

    let outcome = state
        .run_engine
        .launch(user_id, request.app_id, run_type)
        .await?;

    Ok(Json(json!({
        "launched": outcome.launched,
        "state": outcome.state,
        "message": outcome.message,
        "logPath": outcome.log_path,
    })))
}

/// Stop the current run. Idempotent.
pub async fn stop(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
) -> Result<Json<Value>> {
    state.activity.touch(user_id);
    let stopped = state.run_engine.stop(user_id).await?;
    Ok(Json(json!({ "stopped": stopped })))
}

/// One observer snapshot.
pub async fn status(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusSnapshot>> {
    state.activity.touch(user_id);
    let mut snapshot = state.observer.status(user_id).await;

    // Ownership is verified upstream; here we only flag a mismatch between
    // the app the client is asking about and the app actually running.
    if let (Some(asked), Some(current)) = (query.app_id, snapshot.app_id) {
        if asked != current {
            snapshot.message = Some(format!(
                "current task belongs to app {}, not app {}",
                current, asked
            ));
        }
    }

    Ok(Json(snapshot))
}
