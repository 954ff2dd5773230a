//! Orphan sweep trigger

use std::collections::HashSet;

use axum::{extract::State, Json};
use serde::Deserialize;

use crate::error::Result;
use crate::gc::SweepReport;

use super::super::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanSweepRequest {
    pub app_ids: Vec<u64>,
}

/// Run the reconciliation sweep against the id set the control plane says
/// still exists.
pub async fn sweep_orphans(
    State(state): State<AppState>,
    Json(request): Json<OrphanSweepRequest>,
) -> Result<Json<SweepReport>> {
    let live: HashSet<u64> = request.app_ids.into_iter().collect();
    let report = state.collector.sweep(&live).await;
    Ok(Json(report))
}
