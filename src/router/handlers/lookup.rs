//! Gateway port lookup
//!
//! The external nginx gateway resolves preview traffic with an auth
//! subrequest: it asks for the user's host port and gets it back in a
//! response header on a bodyless 204. Preview traffic keeps the workspace
//! alive, so the lookup touches the activity tracker.
//!
//! This path skips request signing (nginx cannot sign subrequests); it is
//! guarded by a shared token or loopback instead.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::error::AgentError;

use super::super::AppState;

pub const PORT_HEADER: &str = "X-WS-Port";
const TOKEN_HEADER: &str = "X-WS-Lookup-Token";

#[derive(Debug, Deserialize)]
pub struct LookupQuery {
    #[serde(default)]
    pub token: Option<String>,
}

pub async fn port_lookup(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(user_id): Path<u64>,
    Query(query): Query<LookupQuery>,
    headers: HeaderMap,
) -> Response {
    let configured = &state.config.auth.lookup_token;
    let presented = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.token);

    let token_ok = !configured.is_empty() && presented.as_deref() == Some(configured.as_str());
    if !token_ok && !addr.ip().is_loopback() {
        return AgentError::Forbidden("lookup requires the shared token or loopback".into())
            .into_response();
    }

    state.activity.touch(user_id);

    match state.meta_store.load(user_id).await {
        Ok(Some(meta)) => (
            StatusCode::NO_CONTENT,
            [(PORT_HEADER, meta.host_port.to_string())],
        )
            .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => e.into_response(),
    }
}
