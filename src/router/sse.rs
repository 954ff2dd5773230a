//! Status stream (server-sent events)
//!
//! One cooperative timer per connection, rescheduled with fixed delay so a
//! stalled probe never piles ticks on top of itself. Status events are
//! sent only when the observed snapshot actually changed; in between the
//! keep-alive comment line keeps proxies from cutting the connection.

use std::collections::hash_map::DefaultHasher;
use std::convert::Infallible;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::AgentError;

use super::AppState;

/// Fixed delay between status probes.
const TICK_DELAY: Duration = Duration::from_secs(2);

/// Activity is touched at most this often per stream.
const TOUCH_INTERVAL: Duration = Duration::from_secs(30);

/// Keep-alive comment cadence; invisible to the EventSource API.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    #[serde(default)]
    pub app_id: Option<u64>,
}

pub async fn status_stream(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
    Query(query): Query<StreamQuery>,
) -> Response {
    // Ownership is the upstream controller's concern; the stream only
    // refuses plainly incomplete requests.
    let Some(app_id) = query.app_id else {
        return AgentError::InputInvalid("appId query parameter is required".into())
            .into_response();
    };

    state.activity.touch(user_id);
    debug!("Status stream opened for user {} app {}", user_id, app_id);

    let (tx, rx) = mpsc::channel::<Event>(16);
    tokio::spawn(tick_loop(state, user_id, tx));

    let stream = ReceiverStream::new(rx).map(Ok::<Event, Infallible>);
    let mut response = Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(KEEP_ALIVE_INTERVAL)
                .text("keep-alive"),
        )
        .into_response();

    let headers = response.headers_mut();
    headers.insert(
        "Cache-Control",
        axum::http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        "X-Accel-Buffering",
        axum::http::HeaderValue::from_static("no"),
    );
    response
}

async fn tick_loop(state: AppState, user_id: u64, tx: mpsc::Sender<Event>) {
    let mut last_hash: Option<u64> = None;
    let mut last_touch = Instant::now();

    loop {
        // The receiver side is dropped the moment the client goes away;
        // checking here bounds the orphaned timer to one tick.
        if tx.is_closed() {
            debug!("Status stream for user {} closed", user_id);
            return;
        }

        if last_touch.elapsed() >= TOUCH_INTERVAL {
            state.activity.touch(user_id);
            last_touch = Instant::now();
        }

        let snapshot = state.observer.status(user_id).await;
        match serde_json::to_string(&snapshot) {
            Ok(payload) => {
                let hash = hash_of(&payload);
                if last_hash != Some(hash) {
                    last_hash = Some(hash);
                    let event = Event::default().event("status").data(payload);
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("Status stream for user {} failed: {}", user_id, e);
                let event = Event::default().event("error").data(e.to_string());
                let _ = tx.send(event).await;
                return;
            }
        }

        // Fixed delay, not fixed rate: the next tick is measured from the
        // end of this probe.
        tokio::time::sleep(TICK_DELAY).await;
    }
}

fn hash_of(payload: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_changes_with_payload() {
        let a = hash_of(r#"{"state":"STARTING"}"#);
        let b = hash_of(r#"{"state":"RUNNING"}"#);
        let c = hash_of(r#"{"state":"STARTING"}"#);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}
