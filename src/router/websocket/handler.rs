//! WebSocket terminal
//!
//! An interactive shell into the user's container, attached host-side via
//! `docker exec -i`. Alongside the interactive shell the client can run
//! one cancellable command at a time (`exec`), which gets its own exec
//! session so cancelling it never kills the shell.
//!
//! No PTY is allocated: stdout and stderr are merged into `stdout` events
//! and `resize` is acknowledged as a no-op.

use std::process::Stdio;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::super::AppState;

/// Grace between TERM and KILL when cancelling an exec job.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// ETX, what a raw Ctrl-C keypress feeds a terminal.
const ETX: &[u8] = b"\x03";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalQuery {
    #[serde(default)]
    pub app_id: Option<u64>,
}

/// Inbound envelope: `{"type": ..., "data": ...}`
#[derive(Debug, Deserialize)]
struct WsIncoming {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: String,
}

/// Outbound envelope, mirrored shape.
#[derive(Debug, Serialize)]
struct WsOutgoing {
    #[serde(rename = "type")]
    kind: String,
    data: String,
}

impl WsOutgoing {
    fn new(kind: &str, data: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            data: data.into(),
        }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub async fn terminal_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
    Query(query): Query<TerminalQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_terminal(socket, state, user_id, query.app_id))
}

async fn handle_terminal(socket: WebSocket, state: AppState, user_id: u64, app_id: Option<u64>) {
    let (mut sender, mut receiver) = socket.split();
    state.activity.touch(user_id);

    let Some(app_id) = app_id else {
        let _ = sender
            .send(Message::Text(
                WsOutgoing::new("error", "appId query parameter is required").to_json(),
            ))
            .await;
        return;
    };

    let container_name = state.meta_store.container_name(user_id);
    let binary = state.config.container.binary.clone();

    // The interactive shell for the whole session
    let mut shell = match spawn_shell(&binary, &container_name) {
        Ok(shell) => shell,
        Err(e) => {
            let _ = sender
                .send(Message::Text(
                    WsOutgoing::new("error", format!("cannot open shell: {}", e)).to_json(),
                ))
                .await;
            return;
        }
    };

    let mut shell_stdin = shell.stdin.take();
    let (event_tx, mut event_rx) = mpsc::channel::<WsOutgoing>(64);

    if let Some(stdout) = shell.stdout.take() {
        tokio::spawn(pump(stdout, event_tx.clone(), "stdout"));
    }
    if let Some(stderr) = shell.stderr.take() {
        tokio::spawn(pump(stderr, event_tx.clone(), "stdout"));
    }

    info!("Terminal connected for user {} app {}", user_id, app_id);
    let _ = sender
        .send(Message::Text(WsOutgoing::new("ready", "").to_json()))
        .await;

    let app_dir = state.container_layout.app_dir(app_id);
    let mut exec_job: Option<ExecJob> = None;

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let message = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(_data))) => {
                        // axum answers pings itself
                        continue;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Terminal transport error for user {}: {}", user_id, e);
                        break;
                    }
                };

                state.activity.touch(user_id);

                let Ok(incoming) = serde_json::from_str::<WsIncoming>(&message) else {
                    let _ = sender
                        .send(Message::Text(
                            WsOutgoing::new("error", "unparseable message").to_json(),
                        ))
                        .await;
                    continue;
                };

                match incoming.kind.as_str() {
                    "stdin" => {
                        if let Some(stdin) = shell_stdin.as_mut() {
                            if stdin.write_all(incoming.data.as_bytes()).await.is_err() {
                                let _ = sender
                                    .send(Message::Text(
                                        WsOutgoing::new("error", "shell stdin is closed").to_json(),
                                    ))
                                    .await;
                            }
                        }
                    }
                    "exec" => {
                        if exec_job.as_ref().map(|j| !j.finished()).unwrap_or(false) {
                            let _ = sender
                                .send(Message::Text(
                                    WsOutgoing::new("error", "a command is already running; cancel it first")
                                        .to_json(),
                                ))
                                .await;
                            continue;
                        }
                        match start_exec(&binary, &container_name, &app_dir, &incoming.data, event_tx.clone()) {
                            Ok(job) => {
                                let _ = sender
                                    .send(Message::Text(WsOutgoing::new("exec_start", incoming.data).to_json()))
                                    .await;
                                exec_job = Some(job);
                            }
                            Err(e) => {
                                let _ = sender
                                    .send(Message::Text(
                                        WsOutgoing::new("error", format!("cannot exec: {}", e)).to_json(),
                                    ))
                                    .await;
                            }
                        }
                    }
                    "cancel" => {
                        if let Some(job) = exec_job.take() {
                            job.cancel();
                        }
                    }
                    "ctrl_c" => {
                        // With a command running, Ctrl-C means "stop it";
                        // otherwise pass ETX to the shell (best effort
                        // without a TTY).
                        if let Some(job) = exec_job.as_ref().filter(|j| !j.finished()) {
                            job.request_cancel();
                        } else if let Some(stdin) = shell_stdin.as_mut() {
                            let _ = stdin.write_all(ETX).await;
                        }
                        let _ = sender
                            .send(Message::Text(WsOutgoing::new("ctrl_c", "").to_json()))
                            .await;
                    }
                    "resize" => {
                        // No PTY, nothing to resize; acknowledged so clients
                        // do not retry.
                        let _ = sender
                            .send(Message::Text(WsOutgoing::new("resize", incoming.data).to_json()))
                            .await;
                    }
                    "close" => break,
                    other => {
                        debug!("Unknown terminal message type: {}", other);
                    }
                }
            }

            event = event_rx.recv() => {
                match event {
                    Some(outgoing) => {
                        if sender.send(Message::Text(outgoing.to_json())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            status = shell.wait() => {
                let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                let _ = sender
                    .send(Message::Text(WsOutgoing::new("exit", code.to_string()).to_json()))
                    .await;
                break;
            }
        }
    }

    // Teardown: both children die with the session, graceful then forced.
    if let Some(job) = exec_job.take() {
        job.cancel();
    }
    terminate_child(&mut shell).await;
    info!("Terminal disconnected for user {}", user_id);
}

fn spawn_shell(binary: &str, container_name: &str) -> std::io::Result<Child> {
    Command::new(binary)
        .args(["exec", "-i", container_name, "bash"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// A cancellable side command, owned by its shepherd task.
struct ExecJob {
    token: CancellationToken,
    done: tokio::sync::watch::Receiver<bool>,
}

impl ExecJob {
    fn finished(&self) -> bool {
        *self.done.borrow()
    }

    fn request_cancel(&self) {
        self.token.cancel();
    }

    fn cancel(self) {
        self.token.cancel();
    }
}

fn start_exec(
    binary: &str,
    container_name: &str,
    app_dir: &str,
    command: &str,
    events: mpsc::Sender<WsOutgoing>,
) -> std::io::Result<ExecJob> {
    let script = format!("cd {} && {}", shell_words::quote(app_dir), command);
    let mut child = Command::new(binary)
        .args(["exec", "-i", container_name, "bash", "-lc", &script])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, events.clone(), "exec_stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, events.clone(), "exec_stdout"));
    }

    let token = CancellationToken::new();
    let (done_tx, done_rx) = tokio::sync::watch::channel(false);

    let job_token = token.clone();
    tokio::spawn(async move {
        let code = tokio::select! {
            status = child.wait() => status.ok().and_then(|s| s.code()).unwrap_or(-1),
            _ = job_token.cancelled() => {
                terminate_child(&mut child).await;
                130
            }
        };
        let _ = done_tx.send(true);
        let _ = events
            .send(WsOutgoing::new("exec_exit", code.to_string()))
            .await;
    });

    Ok(ExecJob {
        token,
        done: done_rx,
    })
}

async fn pump<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    events: mpsc::Sender<WsOutgoing>,
    kind: &'static str,
) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let data = String::from_utf8_lossy(&chunk[..n]).into_owned();
                if events.send(WsOutgoing::new(kind, data)).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn terminate_child(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(CANCEL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let incoming: WsIncoming =
            serde_json::from_str(r#"{"type":"stdin","data":"ls\n"}"#).unwrap();
        assert_eq!(incoming.kind, "stdin");
        assert_eq!(incoming.data, "ls\n");

        // data is optional on the wire
        let incoming: WsIncoming = serde_json::from_str(r#"{"type":"ctrl_c"}"#).unwrap();
        assert_eq!(incoming.kind, "ctrl_c");
        assert_eq!(incoming.data, "");

        let outgoing = WsOutgoing::new("exec_exit", "0").to_json();
        assert_eq!(outgoing, r#"{"type":"exec_exit","data":"0"}"#);
    }

    #[tokio::test]
    async fn test_exec_job_reports_exit() {
        let (tx, mut rx) = mpsc::channel(16);
        // `true` here is the host binary, standing in for the engine CLI
        let job = start_exec("true", "ws-u1", "/workspace/apps/1", "noop", tx).unwrap();

        let mut exit_seen = false;
        while let Some(event) = rx.recv().await {
            if event.kind == "exec_exit" {
                exit_seen = true;
                break;
            }
        }
        assert!(exit_seen);
        assert!(job.finished());
    }

    #[tokio::test]
    async fn test_exec_job_cancel_kills_child() {
        // A fake engine binary that ignores its arguments and blocks
        let dir = tempfile::TempDir::new().unwrap();
        let fake = dir.path().join("fake-engine");
        std::fs::write(&fake, "#!/bin/sh\nsleep 30\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let (tx, mut rx) = mpsc::channel(16);
        let job = start_exec(fake.to_str().unwrap(), "ws-u1", "/tmp", "ignored", tx).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        job.request_cancel();

        let mut code = None;
        while let Some(event) = rx.recv().await {
            if event.kind == "exec_exit" {
                code = Some(event.data);
                break;
            }
        }
        assert_eq!(code.as_deref(), Some("130"));
    }
}
