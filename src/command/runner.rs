//! Bounded subprocess execution
//!
//! The single process-spawning primitive used by the engine adapter, the
//! run engine and the garbage collector. Captures merged stdout+stderr up
//! to a fixed cap; full task output belongs in the task's log file, not in
//! memory.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Merged-output capture cap. Only error context matters; anything longer
/// lives in the per-task log file.
pub const MAX_CAPTURE_BYTES: usize = 32 * 1024;

/// Exit code synthesized when the deadline fires, matching timeout(1).
pub const EXIT_TIMEOUT: i32 = 124;

/// Grace period between SIGTERM and SIGKILL on timeout.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Result of a completed (or failed) subprocess invocation.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Process exit code; 124 on timeout, -1 when no code was reported.
    pub exit_code: i32,

    /// Merged stdout+stderr, truncated to [`MAX_CAPTURE_BYTES`].
    pub output: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn spawn_failure(err: &std::io::Error, program: &str) -> Self {
        Self {
            exit_code: -1,
            output: format!("failed to spawn {}: {}", program, err),
        }
    }
}

/// Shared, capped output buffer filled by the drain tasks.
#[derive(Clone, Default)]
struct CaptureBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    fn push(&self, chunk: &[u8]) {
        let mut buf = self.inner.lock();
        let remaining = MAX_CAPTURE_BYTES.saturating_sub(buf.len());
        if remaining > 0 {
            buf.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
        }
    }

    fn into_string(self) -> String {
        let buf = self.inner.lock();
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// Run an external command to completion with a deadline.
///
/// stdout and stderr are drained on background tasks so a chatty child can
/// never deadlock on a full pipe. On timeout the child receives SIGTERM,
/// then SIGKILL after a short grace, and the result carries exit code 124.
pub async fn run(argv: &[String], stdin: Option<&[u8]>, timeout: Duration) -> CommandResult {
    let Some((program, args)) = argv.split_first() else {
        return CommandResult {
            exit_code: -1,
            output: "empty argv".to_string(),
        };
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!("Spawn failed for {}: {}", program, e);
            return CommandResult::spawn_failure(&e, program);
        }
    };

    if let (Some(payload), Some(mut handle)) = (stdin, child.stdin.take()) {
        let payload = payload.to_vec();
        tokio::spawn(async move {
            // The child may exit without reading; a broken pipe is fine.
            let _ = handle.write_all(&payload).await;
            let _ = handle.shutdown().await;
        });
    }

    let capture = CaptureBuffer::default();
    let mut drains = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        drains.push(tokio::spawn(drain(stdout, capture.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        drains.push(tokio::spawn(drain(stderr, capture.clone())));
    }

    let exit_code = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status.code().unwrap_or(-1),
        Ok(Err(e)) => {
            warn!("Wait failed for {}: {}", program, e);
            -1
        }
        Err(_) => {
            debug!("Timeout after {:?} for {}", timeout, program);
            terminate(&mut child).await;
            EXIT_TIMEOUT
        }
    };

    for drain in drains {
        let _ = drain.await;
    }

    CommandResult {
        exit_code,
        output: capture.into_string(),
    }
}

/// Convenience wrapper for argv built from string literals.
pub async fn run_args<S: AsRef<str>>(
    argv: &[S],
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> CommandResult {
    let owned: Vec<String> = argv.iter().map(|s| s.as_ref().to_string()).collect();
    run(&owned, stdin, timeout).await
}

async fn drain<R: tokio::io::AsyncRead + Unpin>(mut reader: R, capture: CaptureBuffer) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => capture.push(&chunk[..n]),
        }
    }
}

/// SIGTERM, short grace, then SIGKILL.
async fn terminate(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}
