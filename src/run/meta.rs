//! Run meta and pid file access
//!
//! `current.json` and `dev.pid` live on the shared workspace mount, so both
//! the host-side agent and the in-container launch scripts read and write
//! them. The agent only ever reads here; writes happen in the scripts,
//! except for the cleanup paths that delete both files together.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::workspace::WorkspaceLayout;

use super::types::RunMeta;

/// Outcome of reading `current.json`.
#[derive(Debug)]
pub enum RunMetaRead {
    /// No current task
    Missing,
    /// File exists but does not parse; callers fall back to legacy paths
    Corrupt,
    Present(RunMeta),
}

impl RunMetaRead {
    pub fn into_option(self) -> Option<RunMeta> {
        match self {
            RunMetaRead::Present(meta) => Some(meta),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct RunMetaStore {
    layout: WorkspaceLayout,
}

impl RunMetaStore {
    pub fn new(layout: WorkspaceLayout) -> Self {
        Self { layout }
    }

    pub async fn read(&self, user_id: u64) -> RunMetaRead {
        let path = self.layout.current_json(user_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(meta) => RunMetaRead::Present(meta),
                Err(e) => {
                    warn!("Corrupt {}: {}", path.display(), e);
                    RunMetaRead::Corrupt
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RunMetaRead::Missing,
            Err(e) => {
                warn!("Cannot read {}: {}", path.display(), e);
                RunMetaRead::Corrupt
            }
        }
    }

    /// Pid recorded by the outer launcher, the group leader the stop path
    /// signals.
    pub async fn read_pid_file(&self, user_id: u64) -> Option<i64> {
        let path = self.layout.pid_file(user_id);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        content.trim().parse().ok()
    }

    /// Log file to truncate when a client clears the current log. The
    /// legacy `dev.log` is only consulted when `current.json` is missing
    /// or unreadable.
    pub async fn log_path_for_clear(&self, user_id: u64) -> PathBuf {
        match self.read(user_id).await {
            RunMetaRead::Present(meta) => PathBuf::from(meta.log_path),
            _ => self.layout.legacy_dev_log(user_id),
        }
    }

    /// Remove `current.json` and `dev.pid` together. Idempotent.
    pub async fn clear(&self, user_id: u64) {
        for path in [
            self.layout.current_json(user_id),
            self.layout.pid_file(user_id),
        ] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Cannot remove {}: {}", path.display(), e),
            }
        }
    }
}
