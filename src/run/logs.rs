//! Per-task log retention
//!
//! Log files accumulate one per launch; retention keeps the newest N per
//! task kind and drops the rest. Pruned on every ensure, every launch and
//! on app deletion.

use std::path::PathBuf;
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::workspace::{layout::log_file_app_id, WorkspaceLayout};

use super::types::RunType;

const ALL_TYPES: [RunType; 4] = [RunType::Dev, RunType::Start, RunType::Build, RunType::Install];

#[derive(Clone)]
pub struct LogRetention {
    layout: WorkspaceLayout,
    keep_per_type: usize,
}

impl LogRetention {
    pub fn new(layout: WorkspaceLayout, keep_per_type: usize) -> Self {
        Self {
            layout,
            keep_per_type,
        }
    }

    /// Keep the newest `keep_per_type` logs per task kind, by modification
    /// time; delete everything older. Errors are logged and swallowed.
    pub async fn prune(&self, user_id: u64) {
        for run_type in ALL_TYPES {
            let mut files = self.list_type(user_id, run_type).await;
            if files.len() <= self.keep_per_type {
                continue;
            }
            // newest first
            files.sort_by(|a, b| b.1.cmp(&a.1));
            for (path, _) in files.into_iter().skip(self.keep_per_type) {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => debug!("Pruned log {}", path.display()),
                    Err(e) => warn!("Cannot prune {}: {}", path.display(), e),
                }
            }
        }
    }

    /// Delete every task log belonging to an app, regardless of age.
    pub async fn delete_for_app(&self, user_id: u64, app_id: u64) {
        for (path, name) in self.list_all(user_id).await {
            if log_file_app_id(&name) == Some(app_id) {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!("Cannot delete {}: {}", path.display(), e);
                }
            }
        }
    }

    async fn list_all(&self, user_id: u64) -> Vec<(PathBuf, String)> {
        let run_dir = self.layout.run_dir(user_id);
        let mut out = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&run_dir).await else {
            return out;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("run-") && name.ends_with(".log") {
                out.push((entry.path(), name));
            }
        }
        out
    }

    async fn list_type(&self, user_id: u64, run_type: RunType) -> Vec<(PathBuf, SystemTime)> {
        let prefix = format!("run-{}-", run_type.file_tag());
        let mut out = Vec::new();
        for (path, name) in self.list_all(user_id).await {
            if !name.starts_with(&prefix) {
                continue;
            }
            let modified = tokio::fs::metadata(&path)
                .await
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((path, modified));
        }
        out
    }
}
