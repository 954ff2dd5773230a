//! Per-user filesystem layout
//!
//! Everything the agent owns for a user lives under `root/<userId>`:
//!
//! ```text
//! <root>/<userId>/
//!   workspace-meta.json
//!   apps/<appId>/...
//!   apps/<appId>.deleted-<ms>/
//!   run/
//!     current.json
//!     dev.pid
//!     run-<type>-<appId>-<ms>.log
//!     managed-start.sh
//!     bin/ps
//! ```

use std::path::{Path, PathBuf};

use crate::run::RunType;

pub const META_FILE: &str = "workspace-meta.json";
pub const CURRENT_JSON: &str = "current.json";
pub const PID_FILE: &str = "dev.pid";
pub const LEGACY_DEV_LOG: &str = "dev.log";
pub const INNER_SCRIPT: &str = "managed-start.sh";

/// Host-side path helpers rooted at the configured workspace root.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn user_dir(&self, user_id: u64) -> PathBuf {
        self.root.join(user_id.to_string())
    }

    pub fn apps_dir(&self, user_id: u64) -> PathBuf {
        self.user_dir(user_id).join("apps")
    }

    pub fn app_dir(&self, user_id: u64, app_id: u64) -> PathBuf {
        self.apps_dir(user_id).join(app_id.to_string())
    }

    pub fn quarantine_dir(&self, user_id: u64, app_id: u64, epoch_ms: u64) -> PathBuf {
        self.apps_dir(user_id)
            .join(format!("{}.deleted-{}", app_id, epoch_ms))
    }

    pub fn run_dir(&self, user_id: u64) -> PathBuf {
        self.user_dir(user_id).join("run")
    }

    pub fn meta_path(&self, user_id: u64) -> PathBuf {
        self.user_dir(user_id).join(META_FILE)
    }

    pub fn current_json(&self, user_id: u64) -> PathBuf {
        self.run_dir(user_id).join(CURRENT_JSON)
    }

    pub fn pid_file(&self, user_id: u64) -> PathBuf {
        self.run_dir(user_id).join(PID_FILE)
    }

    pub fn legacy_dev_log(&self, user_id: u64) -> PathBuf {
        self.run_dir(user_id).join(LEGACY_DEV_LOG)
    }

    pub fn inner_script(&self, user_id: u64) -> PathBuf {
        self.run_dir(user_id).join(INNER_SCRIPT)
    }

    pub fn shim_bin_dir(&self, user_id: u64) -> PathBuf {
        self.run_dir(user_id).join("bin")
    }

    pub fn log_file(&self, user_id: u64, run_type: RunType, app_id: u64, epoch_ms: u64) -> PathBuf {
        self.run_dir(user_id)
            .join(format!("run-{}-{}-{}.log", run_type.file_tag(), app_id, epoch_ms))
    }
}

/// Container-side path helpers under the workspace mount point.
#[derive(Debug, Clone)]
pub struct ContainerLayout {
    mount: String,
}

impl ContainerLayout {
    pub fn new(mount: impl Into<String>) -> Self {
        let mut mount = mount.into();
        while mount.ends_with('/') && mount.len() > 1 {
            mount.pop();
        }
        Self { mount }
    }

    pub fn mount(&self) -> &str {
        &self.mount
    }

    pub fn app_dir(&self, app_id: u64) -> String {
        format!("{}/apps/{}", self.mount, app_id)
    }

    pub fn run_dir(&self) -> String {
        format!("{}/run", self.mount)
    }

    pub fn current_json(&self) -> String {
        format!("{}/run/{}", self.mount, CURRENT_JSON)
    }

    pub fn pid_file(&self) -> String {
        format!("{}/run/{}", self.mount, PID_FILE)
    }

    pub fn inner_script(&self) -> String {
        format!("{}/run/{}", self.mount, INNER_SCRIPT)
    }

    pub fn shim_bin_dir(&self) -> String {
        format!("{}/run/bin", self.mount)
    }

    pub fn log_file(&self, run_type: RunType, app_id: u64, epoch_ms: u64) -> String {
        format!(
            "{}/run/run-{}-{}-{}.log",
            self.mount,
            run_type.file_tag(),
            app_id,
            epoch_ms
        )
    }
}

/// File name of a per-task log, if the given name matches the
/// `run-<type>-<appId>-<ms>.log` shape. Returns the embedded app id.
pub fn log_file_app_id(file_name: &str) -> Option<u64> {
    let stem = file_name.strip_prefix("run-")?.strip_suffix(".log")?;
    let mut parts = stem.split('-');
    let _type = parts.next()?;
    let app_id = parts.next()?.parse().ok()?;
    let _ms: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(app_id)
}

/// Parse the app id out of a quarantined directory name
/// (`<appId>.deleted-<ms>`). Quarantined directories are never swept.
pub fn is_quarantine_dir(dir_name: &str) -> bool {
    match dir_name.split_once(".deleted-") {
        Some((id, ts)) => id.parse::<u64>().is_ok() && ts.parse::<u64>().is_ok(),
        None => false,
    }
}
