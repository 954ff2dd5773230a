//! Run-state observation
//!
//! Reconciles the durable run meta with what is actually true in the
//! container (process liveness, port reachability) and reduces it to the
//! bounded state set clients see. The observer never mutates anything.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::config::{PreviewConfiguration, RunConfiguration};
use crate::container::{ContainerEngine, ContainerStatus};
use crate::workspace::MetaStore;

use super::meta::{RunMetaRead, RunMetaStore};
use super::types::{RunState, RunType};

/// Point-in-time view of a user's run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<u64>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub run_type: Option<RunType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusSnapshot {
    fn bare(state: RunState) -> Self {
        Self {
            state,
            app_id: None,
            run_type: None,
            pid: None,
            preview_url: None,
            log_path: None,
            message: None,
        }
    }

    fn with_message(state: RunState, message: impl Into<String>) -> Self {
        let mut snapshot = Self::bare(state);
        snapshot.message = Some(message.into());
        snapshot
    }
}

/// Result of the in-container liveness probe for long-running tasks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct LiveProbe {
    alive: bool,
    port_open: bool,
    /// Process group of whatever listens on the port, when resolvable
    listener_pgid: Option<i64>,
}

#[derive(Clone)]
pub struct RunObserver {
    engine: ContainerEngine,
    meta_store: MetaStore,
    run_meta: RunMetaStore,
    run_config: RunConfiguration,
    preview: PreviewConfiguration,
    container_port: u16,
}

impl RunObserver {
    pub fn new(
        engine: ContainerEngine,
        meta_store: MetaStore,
        run_meta: RunMetaStore,
        run_config: RunConfiguration,
        preview: PreviewConfiguration,
        container_port: u16,
    ) -> Self {
        Self {
            engine,
            meta_store,
            run_meta,
            run_config,
            preview,
            container_port,
        }
    }

    /// Compute the current state for a user.
    pub async fn status(&self, user_id: u64) -> StatusSnapshot {
        let meta = match self.run_meta.read(user_id).await {
            RunMetaRead::Missing => return StatusSnapshot::bare(RunState::Idle),
            RunMetaRead::Corrupt => {
                return StatusSnapshot::with_message(
                    RunState::Unknown,
                    "run metadata is unreadable; stop the run to reset it",
                )
            }
            RunMetaRead::Present(meta) => meta,
        };

        let container_name = self.meta_store.container_name(user_id);
        let container_status = self.engine.status(&container_name).await;
        if !container_status.is_running() {
            let mut snapshot = self.annotated(RunState::Dead, &meta);
            snapshot.message = Some(format!("container is {}", container_status));
            return snapshot;
        }

        let container_port = match self.meta_store.load(user_id).await {
            Ok(Some(ws)) => ws.container_port,
            _ => self.container_port,
        };

        match meta.pid {
            None => self.status_without_pid(&meta),
            Some(pid) => {
                if meta.run_type.is_long_running() {
                    self.status_long_running(user_id, &container_name, &meta, pid, container_port)
                        .await
                } else {
                    self.status_finite(&container_name, &meta, pid).await
                }
            }
        }
    }

    /// Early startup: the inner script has not recorded its pid yet, or a
    /// finite task finished and nulled it.
    fn status_without_pid(&self, meta: &super::types::RunMeta) -> StatusSnapshot {
        let elapsed = (chrono::Utc::now().timestamp() - meta.started_at).max(0) as u64;

        match meta.run_type {
            RunType::Build | RunType::Install => match meta.exit_code {
                Some(0) => self.annotated(RunState::Success, meta),
                Some(code) => {
                    let mut snapshot = self.annotated(RunState::Failed, meta);
                    snapshot.message = Some(format!("exited with code {}", code));
                    snapshot
                }
                None if elapsed >= self.run_config.start_timeout_secs => {
                    let mut snapshot = self.annotated(RunState::Dead, meta);
                    snapshot.message = Some("start timeout".into());
                    snapshot
                }
                None => self.annotated(meta.run_type.initial_state(), meta),
            },
            RunType::Dev | RunType::Start => {
                if elapsed >= self.run_config.start_timeout_secs {
                    let mut snapshot = self.annotated(RunState::Dead, meta);
                    snapshot.message = Some("start timeout".into());
                    snapshot
                } else {
                    self.annotated(RunState::Starting, meta)
                }
            }
        }
    }

    async fn status_finite(
        &self,
        container_name: &str,
        meta: &super::types::RunMeta,
        pid: i64,
    ) -> StatusSnapshot {
        let alive = self.probe_pid(container_name, pid).await;
        if alive {
            return self.annotated(meta.run_type.initial_state(), meta);
        }
        match meta.exit_code {
            Some(0) => self.annotated(RunState::Success, meta),
            Some(code) => {
                let mut snapshot = self.annotated(RunState::Failed, meta);
                snapshot.message = Some(format!("exited with code {}", code));
                snapshot
            }
            None => StatusSnapshot::with_message(
                RunState::Unknown,
                "task process is gone without a recorded exit code",
            ),
        }
    }

    async fn status_long_running(
        &self,
        user_id: u64,
        container_name: &str,
        meta: &super::types::RunMeta,
        pid: i64,
        container_port: u16,
    ) -> StatusSnapshot {
        let probe = self.probe_live(container_name, pid, container_port).await;

        if !probe.alive {
            let mut snapshot = self.annotated(RunState::Dead, meta);
            snapshot.message = Some(match meta.exit_code {
                Some(code) => format!("process exited with code {}", code),
                None => "process is gone".into(),
            });
            return snapshot;
        }

        if !probe.port_open {
            return self.annotated(RunState::Starting, meta);
        }

        let mut snapshot = self.annotated(RunState::Running, meta);
        snapshot.preview_url = Some(self.preview_url(user_id));
        if let Some(listener_pgid) = probe.listener_pgid {
            if listener_pgid != pid {
                snapshot.message = Some(format!(
                    "port {} is served by process group {} instead of the managed run; a stale process may own it",
                    container_port, listener_pgid
                ));
            }
        }
        snapshot
    }

    fn annotated(&self, state: RunState, meta: &super::types::RunMeta) -> StatusSnapshot {
        StatusSnapshot {
            state,
            app_id: Some(meta.app_id),
            run_type: Some(meta.run_type),
            pid: meta.pid,
            preview_url: None,
            log_path: Some(meta.log_path.clone()),
            message: None,
        }
    }

    async fn probe_pid(&self, container_name: &str, pid: i64) -> bool {
        let script = format!("kill -0 {} 2>/dev/null && echo ALIVE || echo GONE", pid);
        let result = self
            .engine
            .exec_with_timeout(container_name, &script, self.probe_timeout())
            .await;
        result.success() && result.output.contains("ALIVE")
    }

    /// One probe answers all three questions for long-running tasks:
    /// session liveness, port reachability, and which process group the
    /// listener belongs to (`/proc/<pid>/stat` field 5).
    async fn probe_live(&self, container_name: &str, pid: i64, port: u16) -> LiveProbe {
        let script = format!(
            r#"alive=0
kill -0 {pid} 2>/dev/null && alive=1
port=0
if bash -c 'exec 3<>/dev/tcp/127.0.0.1/{port}' 2>/dev/null; then port=1; fi
lpgid=
if [ "$port" = "1" ]; then
  port_hex=$(printf '%04X' {port})
  for tbl in /proc/net/tcp /proc/net/tcp6; do
    [ -r "$tbl" ] || continue
    for inode in $(awk -v p=":$port_hex" '$2 ~ (p "$") && $4 == "0A" {{print $10}}' "$tbl"); do
      for fd in /proc/[0-9]*/fd/*; do
        [ "$(readlink "$fd" 2>/dev/null)" = "socket:[$inode]" ] || continue
        lpid=${{fd#/proc/}}
        lpid=${{lpid%%/*}}
        lpgid=$(awk '{{print $5}}' "/proc/$lpid/stat" 2>/dev/null)
        break 3
      done
    done
  done
fi
echo "alive=$alive port=$port lpgid=$lpgid"
"#,
            pid = pid,
            port = port,
        );

        let result = self
            .engine
            .exec_with_timeout(container_name, &script, self.probe_timeout())
            .await;
        if !result.success() {
            debug!("Live probe failed: {}", result.output);
            return LiveProbe::default();
        }
        parse_live_probe(&result.output)
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.run_config.probe_timeout_secs)
    }

    /// `<base><prefix>/<userId>/`, tolerant of stray slashes in config.
    pub fn preview_url(&self, user_id: u64) -> String {
        let base = self.preview.base_url.trim_end_matches('/');
        let prefix = self.preview.path_prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{}/{}/", base, user_id)
        } else {
            format!("{}/{}/{}/", base, prefix, user_id)
        }
    }
}

fn parse_live_probe(output: &str) -> LiveProbe {
    let Some(line) = output
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| l.starts_with("alive="))
    else {
        return LiveProbe::default();
    };

    let mut probe = LiveProbe::default();
    for field in line.split_whitespace() {
        match field.split_once('=') {
            Some(("alive", v)) => probe.alive = v == "1",
            Some(("port", v)) => probe.port_open = v == "1",
            Some(("lpgid", v)) => probe.listener_pgid = v.parse().ok(),
            _ => {}
        }
    }
    probe
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContainerConfiguration, PreviewConfiguration};
    use crate::workspace::WorkspaceLayout;
    use tempfile::TempDir;

    #[test]
    fn test_parse_live_probe() {
        let probe = parse_live_probe("alive=1 port=1 lpgid=123\n");
        assert!(probe.alive);
        assert!(probe.port_open);
        assert_eq!(probe.listener_pgid, Some(123));

        let probe = parse_live_probe("noise\nalive=1 port=0 lpgid=\n");
        assert!(probe.alive);
        assert!(!probe.port_open);
        assert_eq!(probe.listener_pgid, None);

        assert_eq!(parse_live_probe("garbage"), LiveProbe::default());
    }

    fn observer(root: &std::path::Path) -> RunObserver {
        let layout = WorkspaceLayout::new(root);
        RunObserver::new(
            ContainerEngine::with_binary("false", Duration::from_secs(1)),
            MetaStore::new(layout.clone(), ContainerConfiguration::default()),
            RunMetaStore::new(layout),
            RunConfiguration::default(),
            PreviewConfiguration {
                base_url: "https://host/".into(),
                path_prefix: "/ws/".into(),
            },
            5173,
        )
    }

    #[tokio::test]
    async fn test_idle_without_current_json() {
        let dir = TempDir::new().unwrap();
        let snapshot = observer(dir.path()).status(1).await;
        assert_eq!(snapshot.state, RunState::Idle);
    }

    #[tokio::test]
    async fn test_dead_when_container_not_running() {
        let dir = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(dir.path());
        tokio::fs::create_dir_all(layout.run_dir(1)).await.unwrap();
        tokio::fs::write(
            layout.current_json(1),
            r#"{"appId":7,"type":"DEV","pid":11,"startedAt":1,"finishedAt":null,"exitCode":null,"logPath":"x"}"#,
        )
        .await
        .unwrap();

        // Engine binary `false` fails every inspect → status UNKNOWN → not running
        let snapshot = observer(dir.path()).status(1).await;
        assert_eq!(snapshot.state, RunState::Dead);
        assert!(snapshot.message.unwrap().contains("container is"));
        assert_eq!(snapshot.app_id, Some(7));
    }

    #[tokio::test]
    async fn test_unknown_on_corrupt_meta() {
        let dir = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(dir.path());
        tokio::fs::create_dir_all(layout.run_dir(1)).await.unwrap();
        tokio::fs::write(layout.current_json(1), "{broken").await.unwrap();

        let snapshot = observer(dir.path()).status(1).await;
        assert_eq!(snapshot.state, RunState::Unknown);
    }

    #[test]
    fn test_preview_url_sanitization() {
        let dir = TempDir::new().unwrap();
        let obs = observer(dir.path());
        assert_eq!(obs.preview_url(42), "https://host/ws/42/");
    }

    // Probe-based paths, exercised through a fake engine binary that
    // reports the container as running and passes exec scripts to the
    // local shell.

    fn passthrough_observer(root: &std::path::Path, container_port: u16) -> RunObserver {
        let fake = root.join("fake-engine");
        std::fs::write(
            &fake,
            "#!/bin/sh\ncmd=$1; shift\ncase \"$cmd\" in\n  inspect) echo running ;;\n  exec) shift; exec \"$@\" ;;\n  *) exit 0 ;;\nesac\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let layout = WorkspaceLayout::new(root);
        let mut container = ContainerConfiguration::default();
        container.container_port = container_port;
        RunObserver::new(
            ContainerEngine::with_binary(fake.to_str().unwrap(), Duration::from_secs(10)),
            MetaStore::new(layout.clone(), container),
            RunMetaStore::new(layout),
            RunConfiguration::default(),
            PreviewConfiguration {
                base_url: "https://host".into(),
                path_prefix: "/ws".into(),
            },
            container_port,
        )
    }

    async fn write_meta(root: &std::path::Path, user_id: u64, meta: &str) {
        let layout = WorkspaceLayout::new(root);
        tokio::fs::create_dir_all(layout.run_dir(user_id))
            .await
            .unwrap();
        tokio::fs::write(layout.current_json(user_id), meta)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_finite_task_building_while_pid_alive() {
        let dir = TempDir::new().unwrap();
        let pid = std::process::id();
        write_meta(
            dir.path(),
            1,
            &format!(
                r#"{{"appId":7,"type":"BUILD","pid":{},"startedAt":1,"finishedAt":null,"exitCode":null,"logPath":"x"}}"#,
                pid
            ),
        )
        .await;

        let snapshot = passthrough_observer(dir.path(), 5173).status(1).await;
        assert_eq!(snapshot.state, RunState::Building);
    }

    #[tokio::test]
    async fn test_finite_task_unknown_when_pid_gone_without_exit_code() {
        let dir = TempDir::new().unwrap();
        // A pid that cannot exist
        write_meta(
            dir.path(),
            1,
            r#"{"appId":7,"type":"INSTALL","pid":4194000,"startedAt":1,"finishedAt":null,"exitCode":null,"logPath":"x"}"#,
        )
        .await;

        let snapshot = passthrough_observer(dir.path(), 5173).status(1).await;
        assert_eq!(snapshot.state, RunState::Unknown);
    }

    #[tokio::test]
    async fn test_long_running_reaches_running_with_preview_url() {
        let dir = TempDir::new().unwrap();

        // A live listener stands in for the dev server; the observed port
        // is whatever the OS handed us.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let pid = std::process::id();
        write_meta(
            dir.path(),
            42,
            &format!(
                r#"{{"appId":7,"type":"DEV","pid":{},"startedAt":1,"finishedAt":null,"exitCode":null,"logPath":"x"}}"#,
                pid
            ),
        )
        .await;

        let snapshot = passthrough_observer(dir.path(), port).status(42).await;
        assert_eq!(snapshot.state, RunState::Running);
        assert_eq!(
            snapshot.preview_url.as_deref(),
            Some("https://host/ws/42/")
        );
        drop(listener);
    }

    #[tokio::test]
    async fn test_long_running_starting_while_port_closed() {
        let dir = TempDir::new().unwrap();

        // Grab a free port and release it so nothing listens there
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let pid = std::process::id();
        write_meta(
            dir.path(),
            42,
            &format!(
                r#"{{"appId":7,"type":"DEV","pid":{},"startedAt":1,"finishedAt":null,"exitCode":null,"logPath":"x"}}"#,
                pid
            ),
        )
        .await;

        let snapshot = passthrough_observer(dir.path(), port).status(42).await;
        assert_eq!(snapshot.state, RunState::Starting);
    }

    #[tokio::test]
    async fn test_long_running_dead_when_pid_gone() {
        let dir = TempDir::new().unwrap();
        write_meta(
            dir.path(),
            42,
            r#"{"appId":7,"type":"DEV","pid":4194000,"startedAt":1,"finishedAt":null,"exitCode":null,"logPath":"x"}"#,
        )
        .await;

        let snapshot = passthrough_observer(dir.path(), 5173).status(42).await;
        assert_eq!(snapshot.state, RunState::Dead);
    }

    #[test]
    fn test_status_without_pid_branches() {
        let dir = TempDir::new().unwrap();
        let obs = observer(dir.path());
        let now = chrono::Utc::now().timestamp();

        let meta = |run_type, started_at, exit_code| super::super::types::RunMeta {
            app_id: 7,
            run_type,
            pid: None,
            started_at,
            finished_at: None,
            exit_code,
            log_path: "x".into(),
        };

        // Fresh build without exit code is BUILDING
        let s = obs.status_without_pid(&meta(RunType::Build, now, None));
        assert_eq!(s.state, RunState::Building);

        // Finished install reports by exit code even without a pid
        let s = obs.status_without_pid(&meta(RunType::Install, now, Some(0)));
        assert_eq!(s.state, RunState::Success);
        let s = obs.status_without_pid(&meta(RunType::Build, now, Some(2)));
        assert_eq!(s.state, RunState::Failed);

        // Dev without pid is STARTING until the timeout, then DEAD
        let s = obs.status_without_pid(&meta(RunType::Dev, now, None));
        assert_eq!(s.state, RunState::Starting);
        let s = obs.status_without_pid(&meta(RunType::Dev, now - 600, None));
        assert_eq!(s.state, RunState::Dead);
        assert_eq!(s.message.as_deref(), Some("start timeout"));
    }
}
