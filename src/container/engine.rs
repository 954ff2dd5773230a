//! Container engine CLI adapter
//!
//! Thin command-building wrapper over the host `docker` binary, which may
//! really be podman's docker shim. The adapter normalizes shim stdout noise
//! and recognizes the engine-specific failure strings upper layers must
//! never see: "name already in use" on create races, and the
//! conmon/libpod corpse states that need a cleanup fallback before a
//! container can be removed again.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::command::{self, CommandResult};
use crate::config::ContainerConfiguration;
use crate::error::{AgentError, Result};

use super::spec::RunSpec;

/// Container status as reported by inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    /// Inspect knows no such container
    NotCreated,
    /// State is `running`
    Running,
    /// Any other engine state, uppercased (CREATED, EXITED, PAUSED, ...)
    Other(String),
    /// Inspect produced something unparseable
    Unknown,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::NotCreated => write!(f, "NOT_CREATED"),
            ContainerStatus::Running => write!(f, "RUNNING"),
            ContainerStatus::Other(state) => write!(f, "{}", state),
            ContainerStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// A bind mount as reported by inspect.
#[derive(Debug, Clone, Deserialize)]
pub struct MountPoint {
    #[serde(rename = "Source")]
    pub source: String,
    #[serde(rename = "Destination")]
    pub destination: String,
}

fn name_in_use_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)already in use").unwrap())
}

fn broken_container_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)conmon|libpod|exit file").unwrap())
}

fn no_such_object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)no such object|no such container").unwrap())
}

/// The create race: another call already owns the container name.
pub fn is_name_in_use(result: &CommandResult, name: &str) -> bool {
    !result.success() && name_in_use_re().is_match(&result.output) && result.output.contains(name)
}

/// The corpse state podman leaves behind when conmon dies under a
/// container. Plain remove fails on these until cleanup has run.
pub fn is_broken_container(result: &CommandResult) -> bool {
    result.exit_code == -1 || broken_container_re().is_match(&result.output)
}

/// CLI wrapper over the configured engine binary. Stateless; cheap to clone.
#[derive(Clone)]
pub struct ContainerEngine {
    binary: String,
    timeout: Duration,
}

impl ContainerEngine {
    pub fn new(config: &ContainerConfiguration) -> Self {
        Self {
            binary: config.binary.clone(),
            timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    #[cfg(test)]
    pub fn with_binary(binary: &str, timeout: Duration) -> Self {
        Self {
            binary: binary.to_string(),
            timeout,
        }
    }

    async fn invoke(&self, args: &[String], stdin: Option<&[u8]>) -> CommandResult {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(self.binary.clone());
        argv.extend(args.iter().cloned());
        command::run(&argv, stdin, self.timeout).await
    }

    async fn invoke_args<S: AsRef<str>>(&self, args: &[S]) -> CommandResult {
        let owned: Vec<String> = args.iter().map(|s| s.as_ref().to_string()).collect();
        self.invoke(&owned, None).await
    }

    /// Scalar inspect. The podman docker shim prints an "Emulate Docker
    /// CLI" banner to stdout, so only the last non-empty line is the value.
    fn scalar(output: &str) -> Option<String> {
        output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .next_back()
            .map(str::to_string)
    }

    /// Inspect the container state.
    pub async fn status(&self, name: &str) -> ContainerStatus {
        let result = self
            .invoke_args(&["inspect", "--format", "{{.State.Status}}", name])
            .await;

        if !result.success() {
            if no_such_object_re().is_match(&result.output) {
                return ContainerStatus::NotCreated;
            }
            debug!("Inspect failed for {}: {}", name, result.output);
            return ContainerStatus::Unknown;
        }

        match Self::scalar(&result.output).as_deref() {
            Some("running") => ContainerStatus::Running,
            Some(state) => ContainerStatus::Other(state.to_uppercase()),
            None => ContainerStatus::Unknown,
        }
    }

    /// Raw inspect of the state, for broken-container detection by callers
    /// that need the unnormalized result.
    pub async fn inspect_raw(&self, name: &str) -> CommandResult {
        self.invoke_args(&["inspect", "--format", "{{.State.Status}}", name])
            .await
    }

    /// Image the container was created from.
    pub async fn image(&self, name: &str) -> Result<String> {
        let result = self
            .invoke_args(&["inspect", "--format", "{{.Config.Image}}", name])
            .await;
        if !result.success() {
            return Err(AgentError::subprocess(
                format!("inspect image of {}", name),
                result.output,
            ));
        }
        Self::scalar(&result.output)
            .ok_or_else(|| AgentError::subprocess(format!("inspect image of {}", name), "empty"))
    }

    /// Bind mounts of the container.
    pub async fn mounts(&self, name: &str) -> Result<Vec<MountPoint>> {
        let result = self
            .invoke_args(&["inspect", "--format", "{{json .Mounts}}", name])
            .await;
        if !result.success() {
            return Err(AgentError::subprocess(
                format!("inspect mounts of {}", name),
                result.output,
            ));
        }
        let json_line = Self::scalar(&result.output).unwrap_or_default();
        serde_json::from_str(&json_line).map_err(|e| {
            AgentError::subprocess(
                format!("inspect mounts of {}", name),
                format!("unparseable mounts: {}", e),
            )
        })
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        let result = self.invoke_args(&["start", name]).await;
        if !result.success() {
            return Err(AgentError::subprocess(format!("start {}", name), result.output));
        }
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let result = self.invoke_args(&["stop", name]).await;
        if !result.success() {
            return Err(AgentError::subprocess(format!("stop {}", name), result.output));
        }
        Ok(())
    }

    /// Force-remove the container. When plain remove trips over a conmon
    /// corpse, runs the podman cleanup fallback and retries once.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let result = self.invoke_args(&["rm", "-f", name]).await;
        if result.success() || no_such_object_re().is_match(&result.output) {
            return Ok(());
        }

        if is_broken_container(&result) {
            warn!("Remove of {} hit a broken container, running cleanup fallback", name);
            self.cleanup_fallback(name).await;
            let retry = self.invoke_args(&["rm", "-f", name]).await;
            if retry.success() || no_such_object_re().is_match(&retry.output) {
                return Ok(());
            }
            return Err(AgentError::subprocess(format!("rm -f {}", name), retry.output));
        }

        Err(AgentError::subprocess(format!("rm -f {}", name), result.output))
    }

    /// podman-specific salvage for containers whose monitor process died.
    async fn cleanup_fallback(&self, name: &str) {
        let cleanup = self.invoke_args(&["container", "cleanup", name]).await;
        if !cleanup.success() {
            debug!("container cleanup for {}: {}", name, cleanup.output);
        }
        let force = self.invoke_args(&["rm", "-f", "--time", "0", name]).await;
        if !force.success() {
            debug!("forced rm for {}: {}", name, force.output);
        }
    }

    /// Create and start a container from the canonical spec.
    pub async fn run(&self, spec: &RunSpec) -> CommandResult {
        self.invoke(&spec.to_args(), None).await
    }

    /// Run a shell script inside the container.
    pub async fn exec(&self, name: &str, script: &str) -> CommandResult {
        self.invoke_args(&["exec", name, "sh", "-c", script]).await
    }

    /// Like [`exec`](Self::exec) but with an explicit deadline for probes.
    pub async fn exec_with_timeout(
        &self,
        name: &str,
        script: &str,
        timeout: Duration,
    ) -> CommandResult {
        let argv = vec![
            self.binary.clone(),
            "exec".to_string(),
            name.to_string(),
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ];
        command::run(&argv, None, timeout).await
    }

    /// Create the network if it does not exist yet.
    pub async fn network_ensure(&self, network: &str) -> Result<()> {
        let inspect = self.invoke_args(&["network", "inspect", network]).await;
        if inspect.success() {
            return Ok(());
        }
        let create = self.invoke_args(&["network", "create", network]).await;
        if create.success() {
            return Ok(());
        }
        // Lost the creation race to a concurrent ensure
        if create.output.contains("already exists") {
            return Ok(());
        }
        Err(AgentError::subprocess(
            format!("network create {}", network),
            create.output,
        ))
    }

    /// Connect the container to a network, tolerating repeat connects.
    pub async fn network_connect(&self, network: &str, name: &str) -> Result<()> {
        let result = self
            .invoke_args(&["network", "connect", network, name])
            .await;
        if result.success()
            || result.output.contains("already exists in network")
            || result.output.contains("already connected")
        {
            return Ok(());
        }
        Err(AgentError::subprocess(
            format!("network connect {} {}", network, name),
            result.output,
        ))
    }

    /// Best-effort registry login; the password travels via stdin only.
    pub async fn registry_login(&self, registry: &str, username: &str, password: &str) -> bool {
        let args = vec![
            "login".to_string(),
            registry.to_string(),
            "--username".to_string(),
            username.to_string(),
            "--password-stdin".to_string(),
        ];
        let result = self.invoke(&args, Some(password.as_bytes())).await;
        if !result.success() {
            warn!("Registry login to {} failed: {}", registry, result.output);
        }
        result.success()
    }

    /// Engine version string, for diagnostics.
    pub async fn version(&self) -> Result<String> {
        let result = self
            .invoke_args(&["version", "--format", "{{.Server.Version}}"])
            .await;
        if !result.success() {
            return Err(AgentError::subprocess("engine version", result.output));
        }
        Self::scalar(&result.output)
            .ok_or_else(|| AgentError::subprocess("engine version", "empty"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i32, output: &str) -> CommandResult {
        CommandResult {
            exit_code,
            output: output.to_string(),
        }
    }

    #[test]
    fn test_scalar_skips_shim_banner() {
        let output = "Emulate Docker CLI using podman. Create /etc/containers/nodocker to quiet msg.\nrunning\n";
        assert_eq!(ContainerEngine::scalar(output).as_deref(), Some("running"));
    }

    #[test]
    fn test_scalar_empty() {
        assert_eq!(ContainerEngine::scalar("\n  \n"), None);
    }

    #[test]
    fn test_name_in_use_detection() {
        let r = result(
            125,
            "docker: Error response from daemon: Conflict. The container name \"/ws-u42\" is already in use by container abc.",
        );
        assert!(is_name_in_use(&r, "ws-u42"));
        assert!(!is_name_in_use(&r, "ws-u43"));
        assert!(!is_name_in_use(&result(0, "ok"), "ws-u42"));
    }

    #[test]
    fn test_broken_container_fingerprints() {
        assert!(is_broken_container(&result(
            125,
            "error: container state improper: read conmon exit file: no such file"
        )));
        assert!(is_broken_container(&result(125, "libpod: storage corrupted")));
        assert!(is_broken_container(&result(-1, "")));
        assert!(!is_broken_container(&result(1, "plain failure")));
    }

    #[tokio::test]
    async fn test_status_running_via_fake_engine() {
        // `echo` stands in for the engine: arguments are echoed back, and
        // the last non-empty line is the scalar, i.e. the container name.
        let engine = ContainerEngine::with_binary("echo", Duration::from_secs(5));
        let status = engine.status("running").await;
        // echo prints "inspect --format {{.State.Status}} running"
        // → scalar is the whole line, not "running"; state is uppercased Other.
        assert!(matches!(status, ContainerStatus::Other(_)));
    }

    #[tokio::test]
    async fn test_status_not_created_on_no_such_object() {
        // `sh -c` exits non-zero and prints the docker not-found phrasing
        let engine = ContainerEngine::with_binary(
            "./does-not-exist-engine-binary",
            Duration::from_secs(1),
        );
        // Spawn failure is not "no such object": it must map to Unknown
        let status = engine.status("ws-u1").await;
        assert_eq!(status, ContainerStatus::Unknown);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ContainerStatus::NotCreated.to_string(), "NOT_CREATED");
        assert_eq!(ContainerStatus::Running.to_string(), "RUNNING");
        assert_eq!(ContainerStatus::Other("EXITED".into()).to_string(), "EXITED");
    }

    #[test]
    fn test_mounts_parse() {
        let payload = r#"[{"Type":"bind","Source":"/srv/ws/42","Destination":"/workspace","Mode":"","RW":true,"Propagation":"rprivate"}]"#;
        let mounts: Vec<MountPoint> = serde_json::from_str(payload).unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].source, "/srv/ws/42");
        assert_eq!(mounts[0].destination, "/workspace");
    }
}
