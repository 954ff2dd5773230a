//! Configuration structures and loading

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Main agent configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfiguration,

    /// System paths and settings
    #[serde(default)]
    pub system: SystemConfiguration,

    /// Container engine configuration
    #[serde(default)]
    pub container: ContainerConfiguration,

    /// Managed run configuration
    #[serde(default)]
    pub run: RunConfiguration,

    /// Internal API authentication
    #[serde(default)]
    pub auth: AuthConfiguration,

    /// Idle reaping thresholds
    #[serde(default)]
    pub idle: IdleConfiguration,

    /// Orphan garbage collection
    #[serde(default)]
    pub gc: GcConfiguration,

    /// Preview URL composition
    #[serde(default)]
    pub preview: PreviewConfiguration,

    /// Control plane reporting (optional)
    #[serde(default)]
    pub remote: RemoteConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let config_path = std::path::Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        // Resolve relative paths against the config file's directory
        let base_dir = config_path
            .parent()
            .and_then(|p| if p.as_os_str().is_empty() { None } else { Some(p) })
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        config.system.resolve_paths(&base_dir);

        std::fs::create_dir_all(&config.system.root_directory)?;

        Ok(config)
    }
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfiguration {
    /// Host to bind to
    #[serde(default = "default_api_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

fn default_api_host() -> String {
    "0.0.0.0".into()
}

fn default_api_port() -> u16 {
    9500
}

/// System paths and settings
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfiguration {
    /// Root directory under which every user workspace lives
    #[serde(default = "default_root_directory")]
    pub root_directory: PathBuf,

    /// Node name reported to the control plane
    #[serde(default = "default_node_name")]
    pub node_name: String,
}

impl SystemConfiguration {
    /// Resolve relative paths against the given base directory.
    pub fn resolve_paths(&mut self, base_dir: &std::path::Path) {
        if !self.root_directory.is_absolute() {
            self.root_directory = base_dir.join(&self.root_directory);
        }
    }
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            root_directory: default_root_directory(),
            node_name: default_node_name(),
        }
    }
}

fn default_root_directory() -> PathBuf {
    PathBuf::from(".workspaces")
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "workspace-node".to_string())
}

/// Container engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerConfiguration {
    /// Engine binary (docker, or podman's docker shim)
    #[serde(default = "default_engine_binary")]
    pub binary: String,

    /// Container name prefix; the user id is appended
    #[serde(default = "default_container_prefix")]
    pub name_prefix: String,

    /// Workspace image to run for every user
    #[serde(default = "default_workspace_image")]
    pub image: String,

    /// Path inside the container where the user workspace is mounted
    #[serde(default = "default_workspace_mount")]
    pub workspace_mount: String,

    /// Container-side port the dev server must listen on
    #[serde(default = "default_container_port")]
    pub container_port: u16,

    /// First host port of the allocation window
    #[serde(default = "default_host_port_base")]
    pub host_port_base: u16,

    /// Size of the host port allocation window
    #[serde(default = "default_host_port_scan")]
    pub host_port_scan: u16,

    /// Network the workspace containers join
    #[serde(default = "default_network")]
    pub network: String,

    /// Memory cap in MB
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    /// CPU cap (number of cores)
    #[serde(default = "default_cpus")]
    pub cpus: f64,

    /// PID limit inside the container
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,

    /// Timeout for engine CLI calls, seconds
    #[serde(default = "default_engine_timeout")]
    pub command_timeout_secs: u64,

    /// Registry credentials for private workspace images
    #[serde(default)]
    pub registry: RegistryConfiguration,
}

impl Default for ContainerConfiguration {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            name_prefix: default_container_prefix(),
            image: default_workspace_image(),
            workspace_mount: default_workspace_mount(),
            container_port: default_container_port(),
            host_port_base: default_host_port_base(),
            host_port_scan: default_host_port_scan(),
            network: default_network(),
            memory_mb: default_memory_mb(),
            cpus: default_cpus(),
            pids_limit: default_pids_limit(),
            command_timeout_secs: default_engine_timeout(),
            registry: RegistryConfiguration::default(),
        }
    }
}

fn default_engine_binary() -> String {
    "docker".into()
}

fn default_container_prefix() -> String {
    "ws-u".into()
}

fn default_workspace_image() -> String {
    "node:20-bookworm-slim".into()
}

fn default_workspace_mount() -> String {
    "/workspace".into()
}

fn default_container_port() -> u16 {
    5173
}

fn default_host_port_base() -> u16 {
    42000
}

fn default_host_port_scan() -> u16 {
    1000
}

fn default_network() -> String {
    "workspace-net".into()
}

fn default_memory_mb() -> u64 {
    2048
}

fn default_cpus() -> f64 {
    2.0
}

fn default_pids_limit() -> u32 {
    512
}

fn default_engine_timeout() -> u64 {
    30
}

/// Registry credentials for pulling private images
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfiguration {
    /// Registry username
    #[serde(default)]
    pub username: String,

    /// Registry password
    #[serde(default)]
    pub password: String,
}

impl RegistryConfiguration {
    pub fn is_configured(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// Where npm keeps its cache during managed runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NpmCacheMode {
    /// Cache lives inside the app directory (`.npm-cache`)
    App,
    /// Cache goes to /tmp and is deleted when the task ends
    Disabled,
    /// Whatever the container image defaults to
    Container,
}

/// Managed run configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfiguration {
    /// npm cache placement strategy
    #[serde(default = "default_npm_cache_mode")]
    pub npm_cache_mode: NpmCacheMode,

    /// Cap on npm cache size before the launcher trims it, MB
    #[serde(default = "default_npm_cache_max_mb")]
    pub npm_cache_max_mb: u64,

    /// npm registry written to the app's .npmrc (empty = default registry)
    #[serde(default)]
    pub npm_registry: String,

    /// Log files kept per user and task kind
    #[serde(default = "default_log_keep_per_type")]
    pub log_keep_per_type: usize,

    /// Seconds a task may sit without a recorded pid before it is declared dead
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Timeout for in-container probe commands, seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            npm_cache_mode: default_npm_cache_mode(),
            npm_cache_max_mb: default_npm_cache_max_mb(),
            npm_registry: String::new(),
            log_keep_per_type: default_log_keep_per_type(),
            start_timeout_secs: default_start_timeout(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

fn default_npm_cache_mode() -> NpmCacheMode {
    NpmCacheMode::App
}

fn default_npm_cache_max_mb() -> u64 {
    512
}

fn default_log_keep_per_type() -> usize {
    3
}

fn default_start_timeout() -> u64 {
    120
}

fn default_probe_timeout() -> u64 {
    30
}

/// Internal API authentication
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfiguration {
    /// Enable HMAC request signing (the IP allowlist always applies)
    #[serde(default = "default_signing_enabled")]
    pub signing_enabled: bool,

    /// Shared secret for HMAC-SHA256 signatures
    #[serde(default)]
    pub secret: String,

    /// Remote addresses allowed to call the internal API (loopback is implicit)
    #[serde(default)]
    pub allowed_ips: Vec<String>,

    /// Maximum clock skew tolerated on signed requests, seconds
    #[serde(default = "default_max_skew")]
    pub max_skew_secs: i64,

    /// Nonce replay window, seconds
    #[serde(default = "default_nonce_ttl")]
    pub nonce_ttl_secs: u64,

    /// Shared token accepted by the gateway port lookup
    #[serde(default)]
    pub lookup_token: String,
}

impl Default for AuthConfiguration {
    fn default() -> Self {
        Self {
            signing_enabled: default_signing_enabled(),
            secret: String::new(),
            allowed_ips: Vec::new(),
            max_skew_secs: default_max_skew(),
            nonce_ttl_secs: default_nonce_ttl(),
            lookup_token: String::new(),
        }
    }
}

fn default_signing_enabled() -> bool {
    true
}

fn default_max_skew() -> i64 {
    60
}

fn default_nonce_ttl() -> u64 {
    300
}

/// Idle reaping thresholds; zero or negative disables the respective sweep
#[derive(Debug, Clone, Deserialize)]
pub struct IdleConfiguration {
    /// Stop the managed run after this many seconds of inactivity
    #[serde(default = "default_stop_run_after")]
    pub stop_run_after_secs: i64,

    /// Stop the container after this many seconds of inactivity
    #[serde(default = "default_stop_container_after")]
    pub stop_container_after_secs: i64,
}

impl Default for IdleConfiguration {
    fn default() -> Self {
        Self {
            stop_run_after_secs: default_stop_run_after(),
            stop_container_after_secs: default_stop_container_after(),
        }
    }
}

fn default_stop_run_after() -> i64 {
    1800
}

fn default_stop_container_after() -> i64 {
    3600
}

/// Orphan garbage collection
#[derive(Debug, Clone, Deserialize)]
pub struct GcConfiguration {
    /// Cron expression for the daily sweep
    #[serde(default = "default_gc_cron")]
    pub cron: String,

    /// Drop orphaned `db_<appId>` databases through mongosh
    #[serde(default)]
    pub mongo_enabled: bool,

    /// mongosh binary
    #[serde(default = "default_mongosh_binary")]
    pub mongosh_binary: String,

    /// Mongo connection string handed to mongosh
    #[serde(default = "default_mongo_uri")]
    pub mongo_uri: String,

    /// Timeout for mongosh invocations, seconds
    #[serde(default = "default_mongo_timeout")]
    pub mongo_timeout_secs: u64,
}

impl Default for GcConfiguration {
    fn default() -> Self {
        Self {
            cron: default_gc_cron(),
            mongo_enabled: false,
            mongosh_binary: default_mongosh_binary(),
            mongo_uri: default_mongo_uri(),
            mongo_timeout_secs: default_mongo_timeout(),
        }
    }
}

fn default_gc_cron() -> String {
    // 02:00 every day
    "0 0 2 * * *".into()
}

fn default_mongosh_binary() -> String {
    "mongosh".into()
}

fn default_mongo_uri() -> String {
    "mongodb://127.0.0.1:27017".into()
}

fn default_mongo_timeout() -> u64 {
    8
}

/// Preview URL composition
#[derive(Debug, Clone, Deserialize)]
pub struct PreviewConfiguration {
    /// External base URL of the gateway, e.g. `https://ws.example.com`
    #[serde(default = "default_preview_base")]
    pub base_url: String,

    /// Path prefix the gateway routes per user, e.g. `/ws`
    #[serde(default = "default_preview_prefix")]
    pub path_prefix: String,
}

impl Default for PreviewConfiguration {
    fn default() -> Self {
        Self {
            base_url: default_preview_base(),
            path_prefix: default_preview_prefix(),
        }
    }
}

fn default_preview_base() -> String {
    "http://localhost".into()
}

fn default_preview_prefix() -> String {
    "/ws".into()
}

/// Control plane reporting; disabled when the URL is empty
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfiguration {
    /// Control plane base URL
    #[serde(default)]
    pub url: String,

    /// Bearer token for heartbeat requests
    #[serde(default)]
    pub token: String,

    /// Request timeout in seconds
    #[serde(default = "default_remote_timeout")]
    pub timeout: u64,

    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

impl Default for RemoteConfiguration {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            timeout: default_remote_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

fn default_remote_timeout() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse_from_empty_toml() {
        let config: Configuration = toml::from_str("").unwrap();
        assert_eq!(config.api.port, 9500);
        assert_eq!(config.container.container_port, 5173);
        assert_eq!(config.container.name_prefix, "ws-u");
        assert_eq!(config.run.npm_cache_mode, NpmCacheMode::App);
        assert!(config.auth.signing_enabled);
    }

    #[test]
    fn test_npm_cache_mode_names() {
        let config: Configuration = toml::from_str(
            r#"
            [run]
            npm_cache_mode = "DISABLED"
            "#,
        )
        .unwrap();
        assert_eq!(config.run.npm_cache_mode, NpmCacheMode::Disabled);
    }

    #[test]
    fn test_idle_thresholds_can_disable() {
        let config: Configuration = toml::from_str(
            r#"
            [idle]
            stop_run_after_secs = 0
            stop_container_after_secs = -1
            "#,
        )
        .unwrap();
        assert!(config.idle.stop_run_after_secs <= 0);
        assert!(config.idle.stop_container_after_secs <= 0);
    }

    #[test]
    fn test_registry_configured() {
        let mut reg = RegistryConfiguration::default();
        assert!(!reg.is_configured());
        reg.username = "ci".into();
        reg.password = "hunter2".into();
        assert!(reg.is_configured());
    }
}
