//! Canonical container run specification
//!
//! Translated into a single `docker run` invocation by the engine adapter.

/// Everything needed to create a workspace container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Container name
    pub name: String,

    /// Restart policy (e.g. `unless-stopped`)
    pub restart_policy: String,

    /// Memory cap in MB
    pub memory_mb: u64,

    /// CPU cap in cores
    pub cpus: f64,

    /// PID limit
    pub pids_limit: u32,

    /// Network to start in
    pub network: String,

    /// Host port bound to the container port
    pub host_port: u16,

    /// Container-side port
    pub container_port: u16,

    /// Bind mounts, host path to container path
    pub volumes: Vec<(String, String)>,

    /// Environment variables
    pub env: Vec<(String, String)>,

    /// Image reference
    pub image: String,

    /// Bootstrap command executed as pid 1
    pub command: Vec<String>,
}

impl RunSpec {
    /// An endless sleep loop keeps minimal images alive without requiring
    /// an init binary in the image.
    pub fn idle_bootstrap() -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            "while true; do sleep 3600; done".to_string(),
        ]
    }

    /// Render the `run` arguments after the engine binary.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--restart".to_string(),
            self.restart_policy.clone(),
            "--memory".to_string(),
            format!("{}m", self.memory_mb),
            "--cpus".to_string(),
            format_cpus(self.cpus),
            "--pids-limit".to_string(),
            self.pids_limit.to_string(),
            "--network".to_string(),
            self.network.clone(),
            "-p".to_string(),
            format!("{}:{}", self.host_port, self.container_port),
        ];

        for (host, container) in &self.volumes {
            args.push("-v".to_string());
            args.push(format!("{}:{}", host, container));
        }

        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Render a CPU cap without trailing noise (`2` rather than `2.0`, but
/// `1.5` stays `1.5`).
fn format_cpus(cpus: f64) -> String {
    if cpus.fract() == 0.0 {
        format!("{}", cpus as u64)
    } else {
        format!("{}", cpus)
    }
}
