//! Project discovery and launch planning
//!
//! Inspects the app directory on the host side (the workspace tree is a
//! shared mount) and decides what the launch scripts will actually run:
//! which package script, with which arguments and environment.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use walkdir::WalkDir;

use crate::error::{AgentError, Result};

use super::types::RunType;

/// Directories never descended into while looking for `package.json`.
const HEAVY_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    ".next",
    ".npm-cache",
    "coverage",
];

/// Maximum nesting of the project below the app directory. Imports often
/// unpack into a single wrapper directory; deeper than that is not a
/// project root.
const MAX_DISCOVERY_DEPTH: usize = 2;

#[derive(Debug, Deserialize)]
struct PackageJson {
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

/// A discovered project: where `package.json` lives and what it declares.
#[derive(Debug, Clone)]
pub struct Project {
    /// Path of the directory holding `package.json`, relative to the app
    /// directory. Empty when it sits at the app root.
    pub package_dir: String,

    /// `scripts` table from `package.json`
    pub scripts: BTreeMap<String, String>,
}

impl Project {
    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts.get(name).map(String::as_str)
    }
}

/// Locate `package.json` under the app directory, scanning at most
/// [`MAX_DISCOVERY_DEPTH`] levels and skipping heavy directories. The
/// shallowest hit wins.
pub fn discover(app_dir: &Path) -> Result<Option<Project>> {
    if !app_dir.is_dir() {
        return Ok(None);
    }

    let mut best: Option<(usize, std::path::PathBuf)> = None;
    for entry in WalkDir::new(app_dir)
        .min_depth(1)
        .max_depth(MAX_DISCOVERY_DEPTH)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .map(|name| HEAVY_DIRS.contains(&name))
                    .unwrap_or(false))
        })
    {
        // Unreadable subtrees are skipped, not fatal
        let Ok(entry) = entry else { continue };
        if entry.file_type().is_file() && entry.file_name() == "package.json" {
            let depth = entry.depth();
            if best.as_ref().map(|(d, _)| depth < *d).unwrap_or(true) {
                best = Some((depth, entry.path().to_path_buf()));
            }
        }
    }

    let Some((_, path)) = best else {
        return Ok(None);
    };

    let content = std::fs::read_to_string(&path)?;
    let parsed: PackageJson = serde_json::from_str(&content)
        .map_err(|e| AgentError::InputInvalid(format!("unparseable package.json: {}", e)))?;

    let package_dir = path
        .parent()
        .and_then(|p| p.strip_prefix(app_dir).ok())
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(Some(Project {
        package_dir,
        scripts: parsed.scripts,
    }))
}

/// Commands and environment a long-running launch will execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Environment exported before the commands run
    pub env: Vec<(String, String)>,

    /// The long-lived command
    pub primary: String,

    /// A sibling spawned in parallel (concurrently split)
    pub secondary: Option<String>,
}

fn base_path(prefix: &str, user_id: u64) -> String {
    let prefix = prefix.trim_end_matches('/');
    format!("{}/{}/", prefix, user_id)
}

fn vite_args(base: &str, port: u16) -> String {
    format!(
        "-- --base '{}' --host 0.0.0.0 --port {} --strictPort",
        base, port
    )
}

/// DEV: run the `dev` script. Vite projects get the per-user base path and
/// the exposed port injected; anything else is invoked as-is.
pub fn plan_dev(
    project: &Project,
    user_id: u64,
    container_port: u16,
    preview_prefix: &str,
) -> Result<LaunchPlan> {
    let Some(command) = project.script("dev") else {
        return Err(AgentError::PreconditionMissing(
            "package.json has no \"dev\" script; import a project with a dev server first".into(),
        ));
    };

    let base = base_path(preview_prefix, user_id);
    let primary = if command.contains("vite") {
        format!("npm run dev {}", vite_args(&base, container_port))
    } else {
        "npm run dev".to_string()
    };

    Ok(LaunchPlan {
        env: vec![("BASE_PATH".to_string(), base)],
        primary,
        secondary: None,
    })
}

/// START: preview the built app. Picks the first of `start`, `preview`,
/// `dev`, `server`. Server-class scripts get production env and the
/// exposed port; pure frontend scripts get the per-user base path.
/// `concurrently` wrappers are split into their vite client and its
/// sibling server so both can be supervised as one group.
pub fn plan_start(
    project: &Project,
    user_id: u64,
    container_port: u16,
    preview_prefix: &str,
) -> Result<LaunchPlan> {
    const LADDER: &[&str] = &["start", "preview", "dev", "server"];

    let Some((name, command)) = LADDER
        .iter()
        .find_map(|n| project.script(n).map(|c| (*n, c)))
    else {
        return Err(AgentError::PreconditionMissing(
            "package.json declares none of start/preview/dev/server; add a start script first"
                .into(),
        ));
    };

    if command.contains("concurrently") {
        return plan_concurrently(project, user_id, container_port, preview_prefix);
    }

    let server_class = matches!(name, "start" | "server");
    if server_class {
        return Ok(LaunchPlan {
            env: vec![
                ("PORT".to_string(), container_port.to_string()),
                ("HOST".to_string(), "0.0.0.0".to_string()),
                ("NODE_ENV".to_string(), "production".to_string()),
                ("BASE_PATH".to_string(), "/".to_string()),
            ],
            primary: format!("npm run {}", name),
            secondary: None,
        });
    }

    let base = base_path(preview_prefix, user_id);
    let primary = if command.contains("vite") {
        format!("npm run {} {}", name, vite_args(&base, container_port))
    } else {
        format!("npm run {}", name)
    };

    Ok(LaunchPlan {
        env: vec![("BASE_PATH".to_string(), base)],
        primary,
        secondary: None,
    })
}

/// Split a `concurrently`-based script: the vite-bearing client child is
/// spawned directly (so the base path and port can be injected) alongside
/// its sibling server script.
fn plan_concurrently(
    project: &Project,
    user_id: u64,
    container_port: u16,
    preview_prefix: &str,
) -> Result<LaunchPlan> {
    const CLIENT_NAMES: &[&str] = &["dev:client", "client"];
    const SERVER_NAMES: &[&str] = &["dev:server", "server"];

    let Some((client, client_cmd)) = CLIENT_NAMES
        .iter()
        .find_map(|n| project.script(n).map(|c| (*n, c)))
    else {
        return Err(AgentError::PreconditionMissing(
            "concurrently script without a dev:client/client sibling; run the declared script inside the terminal instead".into(),
        ));
    };

    let base = base_path(preview_prefix, user_id);
    let primary = if client_cmd.contains("vite") {
        format!("npm run {} {}", client, vite_args(&base, container_port))
    } else {
        format!("npm run {}", client)
    };

    let secondary = SERVER_NAMES
        .iter()
        .find_map(|n| project.script(n).map(|_| format!("npm run {}", n)));

    Ok(LaunchPlan {
        env: vec![("BASE_PATH".to_string(), base)],
        primary,
        secondary,
    })
}

/// Plan for the requested task kind. Finite tasks carry no launch plan;
/// their command lines are fixed.
pub fn plan(
    run_type: RunType,
    project: &Project,
    user_id: u64,
    container_port: u16,
    preview_prefix: &str,
) -> Result<Option<LaunchPlan>> {
    match run_type {
        RunType::Dev => plan_dev(project, user_id, container_port, preview_prefix).map(Some),
        RunType::Start => plan_start(project, user_id, container_port, preview_prefix).map(Some),
        RunType::Build | RunType::Install => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project(scripts: &[(&str, &str)]) -> Project {
        Project {
            package_dir: String::new(),
            scripts: scripts
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_discover_at_root() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts":{"dev":"vite"}}"#,
        )
        .unwrap();
        let found = discover(dir.path()).unwrap().unwrap();
        assert_eq!(found.package_dir, "");
        assert_eq!(found.script("dev"), Some("vite"));
    }

    #[test]
    fn test_discover_nested_and_skips_node_modules() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(
            dir.path().join("node_modules/pkg/package.json"),
            r#"{"name":"dep"}"#,
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("my-app")).unwrap();
        std::fs::write(
            dir.path().join("my-app/package.json"),
            r#"{"scripts":{"dev":"vite dev"}}"#,
        )
        .unwrap();

        let found = discover(dir.path()).unwrap().unwrap();
        assert_eq!(found.package_dir, "my-app");
    }

    #[test]
    fn test_discover_missing_dir() {
        assert!(discover(Path::new("/nonexistent/app")).unwrap().is_none());
    }

    #[test]
    fn test_dev_vite_injection() {
        let plan = plan_dev(&project(&[("dev", "vite")]), 42, 5173, "/ws").unwrap();
        assert!(plan.primary.contains("--base '/ws/42/'"));
        assert!(plan.primary.contains("--port 5173"));
        assert_eq!(plan.env[0], ("BASE_PATH".to_string(), "/ws/42/".to_string()));
    }

    #[test]
    fn test_dev_non_vite_as_is() {
        let plan = plan_dev(&project(&[("dev", "next dev")]), 42, 5173, "/ws").unwrap();
        assert_eq!(plan.primary, "npm run dev");
    }

    #[test]
    fn test_dev_requires_script() {
        assert!(plan_dev(&project(&[]), 42, 5173, "/ws").is_err());
    }

    #[test]
    fn test_start_ladder_prefers_start() {
        let plan = plan_start(
            &project(&[("start", "node server.js"), ("dev", "vite")]),
            42,
            5173,
            "/ws",
        )
        .unwrap();
        assert_eq!(plan.primary, "npm run start");
        assert!(plan.env.contains(&("NODE_ENV".to_string(), "production".to_string())));
        assert!(plan.env.contains(&("BASE_PATH".to_string(), "/".to_string())));
        assert!(plan.env.contains(&("PORT".to_string(), "5173".to_string())));
    }

    #[test]
    fn test_start_frontend_preview() {
        let plan = plan_start(&project(&[("preview", "vite preview")]), 42, 5173, "/ws").unwrap();
        assert!(plan.primary.starts_with("npm run preview"));
        assert!(plan.primary.contains("--base '/ws/42/'"));
        assert!(plan.env.contains(&("BASE_PATH".to_string(), "/ws/42/".to_string())));
        assert!(!plan.env.iter().any(|(k, _)| k == "PORT"));
    }

    #[test]
    fn test_start_concurrently_split() {
        let plan = plan_start(
            &project(&[
                ("dev", "concurrently \"npm run dev:client\" \"npm run dev:server\""),
                ("dev:client", "vite"),
                ("dev:server", "nodemon server.js"),
            ]),
            42,
            5173,
            "/ws",
        )
        .unwrap();
        assert!(plan.primary.contains("npm run dev:client"));
        assert!(plan.primary.contains("--base '/ws/42/'"));
        assert_eq!(plan.secondary.as_deref(), Some("npm run dev:server"));
    }

    #[test]
    fn test_start_ladder_empty() {
        assert!(plan_start(&project(&[("lint", "eslint .")]), 42, 5173, "/ws").is_err());
    }

    #[test]
    fn test_finite_tasks_have_no_plan() {
        let p = project(&[("build", "vite build")]);
        assert!(plan(RunType::Build, &p, 1, 5173, "/ws").unwrap().is_none());
        assert!(plan(RunType::Install, &p, 1, 5173, "/ws").unwrap().is_none());
    }
}
