//! Run task kinds and the observable state set

use serde::{Deserialize, Serialize};

/// The four managed task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunType {
    /// Long-running frontend dev server
    Dev,
    /// Long-running preview of the built app
    Start,
    /// Finite production build
    Build,
    /// Finite dependency install
    Install,
}

impl RunType {
    /// DEV and START hold the port and live until stopped; BUILD and
    /// INSTALL run to completion.
    pub fn is_long_running(&self) -> bool {
        matches!(self, RunType::Dev | RunType::Start)
    }

    /// Lowercase tag used in log file names.
    pub fn file_tag(&self) -> &'static str {
        match self {
            RunType::Dev => "dev",
            RunType::Start => "start",
            RunType::Build => "build",
            RunType::Install => "install",
        }
    }

    /// State reported immediately after a successful launch.
    pub fn initial_state(&self) -> RunState {
        match self {
            RunType::Build => RunState::Building,
            RunType::Install => RunState::Installing,
            RunType::Dev | RunType::Start => RunState::Starting,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "DEV" => Some(RunType::Dev),
            "START" => Some(RunType::Start),
            "BUILD" => Some(RunType::Build),
            "INSTALL" => Some(RunType::Install),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunType::Dev => write!(f, "DEV"),
            RunType::Start => write!(f, "START"),
            RunType::Build => write!(f, "BUILD"),
            RunType::Install => write!(f, "INSTALL"),
        }
    }
}

/// The bounded state set exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Idle,
    Starting,
    Building,
    Installing,
    Running,
    Success,
    Failed,
    Dead,
    Unknown,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Idle => "IDLE",
            RunState::Starting => "STARTING",
            RunState::Building => "BUILDING",
            RunState::Installing => "INSTALLING",
            RunState::Running => "RUNNING",
            RunState::Success => "SUCCESS",
            RunState::Failed => "FAILED",
            RunState::Dead => "DEAD",
            RunState::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// Durable record of the single current task for a user (`current.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    pub app_id: u64,
    #[serde(rename = "type")]
    pub run_type: RunType,
    /// Null during early startup and after a finite task finished.
    pub pid: Option<i64>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub exit_code: Option<i32>,
    pub log_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_type_round_trip() {
        for t in [RunType::Dev, RunType::Start, RunType::Build, RunType::Install] {
            assert_eq!(RunType::parse(&t.to_string()), Some(t));
        }
        assert_eq!(RunType::parse("dev"), Some(RunType::Dev));
        assert_eq!(RunType::parse("bogus"), None);
    }

    #[test]
    fn test_initial_states() {
        assert_eq!(RunType::Build.initial_state(), RunState::Building);
        assert_eq!(RunType::Install.initial_state(), RunState::Installing);
        assert_eq!(RunType::Dev.initial_state(), RunState::Starting);
        assert_eq!(RunType::Start.initial_state(), RunState::Starting);
    }

    #[test]
    fn test_meta_wire_shape() {
        let meta = RunMeta {
            app_id: 7,
            run_type: RunType::Dev,
            pid: None,
            started_at: 100,
            finished_at: None,
            exit_code: None,
            log_path: "/workspace/run/run-dev-7-1.log".into(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["type"], "DEV");
        assert_eq!(json["appId"], 7);
        assert!(json["pid"].is_null());
        assert!(json.get("logPath").is_some());
    }

    #[test]
    fn test_meta_parses_wire_form() {
        let raw = r#"{"appId":7,"type":"BUILD","pid":null,"startedAt":10,"finishedAt":12,"exitCode":0,"logPath":"x"}"#;
        let meta: RunMeta = serde_json::from_str(raw).unwrap();
        assert_eq!(meta.run_type, RunType::Build);
        assert_eq!(meta.exit_code, Some(0));
    }
}
