//! Managed runs: task launch, durable run meta, liveness observation and
//! log retention.

pub mod engine;
pub mod logs;
pub mod meta;
pub mod observer;
pub mod project;
pub mod script;
pub mod types;

pub use engine::{LaunchOutcome, RunEngine};
pub use logs::LogRetention;
pub use meta::{RunMetaRead, RunMetaStore};
pub use observer::{RunObserver, StatusSnapshot};
pub use types::{RunMeta, RunState, RunType};
