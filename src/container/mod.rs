//! Container engine adapter and per-user supervision

pub mod engine;
pub mod spec;
pub mod supervisor;

pub use engine::{is_broken_container, is_name_in_use, ContainerEngine, ContainerStatus};
pub use spec::RunSpec;
pub use supervisor::Supervisor;
