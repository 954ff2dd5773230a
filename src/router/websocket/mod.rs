//! WebSocket terminal channel

pub mod handler;

pub use handler::terminal_handler;
