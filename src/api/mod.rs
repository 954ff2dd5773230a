//! Control-plane client

mod client;

pub use client::{Heartbeat, HttpClient};
