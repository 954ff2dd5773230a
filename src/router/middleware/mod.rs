//! Router middleware

pub mod auth;
pub mod nonce;

pub use nonce::NonceStore;
