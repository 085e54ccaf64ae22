pub mod captcha;
pub mod client;
pub mod codec;
mod connection;
pub mod degraded;
pub mod error;
pub mod frame;
pub mod rate_limit;
pub mod target;
pub mod token_store;

pub use client::{Client, ClientConfig, KeyTtl};
pub use degraded::Outcome;
pub use error::ClientError;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
