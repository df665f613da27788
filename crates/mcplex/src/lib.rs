pub mod auth;
pub mod config;
pub mod mcp;
pub mod stats;
pub mod store;

pub use config::{Config, RawConfig};
pub use mcp::router::App;
