//! igdctl - home router port mapping over UPnP IGD and NAT-PMP
//!
//! This library finds the local Internet gateway, reports its external
//! address and opens or closes port forwardings on it, whichever of the two
//! common protocols the router speaks.
//!
//! ```no_run
//! use igdctl::{new_gateway_control, GatewayControl, Protocol};
//! use std::time::Duration;
//!
//! # async fn example() -> igdctl::Result<()> {
//! let gateway = new_gateway_control().await?;
//! let local = igdctl::gateway::local_ipv4().await?;
//! gateway
//!     .add_port_mapping(Protocol::Tcp, local, 8080, 8080, Duration::from_secs(3600))
//!     .await?;
//! gateway.remove_port_mapping(Protocol::Tcp, 8080).await?;
//! gateway.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod gateway;

pub use config::{GatewayConfig, ZeroLeasePolicy};
pub use gateway::{
    new_gateway_control, with_cancel, with_deadline, Gateway, GatewayControl, GatewayError,
    GatewayProtocol, Protocol,
};

/// Result type alias for igdctl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for igdctl operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or unreadable configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Gateway discovery or control error
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Initialize logging
///
/// Output is filtered by `RUST_LOG`, e.g. `RUST_LOG=igdctl=debug`.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[cfg(test)]
mod tests;
