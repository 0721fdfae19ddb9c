//! The protocol-independent gateway control contract

use super::types::{GatewayError, Protocol, Result};
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Operations every gateway backend offers
///
/// Ports are taken as `i32` so that out-of-range values coming from callers
/// are refused with an error rather than truncated.
#[allow(async_fn_in_trait)]
pub trait GatewayControl {
    /// The gateway's public IPv4 address
    ///
    /// Runs discovery on first use. Later calls reuse the cached endpoint and
    /// skip discovery entirely.
    async fn external_ip(&self) -> Result<Ipv4Addr>;

    /// Forward `external_port` on the gateway to `internal_ip:internal_port`
    ///
    /// A zero `lease` requests the longest lease the protocol supports.
    /// Refusals, including port 0 and ports in use by another client, fail
    /// with [`GatewayError::MappingRejected`].
    async fn add_port_mapping(
        &self,
        protocol: Protocol,
        internal_ip: Ipv4Addr,
        internal_port: i32,
        external_port: i32,
        lease: Duration,
    ) -> Result<()>;

    /// Remove the mapping for `external_port`
    ///
    /// Out-of-range ports fail with [`GatewayError::InvalidPort`] before any
    /// request is sent.
    async fn remove_port_mapping(&self, protocol: Protocol, external_port: i32) -> Result<()>;

    /// Release sockets and pooled connections
    ///
    /// Closing twice is harmless. Other operations fail with
    /// [`GatewayError::Closed`] afterwards.
    async fn close(&self) -> Result<()>;
}

/// Run `fut` until it completes or `token` is cancelled
///
/// The in-flight operation is dropped on cancellation, which releases its
/// sockets.
pub async fn with_cancel<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(GatewayError::Cancelled),
        result = fut => result,
    }
}

/// Run `fut` with a deadline, failing with [`GatewayError::Timeout`]
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| GatewayError::Timeout)?
}
