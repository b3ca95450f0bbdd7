mod local;
#[cfg(test)]
mod tests;

pub use local::*;

use crate::{EngineError, MapSectionRequest, MapSectionResponse};
use async_trait::async_trait;
use std::net::IpAddr;
use tokio_util::sync::CancellationToken;

/// A client of a compute engine that turns a [`MapSectionRequest`] into
/// per-pixel results.
///
/// Implementations may use any partial payload carried by the request as a
/// starting point. The token fires when the pipeline shuts down; engines
/// should stop early and report the result as not completed.
#[async_trait]
pub trait ComputeEngine: Send + Sync {
    /// The address this engine is reached at, e.g. `localhost:5000`.
    fn endpoint_address(&self) -> &str;

    /// Whether the engine runs on this machine, and therefore competes with
    /// the pipeline for cores.
    fn is_local(&self) -> bool {
        is_local_address(self.endpoint_address())
    }

    /// Produces the map section for `request`.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the engine cannot be reached or fails.
    async fn generate(
        &self,
        request: &mut MapSectionRequest,
        token: &CancellationToken,
    ) -> Result<MapSectionResponse, EngineError>;
}

/// Returns true for `local`, `localhost` and loopback addresses, with or
/// without a scheme and port.
pub fn is_local_address(address: &str) -> bool {
    let without_scheme = address
        .split_once("://")
        .map_or(address, |(_, rest)| rest);
    let authority = without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme);

    let host = if let Some(rest) = authority.strip_prefix('[') {
        // [::1]:5000
        rest.split(']').next().unwrap_or(rest)
    } else if authority.matches(':').count() == 1 {
        authority.split(':').next().unwrap_or(authority)
    } else {
        authority
    };

    if host.eq_ignore_ascii_case("local") || host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}
