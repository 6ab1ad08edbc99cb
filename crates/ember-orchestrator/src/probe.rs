//! TCP reachability check for a reported worker endpoint.
//!
//! A worker can publish its connection info a moment before the speech server
//! behind it accepts connections. When probing is enabled the orchestrator
//! keeps polling until a plain TCP connect succeeds.

use std::time::Duration;

use ember_core::jobs::ConnectionInfo;
use tokio::net::TcpStream;
use tracing::debug;

/// Try to open a TCP connection to `host:port` within `timeout`.
pub async fn probe_endpoint(connection: &ConnectionInfo, timeout: Duration) -> bool {
    let addr = (connection.host.as_str(), connection.port);
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(endpoint = %connection.endpoint(), error = %e, "endpoint probe refused");
            false
        }
        Err(_) => {
            debug!(endpoint = %connection.endpoint(), ?timeout, "endpoint probe timed out");
            false
        }
    }
}
