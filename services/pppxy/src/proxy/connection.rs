//! Per-connection handling: dial, send the PROXY header, relay.
//!
//! Every failure here is contained in the connection. The instance keeps
//! accepting no matter what happens to one client.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, error};

use super::classify::ErrorClass;
use super::listener::InstanceStats;
use super::proxy_protocol::ProxyHeader;
use super::relay::{relay, RelayResult};
use crate::config::ProxyConfig;

/// Handle one accepted client until both relay directions are done.
///
/// Both the client and the backend stream are owned here, so they are
/// closed on every return path.
pub(crate) async fn handle_connection(
    config: Arc<ProxyConfig>,
    stats: Arc<InstanceStats>,
    client: TcpStream,
    client_addr: SocketAddr,
) {
    let local_addr = match client.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "Failed to read local address of client connection");
            return;
        }
    };

    let mut backend = match TcpStream::connect(config.backend_addr.as_str()).await {
        Ok(stream) => stream,
        Err(e) => {
            stats.dial_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                backend_addr = %config.backend_addr,
                error = %e,
                "Failed to connect to backend server"
            );
            return;
        }
    };

    let header = ProxyHeader::from_addrs(config.proxy_protocol_version, client_addr, local_addr);
    if let Err(e) = header.write_to(&mut backend).await {
        stats.header_failures.fetch_add(1, Ordering::Relaxed);
        error!(error = %e, "Failed to write proxy protocol header");
        return;
    }
    debug!(header = %header, "Sent proxy protocol header");

    let (to_backend, to_client) = relay(client, backend).await;

    stats
        .bytes_to_backend
        .fetch_add(to_backend.bytes, Ordering::Relaxed);
    stats
        .bytes_from_backend
        .fetch_add(to_client.bytes, Ordering::Relaxed);

    report(&to_backend);
    report(&to_client);

    debug!(
        bytes_to_backend = to_backend.bytes,
        bytes_from_backend = to_client.bytes,
        "Connection closed"
    );
}

fn report(result: &RelayResult) {
    let Some(err) = &result.error else {
        return;
    };

    match err.class() {
        ErrorClass::BenignPeerReset => {
            debug!(direction = %result.direction, error = %err, "Connection reset during read");
        }
        ErrorClass::BenignShutdown => {
            debug!(direction = %result.direction, error = %err, "Connection already closed");
        }
        ErrorClass::Real => {
            error!(direction = %result.direction, error = %err, "Connection error");
        }
    }
}
