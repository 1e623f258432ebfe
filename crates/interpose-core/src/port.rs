//! Listening port selection.
//!
//! Candidates are probed by binding a throwaway listener on the loopback
//! interface and releasing it straight away. The scan is strictly ascending,
//! so the same starting port and the same set of occupied ports always yield
//! the same answer.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use crate::error::{PortError, Result};

/// Port the first proxy session tries before walking upwards.
pub const DEFAULT_BASE_PORT: u16 = 8081;

/// Returns the lowest port at or above `start` that can currently be bound.
///
/// Port 0 is never returned; a `start` of 0 begins the scan at 1.
pub fn find_available_port(start: u16) -> Result<u16> {
    let first = start.max(1);
    for port in first..=u16::MAX {
        if port_is_free(port) {
            tracing::debug!(port, "Found available port");
            return Ok(port);
        }
    }
    Err(PortError::NoPortAvailable { start })
}

fn port_is_free(port: u16) -> bool {
    // The listener is dropped at the end of the expression, releasing the port.
    TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).is_ok()
}
