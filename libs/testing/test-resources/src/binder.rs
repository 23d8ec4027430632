//! Fixed host port checks
//!
//! A descriptor that pins a host port must own it. A port already held by
//! another process is reported as `PortConflict` before anything is started.

use std::net::{Ipv4Addr, TcpListener};

use tracing::debug;

use crate::descriptor::PortBinding;
use crate::error::{ResourceError, ResourceResult};

/// Verify every fixed host port in `bindings` can be bound
///
/// Runtime-assigned bindings are skipped. The probe socket is released
/// immediately so the runtime can take the port.
pub fn ensure_ports_available(bindings: &[PortBinding]) -> ResourceResult<()> {
    for port in bindings.iter().filter_map(|binding| binding.host_port) {
        ensure_port_available(port)?;
    }
    Ok(())
}

/// Verify a single host port can be bound on all interfaces
pub fn ensure_port_available(port: u16) -> ResourceResult<()> {
    match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)) {
        Ok(listener) => {
            drop(listener);
            debug!(port, "Host port available");
            Ok(())
        }
        Err(source) => Err(ResourceError::PortConflict { port, source }),
    }
}
