//! Obtains an unused TCP port from the operating system.
//!
//! The listener is closed before the port is handed to the server, so another
//! process may still grab it in between. The window is narrow and accepted.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use color_eyre::eyre::eyre;

use crate::error::{LifecycleError, LifecycleErrorKind, LifecycleResult};

/// Binds port 0 on the wildcard address and returns the port the OS chose.
///
/// # Errors
/// Returns a [`LifecycleErrorKind::PortAllocation`] error when the bind fails
/// or the bound address cannot be read back.
///
/// # Examples
/// ```
/// let port = pg_tmp::allocate_port()?;
/// assert_ne!(port, 0);
/// # Ok::<(), pg_tmp::LifecycleError>(())
/// ```
pub fn allocate_port() -> LifecycleResult<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        .map_err(|err| port_error(eyre!("failed to bind an ephemeral port: {err}")))?;
    let port = listener
        .local_addr()
        .map_err(|err| port_error(eyre!("failed to read the allocated port: {err}")))?
        .port();
    drop(listener);
    Ok(port)
}

const fn port_error(report: color_eyre::Report) -> LifecycleError {
    LifecycleError::new(LifecycleErrorKind::PortAllocation, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_port_is_free_to_bind_again() {
        let port = allocate_port().expect("allocate port");
        assert_ne!(port, 0);
        let rebound = TcpListener::bind((Ipv4Addr::LOCALHOST, port));
        assert!(rebound.is_ok(), "port {port} should be released");
    }
}
