//! Port selection helpers for the tunnel setup.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use snafu::{ResultExt, Snafu};

use crate::port::Mapping;

const EPHEMERAL_RANGE: std::ops::RangeInclusive<u16> = 49152..=65535;

/// Chooses the in-pod port for the SSH daemon, avoiding every port already
/// claimed by a mapping.
///
/// Preference order: 2222, then 22, then the first free port of the
/// ephemeral range. Port 22 stays behind 2222 on purpose: forwarding to 22
/// is known to fail on some clusters, so it is only used when 2222 is taken.
pub fn free_ssh_port_in_container(mappings: &[Mapping]) -> Result<u16, Error> {
    if !is_in_use(mappings, 2222) {
        return Ok(2222);
    }
    if !is_in_use(mappings, 22) {
        return Ok(22);
    }
    EPHEMERAL_RANGE
        .clone()
        .find(|port| !is_in_use(mappings, *port))
        .ok_or(Error::NoFreeContainerPort)
}

fn is_in_use(mappings: &[Mapping], container_port: u16) -> bool {
    mappings.iter().any(|m| m.container_port == container_port)
}

/// Picks a free TCP port on the loopback interface by binding to port 0 and
/// reading back the assigned address. The listener is dropped immediately;
/// the port is only reserved again once the pod-port-forwarder binds it.
pub fn free_local_port() -> Result<u16, Error> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .context(BindLocalPortSnafu)?;
    let port = listener.local_addr().context(BindLocalPortSnafu)?.port();
    Ok(port)
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display(
        "Failed to choose a port for the SSH connection, all container ports are in use"
    ))]
    NoFreeContainerPort,

    #[snafu(display("Failed to reserve a free local port, error: {source}"))]
    BindLocalPort { source: std::io::Error },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Protocol;

    fn mapping(container_port: u16) -> Mapping {
        Mapping {
            target_host: "127.0.0.1".to_string(),
            target_port: 8080,
            container_port,
            protocol: Protocol::Tcp,
        }
    }

    #[test]
    fn test_prefers_2222() {
        let port = free_ssh_port_in_container(&[mapping(80), mapping(22)]).unwrap();
        assert_eq!(port, 2222);
    }

    #[test]
    fn test_falls_back_to_22() {
        let port = free_ssh_port_in_container(&[mapping(2222)]).unwrap();
        assert_eq!(port, 22);
    }

    #[test]
    fn test_sweeps_ephemeral_range() {
        let port = free_ssh_port_in_container(&[mapping(2222), mapping(22)]).unwrap();
        assert_eq!(port, 49152);

        let port =
            free_ssh_port_in_container(&[mapping(2222), mapping(22), mapping(49152)]).unwrap();
        assert_eq!(port, 49153);
    }

    #[test]
    fn test_free_local_port_is_nonzero() {
        let port = free_local_port().unwrap();
        assert_ne!(port, 0);
    }
}
