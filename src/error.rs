use std::io;
use std::net::SocketAddrV4;

/// Error from probe setup or transmission.
///
/// Timeouts and unrelated inbound frames are not errors; they are absorbed by
/// the probe loop and only show up in the statistics.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error(
        "raw socket creation denied (requires root or CAP_NET_RAW): {0}\n\n\
         Fix options:\n\
         \u{2022} Run with sudo: sudo synping <target>\n\
         \u{2022} Add capability: sudo setcap cap_net_raw+ep <path-to-synping>\n\
         \u{2022} Use the unprivileged mode: synping --mode connect <target>"
    )]
    PermissionDenied(#[source] io::Error),

    #[error("raw TCP sockets are unavailable on this platform: {0}")]
    ResourceUnavailable(#[source] io::Error),

    #[error("local address {addr} is already in use")]
    AddressInUse {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },

    #[error("failed to send probe to {dst}: {source}")]
    SendFailed {
        dst: SocketAddrV4,
        #[source]
        source: io::Error,
    },

    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),

    #[error("no free ephemeral source port after {0} attempts")]
    PortsExhausted(u32),

    #[error("{0} is not an IPv4 address")]
    NotIpv4(std::net::IpAddr),
}

impl ProbeError {
    /// Errors raised before any probe leaves the host
    pub fn is_setup(&self) -> bool {
        !matches!(self, Self::SendFailed { .. } | Self::Receive(_))
    }

    /// Classify a raw socket creation failure
    pub fn from_socket_error(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(err),
            _ => Self::ResourceUnavailable(err),
        }
    }

    /// Classify a bind failure for `addr`
    pub fn from_bind_error(addr: SocketAddrV4, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => Self::AddressInUse { addr, source: err },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(err),
            _ => Self::Bind { addr, source: err },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_socket_error_classification() {
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(
            ProbeError::from_socket_error(denied),
            ProbeError::PermissionDenied(_)
        ));

        let other = io::Error::from(io::ErrorKind::Unsupported);
        assert!(matches!(
            ProbeError::from_socket_error(other),
            ProbeError::ResourceUnavailable(_)
        ));
    }

    #[test]
    fn test_bind_error_classification() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 50000);
        let in_use = io::Error::from(io::ErrorKind::AddrInUse);
        let err = ProbeError::from_bind_error(addr, in_use);
        assert!(matches!(err, ProbeError::AddressInUse { .. }));
        assert!(err.to_string().contains("10.0.0.1:50000"));

        let other = io::Error::from(io::ErrorKind::AddrNotAvailable);
        assert!(matches!(
            ProbeError::from_bind_error(addr, other),
            ProbeError::Bind { .. }
        ));
    }

    #[test]
    fn test_setup_vs_transmission() {
        let dst = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80);
        let send = ProbeError::SendFailed {
            dst,
            source: io::Error::from(io::ErrorKind::Other),
        };
        assert!(!send.is_setup());
        assert!(ProbeError::PortsExhausted(10).is_setup());
        assert!(ProbeError::PermissionDenied(io::Error::from(io::ErrorKind::PermissionDenied)).is_setup());
    }

    #[test]
    fn test_permission_message_is_actionable() {
        let err = ProbeError::PermissionDenied(io::Error::from(io::ErrorKind::PermissionDenied));
        let msg = err.to_string();
        assert!(msg.contains("sudo"));
        assert!(msg.contains("setcap"));
    }
}
