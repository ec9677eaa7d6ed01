use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::error::ProbeError;
use crate::probe::tcp::IPV4_HEADER_SIZE;

/// Outcome of a bounded receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// A frame of this many bytes was written into the buffer
    Frame(usize),
    /// Nothing arrived before the wait elapsed
    TimedOut,
}

/// Sends complete IPv4 + TCP frames and receives inbound ones
///
/// One transport carries exactly one probe at a time. Dropping it releases
/// the underlying socket.
pub trait Transport {
    /// Transmit a fully formed frame towards `destination`
    fn send(&mut self, frame: &[u8], destination: SocketAddrV4) -> Result<(), ProbeError>;

    /// Wait at most `timeout` for the next inbound frame
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Received, ProbeError>;
}

/// Opens a transport bound to a local address
pub trait TransportFactory {
    type Transport: Transport;

    fn open(&mut self, local: SocketAddrV4) -> Result<Self::Transport, ProbeError>;
}

/// Create a raw IPv4 socket for the TCP protocol number
///
/// Requires root/CAP_NET_RAW. With `header_included` the kernel sends our
/// IPv4 header verbatim (IP_HDRINCL).
pub fn create_raw_tcp_socket(header_included: bool) -> Result<Socket, ProbeError> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP))
        .map_err(ProbeError::from_socket_error)?;

    if header_included {
        socket
            .set_header_included(true)
            .map_err(ProbeError::ResourceUnavailable)?;
    }

    socket
        .set_nonblocking(false)
        .map_err(ProbeError::ResourceUnavailable)?;

    Ok(socket)
}

/// Check that raw TCP sockets can be created before any traffic is sent
pub fn check_permissions() -> Result<(), ProbeError> {
    create_raw_tcp_socket(false).map(drop)
}

/// Raw-socket transport over IPPROTO_TCP
#[derive(Debug)]
pub struct RawTransport {
    socket: Socket,
    local: SocketAddrV4,
    /// Kernel builds the IPv4 header; send only the TCP segment
    strip_ip_header: bool,
}

impl RawTransport {
    /// Open a raw socket and bind it to `local`
    ///
    /// Raw sockets ignore the port for delivery, but binding the address keeps
    /// replies for other local addresses out of the receive queue.
    pub fn open(
        local: SocketAddrV4,
        header_included: bool,
        interface: Option<&str>,
    ) -> Result<Self, ProbeError> {
        let socket = create_raw_tcp_socket(header_included)?;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            if let Some(name) = interface {
                socket
                    .bind_device(Some(name.as_bytes()))
                    .map_err(|e| ProbeError::from_bind_error(local, e))?;
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let _ = interface;

        socket
            .bind(&SockAddr::from(SocketAddr::V4(local)))
            .map_err(|e| ProbeError::from_bind_error(local, e))?;

        Ok(Self {
            socket,
            local,
            strip_ip_header: !header_included,
        })
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }
}

/// Bytes handed to the kernel: without header inclusion it writes its own
/// IPv4 header, so ours is dropped
fn outbound_payload(frame: &[u8], strip_ip_header: bool) -> &[u8] {
    match frame.get(IPV4_HEADER_SIZE..) {
        Some(segment) if strip_ip_header && !segment.is_empty() => segment,
        _ => frame,
    }
}

impl Transport for RawTransport {
    fn send(&mut self, frame: &[u8], destination: SocketAddrV4) -> Result<(), ProbeError> {
        let payload = outbound_payload(frame, self.strip_ip_header);

        let addr = SockAddr::from(SocketAddr::V4(destination));
        self.socket
            .send_to(payload, &addr)
            .map(drop)
            .map_err(|source| ProbeError::SendFailed {
                dst: destination,
                source,
            })
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Received, ProbeError> {
        // A zero read timeout would mean "block forever"
        let timeout = timeout.max(Duration::from_millis(1));
        self.socket
            .set_read_timeout(Some(timeout))
            .map_err(ProbeError::Receive)?;

        match (&self.socket).read(buf) {
            Ok(len) => Ok(Received::Frame(len)),
            Err(e) if is_timeout(&e) => Ok(Received::TimedOut),
            Err(e) => Err(ProbeError::Receive(e)),
        }
    }
}

/// True for the errors a socket read timeout surfaces as
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Factory for raw-socket transports, one socket per probe
#[derive(Debug, Clone)]
pub struct RawSocketFactory {
    pub header_included: bool,
    pub interface: Option<String>,
}

impl Default for RawSocketFactory {
    fn default() -> Self {
        Self {
            header_included: true,
            interface: None,
        }
    }
}

impl TransportFactory for RawSocketFactory {
    type Transport = RawTransport;

    fn open(&mut self, local: SocketAddrV4) -> Result<RawTransport, ProbeError> {
        RawTransport::open(local, self.header_included, self.interface.as_deref())
    }
}

/// Result of a kernel-driven TCP connect
#[derive(Debug)]
pub enum ConnectResult {
    Established,
    TimedOut,
    /// Refused, unreachable, or any other failure short of a setup error
    Failed(io::Error),
}

/// Connect a regular TCP stream socket from `local` to `destination`
///
/// The handshake is left to the OS stack; the socket is closed on return.
pub fn tcp_connect(
    local: SocketAddrV4,
    destination: SocketAddrV4,
    timeout: Duration,
) -> Result<ConnectResult, ProbeError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(ProbeError::from_socket_error)?;

    if local != SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0) {
        socket
            .bind(&SockAddr::from(SocketAddr::V4(local)))
            .map_err(|e| ProbeError::from_bind_error(local, e))?;
    }

    let addr = SockAddr::from(SocketAddr::V4(destination));
    Ok(match socket.connect_timeout(&addr, timeout) {
        Ok(()) => ConnectResult::Established,
        Err(e) if is_timeout(&e) => ConnectResult::TimedOut,
        Err(e) => ConnectResult::Failed(e),
    })
}
