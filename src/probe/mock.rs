//! In-memory network for exercising the probe cycle without privileges
//!
//! `MockNetwork` hands out transports that share one recorded state: every
//! frame sent is logged, and an optional responder turns each sent frame into
//! replies that later `receive` calls return in FIFO order.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ProbeError;
use crate::probe::correlate::{Segment, parse_segment};
use crate::probe::socket::{Received, Transport, TransportFactory};
use crate::probe::tcp::{TcpFlags, build_ipv4_header, build_tcp_header};

/// Turns one sent frame into zero or more reply frames
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Longest a mock receive sleeps when nothing is queued
const IDLE_WAIT: Duration = Duration::from_millis(2);

/// A frame recorded by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub local: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    sent: Vec<SentFrame>,
    inbox: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    opened: Vec<SocketAddrV4>,
    live: usize,
    fail_open: Option<io::ErrorKind>,
    fail_next_send: bool,
    fail_sends_after: Option<usize>,
    failing_receives: usize,
}

/// Shared handle to an in-memory network
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<MockState>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network whose peer answers every SYN with a valid SYN-ACK
    pub fn listening() -> Self {
        let net = Self::new();
        net.set_responder(syn_ack_responder());
        net
    }

    pub fn set_responder(&self, responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static) {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// Queue a frame for the next receive regardless of what was sent
    pub fn push_inbound(&self, frame: Vec<u8>) {
        self.state.lock().inbox.push_back(frame);
    }

    /// Make the next `open` fail with `kind`
    pub fn fail_open(&self, kind: io::ErrorKind) {
        self.state.lock().fail_open = Some(kind);
    }

    /// Make the next send fail
    pub fn fail_next_send(&self) {
        self.state.lock().fail_next_send = true;
    }

    /// Let `count` sends succeed, then fail every one after
    pub fn fail_sends_after(&self, count: usize) {
        self.state.lock().fail_sends_after = Some(count);
    }

    /// Make the next `count` receives return an error
    pub fn fail_receives(&self, count: usize) {
        self.state.lock().failing_receives = count;
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        self.state.lock().sent.clone()
    }

    /// Sent frames parsed back into segments
    pub fn sent_segments(&self) -> Vec<Segment> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|f| parse_segment(&f.bytes))
            .collect()
    }

    /// Local addresses transports were opened on, in order
    pub fn opened(&self) -> Vec<SocketAddrV4> {
        self.state.lock().opened.clone()
    }

    /// Transports currently open
    pub fn live_transports(&self) -> usize {
        self.state.lock().live
    }
}

impl std::fmt::Debug for MockNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockNetwork")
            .field("sent", &state.sent.len())
            .field("inbox", &state.inbox.len())
            .field("live", &state.live)
            .finish()
    }
}

impl TransportFactory for MockNetwork {
    type Transport = MockTransport;

    fn open(&mut self, local: SocketAddrV4) -> Result<MockTransport, ProbeError> {
        let mut state = self.state.lock();
        if let Some(kind) = state.fail_open.take() {
            return Err(ProbeError::from_bind_error(local, io::Error::from(kind)));
        }
        state.opened.push(local);
        state.live += 1;
        Ok(MockTransport {
            local,
            state: self.state.clone(),
        })
    }
}

/// Transport handed out by [`MockNetwork`]
pub struct MockTransport {
    local: SocketAddrV4,
    state: Arc<Mutex<MockState>>,
}

impl Transport for MockTransport {
    fn send(&mut self, frame: &[u8], destination: SocketAddrV4) -> Result<(), ProbeError> {
        let mut state = self.state.lock();

        let over_budget = state
            .fail_sends_after
            .is_some_and(|limit| state.sent.len() >= limit);
        if std::mem::take(&mut state.fail_next_send) || over_budget {
            return Err(ProbeError::SendFailed {
                dst: destination,
                source: io::Error::new(io::ErrorKind::NetworkUnreachable, "mock send failure"),
            });
        }

        state.sent.push(SentFrame {
            local: self.local,
            destination,
            bytes: frame.to_vec(),
        });

        let replies = match state.responder.as_mut() {
            Some(responder) => responder(frame),
            None => Vec::new(),
        };
        state.inbox.extend(replies);
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Received, ProbeError> {
        {
            let mut state = self.state.lock();
            if state.failing_receives > 0 {
                state.failing_receives -= 1;
                return Err(ProbeError::Receive(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "mock receive failure",
                )));
            }
            if let Some(frame) = state.inbox.pop_front() {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                return Ok(Received::Frame(len));
            }
        }

        std::thread::sleep(timeout.min(IDLE_WAIT));
        Ok(Received::TimedOut)
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
    }
}

/// Build a reply frame travelling `from` -> `to`
pub fn reply_frame(
    from: SocketAddrV4,
    to: SocketAddrV4,
    flags: TcpFlags,
    seq: u32,
    ack: u32,
) -> Vec<u8> {
    let mut frame = build_ipv4_header(*from.ip(), *to.ip()).to_vec();
    frame.extend_from_slice(&build_tcp_header(from, to, seq, flags, Some(ack)));
    frame
}

/// Responder emulating a listening port: SYN in, SYN-ACK for `seq + 1` out
pub fn syn_ack_responder() -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static {
    |frame: &[u8]| match parse_segment(frame) {
        Some(seg) if seg.flags.contains(TcpFlags::SYN) && !seg.flags.contains(TcpFlags::ACK) => {
            vec![reply_frame(
                seg.destination,
                seg.source,
                TcpFlags::SYN | TcpFlags::ACK,
                0x5eed_0000,
                seg.seq.wrapping_add(1),
            )]
        }
        _ => Vec::new(),
    }
}

/// Responder emulating a closed port: SYN in, RST|ACK out
pub fn rst_responder() -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static {
    |frame: &[u8]| match parse_segment(frame) {
        Some(seg) if seg.flags.contains(TcpFlags::SYN) => vec![reply_frame(
            seg.destination,
            seg.source,
            TcpFlags::RST | TcpFlags::ACK,
            0,
            seg.seq.wrapping_add(1),
        )],
        _ => Vec::new(),
    }
}
