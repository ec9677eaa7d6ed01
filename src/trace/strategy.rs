//! One probe, start to finish
//!
//! A strategy takes a fully addressed probe request and drives it to a
//! verdict. Half-open probing crafts its own segments on a raw transport;
//! connect probing hands the handshake to the OS stack.

use std::net::SocketAddrV4;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ProbeMode;
use crate::error::ProbeError;
use crate::probe::{
    ConnectResult, Expected, MatchResult, Received, Transport, TransportFactory, build_rst_frame,
    build_syn_frame, match_reply, tcp_connect,
};

/// Maximum consecutive receive errors before the run is abandoned
pub const MAX_CONSECUTIVE_ERRORS: u32 = 50;

/// Longest single blocking receive; bounds how late cancellation is noticed
pub const POLL_SLICE: Duration = Duration::from_millis(100);

/// Largest IPv4 datagram
const RECV_BUFFER_SIZE: usize = 65535;

/// Probe cycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    PortAllocated,
    Sent,
    Waiting,
    Matched,
    TimedOut,
    Cancelled,
}

impl CycleState {
    /// Whether the cycle may move from `self` to `next`
    pub fn can_transition_to(self, next: CycleState) -> bool {
        use CycleState::*;
        match (self, next) {
            (_, Cancelled) => self != Cancelled,
            (Idle, PortAllocated) => true,
            (PortAllocated, Sent) => true,
            (Sent, Waiting) => true,
            (Waiting, Waiting | Matched | TimedOut) => true,
            (Matched | TimedOut, Idle) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Matched | Self::TimedOut | Self::Cancelled)
    }
}

/// Tracks the current state and logs each transition
#[derive(Debug)]
pub struct Cycle {
    state: CycleState,
}

impl Cycle {
    pub fn new() -> Self {
        Self {
            state: CycleState::Idle,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn advance(&mut self, next: CycleState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        if self.state != next {
            trace!(from = ?self.state, to = ?next, "cycle transition");
        }
        self.state = next;
    }
}

impl Default for Cycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a strategy needs to send one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRequest {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub seq: u32,
    pub timeout: Duration,
}

/// How a probe ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Matched {
        rtt: Duration,
        reply_len: Option<usize>,
    },
    /// No reply before the deadline (or, in connect mode, refused)
    TimedOut,
    /// Interrupted while waiting; not counted
    Cancelled,
}

/// A way of sending one probe and waiting for its answer
pub trait ProbeStrategy: Send {
    /// Concrete mode this strategy implements
    fn mode(&self) -> ProbeMode;

    /// Drive one probe to a verdict; `cycle` must be in `PortAllocated`
    fn probe(
        &mut self,
        request: &ProbeRequest,
        cycle: &mut Cycle,
        cancel: &CancellationToken,
    ) -> Result<Verdict, ProbeError>;
}

/// Half-open probing over a raw transport
pub struct HalfOpenProbe<F: TransportFactory> {
    factory: F,
    teardown: bool,
    poll_slice: Duration,
    consecutive_errors: u32,
    buffer: Vec<u8>,
}

impl<F: TransportFactory> HalfOpenProbe<F> {
    /// `teardown` sends a RST after each matched SYN-ACK
    pub fn new(factory: F, teardown: bool) -> Self {
        Self {
            factory,
            teardown,
            poll_slice: POLL_SLICE,
            consecutive_errors: 0,
            buffer: vec![0u8; RECV_BUFFER_SIZE],
        }
    }

    pub fn with_poll_slice(mut self, slice: Duration) -> Self {
        self.poll_slice = slice.max(Duration::from_millis(1));
        self
    }

    fn send_teardown(
        transport: &mut F::Transport,
        request: &ProbeRequest,
        peer_ack: u32,
    ) {
        let rst = build_rst_frame(request.source, request.destination, request.seq, peer_ack);
        if let Err(e) = transport.send(&rst, request.destination) {
            warn!(error = %e, dst = %request.destination, "failed to send RST teardown");
        }
    }
}

impl<F> ProbeStrategy for HalfOpenProbe<F>
where
    F: TransportFactory + Send,
{
    fn mode(&self) -> ProbeMode {
        if self.teardown {
            ProbeMode::SynRst
        } else {
            ProbeMode::Syn
        }
    }

    fn probe(
        &mut self,
        request: &ProbeRequest,
        cycle: &mut Cycle,
        cancel: &CancellationToken,
    ) -> Result<Verdict, ProbeError> {
        // Released on every exit path when it goes out of scope
        let mut transport = self.factory.open(request.source)?;

        let syn = build_syn_frame(request.source, request.destination, request.seq);
        let sent_at = Instant::now();
        transport.send(&syn, request.destination)?;
        cycle.advance(CycleState::Sent);

        let deadline = sent_at + request.timeout;
        let expected = Expected {
            source: request.source,
            destination: request.destination,
            seq: request.seq,
        };
        cycle.advance(CycleState::Waiting);

        loop {
            if cancel.is_cancelled() {
                cycle.advance(CycleState::Cancelled);
                return Ok(Verdict::Cancelled);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                cycle.advance(CycleState::TimedOut);
                return Ok(Verdict::TimedOut);
            }

            match transport.receive(&mut self.buffer, remaining.min(self.poll_slice)) {
                Ok(Received::Frame(len)) => {
                    self.consecutive_errors = 0;
                    match match_reply(&self.buffer[..len], &expected) {
                        MatchResult::Accepted { ack } => {
                            let rtt = sent_at.elapsed();
                            cycle.advance(CycleState::Matched);
                            if self.teardown {
                                Self::send_teardown(&mut transport, request, ack);
                            }
                            return Ok(Verdict::Matched {
                                rtt,
                                reply_len: Some(len),
                            });
                        }
                        MatchResult::Unrelated => trace!(len, "unrelated frame discarded"),
                        MatchResult::Malformed => trace!(len, "malformed frame discarded"),
                    }
                }
                Ok(Received::TimedOut) => self.consecutive_errors = 0,
                Err(e) => {
                    self.consecutive_errors += 1;
                    warn!(
                        error = %e,
                        consecutive = self.consecutive_errors,
                        max = MAX_CONSECUTIVE_ERRORS,
                        "receive error"
                    );
                    if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        return Err(e);
                    }
                }
            }
        }
    }
}

/// Probing by full TCP connect through the OS stack
#[derive(Debug, Default)]
pub struct ConnectProbe;

impl ProbeStrategy for ConnectProbe {
    fn mode(&self) -> ProbeMode {
        ProbeMode::Connect
    }

    fn probe(
        &mut self,
        request: &ProbeRequest,
        cycle: &mut Cycle,
        cancel: &CancellationToken,
    ) -> Result<Verdict, ProbeError> {
        if cancel.is_cancelled() {
            cycle.advance(CycleState::Cancelled);
            return Ok(Verdict::Cancelled);
        }

        let (source, destination, timeout) =
            (request.source, request.destination, request.timeout);
        let (tx, rx) = mpsc::channel();

        // The SYN leaves inside connect(); sending and waiting are one step
        cycle.advance(CycleState::Sent);
        cycle.advance(CycleState::Waiting);

        // connect() cannot be interrupted, so it runs on its own thread and
        // is abandoned on cancellation; it still ends within `timeout`
        std::thread::spawn(move || {
            let started = Instant::now();
            let result =
                tcp_connect(source, destination, timeout).map(|r| (r, started.elapsed()));
            let _ = tx.send(result);
        });

        let (result, rtt) = loop {
            if cancel.is_cancelled() {
                debug!(dst = %destination, "connect abandoned on cancellation");
                cycle.advance(CycleState::Cancelled);
                return Ok(Verdict::Cancelled);
            }
            match rx.recv_timeout(POLL_SLICE) {
                Ok(result) => break result?,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    warn!(dst = %destination, "connect thread exited without a result");
                    cycle.advance(CycleState::TimedOut);
                    return Ok(Verdict::TimedOut);
                }
            }
        };

        match result {
            ConnectResult::Established => {
                cycle.advance(CycleState::Matched);
                Ok(Verdict::Matched {
                    rtt,
                    reply_len: None,
                })
            }
            ConnectResult::TimedOut => {
                cycle.advance(CycleState::TimedOut);
                Ok(Verdict::TimedOut)
            }
            ConnectResult::Failed(e) => {
                debug!(error = %e, dst = %destination, "connect failed");
                cycle.advance(CycleState::TimedOut);
                Ok(Verdict::TimedOut)
            }
        }
    }
}
