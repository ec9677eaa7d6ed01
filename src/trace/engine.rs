use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::error::ProbeError;
use crate::probe::PortAllocator;
use crate::state::{ProbeOutcome, Session};
use crate::trace::strategy::{Cycle, CycleState, ProbeRequest, ProbeStrategy, Verdict};

/// Sleep granularity while pacing; bounds how late cancellation is noticed
const PACING_SLICE: Duration = Duration::from_millis(100);

/// The probe engine runs probe cycles one at a time at the configured interval
pub struct ProbeEngine<S, R> {
    config: Config,
    target: SocketAddrV4,
    source_ip: Ipv4Addr,
    strategy: S,
    ports: PortAllocator,
    rng: R,
    state: Arc<RwLock<Session>>,
    cancel: CancellationToken,
    last_seq: Option<u32>,
}

impl<S, R> ProbeEngine<S, R>
where
    S: ProbeStrategy,
    R: Rng,
{
    pub fn new(
        config: Config,
        target: SocketAddrV4,
        source_ip: Ipv4Addr,
        strategy: S,
        rng: R,
        state: Arc<RwLock<Session>>,
        cancel: CancellationToken,
    ) -> Self {
        let ports = match config.source_port {
            Some(port) => PortAllocator::fixed(port),
            None => PortAllocator::new(),
        };
        Self {
            config,
            target,
            source_ip,
            strategy,
            ports,
            rng,
            state,
            cancel,
            last_seq: None,
        }
    }

    /// Replace the source port allocator
    pub fn with_ports(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    /// Fresh initial sequence number, never equal to the previous probe's
    fn next_seq(&mut self) -> u32 {
        loop {
            let seq = self.rng.next_u32();
            if self.last_seq != Some(seq) {
                self.last_seq = Some(seq);
                return seq;
            }
        }
    }

    /// Wait until `until`, returning false if cancelled first
    fn pace(&self, until: Instant) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            std::thread::sleep(remaining.min(PACING_SLICE));
        }
    }

    /// Run probe cycles until the count is reached or the run is cancelled
    ///
    /// Outcomes are recorded into the shared session as they complete and
    /// passed to `on_outcome`. On error the session keeps everything recorded
    /// before the failing probe.
    pub fn run_blocking<O>(mut self, mut on_outcome: O) -> Result<(), ProbeError>
    where
        O: FnMut(&ProbeOutcome),
    {
        let mut index: u64 = 0;

        while self.config.count.is_none_or(|count| index < count) {
            if self.cancel.is_cancelled() {
                debug!(index, "cancelled before probe");
                break;
            }

            let started = Instant::now();
            let mut cycle = Cycle::new();

            let src_port = self.ports.allocate(&mut self.rng, self.source_ip)?;
            cycle.advance(CycleState::PortAllocated);

            let seq = if self.strategy.mode().needs_raw_socket() {
                self.next_seq()
            } else {
                0
            };
            let request = ProbeRequest {
                source: SocketAddrV4::new(self.source_ip, src_port),
                destination: self.target,
                seq,
                timeout: self.config.timeout,
            };

            let sent_at = Utc::now();
            let verdict = self.strategy.probe(&request, &mut cycle, &self.cancel)?;
            debug_assert!(cycle.state().is_terminal());

            let rtt = match verdict {
                Verdict::Cancelled => {
                    debug!(index, seq, "probe abandoned on cancellation");
                    break;
                }
                Verdict::Matched { rtt, .. } => Some(rtt),
                Verdict::TimedOut => None,
            };
            let reply_len = match verdict {
                Verdict::Matched { reply_len, .. } => reply_len,
                _ => None,
            };

            let outcome = ProbeOutcome {
                index,
                seq,
                src_port,
                sent_at,
                rtt,
                reply_len,
            };
            debug!(
                index,
                seq,
                src_port,
                rtt_us = rtt.map(|d| d.as_micros() as u64),
                "probe complete"
            );

            self.state.write().record(outcome.clone());
            on_outcome(&outcome);
            cycle.advance(CycleState::Idle);
            index += 1;

            let more = self.config.count.is_none_or(|count| index < count);
            if more && !self.pace(started + self.config.interval) {
                break;
            }
        }

        Ok(())
    }
}

/// Spawn the engine on a dedicated OS thread (blocking I/O)
///
/// Outcomes are forwarded to `on_outcome` from that thread as they complete.
pub fn spawn_engine<S, R, O>(
    engine: ProbeEngine<S, R>,
    on_outcome: O,
) -> std::thread::JoinHandle<Result<(), ProbeError>>
where
    S: ProbeStrategy + 'static,
    R: Rng + Send + 'static,
    O: FnMut(&ProbeOutcome) + Send + 'static,
{
    std::thread::spawn(move || engine.run_blocking(on_outcome))
}
