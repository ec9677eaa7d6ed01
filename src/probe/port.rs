use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::ops::RangeInclusive;

use crate::error::ProbeError;

/// IANA dynamic/private port range
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;

/// Random candidates tried before giving up on a probe
pub const MAX_PORT_ATTEMPTS: u32 = 10;

/// Recently used ports that will not be handed out again
pub const REUSE_WINDOW: usize = 4096;

/// True if nothing on the host currently holds `ip:port` for TCP
pub fn is_port_free(ip: Ipv4Addr, port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(ip, port)).is_ok()
}

type PortCheck = Box<dyn FnMut(Ipv4Addr, u16) -> bool + Send>;

/// Hands out one local source port per probe
///
/// Each probe gets a fresh random port from [`EPHEMERAL_PORTS`] that is free
/// on the host and was not used by any of the last [`REUSE_WINDOW`] probes, so
/// late replies to an earlier probe can never match a later one.
pub struct PortAllocator {
    fixed: Option<u16>,
    recent: VecDeque<u16>,
    recent_set: HashSet<u16>,
    check: PortCheck,
}

impl PortAllocator {
    /// Allocator that checks candidates against the host's TCP ports
    pub fn new() -> Self {
        Self::with_check(is_port_free)
    }

    /// Allocator with a custom availability check
    pub fn with_check(check: impl FnMut(Ipv4Addr, u16) -> bool + Send + 'static) -> Self {
        Self {
            fixed: None,
            recent: VecDeque::new(),
            recent_set: HashSet::new(),
            check: Box::new(check),
        }
    }

    /// Always hand out `port`, skipping allocation and the availability check
    pub fn fixed(port: u16) -> Self {
        Self {
            fixed: Some(port),
            ..Self::with_check(|_, _| true)
        }
    }

    /// Pick a source port for the next probe from `ip`
    pub fn allocate<R: Rng>(&mut self, rng: &mut R, ip: Ipv4Addr) -> Result<u16, ProbeError> {
        if let Some(port) = self.fixed {
            return Ok(port);
        }

        for _ in 0..MAX_PORT_ATTEMPTS {
            let port = rng.gen_range(EPHEMERAL_PORTS);
            if self.recent_set.contains(&port) {
                continue;
            }
            if !(self.check)(ip, port) {
                tracing::trace!(port, "source port busy");
                continue;
            }
            self.remember(port);
            return Ok(port);
        }

        Err(ProbeError::PortsExhausted(MAX_PORT_ATTEMPTS))
    }

    fn remember(&mut self, port: u16) {
        self.recent.push_back(port);
        self.recent_set.insert(port);
        if self.recent.len() > REUSE_WINDOW
            && let Some(old) = self.recent.pop_front()
        {
            self.recent_set.remove(&old);
        }
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("fixed", &self.fixed)
            .field("recent", &self.recent.len())
            .finish()
    }
}
