use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::cli::Args;
use crate::error::ProbeError;

/// How each probe reaches the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeMode {
    /// Half-open with teardown when raw sockets work, connect otherwise
    #[default]
    Auto,
    /// Hand-built SYN, reply left for the peer to time out
    Syn,
    /// Hand-built SYN followed by a RST once the SYN-ACK arrives
    SynRst,
    /// Full handshake through the OS stack (no privileges needed)
    Connect,
}

impl ProbeMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "syn" => Some(Self::Syn),
            "syn-rst" | "synrst" => Some(Self::SynRst),
            "connect" => Some(Self::Connect),
            _ => None,
        }
    }

    /// Settle `Auto` into a concrete mode
    ///
    /// `raw_available` says whether a raw TCP socket could be opened; `rst`
    /// picks between the two half-open variants.
    pub fn resolve(self, raw_available: bool, rst: bool) -> Self {
        match self {
            Self::Auto if !raw_available => Self::Connect,
            Self::Auto if rst => Self::SynRst,
            Self::Auto => Self::Syn,
            other => other,
        }
    }

    /// Settle the mode against the host's raw socket access
    ///
    /// `check` is only run for modes that need a raw socket. `Auto` falls
    /// back to `Connect` when it fails; explicit half-open modes return the
    /// error.
    pub fn settle<F>(self, rst: bool, check: F) -> Result<Self, ProbeError>
    where
        F: FnOnce() -> Result<(), ProbeError>,
    {
        match self {
            Self::Auto => match check() {
                Ok(()) => Ok(self.resolve(true, rst)),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "raw sockets unavailable, falling back to connect mode"
                    );
                    Ok(self.resolve(false, rst))
                }
            },
            Self::Syn | Self::SynRst => check().map(|()| self),
            Self::Connect => Ok(self),
        }
    }

    /// Whether this mode builds its own segments on a raw socket
    pub fn needs_raw_socket(self) -> bool {
        matches!(self, Self::Syn | Self::SynRst)
    }
}

impl fmt::Display for ProbeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Syn => "syn",
            Self::SynRst => "syn-rst",
            Self::Connect => "connect",
        };
        f.write_str(s)
    }
}

/// Runtime configuration derived from CLI args
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Destination TCP port
    pub port: u16,
    /// Number of probes to send (None = until cancelled)
    pub count: Option<u64>,
    /// Spacing between probe starts
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    /// Per-probe deadline for the reply
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Fixed local port instead of per-probe ephemeral allocation
    pub source_port: Option<u16>,
    pub source_ip: Option<Ipv4Addr>,
    pub interface: Option<String>,
    pub mode: ProbeMode,
    /// Tear down matched half-open sessions (auto mode)
    pub rst: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 80,
            count: None,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            source_port: None,
            source_ip: None,
            interface: None,
            mode: ProbeMode::Auto,
            rst: true,
        }
    }
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            port: args.port,
            count: if args.count == 0 { None } else { Some(args.count) },
            interval: args.interval_duration(),
            timeout: args.timeout_duration(),
            source_port: args.source_port,
            source_ip: args.source_ip,
            interface: args.interface.clone(),
            mode: ProbeMode::parse(&args.mode).unwrap_or_default(),
            rst: !args.no_rst,
        }
    }
}

/// Serde helper for Duration as fractional seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
