use clap::Parser;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Measure TCP handshake latency with half-open SYN probes
#[derive(Parser, Debug, Clone)]
#[command(name = "synping")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Target host (IPv4 address or hostname)
    pub target: String,

    /// Destination TCP port
    #[arg(short = 'p', long = "port", default_value = "80")]
    pub port: u16,

    /// Number of probes to send (0 = until interrupted)
    #[arg(short = 'c', long = "count", default_value = "0")]
    pub count: u64,

    /// Seconds between probes
    #[arg(short = 'i', long = "interval", default_value = "1.0")]
    pub interval: f64,

    /// Seconds to wait for each reply
    #[arg(short = 't', long = "timeout", default_value = "1.0")]
    pub timeout: f64,

    /// Fixed source port (default: random ephemeral port per probe)
    #[arg(short = 's', long = "source-port")]
    pub source_port: Option<u16>,

    /// Source IPv4 address
    #[arg(long = "source-ip")]
    pub source_ip: Option<Ipv4Addr>,

    /// Send probes from a specific network interface (e.g., eth0)
    #[arg(long = "interface")]
    pub interface: Option<String>,

    /// Probe mode (auto, syn, syn-rst, connect)
    #[arg(short = 'm', long = "mode", default_value = "auto")]
    pub mode: String,

    /// Do not reset matched half-open connections (auto mode)
    #[arg(long = "no-rst")]
    pub no_rst: bool,

    /// Print the session as JSON instead of the text summary
    #[arg(long = "json")]
    pub json: bool,

    /// Verbose logging to stderr
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Bounds of the per-probe deadline, in seconds
pub const MIN_TIMEOUT: f64 = 0.1;
pub const MAX_TIMEOUT: f64 = 60.0;

/// Longest gap between probes, in seconds
pub const MAX_INTERVAL: f64 = 3600.0;

impl Args {
    /// Get probe interval as Duration
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }

    /// Get timeout as Duration
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.target.trim().is_empty() {
            return Err("Target cannot be empty".into());
        }

        if self.port == 0 {
            return Err("Port must be between 1 and 65535".into());
        }

        let mode = self.mode.to_lowercase();
        if !["auto", "syn", "syn-rst", "synrst", "connect"].contains(&mode.as_str()) {
            return Err(format!(
                "Unknown mode: {}. Use auto, syn, syn-rst, or connect",
                self.mode
            ));
        }

        if self.no_rst && mode != "auto" {
            return Err("--no-rst only applies to auto mode; use --mode syn instead".into());
        }

        if !self.interval.is_finite() || !(0.0..=MAX_INTERVAL).contains(&self.interval) {
            return Err(format!(
                "Interval must be between 0 and {} seconds",
                MAX_INTERVAL
            ));
        }

        if !self.timeout.is_finite() || !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.timeout) {
            return Err(format!(
                "Timeout must be between {} and {} seconds",
                MIN_TIMEOUT, MAX_TIMEOUT
            ));
        }

        if self.source_port == Some(0) {
            return Err("Source port must be between 1 and 65535".into());
        }

        // Validate interface name
        if let Some(ref iface) = self.interface {
            if iface.is_empty() {
                return Err("Interface name cannot be empty".into());
            }
            // IFNAMSIZ on Linux is 16 including null terminator
            if iface.len() > 15 {
                return Err(format!("Interface name too long: {} (max 15 chars)", iface));
            }
        }

        Ok(())
    }
}
