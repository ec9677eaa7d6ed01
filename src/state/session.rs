use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::config::{Config, ProbeMode};
use crate::state::{RttAggregator, Summary};

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    /// Zero-based iteration number
    pub index: u64,
    /// Sequence number carried by the SYN (0 in connect mode)
    pub seq: u32,
    pub src_port: u16,
    pub sent_at: DateTime<Utc>,
    /// Round-trip time; None when the probe was lost
    #[serde(with = "opt_duration_micros")]
    pub rtt: Option<Duration>,
    /// Size of the matched reply frame, when one was captured
    pub reply_len: Option<usize>,
}

impl ProbeOutcome {
    pub fn matched(&self) -> bool {
        self.rtt.is_some()
    }
}

/// Target being probed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub original: String,
    pub resolved: Ipv4Addr,
    pub port: u16,
}

impl Target {
    pub fn new(original: String, resolved: Ipv4Addr, port: u16) -> Self {
        Self {
            original,
            resolved,
            port,
        }
    }
}

/// A complete probing session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub target: Target,
    pub started_at: DateTime<Utc>,
    pub config: Config,
    /// Mode actually used after resolving `auto`
    pub mode: ProbeMode,
    pub source_ip: Option<Ipv4Addr>,
    pub interface: Option<String>,
    pub stats: RttAggregator,
    /// Set when the run ended on a transmission error
    pub error: Option<String>,
}

impl Session {
    pub fn new(target: Target, config: Config) -> Self {
        let mode = config.mode;
        Self {
            target,
            started_at: Utc::now(),
            config,
            mode,
            source_ip: None,
            interface: None,
            stats: RttAggregator::new(),
            error: None,
        }
    }

    pub fn record(&mut self, outcome: ProbeOutcome) {
        self.stats.record(outcome);
    }

    pub fn outcomes(&self) -> &[ProbeOutcome] {
        self.stats.outcomes()
    }

    pub fn summary(&self) -> Summary {
        self.stats.summary()
    }
}

/// Serde helper for Option<Duration> as microseconds
mod opt_duration_micros {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_micros() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let micros = Option::<u64>::deserialize(deserializer)?;
        Ok(micros.map(Duration::from_micros))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        let target = Target::new(
            "example.com".to_string(),
            Ipv4Addr::new(93, 184, 216, 34),
            80,
        );
        Session::new(target, Config::default())
    }

    fn outcome(index: u64, rtt: Option<Duration>) -> ProbeOutcome {
        ProbeOutcome {
            index,
            seq: 1000 + index as u32,
            src_port: 50000,
            sent_at: Utc::now(),
            rtt,
            reply_len: rtt.map(|_| 40),
        }
    }

    #[test]
    fn test_new_session_is_empty() {
        let session = session();
        assert!(session.outcomes().is_empty());
        assert_eq!(session.summary().sent, 0);
        assert_eq!(session.mode, ProbeMode::Auto);
        assert!(session.error.is_none());
    }

    #[test]
    fn test_record_feeds_summary() {
        let mut session = session();
        session.record(outcome(0, Some(Duration::from_millis(12))));
        session.record(outcome(1, None));

        assert_eq!(session.outcomes().len(), 2);
        assert!(session.outcomes()[0].matched());
        assert!(!session.outcomes()[1].matched());

        let summary = session.summary();
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.received, 1);
        assert_eq!(summary.loss_pct, 50.0);
    }

    #[test]
    fn test_session_serialization_roundtrip() {
        let mut session = session();
        session.mode = ProbeMode::SynRst;
        session.source_ip = Some(Ipv4Addr::new(192, 168, 1, 10));
        session.record(outcome(0, Some(Duration::from_micros(1500))));
        session.record(outcome(1, None));

        let json = serde_json::to_string(&session).unwrap();
        let restored: Session = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.target.original, "example.com");
        assert_eq!(restored.mode, ProbeMode::SynRst);
        assert_eq!(restored.outcomes(), session.outcomes());
        assert_eq!(restored.outcomes()[0].rtt, Some(Duration::from_micros(1500)));
        assert_eq!(restored.outcomes()[1].rtt, None);
    }
}
