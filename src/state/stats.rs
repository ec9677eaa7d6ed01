use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::state::ProbeOutcome;

/// Aggregate over a run: counts, loss and latency of matched probes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub sent: u64,
    pub received: u64,
    pub loss_pct: f64,
    #[serde(with = "duration_micros")]
    pub min: Duration,
    #[serde(with = "duration_micros")]
    pub avg: Duration,
    #[serde(with = "duration_micros")]
    pub max: Duration,
}

/// Collects probe outcomes and derives statistics from them
///
/// The summary is recomputed from the full history on every call, so it can
/// never drift from the outcomes it describes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RttAggregator {
    outcomes: Vec<ProbeOutcome>,
}

impl RttAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: ProbeOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn outcomes(&self) -> &[ProbeOutcome] {
        &self.outcomes
    }

    pub fn summary(&self) -> Summary {
        let sent = self.outcomes.len() as u64;
        let rtts: Vec<Duration> = self.outcomes.iter().filter_map(|o| o.rtt).collect();
        let received = rtts.len() as u64;

        let loss_pct = if sent == 0 {
            0.0
        } else {
            (sent - received) as f64 / sent as f64 * 100.0
        };

        if rtts.is_empty() {
            return Summary {
                sent,
                received,
                loss_pct,
                min: Duration::ZERO,
                avg: Duration::ZERO,
                max: Duration::ZERO,
            };
        }

        let total_nanos: u128 = rtts.iter().map(Duration::as_nanos).sum();
        let avg = Duration::from_nanos((total_nanos / rtts.len() as u128) as u64);

        Summary {
            sent,
            received,
            loss_pct,
            min: rtts.iter().copied().min().unwrap_or_default(),
            avg,
            max: rtts.iter().copied().max().unwrap_or_default(),
        }
    }
}

/// Serde helper for Duration as whole microseconds
pub(crate) mod duration_micros {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_micros() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let micros = u64::deserialize(deserializer)?;
        Ok(Duration::from_micros(micros))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn outcome(rtt_ms: Option<u64>) -> ProbeOutcome {
        ProbeOutcome {
            index: 0,
            seq: 1,
            src_port: 50000,
            sent_at: Utc::now(),
            rtt: rtt_ms.map(Duration::from_millis),
            reply_len: rtt_ms.map(|_| 40),
        }
    }

    #[test]
    fn test_mixed_outcomes() {
        let mut agg = RttAggregator::new();
        for rtt in [Some(10), Some(20), Some(30), None, None] {
            agg.record(outcome(rtt));
        }

        let s = agg.summary();
        assert_eq!(s.sent, 5);
        assert_eq!(s.received, 3);
        assert!((s.loss_pct - 40.0).abs() < f64::EPSILON);
        assert_eq!(s.min, Duration::from_millis(10));
        assert_eq!(s.avg, Duration::from_millis(20));
        assert_eq!(s.max, Duration::from_millis(30));
    }

    #[test]
    fn test_nothing_received() {
        let mut agg = RttAggregator::new();
        for _ in 0..4 {
            agg.record(outcome(None));
        }

        let s = agg.summary();
        assert_eq!(s.sent, 4);
        assert_eq!(s.received, 0);
        assert_eq!(s.loss_pct, 100.0);
        assert_eq!(s.min, Duration::ZERO);
        assert_eq!(s.avg, Duration::ZERO);
        assert_eq!(s.max, Duration::ZERO);
    }

    #[test]
    fn test_empty_run() {
        let s = RttAggregator::new().summary();
        assert_eq!(s.sent, 0);
        assert_eq!(s.loss_pct, 0.0);
    }

    #[test]
    fn test_summary_order_independent() {
        let mut a = RttAggregator::new();
        let mut b = RttAggregator::new();
        for rtt in [Some(30), None, Some(10), Some(20)] {
            a.record(outcome(rtt));
        }
        for rtt in [Some(10), Some(20), None, Some(30)] {
            b.record(outcome(rtt));
        }
        assert_eq!(a.summary(), b.summary());
    }

    #[test]
    fn test_avg_sub_millisecond() {
        let mut agg = RttAggregator::new();
        let mut o = outcome(None);
        o.rtt = Some(Duration::from_micros(150));
        agg.record(o.clone());
        o.rtt = Some(Duration::from_micros(250));
        agg.record(o);
        assert_eq!(agg.summary().avg, Duration::from_micros(200));
    }
}
