use std::io::Write;
use std::time::Duration;

use crate::state::{ProbeOutcome, Session};

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Opening line naming the source, the target and the probe mode
pub fn format_banner(session: &Session) -> String {
    let source = session
        .source_ip
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "0.0.0.0".to_string());
    format!(
        "SYNPING {} ({}) -> {} ({}) port {} mode {}",
        session.interface.as_deref().unwrap_or("any"),
        source,
        session.target.original,
        session.target.resolved,
        session.target.port,
        session.mode
    )
}

/// One line per finished probe
///
/// Probes answered through the OS stack have no captured reply frame, so
/// their line carries neither length nor sequence number.
pub fn format_outcome(session: &Session, outcome: &ProbeOutcome) -> String {
    let ip = session.target.resolved;
    let port = session.target.port;
    match (outcome.rtt, outcome.reply_len) {
        (Some(rtt), Some(len)) => format!(
            "len={} ip={} port={} seq={} rtt={:.2} ms",
            len,
            ip,
            port,
            outcome.seq,
            ms(rtt)
        ),
        (Some(rtt), None) => format!("connected ip={} port={} rtt={:.2} ms", ip, port, ms(rtt)),
        (None, _) if !session.mode.needs_raw_socket() => {
            format!("timeout ip={} port={}", ip, port)
        }
        (None, _) => format!("timeout ip={} port={} seq={}", ip, port, outcome.seq),
    }
}

/// Write the closing statistics block
pub fn write_summary<W: Write>(session: &Session, mut writer: W) -> std::io::Result<()> {
    let summary = session.summary();
    writeln!(writer)?;
    writeln!(writer, "--- {} synping statistics ---", session.target.original)?;
    writeln!(
        writer,
        "{} packets transmitted, {} packets received, {:.2}% packet loss",
        summary.sent, summary.received, summary.loss_pct
    )?;
    writeln!(
        writer,
        "round-trip min/avg/max = {:.2}/{:.2}/{:.2} ms",
        ms(summary.min),
        ms(summary.avg),
        ms(summary.max)
    )?;
    Ok(())
}

/// Summary block as a string
pub fn summary_string(session: &Session) -> String {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail
    let _ = write_summary(session, &mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}
