//! Integration tests for the probe→match→statistics pipeline
//!
//! These tests drive whole probe cycles through the in-memory network, without
//! privileges or real network access.

use chrono::Utc;
use parking_lot::RwLock;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use synping::config::{Config, ProbeMode};
use synping::error::ProbeError;
use synping::export::{export_json, summary_string};
use synping::probe::mock::{MockNetwork, reply_frame};
use synping::probe::{
    Expected, MatchResult, PortAllocator, TcpFlags, build_syn_frame, match_reply, verify,
};
use synping::state::{ProbeOutcome, RttAggregator, Session, Target};
use synping::trace::{HalfOpenProbe, ProbeEngine};

const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
const TARGET: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80);

fn test_config(count: u64) -> Config {
    Config {
        count: Some(count),
        interval: Duration::ZERO,
        timeout: Duration::from_millis(40),
        mode: ProbeMode::SynRst,
        ..Config::default()
    }
}

fn test_session(config: &Config) -> Arc<RwLock<Session>> {
    let target = Target::new("example.com".to_string(), *TARGET.ip(), TARGET.port());
    let mut session = Session::new(target, config.clone());
    session.mode = config.mode;
    session.source_ip = Some(LOCAL_IP);
    Arc::new(RwLock::new(session))
}

fn run(
    net: &MockNetwork,
    config: Config,
    state: &Arc<RwLock<Session>>,
    cancel: CancellationToken,
) -> Result<(), ProbeError> {
    let teardown = config.mode == ProbeMode::SynRst;
    ProbeEngine::new(
        config,
        TARGET,
        LOCAL_IP,
        HalfOpenProbe::new(net.clone(), teardown).with_poll_slice(Duration::from_millis(5)),
        StdRng::seed_from_u64(2024),
        state.clone(),
        cancel,
    )
    .with_ports(PortAllocator::with_check(|_, _| true))
    .run_blocking(|_| {})
}

#[test]
fn test_reference_exchange() {
    let local = SocketAddrV4::new(LOCAL_IP, 50123);
    let expected = Expected {
        source: local,
        destination: TARGET,
        seq: 1000,
    };

    let syn = build_syn_frame(local, TARGET, 1000);
    assert!(verify(&syn[..20]));

    let good = reply_frame(TARGET, local, TcpFlags::SYN | TcpFlags::ACK, 4242, 1001);
    assert_eq!(
        match_reply(&good, &expected),
        MatchResult::Accepted { ack: 1001 }
    );

    let stale = reply_frame(TARGET, local, TcpFlags::SYN | TcpFlags::ACK, 4242, 1000);
    assert_eq!(match_reply(&stale, &expected), MatchResult::Unrelated);
}

#[test]
fn test_listening_peer_full_run() {
    let net = MockNetwork::listening();
    let config = test_config(4);
    let state = test_session(&config);

    run(&net, config, &state, CancellationToken::new()).unwrap();

    let session = state.read();
    let summary = session.summary();
    assert_eq!(summary.sent, 4);
    assert_eq!(summary.received, 4);
    assert_eq!(summary.loss_pct, 0.0);
    assert!(summary.min <= summary.avg && summary.avg <= summary.max);

    // Every probe: one SYN out, one RST answering its SYN-ACK
    let segments = net.sent_segments();
    assert_eq!(segments.len(), 8);
    for (pair, outcome) in segments.chunks(2).zip(session.outcomes()) {
        let (syn, rst) = (&pair[0], &pair[1]);
        assert_eq!(syn.flags, TcpFlags::SYN);
        assert_eq!(syn.destination, TARGET);
        assert_eq!(syn.source, SocketAddrV4::new(LOCAL_IP, outcome.src_port));
        assert_eq!(syn.seq, outcome.seq);
        assert_eq!(rst.flags, TcpFlags::RST);
        assert_eq!(rst.seq, syn.seq);
        assert_eq!(rst.ack, syn.seq.wrapping_add(1));
        assert_eq!(outcome.reply_len, Some(40));
    }
    assert_eq!(net.live_transports(), 0);
}

#[test]
fn test_syn_only_mode_sends_no_rst() {
    let net = MockNetwork::listening();
    let config = Config {
        mode: ProbeMode::Syn,
        ..test_config(3)
    };
    let state = test_session(&config);
    run(&net, config, &state, CancellationToken::new()).unwrap();

    assert_eq!(net.sent().len(), 3);
    assert!(
        net.sent_segments()
            .iter()
            .all(|s| s.flags == TcpFlags::SYN)
    );
}

#[test]
fn test_silent_peer_all_lost() {
    let net = MockNetwork::new();
    let config = test_config(3);
    let state = test_session(&config);
    run(&net, config, &state, CancellationToken::new()).unwrap();

    let text = summary_string(&state.read());
    assert!(text.contains("3 packets transmitted, 0 packets received, 100.00% packet loss"));
    assert!(text.contains("round-trip min/avg/max = 0.00/0.00/0.00 ms"));
}

#[test]
fn test_peer_answering_every_other_probe() {
    let net = MockNetwork::new();
    let mut answer = true;
    let mut inner = synping::probe::mock::syn_ack_responder();
    net.set_responder(move |frame| {
        let replies = if answer { inner(frame) } else { Vec::new() };
        answer = !answer;
        replies
    });

    let config = Config {
        mode: ProbeMode::Syn,
        ..test_config(4)
    };
    let state = test_session(&config);
    run(&net, config, &state, CancellationToken::new()).unwrap();

    let session = state.read();
    let matched: Vec<bool> = session.outcomes().iter().map(|o| o.matched()).collect();
    assert_eq!(matched, vec![true, false, true, false]);
    assert_eq!(session.summary().loss_pct, 50.0);
}

#[test]
fn test_unrelated_traffic_does_not_match() {
    let net = MockNetwork::new();
    // Replies with the wrong ack and from the wrong port only
    net.set_responder(|frame| {
        let seg = synping::probe::parse_segment(frame).unwrap();
        vec![
            reply_frame(
                seg.destination,
                seg.source,
                TcpFlags::SYN | TcpFlags::ACK,
                1,
                seg.seq,
            ),
            reply_frame(
                SocketAddrV4::new(*seg.destination.ip(), 8080),
                seg.source,
                TcpFlags::SYN | TcpFlags::ACK,
                1,
                seg.seq.wrapping_add(1),
            ),
        ]
    });

    let config = test_config(2);
    let state = test_session(&config);
    run(&net, config, &state, CancellationToken::new()).unwrap();
    assert_eq!(state.read().summary().received, 0);
}

#[test]
fn test_send_failure_reports_partial_statistics() {
    let net = MockNetwork::listening();
    net.fail_sends_after(2);
    let config = Config {
        mode: ProbeMode::Syn,
        ..test_config(5)
    };
    let state = test_session(&config);

    let err = run(&net, config, &state, CancellationToken::new()).unwrap_err();
    assert!(matches!(err, ProbeError::SendFailed { .. }));

    let text = summary_string(&state.read());
    assert!(text.contains("2 packets transmitted, 2 packets received, 0.00% packet loss"));
}

#[test]
fn test_cancellation_mid_run() {
    let net = MockNetwork::listening();
    let config = Config {
        count: None,
        interval: Duration::from_millis(10),
        ..test_config(0)
    };
    let state = test_session(&config);
    let cancel = CancellationToken::new();

    let stopper = cancel.clone();
    let timer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        stopper.cancel();
    });

    run(&net, config, &state, cancel).unwrap();
    timer.join().unwrap();

    let summary = state.read().summary();
    assert!(summary.sent >= 1);
    assert_eq!(summary.sent, summary.received);
}

#[test]
fn test_statistics_reference_values() {
    let mut agg = RttAggregator::new();
    for (index, rtt) in [Some(10), Some(20), Some(30), None, None].into_iter().enumerate() {
        agg.record(ProbeOutcome {
            index: index as u64,
            seq: index as u32,
            src_port: 50000 + index as u16,
            sent_at: Utc::now(),
            rtt: rtt.map(Duration::from_millis),
            reply_len: rtt.map(|_| 40),
        });
    }

    let summary = agg.summary();
    assert_eq!(summary.sent, 5);
    assert_eq!(summary.received, 3);
    assert!((summary.loss_pct - 40.0).abs() < 1e-9);
    assert_eq!(summary.min, Duration::from_millis(10));
    assert_eq!(summary.avg, Duration::from_millis(20));
    assert_eq!(summary.max, Duration::from_millis(30));
}

#[test]
fn test_json_export_after_run() {
    let net = MockNetwork::listening();
    let config = test_config(2);
    let state = test_session(&config);
    run(&net, config, &state, CancellationToken::new()).unwrap();

    let mut buf = Vec::new();
    export_json(&state.read(), &mut buf).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();

    assert_eq!(value["mode"], "syn-rst");
    assert_eq!(value["target"]["resolved"], "93.184.216.34");
    assert_eq!(value["stats"]["outcomes"].as_array().unwrap().len(), 2);
    assert_eq!(value["summary"]["received"], 2);
}
