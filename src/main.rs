use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::RwLock;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, ToSocketAddrs};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use synping::cli::Args;
use synping::config::{Config, ProbeMode};
use synping::error::ProbeError;
use synping::export::{export_json, format_banner, format_outcome, write_summary};
use synping::probe::{RawSocketFactory, Source, check_permissions, select_source};
use synping::state::{Session, Target};
use synping::trace::{ConnectProbe, HalfOpenProbe, ProbeEngine, ProbeStrategy, spawn_engine};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries probe lines and the summary
    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    let config = Config::from(&args);

    // Privileges are settled before anything touches the network
    let mode = match config.mode.settle(config.rst, check_permissions) {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let target_ip = resolve_target(&args.target)
        .with_context(|| format!("Failed to resolve target: {}", args.target))?;

    let source = match select_source(target_ip, config.interface.as_deref(), config.source_ip) {
        Ok(source) => source,
        // The OS stack can pick its own source for connect probes
        Err(e) if mode == ProbeMode::Connect => {
            debug!(error = %e, "no source address selected, leaving it to the OS");
            Source {
                ip: Ipv4Addr::UNSPECIFIED,
                interface: None,
            }
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    let target = Target::new(args.target.clone(), target_ip, config.port);
    let mut session = Session::new(target, config.clone());
    session.mode = mode;
    session.source_ip = Some(source.ip);
    session.interface = source.interface.clone();

    if !args.json {
        println!("{}", format_banner(&session));
    }

    let state = Arc::new(RwLock::new(session));

    // Cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel_clone.cancel();
    });

    let destination = SocketAddrV4::new(target_ip, config.port);
    let handle = match mode {
        ProbeMode::Syn | ProbeMode::SynRst => {
            let factory = RawSocketFactory {
                header_included: true,
                interface: config.interface.clone(),
            };
            let strategy = HalfOpenProbe::new(factory, mode == ProbeMode::SynRst);
            start_engine(strategy, &config, destination, source.ip, &state, &cancel, args.json)
        }
        ProbeMode::Connect | ProbeMode::Auto => start_engine(
            ConnectProbe,
            &config,
            destination,
            source.ip,
            &state,
            &cancel,
            args.json,
        ),
    };

    let result = tokio::task::spawn_blocking(move || handle.join())
        .await
        .context("Probe engine task failed")?
        .map_err(|_| anyhow::anyhow!("Probe engine panicked"))?;

    if let Err(ref e) = result {
        state.write().error = Some(e.to_string());
    }

    let session = state.read();
    let print_stats = match &result {
        Ok(()) => true,
        Err(e) => !e.is_setup() || !session.outcomes().is_empty(),
    };

    if print_stats {
        let stdout = std::io::stdout();
        if args.json {
            export_json(&session, stdout.lock())?;
        } else {
            write_summary(&session, stdout.lock())?;
        }
    }

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Spawn the engine with a per-outcome printer
fn start_engine<S>(
    strategy: S,
    config: &Config,
    destination: SocketAddrV4,
    source_ip: Ipv4Addr,
    state: &Arc<RwLock<Session>>,
    cancel: &CancellationToken,
    quiet: bool,
) -> std::thread::JoinHandle<Result<(), ProbeError>>
where
    S: ProbeStrategy + 'static,
{
    let engine = ProbeEngine::new(
        config.clone(),
        destination,
        source_ip,
        strategy,
        StdRng::from_entropy(),
        state.clone(),
        cancel.clone(),
    );

    let printer_state = state.clone();
    spawn_engine(engine, move |outcome| {
        if quiet {
            return;
        }
        let line = format_outcome(&printer_state.read(), outcome);
        let mut stdout = std::io::stdout().lock();
        // A closed stdout must not abort the run
        let _ = writeln!(stdout, "{}", line);
        let _ = stdout.flush();
    })
}

fn resolve_target(target: &str) -> Result<Ipv4Addr> {
    // Try parsing as IP address first
    if let Ok(ip) = target.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => Ok(v4),
            IpAddr::V6(_) => Err(ProbeError::NotIpv4(ip).into()),
        };
    }

    // Resolve hostname, keeping the first IPv4 answer
    let addrs: Vec<_> = format!("{}:0", target)
        .to_socket_addrs()?
        .map(|s| s.ip())
        .collect();

    if addrs.is_empty() {
        anyhow::bail!("No addresses found for hostname");
    }

    addrs
        .iter()
        .find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| anyhow::anyhow!("No IPv4 addresses found"))
}
