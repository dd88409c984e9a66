//! ndpresponder daemon
//!
//! Startup order: configuration, sockets, Docker connection, gateway
//! resolution, the Docker event subscription and initial refresh, then the
//! capture and responder tasks until SIGINT or SIGTERM.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-12: Audit Record Generation - Log daemon lifecycle
//! - CM-6: Configuration Settings - Invalid configuration exits with status 1

use anyhow::Context;
use clap::Parser;
use ndpresponder::config::{self, Args, Config};
use ndpresponder::{
    CaptureSocket, DockerSource, DynamicMembership, DynamicSourceWatcher, FrameSender,
    GatewayResolver, HostInfo, NetlinkNeighborTable, ResponderLoop, spawn_capture,
};
use std::process::ExitCode;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let level = match config::log_level_from_env() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("ndpresponder: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_logging(level) {
        eprintln!("ndpresponder: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => {
            info!("ndpresponder: Exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let msg = format!("{e:#}");
            error!(error = %msg, "ndpresponder: Exiting with error");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: Level) -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set logger")
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::from_args(&args).context("Invalid configuration")?;
    let iface = &config.interface;
    info!(
        ifname = %iface.name,
        ifindex = iface.index,
        mac = %iface.mac,
        subnets = %config.static_targets,
        docker_networks = ?config.docker_networks,
        "ndpresponder: Starting"
    );

    let cancel = shutdown_token()?;

    let capture = CaptureSocket::open(iface.index).context("Failed to open capture socket")?;
    let sender = FrameSender::open(iface.index).context("Failed to open send socket")?;

    let membership = DynamicMembership::new();
    let active = membership.active();
    let notifications = membership.notifications();
    let watcher = if config.docker_networks.is_empty() {
        None
    } else {
        let source = DockerSource::connect()
            .await
            .context("Failed to connect to Docker")?;
        Some(DynamicSourceWatcher::new(
            source,
            config.docker_networks.clone(),
            membership,
        ))
    };

    let host = match config.gateway {
        None => HostInfo {
            host_mac: iface.mac,
            gateway: None,
        },
        Some(settings) => {
            let resolver = GatewayResolver::new(iface.mac, settings.wait, settings.retry_interval);
            match NetlinkNeighborTable::new(&iface.name, iface.index) {
                Ok(table) => tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("ndpresponder: Shutdown during gateway resolution");
                        return Ok(());
                    }
                    res = resolver.resolve(&table) => res.host,
                },
                Err(e) => {
                    warn!(error = %e, "Neighbor table unavailable, continuing without gateway");
                    HostInfo {
                        host_mac: iface.mac,
                        gateway: None,
                    }
                }
            }
        }
    };

    let watcher_task = match watcher {
        Some(watcher) => Some(
            watcher
                .spawn(cancel.clone())
                .await
                .context("Failed to subscribe to Docker events")?,
        ),
        None => None,
    };

    let (ns_tx, ns_rx) = mpsc::channel(1);
    let capture_task = spawn_capture(capture, ns_tx, cancel.clone());

    let responder = ResponderLoop::new(host, config.static_targets.clone(), active, sender);
    responder.run(ns_rx, notifications, cancel.clone()).await;

    cancel.cancel();
    if let Err(e) = capture_task.await {
        warn!(error = %e, "Capture task failed");
    }
    if let Some(task) = watcher_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Watcher task failed");
        }
    }
    Ok(())
}

/// Token cancelled on SIGINT or SIGTERM
fn shutdown_token() -> anyhow::Result<CancellationToken> {
    let cancel = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("ndpresponder: Received SIGINT"),
            _ = sigterm.recv() => info!("ndpresponder: Received SIGTERM"),
        }
        token.cancel();
    });

    Ok(cancel)
}
