//! Subcommand runners.
//!
//! Wires the CLI onto the mesh library: a worker serves until signalled, a
//! dispatch runs one task and streams its output, `peers` lists the registry.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use buildmesh_net::peer::host;
use buildmesh_net::{
    describe_local, Client, DiscoveredPeer, DispatchOptions, LocalPeer, LocalProcess, MeshError,
    PeerFlags, PeerInfo, PeerMode, PeerRegistry, Worker, PROTOCOL_VERSION,
};

use crate::cli::{Cli, Command, DispatchArgs, PeersArgs, WorkerArgs};
use crate::config::NodeConfig;
use crate::shutdown::cancel_on_signal;

/// How often a dispatch re-scans the brokerage while waiting for a worker.
const WAIT_POLL: Duration = Duration::from_millis(250);

/// Run the subcommand selected on the command line.
pub async fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = NodeConfig::from_cli(cli);
    match &cli.command {
        Command::Worker(args) => run_worker(&config, args).await,
        Command::Dispatch(args) => run_dispatch(&config, args).await,
        Command::Peers(args) => run_peers(&config, args).await,
    }
}

/// Serve tasks until SIGINT or SIGTERM.
pub async fn run_worker(config: &NodeConfig, args: &WorkerArgs) -> anyhow::Result<()> {
    let app_key = config.load_app_key()?;
    let identity = config.load_identity()?;
    let mesh = config.worker_config(args);

    let info = describe_local(mesh.flags.clone(), &mesh.advertise_ips).await;
    if info.ips.is_empty() {
        bail!("no routable address found; pass --advertise-ip");
    }

    tracing::info!("buildmesh worker v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Protocol version: {}", PROTOCOL_VERSION);
    tracing::info!("  Brokerage: {}", mesh.brokerage_dir.display());
    tracing::info!("  Host: {} ({} threads)", info.fqdn(), info.hardware.threads);
    tracing::info!("  Mode: {}", info.flags.mode);

    let local = LocalPeer::new(identity, info);
    let worker = Worker::new(mesh, app_key, local).with_executor(Arc::new(LocalProcess::new()));
    let watcher = cancel_on_signal(worker.shutdown_handle());

    let result = worker.run().await;
    watcher.abort();
    result.context("worker stopped with an error")
}

/// Dispatch one task and stream its output to stdout.
pub async fn run_dispatch(config: &NodeConfig, args: &DispatchArgs) -> anyhow::Result<()> {
    let app_key = config.load_app_key()?;
    let identity = config.load_identity()?;

    let flags = PeerFlags {
        mode: PeerMode::Disabled,
        ..PeerFlags::default()
    };
    let local = LocalPeer::new(identity, PeerInfo::new(host::hostname().await, Vec::new(), flags));
    let client = Client::new(config.mesh_config(), app_key, local);

    let cancel = CancellationToken::new();
    let watcher = cancel_on_signal(cancel.clone());

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(anyhow::anyhow!("interrupted")),
        result = dispatch_once(&client, args) => result,
    };

    watcher.abort();
    if let Err(e) = client.close().await {
        tracing::debug!(error = %e, "Worker loop ended with an error");
    }
    result
}

async fn dispatch_once(client: &Client, args: &DispatchArgs) -> anyhow::Result<()> {
    client.start().await.context("discovering workers")?;

    let deadline = Instant::now() + Duration::from_secs(args.wait);
    while client.available_workers() == 0 {
        if Instant::now() >= deadline {
            bail!("no worker became available within {}s", args.wait);
        }
        sleep(WAIT_POLL).await;
        if let Err(e) = client.discover_workers().await {
            tracing::debug!(error = %e, "Discovery pass failed");
        }
    }

    let mut options = DispatchOptions::new()
        .with_working_dir(args.cwd.clone())
        .on_output(|chunk| {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(chunk.as_bytes());
            let _ = stdout.flush();
        })
        .on_file_access(|path, mode| {
            tracing::debug!(path = %path, mode = %mode, "File access");
        });
    for (key, value) in &args.env {
        options = options.with_env(key.clone(), value.clone());
    }

    match client
        .dispatch_task(args.executable.clone(), args.arguments.clone(), options)
        .await
    {
        Ok(outcome) => {
            tracing::info!(worker = %outcome.worker, addr = %outcome.addr, "Task succeeded");
            Ok(())
        }
        Err(MeshError::RemoteTask { addr, message }) => {
            bail!("task failed on {}: {}", addr, message)
        }
        Err(e) => Err(e).context("dispatch failed"),
    }
}

/// Discover and return every peer in the brokerage.
pub async fn list_peers(config: &NodeConfig) -> anyhow::Result<Vec<DiscoveredPeer>> {
    let registry = PeerRegistry::new(config.brokerage_dir.clone());
    registry.discover().await?;
    let mut peers = registry.peers().await;
    peers.sort_by(|a, b| a.info.host.cmp(&b.info.host));
    Ok(peers)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PeerRow<'a> {
    public_key: String,
    #[serde(flatten)]
    info: &'a PeerInfo,
}

async fn run_peers(config: &NodeConfig, args: &PeersArgs) -> anyhow::Result<()> {
    let peers = list_peers(config).await?;

    if args.json {
        let rows: Vec<PeerRow<'_>> = peers
            .iter()
            .map(|peer| PeerRow {
                public_key: peer.public_key.to_base64(),
                info: &peer.info,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("=== {} peer(s) in {} ===", peers.len(), config.brokerage_dir.display());
    for peer in &peers {
        let addrs: Vec<String> = peer.socket_addrs().iter().map(|a| a.to_string()).collect();
        println!(
            "{}  {:<24} {:<10} {:>3}t  {}",
            peer.public_key,
            peer.info.fqdn(),
            peer.info.flags.mode.to_string(),
            peer.info.hardware.threads,
            addrs.join(",")
        );
    }
    Ok(())
}
