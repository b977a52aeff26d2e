//! CLI entry point (spec.md §6, §9 "Graceful shutdown").
//!
//! Three subcommands, matching the teacher's `main.rs` shape
//! (`clap::Parser`/`Subcommand`) generalized from its single `run` command:
//! `run` spawns both the periodic jobs and the transport server, `serve`
//! runs the transport server alone (a receive-only peer with no local
//! schedule), `status` queries live dataset/snapshot state under the
//! configured parent dataset and prints a summary table without starting
//! any job -- the same live-state-over-stored-state choice the teacher's
//! own `status.rs` makes (it calls `configured_datasets()` rather than
//! reading back anything a running instance wrote down).

use std::path::PathBuf;
use std::sync::Arc;

use byte_unit::Byte;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Context, Result};
use humantime::format_duration;
use itertools::Itertools;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use zrepd::config::Config;
use zrepd::events::TracingEventSink;
use zrepd::runner::{spawn_jobs, Runner};
use zrepd::transport::{router, AppState};
use zrepd::zfs::{PropertyName, SubprocessZfsWrapper, ZfsWrapper};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path.
    #[arg(long, short = 'c', default_value = "/etc/zrepd/config.toml", global = true)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the periodic jobs and the HTTP transport server together.
    Run,
    /// Run only the HTTP transport server, for a receive-only peer.
    Serve,
    /// Print a summary of configured datasets and their snapshots, then exit.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let contents = tokio::fs::read_to_string(&args.config)
        .await
        .wrap_err_with(|| format!("reading config file {}", args.config.display()))?;
    let config = Config::try_from(contents.as_str()).wrap_err("invalid config")?;

    match args.command {
        Commands::Run => run(config).await,
        Commands::Serve => serve(config).await,
        Commands::Status => status(config).await,
    }
}

async fn run(config: Config) -> Result<()> {
    let listen_address = config.listen_address.clone();
    let zfs = Arc::new(SubprocessZfsWrapper::new());
    let runner = Runner::new(config, zfs, Arc::new(TracingEventSink));

    let cancel = CancellationToken::new();
    let (mut handles, _send_tx) = spawn_jobs(Arc::clone(&runner), cancel.clone());

    let state = AppState::new(runner.config.clone(), Arc::clone(&runner.zfs), Arc::clone(&runner.events));
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&listen_address)
        .await
        .wrap_err_with(|| format!("binding {listen_address}"))?;
    let server_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_cancel.cancelled().await;
        });
        if let Err(err) = server.await {
            tracing::error!(%err, "transport server exited with an error");
        }
    }));

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    for handle in handles {
        handle.await.wrap_err("job task panicked")?;
    }
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let listen_address = config.listen_address.clone();
    let zfs = Arc::new(SubprocessZfsWrapper::new());
    let state = AppState::new(config, zfs, Arc::new(TracingEventSink));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&listen_address)
        .await
        .wrap_err_with(|| format!("binding {listen_address}"))?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .wrap_err("transport server exited with an error")
}

async fn status(config: Config) -> Result<()> {
    let send_to_prop = PropertyName::SendTo.qualified(&config.property_namespace);
    let zfs = SubprocessZfsWrapper::new();
    let datasets = zfs
        .list_with_property(&config.parent_dataset, &send_to_prop)
        .await
        .wrap_err("listing configured datasets")?;

    if datasets.is_empty() {
        println!("no datasets configured for replication under {}", config.parent_dataset);
        return Ok(());
    }

    for dataset in datasets.into_iter().sorted_by(|a, b| a.name().cmp(b.name())) {
        let send_to = zfs
            .get_property(dataset.name(), &send_to_prop)
            .await?
            .unwrap_or_default();
        let mut snapshots = zfs.list_snapshots(dataset.name()).await?;
        snapshots.sort();

        let used: u64 = snapshots.iter().map(|s| s.used_bytes).sum();
        let newest_age = snapshots
            .last()
            .map(|s| (chrono::Utc::now() - s.created).to_std().unwrap_or_default())
            .map(|d| format_duration(d).to_string())
            .unwrap_or_else(|| "never".to_string());

        println!(
            "{} -> {}: {} snapshots, {} referenced, newest {} ago",
            dataset.name(),
            send_to,
            snapshots.len(),
            Byte::from_bytes(used as u128).get_appropriate_unit(true),
            newest_age,
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
    }
}
