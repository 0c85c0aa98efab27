use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Serves the V-Stack coordinator: video and chunk metadata, placement
/// consensus, node liveness, and redundancy policy.
#[derive(Debug, clap::Parser)]
struct Args {
    #[clap(flatten)]
    logging: cli_common::LogArgs,

    /// Port to listen on for HTTP requests.
    #[clap(long, env = "VSTACK_COORDINATOR_PORT", default_value = "8080")]
    port: u16,
    #[clap(long, env = "VSTACK_BIND_ADDR", default_value = "0.0.0.0")]
    bind_addr: std::net::IpAddr,

    /// Path of the SQLite metadata database.
    #[clap(long = "database", env = "VSTACK_DB_PATH", default_value = "./data/metadata.db")]
    db_path: std::path::PathBuf,

    /// View count separating hot (replicated) from cold (erasure-coded)
    /// videos.
    #[clap(long, env = "VSTACK_POPULARITY_THRESHOLD", default_value = "1000")]
    popularity_threshold: u64,

    /// Seconds without a heartbeat before a node is marked down.
    #[clap(long, env = "VSTACK_HEARTBEAT_TTL_SEC", default_value = "60")]
    heartbeat_ttl_sec: u64,
    /// Seconds between health monitor sweeps.
    #[clap(long, env = "VSTACK_PROBE_INTERVAL_SEC", default_value = "30")]
    probe_interval_sec: u64,

    /// Address rewrite applied to node URLs in outgoing manifests, as
    /// `internal=external`. May be given multiple times.
    #[clap(long = "rewrite", value_parser = parse_rewrite)]
    rewrites: Vec<(String, String)>,
}

fn parse_rewrite(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(internal, external)| (internal.to_string(), external.to_string()))
        .ok_or_else(|| format!("expected internal=external, got '{value}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    cli_common::init_logging(&args.logging);
    tracing::debug!(?args, "parsed arguments");

    if let Some(parent) = args.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("creating database directory")?;
        }
    }
    let store = Arc::new(metadata::Store::open(&args.db_path).context("opening metadata store")?);

    // One HTTP client, shared by consensus probes and the health monitor.
    let http = reqwest::Client::new();

    let app = coordinator::App::new(
        store.clone(),
        http.clone(),
        redundancy::Policy::new(redundancy::PolicyConfig {
            popularity_threshold: args.popularity_threshold,
            ..Default::default()
        }),
        consensus::ProposerConfig::default(),
        coordinator::Config {
            heartbeat_ttl: Duration::from_secs(args.heartbeat_ttl_sec),
            rewrites: args.rewrites.clone(),
            ..Default::default()
        },
    );

    let cancel = CancellationToken::new();
    let monitor = tokio::spawn(coordinator::monitor::run(
        store.clone(),
        http.clone(),
        coordinator::monitor::MonitorConfig {
            probe_interval: Duration::from_secs(args.probe_interval_sec),
            heartbeat_ttl: Duration::from_secs(args.heartbeat_ttl_sec),
            ..Default::default()
        },
        cancel.clone(),
    ));

    let shutdown_signal = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("caught shutdown signal, stopping coordinator"),
            Err(err) => tracing::error!(?err, "error subscribing to shutdown signal"),
        }
    };

    let listener = tokio::net::TcpListener::bind((args.bind_addr, args.port))
        .await
        .context("failed to bind coordinator port")?;
    tracing::info!(port = args.port, "coordinator listening");

    axum::serve(listener, coordinator::router(app))
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("HTTP server failed")?;

    // Stop the monitor after the server has drained.
    cancel.cancel();
    monitor.await.context("health monitor panicked")?;

    tracing::info!("coordinator shut down cleanly");
    Ok(())
}
