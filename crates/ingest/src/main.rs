use anyhow::Context;
use clap::Parser;

/// Ingests a video into a V-Stack cluster: segments the source, uploads
/// chunks to healthy storage nodes with redundancy, and commits each
/// placement through the coordinator.
#[derive(Debug, clap::Parser)]
struct Args {
    #[clap(flatten)]
    logging: cli_common::LogArgs,

    /// Video source file.
    file: std::path::PathBuf,

    /// Title of the video; defaults to the file name.
    #[clap(long)]
    title: Option<String>,

    /// Base URL of the coordinator.
    #[clap(long, env = "VSTACK_COORDINATOR_URL", default_value = "http://localhost:8080")]
    coordinator: String,

    /// Target chunk size, in bytes.
    #[clap(long, env = "VSTACK_CHUNK_SIZE", default_value = "2097152")]
    chunk_size_bytes: usize,
    /// Seconds of media per chunk.
    #[clap(long, env = "VSTACK_CHUNK_DURATION", default_value = "10")]
    chunk_duration_sec: i64,

    /// Full copies per chunk in replication mode.
    #[clap(long, env = "VSTACK_REPLICAS_PER_CHUNK", default_value = "3")]
    replicas: usize,
    /// Concurrent chunk uploads.
    #[clap(long, env = "VSTACK_MAX_CONCURRENT_UPLOADS", default_value = "5")]
    max_concurrent: usize,

    /// Force a redundancy mode ("replication" or "erasure_coding")
    /// instead of asking the coordinator.
    #[clap(long, value_parser = parse_mode)]
    redundancy: Option<models::RedundancyMode>,
}

fn parse_mode(value: &str) -> Result<models::RedundancyMode, String> {
    models::RedundancyMode::parse(value)
        .ok_or_else(|| format!("expected 'replication' or 'erasure_coding', got '{value}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    cli_common::init_logging(&args.logging);

    let title = args.title.clone().unwrap_or_else(|| {
        args.file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "untitled".to_string())
    });

    let mut cfg = ingest::IngestConfig::new(args.coordinator.clone());
    cfg.replicas_per_chunk = args.replicas;
    cfg.max_concurrent_uploads = args.max_concurrent;
    cfg.mode_override = args.redundancy;

    let worker = ingest::IngestWorker::new(reqwest::Client::new(), cfg)
        .context("building ingest worker")?;
    let mut segmenter =
        ingest::FileSegmenter::new(&args.file, args.chunk_size_bytes, args.chunk_duration_sec);

    let report = worker
        .ingest(&title, &mut segmenter)
        .await
        .context("ingest failed")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "video_id": report.video_id,
            "chunks": report.chunk_count,
            "redundancy_mode": report.mode,
            "total_chunks": report.manifest.total_chunks,
            "status": report.manifest.status,
        }))?
    );
    Ok(())
}
