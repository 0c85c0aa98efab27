use anyhow::Context;
use clap::Parser;
use std::time::Duration;

/// Streams a video from a V-Stack cluster: fetches the manifest, ranks
/// storage nodes continuously, and plays chunks back in order at playback
/// rate.
#[derive(Debug, clap::Parser)]
struct Args {
    #[clap(flatten)]
    logging: cli_common::LogArgs,

    /// The video to stream.
    video_id: String,

    /// Base URL of the coordinator.
    #[clap(long, env = "VSTACK_COORDINATOR_URL", default_value = "http://localhost:8080")]
    coordinator: String,

    /// Concurrent chunk downloads.
    #[clap(long, env = "VSTACK_MAX_CONCURRENT_DOWNLOADS", default_value = "4")]
    max_concurrent: usize,
    /// Steady-state buffer level, in seconds of content.
    #[clap(long, env = "VSTACK_TARGET_BUFFER_SEC", default_value = "30")]
    target_buffer_sec: f64,
    /// Buffer level that triggers refills.
    #[clap(long, env = "VSTACK_LOW_WATER_MARK_SEC", default_value = "15")]
    low_water_mark_sec: f64,
    /// Buffer level required before playback starts.
    #[clap(long, env = "VSTACK_START_PLAYBACK_SEC", default_value = "10")]
    start_playback_sec: f64,

    /// Play as fast as chunks arrive instead of at playback rate.
    #[clap(long)]
    no_pacing: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    cli_common::init_logging(&args.logging);

    let mut cfg = stream_client::SessionConfig::new(args.coordinator.clone());
    cfg.scheduler.max_concurrent = args.max_concurrent;
    cfg.buffer.target_buffer_secs = args.target_buffer_sec;
    cfg.buffer.low_water_mark_secs = args.low_water_mark_sec;
    cfg.buffer.start_playback_secs = args.start_playback_sec;

    let http = reqwest::Client::new();
    let session = stream_client::Session::start(http, cfg, &args.video_id)
        .await
        .context("failed to start streaming session")?;
    let chunk_duration = Duration::from_secs(session.manifest().chunk_duration_sec as u64);

    loop {
        let chunk = tokio::select! {
            chunk = session.next_chunk() => chunk,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, stopping playback");
                break;
            }
        };
        let Some(chunk) = chunk else {
            tracing::info!("reached end of video");
            break;
        };

        let status = session.buffer().status();
        tracing::info!(
            chunk_id = chunk.chunk_id,
            sequence_num = chunk.sequence_num,
            bytes = chunk.bytes.len(),
            buffer_level_secs = status.level_secs,
            buffer_state = status.state,
            "playing chunk"
        );

        // Consume at playback rate.
        if !args.no_pacing {
            tokio::time::sleep(chunk_duration).await;
        }
    }

    let stats = session.stats();
    session.stop().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
