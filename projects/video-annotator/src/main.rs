mod cli;
mod error;
mod pipeline;
mod run_context;
mod video;
mod web;

use anyhow::Result;
use cli::{Args, Command};
use indicatif::{ProgressBar, ProgressStyle};
use pipeline::orchestrator::{spawn_run, PipelineConfig};
use pipeline::types::RunOutcome;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use web::api::AppState;
use web::server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();
    let config = args.pipeline_config();

    match args.command {
        Command::Process { input } => {
            let outcome =
                tokio::task::spawn_blocking(move || process_with_progress(input, config)).await??;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if let RunOutcome::Failed { message, .. } = outcome {
                anyhow::bail!(message);
            }
        }
        Command::Serve {
            host,
            port,
            video_root,
        } => {
            let state = AppState {
                video_root,
                pipeline: config,
            };
            run_server(host, port, state).await?;
        }
    }

    Ok(())
}

/// Runs one video on a worker thread and mirrors its progress on the terminal.
fn process_with_progress(input: PathBuf, config: PipelineConfig) -> Result<RunOutcome> {
    let run_id = format!("cli-{}", chrono::Utc::now().timestamp_millis());
    let handle = spawn_run(run_id, input, config);

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec:.1.yellow} fps, {eta})")?
            .progress_chars("#>-"),
    );

    let outcome = loop {
        if let Some(outcome) = handle.wait_timeout(Duration::from_millis(200)) {
            break outcome;
        }
        pb.set_length(handle.state.total_frames.load(Ordering::Relaxed) as u64);
        pb.set_position(handle.state.frames_done.load(Ordering::Relaxed) as u64);
    };

    pb.set_position(handle.state.frames_done.load(Ordering::Relaxed) as u64);
    match &outcome {
        RunOutcome::Completed(summary) => pb.finish_with_message(format!(
            "{} frames -> {}",
            summary.frames_processed,
            summary.output.path.display()
        )),
        RunOutcome::Failed { .. } => pb.abandon(),
    }

    Ok(outcome)
}
