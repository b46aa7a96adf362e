use std::{future::Future, path::Path, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    transport::Transport, BackendRoutes, HttpBackend, RunStatus, TrainingController,
    WizardBackend, WizardController, WizardEvent,
};
use shared::domain::{LogEntry, LogKind, SegmentParameters, DEFAULT_SAVE_FILENAME};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "wizard", about = "Upload, validate, process, and run against the ML backend")]
struct Args {
    /// Base url of the backend or of the proxy's `/api` prefix.
    #[arg(long, default_value = "http://127.0.0.1:3000/api")]
    server_url: String,
    /// Use the proxy's `test_csv/*` route aliases.
    #[arg(long)]
    proxied: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report whether the server-held session can start a run.
    Session,
    /// Upload a file, prepare segments, and stream the test results.
    Test(TestArgs),
    /// Stream a training run for the current session.
    Train,
}

#[derive(clap::Args, Debug)]
struct TestArgs {
    /// Raw sensor CSV; goes through validation and processing.
    #[arg(long, conflicts_with = "npy", required_unless_present = "npy")]
    csv: Option<PathBuf>,
    /// Pre-segmented dataset; the run starts right after the upload.
    #[arg(long)]
    npy: Option<PathBuf>,
    #[arg(long, default_value_t = 0.0)]
    trim: f64,
    /// Defaults to the upload's suggestion (at most 5).
    #[arg(long)]
    segments: Option<u32>,
    #[arg(long, default_value = DEFAULT_SAVE_FILENAME)]
    save: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let routes = if args.proxied {
        BackendRoutes::proxied()
    } else {
        BackendRoutes::direct()
    };
    let transport = Transport::new(&args.server_url)?;
    let backend: Arc<dyn WizardBackend> = Arc::new(HttpBackend::new(transport, routes));

    match args.command {
        Command::Session => check_session(backend).await,
        Command::Test(test) => run_test(backend, test).await,
        Command::Train => run_training(backend).await,
    }
}

async fn check_session(backend: Arc<dyn WizardBackend>) -> Result<()> {
    let readiness = WizardController::new(backend).mount().await;
    println!("{}", readiness.describe());
    if !readiness.is_ready() {
        bail!("session is not ready");
    }
    Ok(())
}

async fn run_test(backend: Arc<dyn WizardBackend>, args: TestArgs) -> Result<()> {
    let controller = WizardController::new(backend);
    let mut events = controller.subscribe_events();
    let session = controller.mount().await;
    info!(session = %session.describe(), "cli: session checked");

    if let Some(path) = &args.npy {
        let (filename, bytes) = read_upload(path).await?;
        let total = controller.upload_dataset(&filename, bytes).await?;
        println!("dataset uploaded: {total} samples");
    } else if let Some(path) = &args.csv {
        let (filename, bytes) = read_upload(path).await?;
        let file = controller.upload_csv(&filename, bytes).await?;
        println!(
            "uploaded {}: shape {:?}, {:.1}s, up to {} segments",
            file.filename, file.data_shape, file.duration_seconds, file.max_possible_segments
        );

        let suggested = controller.snapshot().await.parameters().y_segments;
        controller
            .set_parameters(SegmentParameters {
                trim_seconds: args.trim,
                y_segments: args.segments.unwrap_or(suggested),
            })
            .await?;
        let validation = controller.validate().await?;
        println!(
            "validated: {} of {} available segments after trimming {}s",
            validation.final_segments, validation.available_segments, validation.trim_seconds
        );
        if !validation.will_use_all_segments {
            warn!(
                requested = validation.y_segments,
                used = validation.final_segments,
                "cli: fewer segments than requested will be used"
            );
        }
        controller.set_save_filename(&args.save).await?;

        let processed = controller.process().await?;
        println!(
            "created {} segments{}",
            processed.segments_created,
            processed
                .save_path
                .as_deref()
                .map(|path| format!(" at {path}"))
                .unwrap_or_default()
        );
    }

    controller.start_run().await?;
    let stopper = Arc::clone(&controller);
    let status = follow_run(&mut events, move || async move { stopper.stop_run().await }).await?;
    finish(status)
}

async fn run_training(backend: Arc<dyn WizardBackend>) -> Result<()> {
    let controller = TrainingController::new(backend);
    let mut events = controller.subscribe_events();
    controller.start().await?;
    let stopper = Arc::clone(&controller);
    let status = follow_run(&mut events, move || async move { stopper.stop().await }).await?;
    finish(status)
}

async fn read_upload(path: &Path) -> Result<(String, Vec<u8>)> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?
        .to_string();
    Ok((filename, bytes))
}

/// Prints log entries until the run settles. Ctrl-C stops the run once.
async fn follow_run<F, Fut>(
    events: &mut broadcast::Receiver<WizardEvent>,
    stop: F,
) -> Result<RunStatus>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = bool>,
{
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stop = Some(stop);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(WizardEvent::LogAppended(entry)) => print_entry(&entry),
                Ok(WizardEvent::RunFinished(status)) => return Ok(status),
                Ok(WizardEvent::Status(status)) => info!(%status, "cli: status"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "cli: log output fell behind"),
                Err(RecvError::Closed) => bail!("controller went away before the run finished"),
            },
            _ = &mut ctrl_c, if stop.is_some() => {
                if let Some(stop) = stop.take() {
                    info!("cli: stopping run");
                    stop().await;
                }
            }
        }
    }
}

fn print_entry(entry: &LogEntry) {
    let time = entry.received_at.format("%H:%M:%S");
    match entry.kind {
        LogKind::Line => println!("[{time}] {}", entry.text),
        LogKind::Completed => println!("[{time}] done: {}", entry.text),
        LogKind::Error => eprintln!("[{time}] error: {}", entry.text),
        LogKind::Stopped => println!("[{time}] {}", entry.text),
    }
}

fn finish(status: RunStatus) -> Result<()> {
    match status {
        RunStatus::Completed | RunStatus::Stopped => Ok(()),
        other => bail!("run ended with status {other:?}"),
    }
}
