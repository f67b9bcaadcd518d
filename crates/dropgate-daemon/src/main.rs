//! Dropgate daemon: watches a drop directory and runs every new file
//! through the intake pipeline: readiness wait, malware scan, bounded
//! archive expansion, dedup, and placement into the organized tree.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use notify::{RecursiveMode, Watcher};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use dropgate_core::config::IntakeConfig;
use dropgate_core::models::{EventKind, FileEvent};
use dropgate_pipeline::Coordinator;

#[derive(Parser)]
#[command(name = "dropgate", about = "Secure file intake daemon")]
struct Cli {
    /// Put all working directories under this root instead of reading
    /// DROPGATE_* environment variables.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Process files already present in the watch directory, then exit
    /// without watching for new ones.
    #[arg(long)]
    sweep_only: bool,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match cli.root {
        Some(root) => IntakeConfig::rooted_at(root),
        None => IntakeConfig::from_env()?,
    };

    tokio::fs::create_dir_all(&config.watch_dir)
        .await
        .with_context(|| format!("failed to create {}", config.watch_dir.display()))?;

    let watch_dir = config.watch_dir.clone();
    let max_workers = config.max_workers;
    let coordinator = Coordinator::from_config(config).await?;

    tracing::info!(
        watch = %watch_dir.display(),
        workers = max_workers,
        "Dropgate starting"
    );

    let workers = Arc::new(Semaphore::new(max_workers));
    let mut inflight = JoinSet::new();

    sweep(&coordinator, &watch_dir, &workers, &mut inflight)?;

    if cli.sweep_only {
        while inflight.join_next().await.is_some() {}
        coordinator.save_dedup_seed()?;
        tracing::info!("Sweep complete");
        return Ok(());
    }

    // notify delivers on its own thread; forward into the async world over
    // an unbounded channel (sends never block the watcher thread).
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(
        move |result: Result<notify::Event, notify::Error>| match result {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => tracing::error!(error = %e, "Watcher error"),
        },
    )?;
    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", watch_dir.display()))?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            maybe_event = rx.recv() => {
                let Some(event) = maybe_event else { break };
                // Reap finished intakes so the join set stays small.
                while inflight.try_join_next().is_some() {}
                let Some(kind) = intake_kind(&event.kind) else { continue };
                for path in event.paths {
                    dispatch(&coordinator, &workers, &mut inflight, FileEvent::new(path, kind));
                }
            }
        }
    }

    drop(watcher);
    while inflight.join_next().await.is_some() {}
    coordinator.save_dedup_seed()?;
    tracing::info!("Dropgate stopped");
    Ok(())
}

/// Map a raw notification to an intake event kind. Removals, metadata-only
/// changes, and access events carry no new content and are dropped here.
fn intake_kind(kind: &notify::EventKind) -> Option<EventKind> {
    match kind {
        notify::EventKind::Create(_) => Some(EventKind::Created),
        notify::EventKind::Modify(_) => Some(EventKind::Modified),
        _ => None,
    }
}

fn dispatch(
    coordinator: &Coordinator,
    workers: &Arc<Semaphore>,
    inflight: &mut JoinSet<()>,
    event: FileEvent,
) {
    let coordinator = coordinator.clone();
    let workers = Arc::clone(workers);
    inflight.spawn(async move {
        let Ok(_permit) = workers.acquire_owned().await else {
            return;
        };
        let path = event.path.clone();
        let outcome = coordinator.submit(event).await;
        tracing::debug!(
            path = %path.display(),
            outcome = outcome.label(),
            "Intake finished"
        );
    });
}

/// Queue everything already sitting in the watch directory. Files dropped
/// while the daemon was down get processed exactly like live events.
fn sweep(
    coordinator: &Coordinator,
    watch_dir: &std::path::Path,
    workers: &Arc<Semaphore>,
    inflight: &mut JoinSet<()>,
) -> anyhow::Result<()> {
    let entries = std::fs::read_dir(watch_dir)
        .with_context(|| format!("failed to read {}", watch_dir.display()))?;
    let mut queued = 0usize;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        dispatch(
            coordinator,
            workers,
            inflight,
            FileEvent::new(path, EventKind::Created),
        );
        queued += 1;
    }
    if queued > 0 {
        tracing::info!(count = queued, "Queued pre-existing files");
    }
    Ok(())
}
