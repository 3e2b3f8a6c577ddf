//! modelgridd — the ModelGrid daemon.
//!
//! # Usage
//!
//! ```text
//! modelgridd --config modelgrid.toml run --data-dir /var/lib/modelgrid
//! modelgridd --config modelgrid.toml deploy bert-small --category remote
//! modelgridd --config modelgrid.toml check-config
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use modelgrid_core::{Settings, SettingsHandle, fingerprint};
use modelgrid_deploy::{FsEngine, InferenceEngine};
use modelgrid_state::StateStore;
use modelgridd::{LocalCluster, logging};

#[derive(Parser)]
#[command(name = "modelgridd", about = "ModelGrid daemon")]
struct Cli {
    /// Settings file. Built-in defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the cluster until interrupted.
    Run {
        /// Data directory for persistent state.
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
    },

    /// Register an artifact from the model directory, deploy it and wait
    /// for the task to finish.
    Deploy {
        artifact_id: String,

        #[arg(long, default_value = "remote")]
        category: String,

        /// Explicit target node IDs, comma separated.
        #[arg(long, value_delimiter = ',')]
        targets: Vec<String>,

        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,

        /// Seconds to wait for the task to finish.
        #[arg(long, default_value = "60")]
        wait: u64,
    },

    /// Load the settings file and print the effective settings.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_json);

    let settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Command::Run { data_dir } => run(cli.config, settings, data_dir).await,
        Command::Deploy {
            artifact_id,
            category,
            targets,
            data_dir,
            wait,
        } => deploy(settings, data_dir, &artifact_id, &category, targets, wait).await,
        Command::CheckConfig => {
            print!("{}", settings.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    match path {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("failed to load settings from {}", path.display())),
        None => Ok(Settings::default()),
    }
}

fn open_cluster(settings: &SettingsHandle, data_dir: &Path) -> anyhow::Result<LocalCluster> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("modelgrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let model_dir = settings.current().engine.model_dir.clone();
    let cluster = LocalCluster::from_settings(store, settings.clone(), |_| {
        let engine: Arc<dyn InferenceEngine> = Arc::new(FsEngine::new(&model_dir));
        engine
    });
    info!(
        nodes = cluster.nodes().count(),
        leader = ?cluster.membership().leader(),
        model_dir = %model_dir.display(),
        "cluster assembled"
    );
    Ok(cluster)
}

async fn run(config: Option<PathBuf>, settings: Settings, data_dir: PathBuf) -> anyhow::Result<()> {
    info!("ModelGrid daemon starting");
    let settings = SettingsHandle::new(settings);
    let cluster = open_cluster(&settings, &data_dir)?;

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = cluster.start(shutdown_rx.clone());

    // Dead node reaper.
    let membership = cluster.membership().clone();
    let reap_every = settings.current().cluster.heartbeat_interval.max(Duration::from_secs(1));
    let mut reaper_shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reap_every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = membership.reap_dead_nodes();
                    if !reaped.is_empty() {
                        info!(count = reaped.len(), nodes = ?reaped, "reaped dead nodes");
                    }
                }
                _ = reaper_shutdown.changed() => break,
            }
        }
    }));

    // Settings reload on SIGHUP.
    #[cfg(unix)]
    let reloader = config
        .map(|path| spawn_reloader(path, settings.clone(), shutdown_rx.clone()))
        .transpose()?;
    #[cfg(not(unix))]
    let reloader: Option<tokio::task::JoinHandle<()>> = config.and(None);
    handles.extend(reloader);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    info!("ModelGrid daemon stopped");
    Ok(())
}

#[cfg(unix)]
fn spawn_reloader(
    path: PathBuf,
    settings: SettingsHandle,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hangup.recv() => match Settings::from_file(&path) {
                    Ok(next) => {
                        settings.update(next);
                        info!(path = %path.display(), "settings reloaded");
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "settings reload failed, keeping current"),
                },
                _ = shutdown.changed() => break,
            }
        }
    }))
}

async fn deploy(
    settings: Settings,
    data_dir: PathBuf,
    artifact_id: &str,
    category: &str,
    targets: Vec<String>,
    wait: u64,
) -> anyhow::Result<()> {
    let settings = SettingsHandle::new(settings);
    let cluster = open_cluster(&settings, &data_dir)?;

    let payload = FsEngine::new(&settings.current().engine.model_dir).payload_path(artifact_id);
    let fp = fingerprint::fingerprint_file(&payload)
        .with_context(|| format!("cannot read payload {}", payload.display()))?;
    cluster.register_artifact(artifact_id, category, &fp)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = cluster.start(shutdown_rx);

    let targets = (!targets.is_empty()).then_some(targets);
    let ack = cluster.deploy(artifact_id, targets).await?;
    info!(task_id = %ack.task_id, "deploy accepted");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
    let task = loop {
        let task = cluster.task_status(&ack.task_id)?;
        if task.state.is_done() || tokio::time::Instant::now() >= deadline {
            break task;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    };
    let artifact = cluster
        .store()
        .get_artifact(artifact_id)?
        .context("artifact disappeared")?;

    let summary = serde_json::json!({
        "task": serde_json::to_value(&task)?,
        "artifact": serde_json::to_value(&artifact)?,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}
