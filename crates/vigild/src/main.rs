use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use vigil_core::{Config, OnnxEmbedder};
use vigil_store::Store;

mod notify;
mod pipeline;
mod recorder;
mod snapshot;
mod status;
mod supervisor;

use notify::{Notifier, NotifierHandle};
use pipeline::{Pipeline, PipelineSettings};
use recorder::{Recorder, RetryPolicy};
use status::HealthReporter;
use supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "vigild", about = "Vigil entrance face recognition daemon")]
struct Args {
    /// Configuration file (default: $VIGIL_CONFIG or /etc/vigil/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    tracing::info!(
        source = %config.dvr.redacted_uri(),
        data_dir = %config.storage.data_dir.display(),
        "vigild starting"
    );

    let db_path = config.storage.db_path();
    let events_store = Store::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    let registry_store = Store::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    let scrfd = config.models.scrfd_model_path();
    let arcface = config.models.arcface_model_path();
    let embedder = OnnxEmbedder::load(
        &scrfd,
        &arcface,
        config.recognition.min_detection_confidence,
        config.recognition.min_face_size,
    )
    .with_context(|| format!("failed to load models from {}", config.models.model_dir.display()))?;
    tracing::info!(scrfd = %scrfd, arcface = %arcface, "models loaded");

    let recorder = Recorder::spawn(events_store, RetryPolicy::default())
        .context("failed to start recorder thread")?;

    let notifier = if config.notifications.enabled {
        let sinks = notify::sinks_from_config(
            &config.notifications,
            config.storage.feed_path(),
            tokio::runtime::Handle::current(),
        );
        Some(
            Notifier::spawn(sinks, config.notifications.queue_capacity)
                .context("failed to start notifier thread")?,
        )
    } else {
        tracing::info!("notifications disabled");
        None
    };
    let notifier_handle = notifier
        .as_ref()
        .map(Notifier::handle)
        .unwrap_or_else(NotifierHandle::disabled);

    let (health, health_rx) = HealthReporter::new(config.dvr.redacted_uri());
    let status_writer = tokio::spawn(status::run_status_writer(
        health_rx,
        config.storage.status_path(),
    ));

    let summary = health.clone();
    let mut pipeline = Pipeline::new(
        Box::new(embedder),
        Box::new(registry_store),
        PipelineSettings::from_config(&config),
        recorder.handle(),
        notifier_handle,
        health,
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let supervisor = Supervisor::from_config(&config);
    let dvr = config.dvr.clone();
    let mut worker = tokio::task::spawn_blocking(move || {
        let result = supervisor.run(&mut pipeline, || vigil_stream::connector_for(&dvr), stop_rx);
        drop(pipeline);
        result
    });

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tracing::info!("vigild ready");

    let outcome = tokio::select! {
        joined = &mut worker => joined,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            let _ = stop_tx.send(true);
            worker.await
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received, shutting down");
            let _ = stop_tx.send(true);
            worker.await
        }
    };

    // The pipeline dropped its handles when the worker finished.
    tokio::task::spawn_blocking(move || {
        recorder.shutdown();
        if let Some(notifier) = notifier {
            notifier.shutdown();
        }
    })
    .await
    .context("shutdown task failed")?;

    let last = summary.current();
    tracing::info!(
        frames_read = last.frames_read,
        visits = last.visits,
        unknowns = last.unknowns,
        restarts = last.restarts,
        "session summary"
    );
    drop(summary);

    if status_writer.await.is_err() {
        tracing::warn!("status writer task failed");
    }

    match outcome.context("pipeline thread panicked")? {
        Ok(()) => {
            tracing::info!("vigild stopped");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "pipeline gave up");
            Err(e).context("video stream failed")
        }
    }
}
