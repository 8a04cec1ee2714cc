//! Wires the pipeline components together and runs them.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracerelay_manifest::ManifestCache;
use tracerelay_mover::CollisionSafeMover;
use tracerelay_pipeline::{Orchestrator, TransferEvent};
use tracerelay_stage::FsStore;
use tracerelay_uplink::HttpUploader;

use crate::config::Config;

/// How the relay runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Poll until SIGINT/SIGTERM.
    Daemon,
    /// Drive a single cycle and print its report.
    Once,
}

/// Builds the orchestrator described by `config`, creating missing spool
/// directories.
pub fn build(config: &Config) -> anyhow::Result<Orchestrator> {
    let layout = config.stage_layout();
    layout
        .create_all()
        .context("failed to create spool directories")?;
    std::fs::create_dir_all(&config.directories.csv_dir).with_context(|| {
        format!(
            "failed to create manifest directory {}",
            config.directories.csv_dir.display()
        )
    })?;

    // Manifest records carry resolved paths.
    let source = std::fs::canonicalize(&layout.source).with_context(|| {
        format!("failed to resolve source directory {}", layout.source.display())
    })?;
    let manifest = Arc::new(ManifestCache::new(
        config.manifest_path(),
        source,
        config.parse_mode(),
    ));
    let mover = CollisionSafeMover::new(config.move_config());
    let store = Arc::new(FsStore::new(layout, mover));
    let uploader = Arc::new(
        HttpUploader::new(config.uploader_config()).context("failed to build HTTP uploader")?,
    );

    tracing::info!(
        endpoint = %uploader.url(),
        source = %config.directories.source_dir.display(),
        manifest = %config.manifest_path().display(),
        "pipeline configured"
    );

    Ok(Orchestrator::new(
        store,
        manifest,
        uploader,
        config.pipeline_config(),
    ))
}

/// Runs the relay until shutdown is requested (or once, in [`Mode::Once`]).
pub async fn run(config: Config, mode: Mode) -> anyhow::Result<()> {
    let mut orchestrator = build(&config)?;
    let cancel = CancellationToken::new();

    if let Some(events) = orchestrator.take_events() {
        tokio::spawn(log_events(events));
    }

    let signals = tokio::spawn(wait_for_shutdown(cancel.clone()));

    let result = match mode {
        Mode::Once => {
            let report = orchestrator.drive_cycle(&cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Mode::Daemon => {
            tracing::info!(
                poll_interval_secs = config.timing.poll_interval_secs,
                "relay running, press Ctrl+C to stop"
            );
            orchestrator.run(cancel.clone()).await.map_err(Into::into)
        }
    };

    signals.abort();

    let pending = orchestrator.delivered_unarchived();
    if !pending.is_empty() {
        tracing::warn!(
            count = pending.len(),
            artifacts = ?pending,
            "delivered artifacts left in work, they will be archived on the next start"
        );
    }
    result
}

async fn wait_for_shutdown(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl+C, shutting down"),
                    _ = term.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("received Ctrl+C, shutting down");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl+C, shutting down");
        }
    }

    cancel.cancel();
}

/// Drains the event channel into debug logs. Terminal outcomes are already
/// logged by the orchestrator.
async fn log_events(mut events: mpsc::Receiver<TransferEvent>) {
    while let Some(event) = events.recv().await {
        tracing::debug!(artifact = event.artifact(), event = ?event, "transfer event");
    }
}
