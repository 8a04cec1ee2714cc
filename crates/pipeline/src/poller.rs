//! Discovery of artifacts waiting in `work` and `source`.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior};
use tracerelay_stage::{ArtifactStore, Stage};

/// One artifact to drive, named as it appears in its stage directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub name: String,
    pub stage: Stage,
}

/// Result of listing both polled stages once.
#[derive(Debug, Default)]
pub struct Scan {
    /// Work items first, then source items, each sorted by name.
    pub items: Vec<WorkItem>,
    /// Stages that could not be listed this time.
    pub failed: Vec<Stage>,
}

/// Lists the non-terminal stages on a fixed interval.
#[derive(Clone)]
pub struct DirectoryPoller {
    store: Arc<dyn ArtifactStore>,
    interval: Duration,
}

impl DirectoryPoller {
    /// Stages polled, in order. Work first so interrupted artifacts resume
    /// before new ones are admitted.
    pub const POLLED: [Stage; 2] = [Stage::Work, Stage::Source];

    pub fn new(store: Arc<dyn ArtifactStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Ticker for the poll loop. A slow cycle delays the next tick instead
    /// of bunching ticks up.
    pub fn ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Lists work and source once. Listing errors are logged and reported in
    /// [`Scan::failed`]; the next scan tries again.
    pub async fn scan(&self) -> Scan {
        let store = Arc::clone(&self.store);
        let listed = tokio::task::spawn_blocking(move || {
            Self::POLLED.map(|stage| (stage, store.list(stage)))
        })
        .await;

        let mut scan = Scan::default();
        let listed = match listed {
            Ok(listed) => listed,
            Err(e) => {
                tracing::error!(error = %e, "directory listing task failed");
                scan.failed.extend(Self::POLLED);
                return scan;
            }
        };

        for (stage, result) in listed {
            match result {
                Ok(names) => scan
                    .items
                    .extend(names.into_iter().map(|name| WorkItem { name, stage })),
                Err(e) => {
                    tracing::warn!(%stage, error = %e, "failed to list stage directory, retrying next cycle");
                    scan.failed.push(stage);
                }
            }
        }
        tracing::trace!(items = scan.items.len(), "scan complete");
        scan
    }
}
