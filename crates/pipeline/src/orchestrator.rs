//! Transfer orchestrator.
//!
//! Each poll cycle lists `work` and `source` and spawns one task per
//! artifact. A task drives its artifact through
//! stage -> verify -> upload -> archive, diverting to the dead letter or
//! failed move stage as needed. Progress is reported through `tracing` and,
//! best effort, through the [`TransferEvent`] channel.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{RwLock, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracerelay_manifest::{ManifestCache, ManifestError, RefreshOutcome, sha256_file, sha256_hex};
use tracerelay_mover::MoveError;
use tracerelay_stage::{ArtifactContent, ArtifactStore, MoveReceipt, Stage};
use tracerelay_uplink::{UploadBody, UploadOutcome, UploadRequest, Uploader};
use tracing::{debug, error, info, warn};

use crate::artifact::{Artifact, ArtifactState};
use crate::config::{MissingHashPolicy, PipelineConfig};
use crate::error::PipelineError;
use crate::events::{DeadLetterReason, TerminalOutcome, TransferEvent};
use crate::poller::{DirectoryPoller, WorkItem};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How one artifact's run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactResult {
    /// Reached a terminal stage.
    Finished(TerminalOutcome),
    /// Waiting in work for its manifest entry.
    Deferred,
    /// Shutdown stopped it before the next step; it resumes from its stage.
    Interrupted,
    /// Could not be placed anywhere; retried next cycle.
    Stranded { reason: String },
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// Artifacts dispatched this cycle.
    pub dispatched: usize,
    /// Listed artifacts skipped because a task already owns them.
    pub skipped_in_flight: usize,
    pub done: Vec<String>,
    pub dead_lettered: Vec<String>,
    pub failed_move: Vec<String>,
    pub deferred: Vec<String>,
    pub stranded: Vec<String>,
    pub interrupted: Vec<String>,
    /// Stages whose listing failed.
    pub list_failures: Vec<Stage>,
}

impl CycleReport {
    fn record(&mut self, name: String, result: ArtifactResult) {
        let bucket = match result {
            ArtifactResult::Finished(TerminalOutcome::Done) => &mut self.done,
            ArtifactResult::Finished(TerminalOutcome::DeadLettered { .. }) => {
                &mut self.dead_lettered
            }
            ArtifactResult::Finished(TerminalOutcome::FailedMove { .. }) => &mut self.failed_move,
            ArtifactResult::Deferred => &mut self.deferred,
            ArtifactResult::Stranded { .. } => &mut self.stranded,
            ArtifactResult::Interrupted => &mut self.interrupted,
        };
        bucket.push(name);
    }

    /// Artifacts that reached a terminal stage.
    pub fn finished(&self) -> usize {
        self.done.len() + self.dead_lettered.len() + self.failed_move.len()
    }
}

type Claims = Arc<Mutex<HashSet<(Stage, String)>>>;

/// Exclusive ownership of one stage entry by one task.
struct Claim {
    claims: Claims,
    key: (Stage, String),
}

impl Claim {
    fn acquire(claims: &Claims, stage: Stage, name: &str) -> Option<Self> {
        let key = (stage, name.to_string());
        let mut set = claims.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(key.clone()) {
            return None;
        }
        Some(Self {
            claims: Arc::clone(claims),
            key,
        })
    }

    /// Follows the artifact to its new stage entry.
    fn rekey(&mut self, stage: Stage, name: &str) {
        let key = (stage, name.to_string());
        let mut set = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        set.remove(&self.key);
        set.insert(key.clone());
        self.key = key;
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

struct Shared {
    store: Arc<dyn ArtifactStore>,
    manifest: Arc<ManifestCache>,
    uploader: Arc<dyn Uploader>,
    config: PipelineConfig,
    poller: DirectoryPoller,
    limiter: Arc<Semaphore>,
    claims: Claims,
    /// Work-stage names the endpoint accepted but that are not archived yet.
    delivered: Mutex<HashSet<String>>,
    /// Held for writing while listing and claiming, for reading while moving,
    /// so a scan never sees a moved file before its task has re-claimed it.
    listing_gate: RwLock<()>,
    /// A manifest reload that outlived its timeout. Awaited again instead of
    /// starting another one.
    pending_refresh: Mutex<Option<RefreshTask>>,
    events: mpsc::Sender<TransferEvent>,
}

type RefreshTask = JoinHandle<Result<RefreshOutcome, ManifestError>>;

/// Drives artifacts from `source` to a terminal stage.
pub struct Orchestrator {
    shared: Arc<Shared>,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        manifest: Arc<ManifestCache>,
        uploader: Arc<dyn Uploader>,
        config: PipelineConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let poller = DirectoryPoller::new(Arc::clone(&store), config.poll_interval);
        let limiter = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            shared: Arc::new(Shared {
                store,
                manifest,
                uploader,
                config,
                poller,
                limiter,
                claims: Arc::default(),
                delivered: Mutex::default(),
                listing_gate: RwLock::new(()),
                pending_refresh: Mutex::default(),
                events: events_tx,
            }),
            events_rx: Some(events_rx),
        }
    }

    /// Takes the event receiver. Returns `None` after the first call.
    ///
    /// Events are dropped when the channel is full.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.take()
    }

    /// Work-stage names delivered to the endpoint but not yet archived.
    pub fn delivered_unarchived(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .shared
            .delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Runs one poll cycle and waits for every artifact it dispatched.
    pub async fn drive_cycle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, PipelineError> {
        let mut tasks = JoinSet::new();
        let mut report = CycleReport::default();
        self.poll_once(&mut tasks, cancel, &mut report).await?;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, result)) => report.record(name, result),
                Err(e) => error!(error = %e, "artifact task failed"),
            }
        }
        Ok(report)
    }

    /// Polls on the configured interval until `cancel` fires, then waits for
    /// in-flight artifacts to reach a safe point.
    ///
    /// Returns an error only when the manifest becomes unusable.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let tasks_cancel = cancel.child_token();
        let mut ticker = self.shared.poller.ticker();
        let mut tasks = JoinSet::new();

        info!(
            interval_ms = self.shared.config.poll_interval.as_millis() as u64,
            max_in_flight = self.shared.config.max_in_flight,
            "transfer pipeline started"
        );

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = ticker.tick() => {
                    let mut report = CycleReport::default();
                    if let Err(e) = self.poll_once(&mut tasks, &tasks_cancel, &mut report).await {
                        error!(error = %e, "stopping pipeline");
                        tasks_cancel.cancel();
                        break Err(e);
                    }
                    if report.dispatched > 0 {
                        debug!(
                            dispatched = report.dispatched,
                            skipped = report.skipped_in_flight,
                            in_flight = tasks.len(),
                            "poll cycle dispatched artifacts"
                        );
                    }
                }
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = joined {
                        error!(error = %e, "artifact task failed");
                    }
                }
            }
        };

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "waiting for in-flight artifacts");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "artifact task failed");
            }
        }
        info!("transfer pipeline stopped");
        result
    }

    async fn poll_once(
        &self,
        tasks: &mut JoinSet<(String, ArtifactResult)>,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<(), PipelineError> {
        self.refresh_manifest().await?;

        let _gate = self.shared.listing_gate.write().await;
        let scan = self.shared.poller.scan().await;
        report.list_failures = scan.failed;

        for item in scan.items {
            if cancel.is_cancelled() {
                break;
            }
            let Some(claim) = Claim::acquire(&self.shared.claims, item.stage, &item.name) else {
                report.skipped_in_flight += 1;
                continue;
            };
            report.dispatched += 1;
            self.shared.emit(TransferEvent::Discovered {
                artifact: item.name.clone(),
                stage: item.stage,
            });
            tasks.spawn(drive(
                Arc::clone(&self.shared),
                claim,
                item,
                cancel.clone(),
            ));
        }
        Ok(())
    }

    /// Reloads the manifest on the blocking pool, bounded by the load timeout.
    /// Only a malformed manifest is an error; anything else keeps the previous
    /// snapshot. A reload that times out keeps running and is picked up by the
    /// next cycle.
    async fn refresh_manifest(&self) -> Result<(), PipelineError> {
        let Some(path) = self.shared.manifest.path().map(|p| p.display().to_string()) else {
            return Ok(());
        };
        let pending = self
            .shared
            .pending_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut task = pending.unwrap_or_else(|| {
            let cache = Arc::clone(&self.shared.manifest);
            tokio::task::spawn_blocking(move || cache.refresh())
        });
        let timeout = self.shared.config.manifest_load_timeout;
        let refreshed = tokio::time::timeout(timeout, &mut task).await;

        match refreshed {
            Err(_) => {
                warn!(
                    manifest = %path,
                    error = %PipelineError::ManifestTimeout(timeout),
                    "keeping previous manifest"
                );
                *self
                    .shared
                    .pending_refresh
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(task);
            }
            Ok(Err(e)) => warn!(manifest = %path, error = %e, "manifest reload task failed"),
            Ok(Ok(Ok(RefreshOutcome::Reloaded(parsed)))) => info!(
                manifest = %path,
                accepted = parsed.accepted,
                rejected = parsed.rejected,
                replaced = parsed.replaced,
                incomplete_tail = parsed.incomplete_tail,
                "manifest loaded"
            ),
            Ok(Ok(Ok(RefreshOutcome::Missing))) => {
                debug!(manifest = %path, "manifest file not present")
            }
            Ok(Ok(Ok(RefreshOutcome::Unchanged))) => {}
            Ok(Ok(Err(e))) if e.is_fatal() => return Err(e.into()),
            Ok(Ok(Err(e))) => warn!(
                manifest = %path,
                error = %e,
                "manifest unavailable, keeping previous snapshot"
            ),
        }
        Ok(())
    }
}

/// Task body for one artifact.
async fn drive(
    shared: Arc<Shared>,
    mut claim: Claim,
    item: WorkItem,
    cancel: CancellationToken,
) -> (String, ArtifactResult) {
    let _permit = tokio::select! {
        permit = Arc::clone(&shared.limiter).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return (item.name, ArtifactResult::Interrupted),
        },
        _ = cancel.cancelled() => return (item.name, ArtifactResult::Interrupted),
    };

    let mut artifact = match item.stage {
        Stage::Source => Artifact::discovered(&item.name),
        _ if shared.is_delivered(&item.name) => Artifact::delivered(&item.name),
        _ => Artifact::recovered(&item.name),
    };

    let result = match shared.advance(&mut artifact, &mut claim, &cancel).await {
        Ok(result) => result,
        Err(PipelineError::ShutdownRequested) => {
            info!(
                artifact = %artifact.placed_name,
                stage = %artifact.stage(),
                "shutdown requested, artifact resumes on next run"
            );
            ArtifactResult::Interrupted
        }
        Err(e) => {
            error!(artifact = %artifact.placed_name, error = %e, "artifact pipeline failed");
            ArtifactResult::Stranded {
                reason: e.to_string(),
            }
        }
    };
    (item.name, result)
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::ShutdownRequested)
    } else {
        Ok(())
    }
}

impl Shared {
    fn emit(&self, event: TransferEvent) {
        if self.events.try_send(event).is_err() {
            debug!("event channel full or closed, dropping event");
        }
    }

    fn is_delivered(&self, name: &str) -> bool {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    fn set_delivered(&self, name: &str, delivered: bool) {
        let mut set = self.delivered.lock().unwrap_or_else(PoisonError::into_inner);
        if delivered {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    fn finish(&self, artifact: &Artifact, outcome: TerminalOutcome) -> ArtifactResult {
        self.emit(TransferEvent::Finished {
            artifact: artifact.placed_name.clone(),
            outcome: outcome.clone(),
        });
        ArtifactResult::Finished(outcome)
    }

    async fn advance(
        &self,
        artifact: &mut Artifact,
        claim: &mut Claim,
        cancel: &CancellationToken,
    ) -> Result<ArtifactResult, PipelineError> {
        if artifact.state == ArtifactState::Discovered {
            if let ControlFlow::Break(result) = self.stage(artifact, claim, cancel).await? {
                return Ok(result);
            }
        }

        if artifact.state == ArtifactState::Staged {
            let body = match self.verify(artifact, claim, cancel).await? {
                ControlFlow::Continue(body) => body,
                ControlFlow::Break(result) => return Ok(result),
            };
            if let ControlFlow::Break(result) = self.upload(artifact, body, claim, cancel).await? {
                return Ok(result);
            }
        }

        self.archive(artifact, claim, cancel).await
    }

    /// Moves a store entry on the blocking pool and moves the claim with it.
    async fn move_artifact(
        &self,
        claim: &mut Claim,
        name: &str,
        from: Stage,
        to: Stage,
    ) -> Result<MoveReceipt, MoveError> {
        let _gate = self.listing_gate.read().await;
        let store = Arc::clone(&self.store);
        let owned = name.to_string();
        let receipt = match tokio::task::spawn_blocking(move || store.move_to(&owned, from, to))
            .await
        {
            Ok(moved) => moved?,
            Err(e) => {
                return Err(MoveError::Permanent {
                    attempts: 0,
                    reason: format!("move task failed: {e}"),
                });
            }
        };
        claim.rekey(to, &receipt.file_name);
        Ok(receipt)
    }

    /// source -> work.
    async fn stage(
        &self,
        artifact: &mut Artifact,
        claim: &mut Claim,
        cancel: &CancellationToken,
    ) -> Result<ControlFlow<ArtifactResult>, PipelineError> {
        check_cancelled(cancel)?;
        match self
            .move_artifact(claim, &artifact.placed_name, Stage::Source, Stage::Work)
            .await
        {
            Ok(receipt) => {
                artifact.transition(ArtifactState::Staged)?;
                artifact.move_attempts = receipt.attempts;
                if receipt.file_name != artifact.placed_name {
                    info!(
                        artifact = %artifact.placed_name,
                        placed_as = %receipt.file_name,
                        "name already taken in work, staged under alternative name"
                    );
                }
                artifact.placed_name = receipt.file_name;
                self.emit(TransferEvent::Staged {
                    artifact: artifact.filename.clone(),
                    placed_as: artifact.placed_name.clone(),
                });
                Ok(ControlFlow::Continue(()))
            }
            Err(e) => Ok(ControlFlow::Break(
                self.divert_failed_move(artifact, claim, cancel, e.to_string(), false)
                    .await?,
            )),
        }
    }

    /// Manifest lookup, missing-hash policy and content check. Continues with
    /// the body to upload.
    async fn verify(
        &self,
        artifact: &mut Artifact,
        claim: &mut Claim,
        cancel: &CancellationToken,
    ) -> Result<ControlFlow<ArtifactResult, UploadBody>, PipelineError> {
        let index = self.manifest.current();
        artifact.expected_hash = artifact
            .manifest_keys()
            .iter()
            .find_map(|key| index.lookup(key).ok())
            .map(str::to_owned);

        let has_hash = artifact.expected_hash.is_some();
        artifact.transition(if has_hash {
            ArtifactState::Verified
        } else {
            ArtifactState::Unverified
        })?;
        self.emit(TransferEvent::Verified {
            artifact: artifact.placed_name.clone(),
            has_hash,
        });

        if !has_hash {
            match self.config.missing_hash {
                MissingHashPolicy::Upload => {
                    debug!(artifact = %artifact.placed_name, "no manifest entry, uploading unverified");
                }
                MissingHashPolicy::DeadLetter => {
                    let result = self
                        .dead_letter(artifact, claim, cancel, DeadLetterReason::ManifestMiss)
                        .await?;
                    return Ok(ControlFlow::Break(result));
                }
                MissingHashPolicy::Defer => {
                    info!(artifact = %artifact.placed_name, "no manifest entry yet, deferring");
                    self.emit(TransferEvent::Deferred {
                        artifact: artifact.placed_name.clone(),
                    });
                    return Ok(ControlFlow::Break(ArtifactResult::Deferred));
                }
            }
        }

        let hash_content = self.config.verify_content && has_hash;
        let store = Arc::clone(&self.store);
        let name = artifact.placed_name.clone();
        let read = tokio::task::spawn_blocking(move || {
            let content = store.open(Stage::Work, &name)?;
            let actual = match (&content, hash_content) {
                (_, false) => None,
                (ArtifactContent::File(path), true) => Some(sha256_file(path)?),
                (ArtifactContent::Memory(bytes), true) => Some(sha256_hex(bytes)),
            };
            let body = match content {
                ArtifactContent::File(path) => UploadBody::File(path),
                ArtifactContent::Memory(bytes) => UploadBody::Bytes(bytes),
            };
            Ok::<_, std::io::Error>((body, actual))
        })
        .await?;

        let (body, actual) = match read {
            Ok(read) => read,
            Err(e) => {
                warn!(artifact = %artifact.placed_name, error = %e, "failed to read staged artifact, retrying next cycle");
                return Ok(ControlFlow::Break(ArtifactResult::Stranded {
                    reason: e.to_string(),
                }));
            }
        };

        let mismatch = match (&artifact.expected_hash, actual) {
            (Some(expected), Some(actual)) if *expected != actual => {
                Some(DeadLetterReason::HashMismatch {
                    expected: expected.clone(),
                    actual,
                })
            }
            _ => None,
        };
        if let Some(reason) = mismatch {
            let result = self.dead_letter(artifact, claim, cancel, reason).await?;
            return Ok(ControlFlow::Break(result));
        }

        Ok(ControlFlow::Continue(body))
    }

    /// Sends the artifact until it is accepted, rejected, out of attempts or
    /// interrupted.
    async fn upload(
        &self,
        artifact: &mut Artifact,
        body: UploadBody,
        claim: &mut Claim,
        cancel: &CancellationToken,
    ) -> Result<ControlFlow<ArtifactResult>, PipelineError> {
        check_cancelled(cancel)?;
        artifact.transition(ArtifactState::Uploading)?;

        let request = UploadRequest {
            filename: artifact.placed_name.clone(),
            body,
            expected_hash: artifact.expected_hash.clone(),
        };
        let mut backoff = self.config.backoff.start();

        loop {
            artifact.upload_attempts += 1;
            self.emit(TransferEvent::UploadAttempt {
                artifact: artifact.placed_name.clone(),
                attempt: artifact.upload_attempts,
            });

            match self.uploader.upload(&request).await {
                UploadOutcome::Success { status } => {
                    debug!(
                        artifact = %artifact.placed_name,
                        status,
                        attempt = artifact.upload_attempts,
                        "upload accepted"
                    );
                    break;
                }
                UploadOutcome::PermanentFailure { reason } => {
                    let result = self
                        .dead_letter(artifact, claim, cancel, DeadLetterReason::Rejected { reason })
                        .await?;
                    return Ok(ControlFlow::Break(result));
                }
                UploadOutcome::RetryableFailure { reason } => {
                    if self.config.uploads_exhausted(artifact.upload_attempts) {
                        let reason = DeadLetterReason::RetriesExhausted {
                            attempts: artifact.upload_attempts,
                            last: reason,
                        };
                        let result = self.dead_letter(artifact, claim, cancel, reason).await?;
                        return Ok(ControlFlow::Break(result));
                    }

                    let delay = backoff.next_delay();
                    warn!(
                        artifact = %artifact.placed_name,
                        attempt = artifact.upload_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "upload failed, retrying"
                    );
                    self.emit(TransferEvent::RetryScheduled {
                        artifact: artifact.placed_name.clone(),
                        attempt: artifact.upload_attempts,
                        delay,
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(PipelineError::ShutdownRequested),
                    }
                }
            }
        }

        artifact.transition(ArtifactState::Delivered)?;
        self.set_delivered(&artifact.placed_name, true);
        Ok(ControlFlow::Continue(()))
    }

    /// work -> done, for delivered artifacts.
    async fn archive(
        &self,
        artifact: &mut Artifact,
        claim: &mut Claim,
        cancel: &CancellationToken,
    ) -> Result<ArtifactResult, PipelineError> {
        check_cancelled(cancel)?;
        let name = artifact.placed_name.clone();
        match self
            .move_artifact(claim, &name, Stage::Work, Stage::Done)
            .await
        {
            Ok(receipt) => {
                let uploads = artifact.upload_attempts;
                artifact.transition(ArtifactState::Done)?;
                artifact.placed_name = receipt.file_name;
                self.set_delivered(&name, false);
                info!(
                    artifact = %name,
                    placed_as = %artifact.placed_name,
                    uploads,
                    "artifact delivered and archived"
                );
                Ok(self.finish(artifact, TerminalOutcome::Done))
            }
            Err(e) => {
                self.divert_failed_move(artifact, claim, cancel, e.to_string(), true)
                    .await
            }
        }
    }

    /// work -> dead_letter.
    async fn dead_letter(
        &self,
        artifact: &mut Artifact,
        claim: &mut Claim,
        cancel: &CancellationToken,
        reason: DeadLetterReason,
    ) -> Result<ArtifactResult, PipelineError> {
        check_cancelled(cancel)?;
        let name = artifact.placed_name.clone();
        match self
            .move_artifact(claim, &name, Stage::Work, Stage::DeadLetter)
            .await
        {
            Ok(receipt) => {
                artifact.transition(ArtifactState::DeadLettered)?;
                artifact.placed_name = receipt.file_name;
                warn!(
                    artifact = %name,
                    placed_as = %artifact.placed_name,
                    reason = %reason,
                    "artifact dead-lettered"
                );
                Ok(self.finish(artifact, TerminalOutcome::DeadLettered { reason }))
            }
            Err(e) => {
                let reason = format!("dead-letter move failed ({reason}): {e}");
                self.divert_failed_move(artifact, claim, cancel, reason, false)
                    .await
            }
        }
    }

    /// Current stage -> failed_move. If that move fails too, the artifact stays
    /// where it is and is picked up again next cycle.
    async fn divert_failed_move(
        &self,
        artifact: &mut Artifact,
        claim: &mut Claim,
        cancel: &CancellationToken,
        reason: String,
        delivered: bool,
    ) -> Result<ArtifactResult, PipelineError> {
        let from = artifact.stage();
        error!(
            artifact = %artifact.placed_name,
            stage = %from,
            delivered,
            error = %reason,
            "move failed, diverting to failed_move"
        );
        check_cancelled(cancel)?;

        let name = artifact.placed_name.clone();
        match self
            .move_artifact(claim, &name, from, Stage::FailedMove)
            .await
        {
            Ok(receipt) => {
                artifact.transition(ArtifactState::FailedMove)?;
                artifact.placed_name = receipt.file_name;
                if delivered {
                    self.set_delivered(&name, false);
                }
                Ok(self.finish(artifact, TerminalOutcome::FailedMove { delivered, reason }))
            }
            Err(e) => {
                error!(
                    artifact = %name,
                    stage = %from,
                    error = %e,
                    "could not place artifact in failed_move, leaving it for next cycle"
                );
                Ok(ArtifactResult::Stranded {
                    reason: format!("{reason}; failed_move placement failed: {e}"),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    use tracerelay_manifest::{ManifestEntry, ManifestIndex};
    use tracerelay_stage::MemoryStore;
    use tracerelay_uplink::BackoffPolicy;

    /// Replays scripted outcomes, then repeats `fallback`.
    struct ScriptedUploader {
        script: Mutex<VecDeque<UploadOutcome>>,
        fallback: UploadOutcome,
        seen: Mutex<Vec<UploadRequest>>,
    }

    impl ScriptedUploader {
        fn new(script: Vec<UploadOutcome>, fallback: UploadOutcome) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn always(outcome: UploadOutcome) -> Arc<Self> {
            Self::new(Vec::new(), outcome)
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn requests(&self) -> Vec<UploadRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Uploader for ScriptedUploader {
        fn upload<'a>(
            &'a self,
            request: &'a UploadRequest,
        ) -> Pin<Box<dyn Future<Output = UploadOutcome> + Send + 'a>> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(request.clone());
                self.script
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| self.fallback.clone())
            })
        }
    }

    fn ok() -> UploadOutcome {
        UploadOutcome::Success { status: 200 }
    }

    fn unavailable() -> UploadOutcome {
        UploadOutcome::RetryableFailure {
            reason: "server responded 503".into(),
        }
    }

    fn bad_request() -> UploadOutcome {
        UploadOutcome::PermanentFailure {
            reason: "server responded 400".into(),
        }
    }

    fn manifest_for(entries: &[(&str, &[u8])]) -> Arc<ManifestCache> {
        let index = ManifestIndex::from_entries(entries.iter().map(|(name, content)| {
            ManifestEntry {
                filename: name.to_string(),
                expected_hash: sha256_hex(content),
                recorded_at: Default::default(),
                source_path: format!("/spool/source/{name}").into(),
            }
        }));
        Arc::new(ManifestCache::fixed(index))
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1)),
            ..PipelineConfig::default()
        }
    }

    fn orchestrator(
        store: &Arc<MemoryStore>,
        manifest: Arc<ManifestCache>,
        uploader: &Arc<ScriptedUploader>,
        config: PipelineConfig,
    ) -> (Orchestrator, mpsc::Receiver<TransferEvent>) {
        let mut orch = Orchestrator::new(
            Arc::clone(store) as Arc<dyn ArtifactStore>,
            manifest,
            Arc::clone(uploader) as Arc<dyn Uploader>,
            config,
        );
        let events = orch.take_events().unwrap();
        (orch, events)
    }

    fn drain(rx: &mut mpsc::Receiver<TransferEvent>) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn retry_delays(events: &[TransferEvent]) -> Vec<Duration> {
        events
            .iter()
            .filter_map(|e| match e {
                TransferEvent::RetryScheduled { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn verified_artifact_is_delivered_and_archived() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Source, "trace1.pcap", b"trace-one".to_vec());
        let uploader = ScriptedUploader::always(ok());
        let manifest = manifest_for(&[("trace1.pcap", b"trace-one")]);
        let (orch, mut rx) = orchestrator(&store, manifest, &uploader, config());

        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.done, ["trace1.pcap"]);
        assert_eq!(store.locate("trace1.pcap"), Some(Stage::Done));
        let requests = uploader.requests();
        assert_eq!(requests.len(), 1);
        assert!(matches!(
            &requests[0].body,
            UploadBody::Bytes(body) if body.as_ref() == b"trace-one"
        ));
        assert_eq!(
            requests[0].expected_hash.as_deref(),
            Some(sha256_hex(b"trace-one").as_str())
        );

        let events = drain(&mut rx);
        assert!(retry_delays(&events).is_empty());
        assert!(events.contains(&TransferEvent::Verified {
            artifact: "trace1.pcap".into(),
            has_hash: true,
        }));
        assert_eq!(
            events.last(),
            Some(&TransferEvent::Finished {
                artifact: "trace1.pcap".into(),
                outcome: TerminalOutcome::Done,
            })
        );
        assert!(orch.delivered_unarchived().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_back_off_then_succeed() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Source, "trace2.pcap", b"two".to_vec());
        let uploader = ScriptedUploader::new(vec![unavailable(), unavailable()], ok());
        let (orch, mut rx) = orchestrator(&store, manifest_for(&[]), &uploader, config());

        let start = tokio::time::Instant::now();
        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.done, ["trace2.pcap"]);
        assert_eq!(uploader.calls(), 3);
        let delays = retry_delays(&drain(&mut rx));
        assert_eq!(delays, [Duration::from_millis(100), Duration::from_millis(200)]);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_after_one_attempt() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Source, "trace3.pcap", b"three".to_vec());
        let uploader = ScriptedUploader::always(bad_request());
        let (orch, mut rx) = orchestrator(&store, manifest_for(&[]), &uploader, config());

        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.dead_lettered, ["trace3.pcap"]);
        assert_eq!(store.locate("trace3.pcap"), Some(Stage::DeadLetter));
        assert_eq!(uploader.calls(), 1);
        let events = drain(&mut rx);
        assert!(retry_delays(&events).is_empty());
        assert!(events.iter().any(|e| matches!(
            e,
            TransferEvent::Finished {
                outcome: TerminalOutcome::DeadLettered {
                    reason: DeadLetterReason::Rejected { .. }
                },
                ..
            }
        )));
    }

    #[tokio::test]
    async fn hash_mismatch_dead_letters_without_upload() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Source, "trace1.pcap", b"corrupted".to_vec());
        let uploader = ScriptedUploader::always(ok());
        let manifest = manifest_for(&[("trace1.pcap", b"original")]);
        let (orch, mut rx) = orchestrator(&store, manifest, &uploader, config());

        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.dead_lettered, ["trace1.pcap"]);
        assert_eq!(uploader.calls(), 0);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            TransferEvent::Finished {
                outcome: TerminalOutcome::DeadLettered {
                    reason: DeadLetterReason::HashMismatch { .. }
                },
                ..
            }
        )));
    }

    #[tokio::test]
    async fn hash_mismatch_ignored_when_content_check_disabled() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Source, "trace1.pcap", b"corrupted".to_vec());
        let uploader = ScriptedUploader::always(ok());
        let manifest = manifest_for(&[("trace1.pcap", b"original")]);
        let config = PipelineConfig {
            verify_content: false,
            ..config()
        };
        let (orch, _rx) = orchestrator(&store, manifest, &uploader, config);

        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.done, ["trace1.pcap"]);
        assert_eq!(uploader.calls(), 1);
    }

    #[tokio::test]
    async fn missing_hash_uploads_unverified() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Source, "a.pcap", b"a".to_vec());
        let uploader = ScriptedUploader::always(ok());
        let (orch, _rx) = orchestrator(&store, manifest_for(&[]), &uploader, config());

        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.done, ["a.pcap"]);
        assert_eq!(uploader.requests()[0].expected_hash, None);
    }

    #[tokio::test]
    async fn missing_hash_dead_letters_when_configured() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Source, "a.pcap", b"a".to_vec());
        let uploader = ScriptedUploader::always(ok());
        let config = PipelineConfig {
            missing_hash: MissingHashPolicy::DeadLetter,
            ..config()
        };
        let (orch, mut rx) = orchestrator(&store, manifest_for(&[]), &uploader, config);

        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.dead_lettered, ["a.pcap"]);
        assert_eq!(uploader.calls(), 0);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            TransferEvent::Finished {
                outcome: TerminalOutcome::DeadLettered {
                    reason: DeadLetterReason::ManifestMiss
                },
                ..
            }
        )));
    }

    #[tokio::test]
    async fn missing_hash_defers_in_work() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Source, "a.pcap", b"a".to_vec());
        let uploader = ScriptedUploader::always(ok());
        let config = PipelineConfig {
            missing_hash: MissingHashPolicy::Defer,
            ..config()
        };
        let (orch, _rx) = orchestrator(&store, manifest_for(&[]), &uploader, config);

        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.deferred, ["a.pcap"]);
        assert_eq!(store.locate("a.pcap"), Some(Stage::Work));

        // Still waiting on the next cycle, picked up from work this time.
        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.deferred, ["a.pcap"]);
        assert_eq!(uploader.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn capped_retries_dead_letter() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Source, "a.pcap", b"a".to_vec());
        let uploader = ScriptedUploader::always(unavailable());
        let config = PipelineConfig {
            max_upload_attempts: 3,
            ..config()
        };
        let (orch, mut rx) = orchestrator(&store, manifest_for(&[]), &uploader, config);

        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.dead_lettered, ["a.pcap"]);
        assert_eq!(uploader.calls(), 3);
        let events = drain(&mut rx);
        assert_eq!(retry_delays(&events).len(), 2);
        assert!(events.iter().any(|e| matches!(
            e,
            TransferEvent::Finished {
                outcome: TerminalOutcome::DeadLettered {
                    reason: DeadLetterReason::RetriesExhausted { attempts: 3, .. }
                },
                ..
            }
        )));
    }

    #[tokio::test]
    async fn staging_failure_goes_to_failed_move() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Source, "a.pcap", b"a".to_vec());
        store.fail_moves_into(Stage::Work);
        let uploader = ScriptedUploader::always(ok());
        let (orch, mut rx) = orchestrator(&store, manifest_for(&[]), &uploader, config());

        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.failed_move, ["a.pcap"]);
        assert_eq!(store.locate("a.pcap"), Some(Stage::FailedMove));
        assert_eq!(uploader.calls(), 0);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            TransferEvent::Finished {
                outcome: TerminalOutcome::FailedMove {
                    delivered: false,
                    ..
                },
                ..
            }
        )));
    }

    #[tokio::test]
    async fn archive_failure_is_marked_delivered() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Source, "a.pcap", b"a".to_vec());
        store.fail_moves_into(Stage::Done);
        let uploader = ScriptedUploader::always(ok());
        let (orch, mut rx) = orchestrator(&store, manifest_for(&[]), &uploader, config());

        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.failed_move, ["a.pcap"]);
        assert_eq!(store.locate("a.pcap"), Some(Stage::FailedMove));
        assert_eq!(uploader.calls(), 1);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            TransferEvent::Finished {
                outcome: TerminalOutcome::FailedMove {
                    delivered: true,
                    ..
                },
                ..
            }
        )));
    }

    #[tokio::test]
    async fn stranded_delivery_retries_only_the_archive() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Source, "a.pcap", b"a".to_vec());
        store.fail_moves_into(Stage::Done);
        store.fail_moves_into(Stage::FailedMove);
        let uploader = ScriptedUploader::always(ok());
        let (orch, _rx) = orchestrator(&store, manifest_for(&[]), &uploader, config());

        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.stranded, ["a.pcap"]);
        assert_eq!(store.locate("a.pcap"), Some(Stage::Work));
        assert_eq!(orch.delivered_unarchived(), ["a.pcap"]);

        store.heal_moves_into(Stage::Done);
        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.done, ["a.pcap"]);
        assert_eq!(uploader.calls(), 1);
        assert!(orch.delivered_unarchived().is_empty());
    }

    #[tokio::test]
    async fn work_leftovers_are_recovered() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Work, "left-dup1.pcap", b"left".to_vec());
        let uploader = ScriptedUploader::always(ok());
        let manifest = manifest_for(&[("left.pcap", b"left")]);
        let (orch, _rx) = orchestrator(&store, manifest, &uploader, config());

        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.done, ["left-dup1.pcap"]);
        assert_eq!(
            store.moves(),
            [("left-dup1.pcap".to_string(), Stage::Work, Stage::Done)]
        );
        // Looked up under its logical name.
        assert!(uploader.requests()[0].expected_hash.is_some());
    }

    #[tokio::test]
    async fn arrival_name_with_collision_marker_is_looked_up_as_is() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Source, "capture-dup1.pcap", b"capture".to_vec());
        let uploader = ScriptedUploader::always(ok());
        let manifest = manifest_for(&[("capture-dup1.pcap", b"capture")]);
        let (orch, _rx) = orchestrator(&store, manifest, &uploader, config());

        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.done, ["capture-dup1.pcap"]);
        assert_eq!(
            uploader.requests()[0].expected_hash.as_deref(),
            Some(sha256_hex(b"capture").as_str())
        );
    }

    #[tokio::test]
    async fn recovered_artifact_prefers_its_exact_name() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Work, "capture-dup1.pcap", b"second".to_vec());
        let uploader = ScriptedUploader::always(ok());
        let manifest = manifest_for(&[
            ("capture.pcap", b"first"),
            ("capture-dup1.pcap", b"second"),
        ]);
        let (orch, _rx) = orchestrator(&store, manifest, &uploader, config());

        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.done, ["capture-dup1.pcap"]);
        assert_eq!(
            uploader.requests()[0].expected_hash.as_deref(),
            Some(sha256_hex(b"second").as_str())
        );
    }

    #[tokio::test]
    async fn every_artifact_ends_in_one_terminal_stage() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..12 {
            store.insert(Stage::Source, &format!("t{i:02}.pcap"), vec![i as u8]);
        }
        let script = (0..12)
            .map(|i| if i % 3 == 0 { bad_request() } else { ok() })
            .collect();
        let uploader = ScriptedUploader::new(script, ok());
        let config = PipelineConfig {
            max_in_flight: 3,
            ..config()
        };
        let (orch, _rx) = orchestrator(&store, manifest_for(&[]), &uploader, config);

        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.dispatched, 12);
        assert_eq!(report.finished(), 12);
        assert_eq!(report.dead_lettered.len(), 4);
        assert!(store.names(Stage::Source).is_empty());
        assert!(store.names(Stage::Work).is_empty());
        for i in 0..12 {
            let stage = store.locate(&format!("t{i:02}.pcap")).unwrap();
            assert!(stage.is_terminal());
        }
    }

    #[tokio::test]
    async fn cancelled_before_cycle_moves_nothing() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Source, "a.pcap", b"a".to_vec());
        let uploader = ScriptedUploader::always(ok());
        let (orch, _rx) = orchestrator(&store, manifest_for(&[]), &uploader, config());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = orch.drive_cycle(&cancel).await.unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(store.locate("a.pcap"), Some(Stage::Source));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_backoff_and_leaves_artifact_in_work() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Source, "a.pcap", b"a".to_vec());
        let uploader = ScriptedUploader::always(unavailable());
        let config = PipelineConfig {
            backoff: BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(60)),
            ..config()
        };
        let (orch, mut rx) = orchestrator(&store, manifest_for(&[]), &uploader, config);
        let cancel = CancellationToken::new();

        let cycle = orch.drive_cycle(&cancel);
        let stopper = async {
            while let Some(event) = rx.recv().await {
                if matches!(event, TransferEvent::RetryScheduled { .. }) {
                    cancel.cancel();
                    break;
                }
            }
        };
        let (report, ()) = tokio::join!(cycle, stopper);

        let report = report.unwrap();
        assert_eq!(report.interrupted, ["a.pcap"]);
        assert_eq!(store.locate("a.pcap"), Some(Stage::Work));
        assert_eq!(uploader.calls(), 1);
    }

    #[tokio::test]
    async fn claimed_entries_are_skipped() {
        let claims: Claims = Arc::default();
        let mut first = Claim::acquire(&claims, Stage::Source, "a.pcap").unwrap();
        assert!(Claim::acquire(&claims, Stage::Source, "a.pcap").is_none());
        assert!(Claim::acquire(&claims, Stage::Work, "a.pcap").is_some());

        first.rekey(Stage::Work, "a-dup1.pcap");
        assert!(Claim::acquire(&claims, Stage::Source, "a.pcap").is_some());
        assert!(Claim::acquire(&claims, Stage::Work, "a-dup1.pcap").is_none());

        drop(first);
        assert!(claims.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Source, "a.pcap", b"a".to_vec());
        let uploader = ScriptedUploader::always(ok());
        let (orch, mut rx) = orchestrator(&store, manifest_for(&[]), &uploader, config());
        let cancel = CancellationToken::new();

        let run = orch.run(cancel.clone());
        let stopper = async {
            while let Some(event) = rx.recv().await {
                if matches!(event, TransferEvent::Finished { .. }) {
                    cancel.cancel();
                    break;
                }
            }
        };
        let (result, ()) = tokio::join!(run, stopper);

        result.unwrap();
        assert_eq!(store.locate("a.pcap"), Some(Stage::Done));
    }

    /// The manifest is a FIFO, so the first reload blocks until something is
    /// written to it.
    #[cfg(unix)]
    #[tokio::test]
    async fn slow_manifest_reload_is_resumed_not_respawned() {
        use nix::sys::stat::Mode;
        use tracerelay_manifest::ParseMode;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.csv");
        nix::unistd::mkfifo(&path, Mode::S_IRWXU).unwrap();

        let store = Arc::new(MemoryStore::new());
        store.insert(Stage::Source, "t.pcap", b"slow".to_vec());
        let uploader = ScriptedUploader::always(ok());
        let manifest = Arc::new(ManifestCache::new(&path, "/spool/source", ParseMode::Strict));
        let config = PipelineConfig {
            missing_hash: MissingHashPolicy::Defer,
            manifest_load_timeout: Duration::from_millis(200),
            ..config()
        };
        let (orch, _rx) = orchestrator(&store, manifest, &uploader, config);

        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.deferred, ["t.pcap"]);
        assert!(orch.shared.pending_refresh.lock().unwrap().is_some());

        // Unblocks the reader started by the first cycle.
        let record = format!("1700000000,/spool/source/t.pcap,{}\n", sha256_hex(b"slow"));
        tokio::task::spawn_blocking(move || std::fs::write(path, record))
            .await
            .unwrap()
            .unwrap();

        let report = orch.drive_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.done, ["t.pcap"]);
        assert!(orch.shared.pending_refresh.lock().unwrap().is_none());
        assert_eq!(
            uploader.requests()[0].expected_hash.as_deref(),
            Some(sha256_hex(b"slow").as_str())
        );
    }
}
