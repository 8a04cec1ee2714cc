use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracerelay_uplink::BackoffPolicy;

/// What to do with an artifact the manifest has no entry for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingHashPolicy {
    /// Upload without verification.
    #[default]
    Upload,
    /// Dead-letter without uploading.
    DeadLetter,
    /// Leave it in work until a later manifest has the entry.
    Defer,
}

/// Orchestrator settings. Fixed for the lifetime of an orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
    /// Upload attempts before dead-lettering; 0 retries forever.
    pub max_upload_attempts: u32,
    pub max_in_flight: usize,
    pub missing_hash: MissingHashPolicy,
    /// Hash staged content and dead-letter on mismatch.
    pub verify_content: bool,
    pub manifest_load_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            backoff: BackoffPolicy::default(),
            max_upload_attempts: 0,
            max_in_flight: 4,
            missing_hash: MissingHashPolicy::default(),
            verify_content: true,
            manifest_load_timeout: Duration::from_secs(5),
        }
    }
}

impl PipelineConfig {
    /// Whether `attempts` uploads use up the budget.
    pub(crate) fn uploads_exhausted(&self, attempts: u32) -> bool {
        self.max_upload_attempts > 0 && attempts >= self.max_upload_attempts
    }
}
