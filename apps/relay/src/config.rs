//! Relay configuration.
//!
//! Configuration is stored as TOML. Lookup order: the first command line
//! argument, then `$TRACERELAY_CONFIG`, then
//! `~/.config/tracerelay/relay.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use tracerelay_manifest::ParseMode;
use tracerelay_mover::MoveConfig;
use tracerelay_pipeline::{MissingHashPolicy, PipelineConfig};
use tracerelay_stage::StageLayout;
use tracerelay_uplink::{BackoffPolicy, HttpUploaderConfig, parse_endpoint};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "TRACERELAY_CONFIG";

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub directories: Directories,
    #[serde(default)]
    pub files: Files,
    #[serde(default)]
    pub upload: Upload,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default)]
    pub manifest: ManifestOptions,
}

/// Spool directories. All required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directories {
    pub source_dir: PathBuf,
    pub work_dir: PathBuf,
    pub csv_dir: PathBuf,
    pub done_dir: PathBuf,
    pub failed_move_dir: PathBuf,
    pub dead_letter_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Files {
    /// Manifest file name inside `csv_dir`.
    #[serde(default = "default_csv_filename")]
    pub csv_filename: String,
}

/// Collection endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    #[serde(default = "default_url")]
    pub url: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_true")]
    pub verify_tls: bool,

    /// Upload attempts before dead-lettering (0 = retry forever).
    #[serde(default)]
    pub max_attempts: u32,

    /// Artifacts processed concurrently.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Sent as `x-source-host` (empty = this machine's hostname).
    #[serde(default)]
    pub source_host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timing {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_move_retry_delay_ms")]
    pub move_retry_delay_ms: u64,
    #[serde(default = "default_max_move_retries")]
    pub max_move_retries: u32,
    #[serde(default = "default_max_collision_attempts")]
    pub max_collision_attempts: u32,
    #[serde(default = "default_manifest_load_timeout_secs")]
    pub manifest_load_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestOptions {
    /// Handling of artifacts without a manifest record.
    #[serde(default)]
    pub missing_hash: MissingHashPolicy,
    /// Hash staged content against the manifest before uploading.
    #[serde(default = "default_true")]
    pub verify_content: bool,
    /// Fail on the first invalid record instead of skipping it.
    #[serde(default)]
    pub strict: bool,
}

fn default_csv_filename() -> String {
    "manifest.csv".into()
}

fn default_url() -> String {
    "http://127.0.0.1:8989/pcap".into()
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_max_in_flight() -> usize {
    4
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_secs() -> u64 {
    60
}

fn default_move_retry_delay_ms() -> u64 {
    250
}

fn default_max_move_retries() -> u32 {
    3
}

fn default_max_collision_attempts() -> u32 {
    100
}

fn default_manifest_load_timeout_secs() -> u64 {
    5
}

impl Default for Files {
    fn default() -> Self {
        Self {
            csv_filename: default_csv_filename(),
        }
    }
}

impl Default for Upload {
    fn default() -> Self {
        Self {
            url: default_url(),
            timeout_secs: default_timeout_secs(),
            verify_tls: true,
            max_attempts: 0,
            max_in_flight: default_max_in_flight(),
            source_host: String::new(),
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            move_retry_delay_ms: default_move_retry_delay_ms(),
            max_move_retries: default_max_move_retries(),
            max_collision_attempts: default_max_collision_attempts(),
            manifest_load_timeout_secs: default_manifest_load_timeout_secs(),
        }
    }
}

impl Default for ManifestOptions {
    fn default() -> Self {
        Self {
            missing_hash: MissingHashPolicy::default(),
            verify_content: true,
            strict: false,
        }
    }
}

impl Config {
    /// Loads and validates the configuration at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        parse_endpoint(&self.upload.url)?;

        let dirs = self.named_directories();
        for (name, dir) in &dirs {
            if !dir.is_absolute() {
                bail!("{name} must be an absolute path, got {}", dir.display());
            }
        }
        for (i, (name_a, a)) in dirs.iter().enumerate() {
            for (name_b, b) in &dirs[i + 1..] {
                if a == b {
                    bail!("{name_a} and {name_b} must differ, both are {}", a.display());
                }
            }
        }

        if self.files.csv_filename.is_empty() || self.files.csv_filename.contains('/') {
            bail!("csv_filename must be a plain file name");
        }
        if self.timing.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than 0");
        }
        if self.timing.initial_backoff_ms == 0 {
            bail!("initial_backoff_ms must be greater than 0");
        }
        if self.max_backoff() < self.initial_backoff() {
            bail!("max_backoff_secs must not be below initial_backoff_ms");
        }
        if self.upload.max_in_flight == 0 {
            bail!("max_in_flight must be at least 1");
        }
        if self.upload.timeout_secs == 0 {
            bail!("timeout_secs must be greater than 0");
        }
        if self.timing.manifest_load_timeout_secs == 0 {
            bail!("manifest_load_timeout_secs must be greater than 0");
        }
        Ok(())
    }

    fn named_directories(&self) -> [(&'static str, &PathBuf); 6] {
        let d = &self.directories;
        [
            ("source_dir", &d.source_dir),
            ("work_dir", &d.work_dir),
            ("csv_dir", &d.csv_dir),
            ("done_dir", &d.done_dir),
            ("failed_move_dir", &d.failed_move_dir),
            ("dead_letter_dir", &d.dead_letter_dir),
        ]
    }

    fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.timing.initial_backoff_ms)
    }

    fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.timing.max_backoff_secs)
    }

    pub fn stage_layout(&self) -> StageLayout {
        let d = &self.directories;
        StageLayout {
            source: d.source_dir.clone(),
            work: d.work_dir.clone(),
            done: d.done_dir.clone(),
            failed_move: d.failed_move_dir.clone(),
            dead_letter: d.dead_letter_dir.clone(),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.directories.csv_dir.join(&self.files.csv_filename)
    }

    pub fn parse_mode(&self) -> ParseMode {
        if self.manifest.strict {
            ParseMode::Strict
        } else {
            ParseMode::Lenient
        }
    }

    pub fn move_config(&self) -> MoveConfig {
        MoveConfig {
            max_retries: self.timing.max_move_retries,
            retry_delay: Duration::from_millis(self.timing.move_retry_delay_ms),
            max_collision_attempts: self.timing.max_collision_attempts,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            poll_interval: Duration::from_secs(self.timing.poll_interval_secs),
            backoff: BackoffPolicy::new(self.initial_backoff(), self.max_backoff()),
            max_upload_attempts: self.upload.max_attempts,
            max_in_flight: self.upload.max_in_flight,
            missing_hash: self.manifest.missing_hash,
            verify_content: self.manifest.verify_content,
            manifest_load_timeout: Duration::from_secs(self.timing.manifest_load_timeout_secs),
        }
    }

    pub fn uploader_config(&self) -> HttpUploaderConfig {
        HttpUploaderConfig {
            url: self.upload.url.clone(),
            timeout: Duration::from_secs(self.upload.timeout_secs),
            verify_tls: self.upload.verify_tls,
            source_host: self.source_host(),
        }
    }

    fn source_host(&self) -> Option<String> {
        if !self.upload.source_host.is_empty() {
            return Some(self.upload.source_host.clone());
        }
        hostname::get().ok().and_then(|h| h.into_string().ok())
    }
}

/// Resolves the configuration file path.
pub fn config_path(arg: Option<&str>) -> PathBuf {
    if let Some(arg) = arg {
        return PathBuf::from(arg);
    }
    if let Some(env) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(env);
    }
    default_config_path()
}

fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("tracerelay").join("relay.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("tracerelay")
            .join("relay.toml")
    }
}
