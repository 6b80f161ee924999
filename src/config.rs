use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub drive: DriveConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub blob: BlobConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Environment variable holding the HMAC secret for channel tokens.
    /// Unset disables token signing and verification.
    #[serde(default)]
    pub channel_token_secret_env: Option<String>,
}

impl ServerConfig {
    pub fn channel_token_secret(&self) -> Result<Option<String>> {
        match &self.channel_token_secret_env {
            None => Ok(None),
            Some(var) => std::env::var(var)
                .map(Some)
                .with_context(|| format!("channel token secret env var {} is not set", var)),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LeaseConfig {
    #[serde(default = "default_lease_secs")]
    pub duration_secs: i64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_lease_secs(),
        }
    }
}

fn default_lease_secs() -> i64 {
    drivewatch_core::lease::DEFAULT_LEASE_SECS
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: i64,
    #[serde(default = "default_max_receives")]
    pub max_receives: u32,
    #[serde(default = "default_queue_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Redelivery delay for a notification whose channel was being polled.
    #[serde(default = "default_lock_held_delay_secs")]
    pub lock_held_delay_secs: u64,
    /// Redelivery delay after any other handling failure.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_receives: default_max_receives(),
            batch_size: default_queue_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            lock_held_delay_secs: default_lock_held_delay_secs(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

fn default_visibility_timeout_secs() -> i64 {
    360
}
fn default_max_receives() -> u32 {
    5
}
fn default_queue_batch_size() -> u32 {
    10
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_lock_held_delay_secs() -> u64 {
    15
}
fn default_retry_delay_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct DriveConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_upload_base")]
    pub upload_base: String,
    /// Environment variable holding the OAuth bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_drive_timeout_secs")]
    pub timeout_secs: u64,
    /// Accepted mime types. Empty accepts every file.
    #[serde(default)]
    pub mime_types: Vec<String>,
    #[serde(default = "default_channel_ttl_hours")]
    pub channel_ttl_hours: i64,
    #[serde(default = "default_renew_before_mins")]
    pub renew_before_mins: i64,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            upload_base: default_upload_base(),
            token_env: default_token_env(),
            timeout_secs: default_drive_timeout_secs(),
            mime_types: Vec::new(),
            channel_ttl_hours: default_channel_ttl_hours(),
            renew_before_mins: default_renew_before_mins(),
        }
    }
}

impl DriveConfig {
    pub fn access_token(&self) -> Result<String> {
        std::env::var(&self.token_env)
            .with_context(|| format!("Drive access token env var {} is not set", self.token_env))
    }
}

fn default_api_base() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}
fn default_upload_base() -> String {
    "https://www.googleapis.com/upload/drive/v3".to_string()
}
fn default_token_env() -> String {
    "DRIVE_ACCESS_TOKEN".to_string()
}
fn default_drive_timeout_secs() -> u64 {
    30
}
fn default_channel_ttl_hours() -> i64 {
    48
}
fn default_renew_before_mins() -> i64 {
    60
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RegistrationConfig {
    /// Public URL of this deployment's `/webhook` endpoint.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl RegistrationConfig {
    pub fn require_webhook_url(&self) -> Result<&str> {
        self.webhook_url
            .as_deref()
            .context("registration.webhook_url must be set to register channels")
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowMode {
    /// Enqueue step inputs on the local pipeline queue.
    Queue,
    /// POST step inputs to an external workflow service.
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowConfig {
    #[serde(default = "default_workflow_mode")]
    pub mode: WorkflowMode,
    #[serde(default = "default_workflow_id")]
    pub workflow_id: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            mode: default_workflow_mode(),
            workflow_id: default_workflow_id(),
            endpoint: None,
        }
    }
}

fn default_workflow_mode() -> WorkflowMode {
    WorkflowMode::Queue
}
fn default_workflow_id() -> String {
    "document-pipeline".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// In-progress stages older than this are reported as stale.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: i64,
    #[serde(default)]
    pub default_destination_folder_id: Option<String>,
    #[serde(default)]
    pub ocr: Option<ConverterConfig>,
    #[serde(default)]
    pub cleanup: Option<ConverterConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: default_stage_timeout_secs(),
            default_destination_folder_id: None,
            ocr: None,
            cleanup: None,
        }
    }
}

fn default_stage_timeout_secs() -> i64 {
    900
}

/// An HTTP document converter: the artifact is POSTed as the request body
/// and the response body is the converted artifact.
#[derive(Debug, Deserialize, Clone)]
pub struct ConverterConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Extension given to the converted artifact, including the dot.
    pub output_extension: String,
    /// Content type of the converted artifact.
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Request timeout; the longest a conversion stage may run.
    #[serde(default = "default_converter_timeout_secs")]
    pub timeout_secs: i64,
}

impl ConverterConfig {
    pub fn api_key(&self) -> Result<Option<String>> {
        match &self.api_key_env {
            None => Ok(None),
            Some(var) => std::env::var(var)
                .map(Some)
                .with_context(|| format!("converter api key env var {} is not set", var)),
        }
    }
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}
fn default_converter_timeout_secs() -> i64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlobConfig {
    pub root: PathBuf,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/blobs"),
        }
    }
}

/// Upper bound for every configured duration, in seconds.
pub const MAX_DURATION_SECS: i64 = 366 * 24 * 60 * 60;

fn check_secs(name: &str, secs: i64) -> Result<()> {
    if secs <= 0 || secs > MAX_DURATION_SECS {
        anyhow::bail!(
            "{} must be between 1 and {} seconds, got {}",
            name,
            MAX_DURATION_SECS,
            secs
        );
    }
    Ok(())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    check_secs("lease.duration_secs", config.lease.duration_secs)?;
    check_secs(
        "queue.visibility_timeout_secs",
        config.queue.visibility_timeout_secs,
    )?;

    if config.queue.max_receives == 0 {
        anyhow::bail!("queue.max_receives must be >= 1");
    }
    if config.queue.batch_size == 0 {
        anyhow::bail!("queue.batch_size must be >= 1");
    }
    if config.queue.visibility_timeout_secs <= config.lease.duration_secs {
        anyhow::bail!(
            "queue.visibility_timeout_secs ({}) must exceed lease.duration_secs ({})",
            config.queue.visibility_timeout_secs,
            config.lease.duration_secs
        );
    }

    if config.drive.channel_ttl_hours <= 0
        || config.drive.channel_ttl_hours > MAX_DURATION_SECS / 3600
    {
        anyhow::bail!(
            "drive.channel_ttl_hours must be between 1 and {}",
            MAX_DURATION_SECS / 3600
        );
    }
    if config.drive.renew_before_mins < 0
        || config.drive.renew_before_mins > MAX_DURATION_SECS / 60
    {
        anyhow::bail!(
            "drive.renew_before_mins must be between 0 and {}",
            MAX_DURATION_SECS / 60
        );
    }

    if config.workflow.mode == WorkflowMode::Http && config.workflow.endpoint.is_none() {
        anyhow::bail!("workflow.endpoint must be specified when workflow.mode is 'http'");
    }

    check_secs(
        "pipeline.stage_timeout_secs",
        config.pipeline.stage_timeout_secs,
    )?;
    for (name, converter) in [
        ("ocr", &config.pipeline.ocr),
        ("cleanup", &config.pipeline.cleanup),
    ] {
        if let Some(c) = converter {
            if !c.output_extension.starts_with('.') {
                anyhow::bail!(
                    "pipeline.{}.output_extension must start with '.', got '{}'",
                    name,
                    c.output_extension
                );
            }
            check_secs(&format!("pipeline.{}.timeout_secs", name), c.timeout_secs)?;
            // A pipeline job must stay invisible, and its stage record fresh,
            // for as long as a single conversion may run.
            if c.timeout_secs >= config.queue.visibility_timeout_secs {
                anyhow::bail!(
                    "queue.visibility_timeout_secs ({}) must exceed pipeline.{}.timeout_secs ({})",
                    config.queue.visibility_timeout_secs,
                    name,
                    c.timeout_secs
                );
            }
            if c.timeout_secs >= config.pipeline.stage_timeout_secs {
                anyhow::bail!(
                    "pipeline.stage_timeout_secs ({}) must exceed pipeline.{}.timeout_secs ({})",
                    config.pipeline.stage_timeout_secs,
                    name,
                    c.timeout_secs
                );
            }
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "./data/dwatch.sqlite"

[server]
bind = "127.0.0.1:7410"
"#;

    #[test]
    fn minimal_config_fills_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.lease.duration_secs, 30);
        assert_eq!(config.queue.max_receives, 5);
        assert_eq!(config.queue.lock_held_delay_secs, 15);
        assert_eq!(config.drive.token_env, "DRIVE_ACCESS_TOKEN");
        assert_eq!(config.drive.channel_ttl_hours, 48);
        assert_eq!(config.workflow.mode, WorkflowMode::Queue);
        assert_eq!(config.pipeline.stage_timeout_secs, 900);
        assert!(config.registration.webhook_url.is_none());
        assert!(config.pipeline.ocr.is_none());
    }

    #[test]
    fn http_workflow_requires_endpoint() {
        let toml = format!("{}\n[workflow]\nmode = \"http\"\n", MINIMAL);
        let err = parse_config(&toml).unwrap_err();
        assert!(err.to_string().contains("workflow.endpoint"));
    }

    #[test]
    fn visibility_timeout_must_exceed_lease() {
        let toml = format!(
            "{}\n[lease]\nduration_secs = 90\n\n[queue]\nvisibility_timeout_secs = 60\n",
            MINIMAL
        );
        assert!(parse_config(&toml).is_err());
    }

    #[test]
    fn visibility_timeout_must_exceed_converter_timeout() {
        let toml = format!(
            "{}\n[queue]\nvisibility_timeout_secs = 120\n\n[pipeline.ocr]\nendpoint = \"http://ocr\"\noutput_extension = \".pdf\"\ntimeout_secs = 300\n",
            MINIMAL
        );
        let err = parse_config(&toml).unwrap_err();
        assert!(err.to_string().contains("pipeline.ocr.timeout_secs"));
    }

    #[test]
    fn stage_timeout_must_exceed_converter_timeout() {
        let toml = format!(
            "{}\n[pipeline]\nstage_timeout_secs = 200\n\n[pipeline.cleanup]\nendpoint = \"http://clean\"\noutput_extension = \".docx\"\n",
            MINIMAL
        );
        let err = parse_config(&toml).unwrap_err();
        assert!(err.to_string().contains("pipeline.stage_timeout_secs"));
    }

    #[test]
    fn out_of_range_durations_are_rejected() {
        let huge = format!("{}\n[lease]\nduration_secs = 9223372036854775807\n", MINIMAL);
        let err = parse_config(&huge).unwrap_err();
        assert!(err.to_string().contains("lease.duration_secs"));

        let ttl = format!("{}\n[drive]\nchannel_ttl_hours = 9223372036854775807\n", MINIMAL);
        assert!(parse_config(&ttl).is_err());

        let renew = format!("{}\n[drive]\nrenew_before_mins = -1\n", MINIMAL);
        assert!(parse_config(&renew).is_err());
    }

    #[test]
    fn converter_extension_needs_leading_dot() {
        let toml = format!(
            "{}\n[pipeline.ocr]\nendpoint = \"http://ocr\"\noutput_extension = \"pdf\"\n",
            MINIMAL
        );
        let err = parse_config(&toml).unwrap_err();
        assert!(err.to_string().contains("pipeline.ocr.output_extension"));
    }

    #[test]
    fn full_converter_section_parses() {
        let toml = format!(
            "{}\n[pipeline.cleanup]\nendpoint = \"http://clean\"\napi_key_env = \"CLEAN_KEY\"\noutput_extension = \".docx\"\ncontent_type = \"application/pdf\"\n",
            MINIMAL
        );
        let config = parse_config(&toml).unwrap();
        let cleanup = config.pipeline.cleanup.unwrap();
        assert_eq!(cleanup.output_extension, ".docx");
        assert_eq!(cleanup.api_key_env.as_deref(), Some("CLEAN_KEY"));
        assert_eq!(cleanup.timeout_secs, 300);
    }

    #[test]
    fn example_config_is_valid() {
        let config = parse_config(include_str!("../config/dwatch.example.toml")).unwrap();
        assert_eq!(config.queue.retry_delay_secs, 30);
        assert!(config.pipeline.ocr.is_some());
        assert_eq!(
            config.registration.require_webhook_url().unwrap(),
            "https://example.com/webhook"
        );
    }
}
