//! Per-document processing pipeline.
//!
//! A pipeline is an ordered list of [`Stage`]s run against one discovered
//! document. Progress lives entirely in the document ledger, so a runner
//! handed the same document twice picks up where the last run stopped:
//!
//! 1. Stages whose record is already `complete` are skipped.
//! 2. A stage whose record is `in-progress` and younger than the stage
//!    timeout belongs to another run; the runner stops with
//!    [`CoordError::StageBusy`] so the job is retried later.
//! 3. Every other stage (no record, `error`, or stale) is started,
//!    run, and then completed with the artifact it produced.
//! 4. A stage body that fails marks its record `error` with the failure
//!    detail and stops the run. Earlier completed stages are left as they
//!    are; nothing is rolled back.
//!
//! # Default stages
//!
//! | Stage | Input | Output |
//! |-------|-------|--------|
//! | `download` | Drive file | `staging/<name>-<ts><ext>` in the blob store |
//! | `ocr-convert` | previous artifact | converter response, `<stage>/<doc>/<base><ext>` |
//! | `cleanup` | previous artifact | converter response, `<stage>/<doc>/<base><ext>` |
//! | `publish` | previous artifact | Drive file `<base><ext>` in the destination folder |
//!
//! Converter stages are only present when their `[pipeline.*]` section is
//! configured; each stage reads whichever stage precedes it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use tracing::{error, info, warn};

use drivewatch_core::models::{now, DiscoveredDocument, StageName, StageStatus};
use drivewatch_core::store::{ChannelRegistry, DocumentLedger};
use drivewatch_core::CoordError;

use crate::blob::BlobStore;
use crate::config::{Config, ConverterConfig};
use crate::drive::DriveClient;

// ═══════════════════════════════════════════════════════════════════════
// Collaborators
// ═══════════════════════════════════════════════════════════════════════

/// File transfer against the feed provider.
#[async_trait]
pub trait DriveFiles: Send + Sync {
    async fn download(&self, file_id: &str) -> Result<Vec<u8>>;

    /// Returns the new file id.
    async fn upload(
        &self,
        parent_folder_id: &str,
        name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String>;
}

#[async_trait]
impl DriveFiles for DriveClient {
    async fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        Ok(DriveClient::download(self, file_id).await?)
    }

    async fn upload(
        &self,
        parent_folder_id: &str,
        name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        Ok(DriveClient::upload(self, parent_folder_id, name, content_type, bytes).await?)
    }
}

/// An external document conversion service.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, file_name: &str, bytes: Vec<u8>) -> Result<Vec<u8>>;
}

/// POSTs the artifact as the request body; the response body is the result.
pub struct HttpConverter {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpConverter {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    pub fn from_config(config: &ConverterConfig) -> Result<Self> {
        let timeout = Duration::from_secs(u64::try_from(config.timeout_secs)?);
        Self::new(&config.endpoint, config.api_key()?, timeout)
    }
}

#[async_trait]
impl Converter for HttpConverter {
    async fn convert(&self, file_name: &str, bytes: Vec<u8>) -> Result<Vec<u8>> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header("X-File-Name", file_name)
            .body(bytes);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("converter request to {} failed", self.endpoint))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "converter {} returned HTTP {}: {}",
                self.endpoint,
                status,
                body.chars().take(500).collect::<String>()
            );
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Stages
// ═══════════════════════════════════════════════════════════════════════

/// What a stage body hands back to the runner for `complete_stage`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutput {
    pub stage_file_name: String,
    pub storage_key: Option<String>,
}

/// Everything a stage body may read about the document being processed.
pub struct StageContext<'a> {
    pub document: &'a DiscoveredDocument,
    /// Publish target resolved from the folder's channel or the default.
    pub destination_folder_id: Option<&'a str>,
    pub ledger: &'a dyn DocumentLedger,
}

impl StageContext<'_> {
    /// The completed artifact left by `stage`.
    pub async fn artifact_of(&self, stage: &StageName) -> Result<(String, String)> {
        let record = self
            .ledger
            .get_stage(&self.document.id, stage)
            .await?
            .ok_or_else(|| anyhow!("stage {} has no record for {}", stage, self.document.id))?;
        if !record.is_complete() {
            bail!("stage {} is {} for {}", stage, record.status, self.document.id);
        }
        match (record.stage_file_name, record.storage_key) {
            (Some(name), Some(key)) => Ok((name, key)),
            _ => bail!("stage {} left no artifact for {}", stage, self.document.id),
        }
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutput>;
}

/// Splits `scan.final.pdf` into (`scan.final`, `.pdf`). Dot-files and
/// names without a dot have an empty extension.
pub fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

pub struct DownloadStage {
    drive: Arc<dyn DriveFiles>,
    blobs: Arc<dyn BlobStore>,
}

impl DownloadStage {
    pub fn new(drive: Arc<dyn DriveFiles>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { drive, blobs }
    }
}

#[async_trait]
impl Stage for DownloadStage {
    fn name(&self) -> StageName {
        StageName::Download
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutput> {
        let bytes = self.drive.download(&ctx.document.external_id).await?;
        let (stem, ext) = split_name(&ctx.document.display_name);
        let file_name = format!("{}-{}{}", stem, now().timestamp_millis(), ext);
        let key = self
            .blobs
            .put(&format!("staging/{}", file_name), &bytes)
            .await?;
        Ok(StageOutput {
            stage_file_name: file_name,
            storage_key: Some(key),
        })
    }
}

/// Sends the previous stage's artifact through a [`Converter`].
pub struct ConvertStage {
    name: StageName,
    input: StageName,
    converter: Arc<dyn Converter>,
    output_extension: String,
    blobs: Arc<dyn BlobStore>,
}

impl ConvertStage {
    pub fn new(
        name: StageName,
        input: StageName,
        converter: Arc<dyn Converter>,
        output_extension: impl Into<String>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            name,
            input,
            converter,
            output_extension: output_extension.into(),
            blobs,
        }
    }
}

#[async_trait]
impl Stage for ConvertStage {
    fn name(&self) -> StageName {
        self.name.clone()
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutput> {
        let (input_name, input_key) = ctx.artifact_of(&self.input).await?;
        let bytes = self.blobs.get(&input_key).await?;
        let converted = self.converter.convert(&input_name, bytes).await?;

        let (stem, _) = split_name(&input_name);
        let file_name = format!("{}{}", stem, self.output_extension);
        let key = self
            .blobs
            .put(
                &format!("{}/{}/{}", self.name, ctx.document.id, file_name),
                &converted,
            )
            .await?;
        Ok(StageOutput {
            stage_file_name: file_name,
            storage_key: Some(key),
        })
    }
}

/// Uploads the final artifact under the document's original base name.
pub struct PublishStage {
    input: StageName,
    drive: Arc<dyn DriveFiles>,
    blobs: Arc<dyn BlobStore>,
    content_type: String,
}

impl PublishStage {
    pub fn new(
        input: StageName,
        drive: Arc<dyn DriveFiles>,
        blobs: Arc<dyn BlobStore>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            input,
            drive,
            blobs,
            content_type: content_type.into(),
        }
    }
}

#[async_trait]
impl Stage for PublishStage {
    fn name(&self) -> StageName {
        StageName::Publish
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutput> {
        let destination = ctx.destination_folder_id.ok_or_else(|| {
            anyhow!(
                "no destination folder for {} (folder {})",
                ctx.document.id,
                ctx.document.parent_folder_id
            )
        })?;
        let (input_name, input_key) = ctx.artifact_of(&self.input).await?;
        let bytes = self.blobs.get(&input_key).await?;

        let (base, _) = split_name(&ctx.document.display_name);
        let (_, ext) = split_name(&input_name);
        let file_name = format!("{}{}", base, ext);
        let file_id = self
            .drive
            .upload(destination, &file_name, &self.content_type, bytes)
            .await?;
        Ok(StageOutput {
            stage_file_name: file_name,
            storage_key: Some(format!("drive:{}", file_id)),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Runner
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub completed: Vec<StageName>,
    /// Stages already complete from an earlier run.
    pub skipped: Vec<StageName>,
}

pub struct PipelineRunner {
    ledger: Arc<dyn DocumentLedger>,
    registry: Arc<dyn ChannelRegistry>,
    stages: Vec<Box<dyn Stage>>,
    default_destination: Option<String>,
    stage_timeout: ChronoDuration,
}

pub const DEFAULT_STAGE_TIMEOUT_SECS: i64 = 900;

impl PipelineRunner {
    pub fn new(
        ledger: Arc<dyn DocumentLedger>,
        registry: Arc<dyn ChannelRegistry>,
        stages: Vec<Box<dyn Stage>>,
    ) -> Self {
        Self {
            ledger,
            registry,
            stages,
            default_destination: None,
            stage_timeout: ChronoDuration::seconds(DEFAULT_STAGE_TIMEOUT_SECS),
        }
    }

    /// How long an `in-progress` stage is left to its owner before another
    /// run may restart it.
    pub fn with_stage_timeout(mut self, timeout: ChronoDuration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_default_destination(mut self, folder_id: Option<String>) -> Self {
        self.default_destination = folder_id;
        self
    }

    /// Build the configured stage list: download, the configured converters
    /// in order, then publish.
    pub fn from_config(
        config: &Config,
        ledger: Arc<dyn DocumentLedger>,
        registry: Arc<dyn ChannelRegistry>,
        drive: Arc<dyn DriveFiles>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        let mut stages: Vec<Box<dyn Stage>> =
            vec![Box::new(DownloadStage::new(drive.clone(), blobs.clone()))];
        let mut previous = StageName::Download;
        let mut content_type = "application/octet-stream".to_string();

        for (name, converter) in [
            (StageName::OcrConvert, &config.pipeline.ocr),
            (StageName::Cleanup, &config.pipeline.cleanup),
        ] {
            let Some(cfg) = converter else {
                continue;
            };
            stages.push(Box::new(ConvertStage::new(
                name.clone(),
                previous,
                Arc::new(HttpConverter::from_config(cfg)?),
                &cfg.output_extension,
                blobs.clone(),
            )));
            previous = name;
            content_type = cfg.content_type.clone();
        }
        stages.push(Box::new(PublishStage::new(
            previous,
            drive,
            blobs,
            content_type,
        )));

        let stage_timeout = ChronoDuration::try_seconds(config.pipeline.stage_timeout_secs)
            .context("pipeline.stage_timeout_secs is out of range")?;
        Ok(Self::new(ledger, registry, stages)
            .with_default_destination(config.pipeline.default_destination_folder_id.clone())
            .with_stage_timeout(stage_timeout))
    }

    async fn destination_for(&self, document: &DiscoveredDocument) -> Result<Option<String>> {
        let from_channel = self
            .registry
            .get_channel_by_folder(&document.parent_folder_id)
            .await?
            .and_then(|c| c.destination_folder_id);
        Ok(from_channel.or_else(|| self.default_destination.clone()))
    }

    /// Run every stage not yet complete for `document_id`.
    pub async fn run(&self, document_id: &str) -> Result<PipelineReport> {
        let document = self
            .ledger
            .get_document(document_id)
            .await?
            .ok_or_else(|| CoordError::not_found("document", document_id))?;
        let destination = self.destination_for(&document).await?;
        let ctx = StageContext {
            document: &document,
            destination_folder_id: destination.as_deref(),
            ledger: self.ledger.as_ref(),
        };

        let mut report = PipelineReport::default();
        for stage in &self.stages {
            let name = stage.name();
            if let Some(existing) = self.ledger.get_stage(document_id, &name).await? {
                if existing.is_complete() {
                    report.skipped.push(name);
                    continue;
                }
                if existing.status == StageStatus::InProgress {
                    let at = now();
                    if !existing.is_stale(at, self.stage_timeout) {
                        let remaining = existing.started_at + self.stage_timeout - at;
                        return Err(CoordError::StageBusy {
                            document_id: document_id.to_string(),
                            stage: name.to_string(),
                            retry_after_secs: u64::try_from(remaining.num_seconds()).unwrap_or(0)
                                + 1,
                        }
                        .into());
                    }
                    warn!(
                        document_id,
                        stage = %name,
                        started_at = %existing.started_at,
                        "restarting stale stage"
                    );
                }
            }

            let mut record = self
                .ledger
                .start_stage(document_id, name.clone(), &document.display_name)
                .await?;
            info!(document_id, stage = %name, "stage started");

            match stage.run(&ctx).await {
                Ok(output) => {
                    record.stage_file_name = Some(output.stage_file_name);
                    record.storage_key = output.storage_key;
                    self.ledger.complete_stage(&mut record).await?;
                    info!(document_id, stage = %name, "stage complete");
                    report.completed.push(name);
                }
                Err(e) => {
                    error!(document_id, stage = %name, error = %e, "stage failed");
                    if let Err(mark) = self.ledger.fail_stage(&mut record, &format!("{:#}", e)).await {
                        error!(document_id, stage = %name, error = %mark, "could not record stage failure");
                    }
                    return Err(e.context(format!("stage {} failed for {}", name, document_id)));
                }
            }
        }
        Ok(report)
    }
}
