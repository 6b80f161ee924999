//! Core data models shared by the coordination core and the `drivewatch` crate.
//!
//! These are the logical record shapes persisted by every store backend:
//! [`Channel`], [`Lease`], [`DiscoveredDocument`], and [`ProcessingStage`],
//! plus the small messages that travel between components.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current time truncated to millisecond precision.
///
/// Every backend persists timestamps as epoch milliseconds, so records built
/// in memory use the same precision to compare equal after a round-trip.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// A watched folder and the push channel currently registered for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub folder_id: String,
    /// Rotates every time the channel is re-registered.
    pub channel_id: String,
    /// Opaque handle returned by the feed provider at registration.
    pub resource_id: String,
    pub webhook_url: String,
    pub expires_at: DateTime<Utc>,
    /// Where the pipeline publishes converted documents for this folder.
    pub destination_folder_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    /// True when the channel expires within `renew_before` or points at a
    /// different webhook than the one currently configured.
    pub fn needs_renewal(
        &self,
        now: DateTime<Utc>,
        renew_before: Duration,
        webhook_url: &str,
    ) -> bool {
        self.expires_at <= now + renew_before || self.webhook_url != webhook_url
    }
}

/// Mutual-exclusion record guarding a channel's change-feed cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub channel_id: String,
    /// Resume point in the change feed.
    pub cursor: String,
    pub locked: bool,
    pub lock_expires_at: DateTime<Utc>,
}

impl Lease {
    /// A lease may be taken when unlocked, or when the holder's grant has
    /// run out (`now >= lock_expires_at`).
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        !self.locked || self.lock_expires_at <= now
    }
}

/// Metadata the change feed reports for a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub parent_folder_id: String,
    pub display_name: String,
    pub byte_size: i64,
    pub mime_type: Option<String>,
    pub external_created_at: Option<DateTime<Utc>>,
    pub external_modified_at: Option<DateTime<Utc>>,
}

/// A new file observed by one ingestion call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentEvent {
    pub external_id: String,
    pub metadata: DocumentMetadata,
}

/// Permanent idempotency record for an external file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDocument {
    /// Internally generated key, distinct from `external_id`.
    pub id: String,
    pub external_id: String,
    pub parent_folder_id: String,
    pub display_name: String,
    pub byte_size: i64,
    pub mime_type: Option<String>,
    pub external_created_at: Option<DateTime<Utc>>,
    pub external_modified_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
}

impl DiscoveredDocument {
    pub fn new(id: String, external_id: &str, metadata: &DocumentMetadata) -> Self {
        Self {
            id,
            external_id: external_id.to_string(),
            parent_folder_id: metadata.parent_folder_id.clone(),
            display_name: metadata.display_name.clone(),
            byte_size: metadata.byte_size,
            mime_type: metadata.mime_type.clone(),
            external_created_at: metadata.external_created_at,
            external_modified_at: metadata.external_modified_at,
            discovered_at: now(),
        }
    }
}

/// Result of [`record_if_new`](crate::store::DocumentLedger::record_if_new).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub document_id: String,
    /// `false` when the external file was already recorded.
    pub is_new: bool,
}

/// Named step of the per-document pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum StageName {
    Download,
    OcrConvert,
    Cleanup,
    Publish,
    Custom(String),
}

impl StageName {
    /// Built-in stages in pipeline order.
    pub const PIPELINE: [StageName; 4] = [
        StageName::Download,
        StageName::OcrConvert,
        StageName::Cleanup,
        StageName::Publish,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            StageName::Download => "download",
            StageName::OcrConvert => "ocr-convert",
            StageName::Cleanup => "cleanup",
            StageName::Publish => "publish",
            StageName::Custom(name) => name,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for StageName {
    fn from(s: &str) -> Self {
        match s {
            "download" => StageName::Download,
            "ocr-convert" => StageName::OcrConvert,
            "cleanup" => StageName::Cleanup,
            "publish" => StageName::Publish,
            other => StageName::Custom(other.to_string()),
        }
    }
}

impl From<String> for StageName {
    fn from(s: String) -> Self {
        StageName::from(s.as_str())
    }
}

impl From<StageName> for String {
    fn from(stage: StageName) -> Self {
        stage.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    InProgress,
    Complete,
    Error,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::InProgress => "in-progress",
            StageStatus::Complete => "complete",
            StageStatus::Error => "error",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-progress" => Ok(StageStatus::InProgress),
            "complete" => Ok(StageStatus::Complete),
            "error" => Ok(StageStatus::Error),
            other => Err(format!("unknown stage status: '{}'", other)),
        }
    }
}

/// One (document, stage) record in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStage {
    pub document_id: String,
    pub stage: StageName,
    pub status: StageStatus,
    /// Fresh for every `start_stage`; completion and failure are fenced on it.
    pub attempt_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub original_file_name: String,
    /// Name of the artifact this stage produced.
    pub stage_file_name: Option<String>,
    /// Location of that artifact in the blob store.
    pub storage_key: Option<String>,
    /// Failure detail for `status = error`.
    pub detail: Option<String>,
}

impl ProcessingStage {
    pub fn start(document_id: &str, stage: StageName, original_file_name: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            stage,
            status: StageStatus::InProgress,
            attempt_id: Uuid::new_v4().to_string(),
            started_at: now(),
            completed_at: None,
            original_file_name: original_file_name.to_string(),
            stage_file_name: None,
            storage_key: None,
            detail: None,
        }
    }

    /// Marks the record complete. `completed_at` is always strictly after
    /// `started_at`, even when both fall in the same millisecond.
    pub fn mark_complete(&mut self, at: DateTime<Utc>) {
        let floor = self.started_at + Duration::milliseconds(1);
        self.completed_at = Some(at.max(floor));
        self.status = StageStatus::Complete;
    }

    pub fn mark_failed(&mut self, detail: impl Into<String>, at: DateTime<Utc>) {
        let floor = self.started_at + Duration::milliseconds(1);
        self.completed_at = Some(at.max(floor));
        self.status = StageStatus::Error;
        self.detail = Some(detail.into());
    }

    pub fn is_complete(&self) -> bool {
        self.status == StageStatus::Complete
    }

    /// An in-progress record older than `timeout` is a retry candidate.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status == StageStatus::InProgress && self.started_at + timeout < now
    }
}

/// Queue message produced by the relay for each accepted signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelNotification {
    pub notification_id: String,
    pub channel_id: String,
    pub folder_id: String,
}

/// Stage value carried by the first step of every workflow execution.
pub const STAGE_NEW: &str = "new";

/// Input record handed to the workflow execution service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInput {
    pub notification_id: String,
    pub document_id: String,
    pub stage: String,
}
