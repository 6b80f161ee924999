//! Storage abstraction for the coordination core.
//!
//! All coordination state (channels, leases, documents, stage records) lives
//! in a shared external store so that independent, stateless invocations can
//! cooperate. The traits here name exactly the atomic primitives the core
//! needs; the `drivewatch` crate implements them on SQLite and [`memory`] provides
//! an in-process implementation for tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    Channel, DiscoveredDocument, DocumentMetadata, Lease, ProcessingStage, RecordOutcome,
    StageName,
};

/// Registry of watched folders and their currently registered channels.
///
/// Written only by registration; read by the relay on every inbound signal.
#[async_trait]
pub trait ChannelRegistry: Send + Sync {
    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>>;

    async fn get_channel_by_folder(&self, folder_id: &str) -> Result<Option<Channel>>;

    async fn list_channels(&self) -> Result<Vec<Channel>>;

    /// Insert or replace the channel for `channel.folder_id`. A folder has at
    /// most one active channel, so re-registration overwrites the old one.
    async fn upsert_channel(&self, channel: &Channel) -> Result<()>;
}

/// Per-channel lease records with an atomic conditional write.
///
/// | Method | Semantics |
/// |--------|-----------|
/// | [`seed_lease`](LeaseStore::seed_lease) | create unlocked with an initial cursor |
/// | [`acquire_lease`](LeaseStore::acquire_lease) | compare-and-swap on `locked` / `lock_expires_at` |
/// | [`release_lease`](LeaseStore::release_lease) | unlock and store the new cursor |
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create the lease unlocked with `cursor`, or reset the cursor of an
    /// existing unlocked lease. Fails with `LockHeld` if currently held.
    async fn seed_lease(&self, channel_id: &str, cursor: &str) -> Result<()>;

    /// Atomically take the lease if `!locked || lock_expires_at <= now`,
    /// setting `locked = true, lock_expires_at = until`. Returns the stored
    /// cursor on success, `LockHeld` if another holder's grant is still
    /// live, and `LeaseMissing` if the channel was never seeded.
    async fn acquire_lease(
        &self,
        channel_id: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<String>;

    /// Unlock the lease and store `cursor`. `granted_until` is the expiry
    /// handed out by the matching acquire; if the lease has since been
    /// reclaimed by someone else this returns `LeaseLost` and changes nothing.
    async fn release_lease(
        &self,
        channel_id: &str,
        granted_until: DateTime<Utc>,
        cursor: &str,
    ) -> Result<()>;

    async fn get_lease(&self, channel_id: &str) -> Result<Option<Lease>>;
}

/// Document idempotency records plus the per-document stage ledger.
#[async_trait]
pub trait DocumentLedger: Send + Sync {
    /// Single atomic insert-if-absent keyed by `external_id`. This is the
    /// permanent idempotency boundary; concurrent callers for the same file
    /// see exactly one `is_new = true`.
    async fn record_if_new(
        &self,
        external_id: &str,
        metadata: &DocumentMetadata,
    ) -> Result<RecordOutcome>;

    async fn get_document(&self, document_id: &str) -> Result<Option<DiscoveredDocument>>;

    /// Create (or restart) the record with `status = in-progress`. The
    /// ledger does not deduplicate starts; callers check [`get_stage`] first
    /// when retry safety matters.
    ///
    /// [`get_stage`]: DocumentLedger::get_stage
    async fn start_stage(
        &self,
        document_id: &str,
        stage: StageName,
        original_file_name: &str,
    ) -> Result<ProcessingStage>;

    /// Set `status = complete`, `completed_at`, `stage_file_name`, and
    /// `storage_key` from `record`. Only the attempt that started the record
    /// may complete it; otherwise `StageConflict`.
    async fn complete_stage(&self, record: &mut ProcessingStage) -> Result<()>;

    /// Set `status = error` with `detail`, under the same ownership rule as
    /// [`complete_stage`](DocumentLedger::complete_stage).
    async fn fail_stage(&self, record: &mut ProcessingStage, detail: &str) -> Result<()>;

    async fn get_stage(
        &self,
        document_id: &str,
        stage: &StageName,
    ) -> Result<Option<ProcessingStage>>;

    /// All stage records of a document, in pipeline order.
    async fn list_stages(&self, document_id: &str) -> Result<Vec<ProcessingStage>>;

    /// In-progress records started before `cutoff`.
    async fn list_stale_stages(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProcessingStage>>;

    /// Documents discovered before `cutoff` that have no stage record at
    /// all, oldest first. A document whose dispatch failed after it was
    /// recorded stays here until it is dispatched again.
    async fn list_unstarted_documents(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DiscoveredDocument>>;
}

/// Sort key placing built-in stages in pipeline order and custom stages after.
pub fn stage_order(stage: &StageName) -> usize {
    StageName::PIPELINE
        .iter()
        .position(|s| s == stage)
        .unwrap_or(StageName::PIPELINE.len())
}
