//! In-memory store implementing every coordination trait.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Each conditional write holds
//! the write lock for the whole check-and-set, which gives the same
//! atomicity the SQLite backend gets from a single conditional statement.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{CoordError, Result};
use crate::models::{
    now, Channel, DiscoveredDocument, DocumentMetadata, Lease, ProcessingStage, RecordOutcome,
    StageName, StageStatus,
};

use super::{stage_order, ChannelRegistry, DocumentLedger, LeaseStore};

/// In-memory store for tests and single-process runs.
pub struct InMemoryStore {
    channels: RwLock<HashMap<String, Channel>>,
    leases: RwLock<HashMap<String, Lease>>,
    documents: RwLock<HashMap<String, DiscoveredDocument>>,
    /// external_id -> document id
    by_external: RwLock<HashMap<String, String>>,
    stages: RwLock<HashMap<(String, String), ProcessingStage>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            leases: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
            by_external: RwLock::new(HashMap::new()),
            stages: RwLock::new(HashMap::new()),
        }
    }

    /// Overwrite a lease record verbatim. Used to simulate a crashed holder.
    pub fn put_lease(&self, lease: Lease) -> Result<()> {
        write(&self.leases)?.insert(lease.channel_id.clone(), lease);
        Ok(())
    }

    pub fn document_count(&self) -> Result<usize> {
        Ok(read(&self.documents)?.len())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| CoordError::Store("in-memory store lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| CoordError::Store("in-memory store lock poisoned".to_string()))
}

fn stage_key(document_id: &str, stage: &StageName) -> (String, String) {
    (document_id.to_string(), stage.as_str().to_string())
}

#[async_trait]
impl ChannelRegistry for InMemoryStore {
    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>> {
        let channels = read(&self.channels)?;
        Ok(channels
            .values()
            .find(|c| c.channel_id == channel_id)
            .cloned())
    }

    async fn get_channel_by_folder(&self, folder_id: &str) -> Result<Option<Channel>> {
        Ok(read(&self.channels)?.get(folder_id).cloned())
    }

    async fn list_channels(&self) -> Result<Vec<Channel>> {
        let mut all: Vec<Channel> = read(&self.channels)?.values().cloned().collect();
        all.sort_by(|a, b| a.folder_id.cmp(&b.folder_id));
        Ok(all)
    }

    async fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        write(&self.channels)?.insert(channel.folder_id.clone(), channel.clone());
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for InMemoryStore {
    async fn seed_lease(&self, channel_id: &str, cursor: &str) -> Result<()> {
        let mut leases = write(&self.leases)?;
        if let Some(existing) = leases.get(channel_id) {
            if !existing.is_available(now()) {
                return Err(CoordError::LockHeld(channel_id.to_string()));
            }
        }
        leases.insert(
            channel_id.to_string(),
            Lease {
                channel_id: channel_id.to_string(),
                cursor: cursor.to_string(),
                locked: false,
                lock_expires_at: now(),
            },
        );
        Ok(())
    }

    async fn acquire_lease(
        &self,
        channel_id: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<String> {
        let mut leases = write(&self.leases)?;
        let lease = leases
            .get_mut(channel_id)
            .ok_or_else(|| CoordError::LeaseMissing(channel_id.to_string()))?;
        if !lease.is_available(now) {
            return Err(CoordError::LockHeld(channel_id.to_string()));
        }
        lease.locked = true;
        lease.lock_expires_at = until;
        Ok(lease.cursor.clone())
    }

    async fn release_lease(
        &self,
        channel_id: &str,
        granted_until: DateTime<Utc>,
        cursor: &str,
    ) -> Result<()> {
        let mut leases = write(&self.leases)?;
        let lease = leases
            .get_mut(channel_id)
            .ok_or_else(|| CoordError::LeaseMissing(channel_id.to_string()))?;
        if !lease.locked || lease.lock_expires_at != granted_until {
            return Err(CoordError::LeaseLost(channel_id.to_string()));
        }
        lease.locked = false;
        lease.cursor = cursor.to_string();
        Ok(())
    }

    async fn get_lease(&self, channel_id: &str) -> Result<Option<Lease>> {
        Ok(read(&self.leases)?.get(channel_id).cloned())
    }
}

#[async_trait]
impl DocumentLedger for InMemoryStore {
    async fn record_if_new(
        &self,
        external_id: &str,
        metadata: &DocumentMetadata,
    ) -> Result<RecordOutcome> {
        let mut by_external = write(&self.by_external)?;
        if let Some(existing) = by_external.get(external_id) {
            return Ok(RecordOutcome {
                document_id: existing.clone(),
                is_new: false,
            });
        }

        let doc = DiscoveredDocument::new(Uuid::new_v4().to_string(), external_id, metadata);
        let document_id = doc.id.clone();
        by_external.insert(external_id.to_string(), document_id.clone());
        write(&self.documents)?.insert(document_id.clone(), doc);

        Ok(RecordOutcome {
            document_id,
            is_new: true,
        })
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<DiscoveredDocument>> {
        Ok(read(&self.documents)?.get(document_id).cloned())
    }

    async fn start_stage(
        &self,
        document_id: &str,
        stage: StageName,
        original_file_name: &str,
    ) -> Result<ProcessingStage> {
        let record = ProcessingStage::start(document_id, stage, original_file_name);
        write(&self.stages)?.insert(stage_key(document_id, &record.stage), record.clone());
        Ok(record)
    }

    async fn complete_stage(&self, record: &mut ProcessingStage) -> Result<()> {
        let mut stages = write(&self.stages)?;
        let stored = owned_stage(&mut stages, record)?;
        record.mark_complete(now());
        *stored = record.clone();
        Ok(())
    }

    async fn fail_stage(&self, record: &mut ProcessingStage, detail: &str) -> Result<()> {
        let mut stages = write(&self.stages)?;
        let stored = owned_stage(&mut stages, record)?;
        record.mark_failed(detail, now());
        *stored = record.clone();
        Ok(())
    }

    async fn get_stage(
        &self,
        document_id: &str,
        stage: &StageName,
    ) -> Result<Option<ProcessingStage>> {
        Ok(read(&self.stages)?
            .get(&stage_key(document_id, stage))
            .cloned())
    }

    async fn list_stages(&self, document_id: &str) -> Result<Vec<ProcessingStage>> {
        let mut records: Vec<ProcessingStage> = read(&self.stages)?
            .values()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| (stage_order(&r.stage), r.started_at));
        Ok(records)
    }

    async fn list_stale_stages(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProcessingStage>> {
        let mut records: Vec<ProcessingStage> = read(&self.stages)?
            .values()
            .filter(|r| r.status == StageStatus::InProgress && r.started_at < cutoff)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }

    async fn list_unstarted_documents(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DiscoveredDocument>> {
        let stages = read(&self.stages)?;
        let mut docs: Vec<DiscoveredDocument> = read(&self.documents)?
            .values()
            .filter(|d| d.discovered_at < cutoff)
            .filter(|d| !stages.values().any(|r| r.document_id == d.id))
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.discovered_at);
        Ok(docs)
    }
}

/// Looks up the stored record and checks that `record` is the attempt that
/// started it and that it is still in progress.
fn owned_stage<'a>(
    stages: &'a mut HashMap<(String, String), ProcessingStage>,
    record: &ProcessingStage,
) -> Result<&'a mut ProcessingStage> {
    let conflict = || CoordError::StageConflict {
        document_id: record.document_id.clone(),
        stage: record.stage.to_string(),
    };
    let stored = stages
        .get_mut(&stage_key(&record.document_id, &record.stage))
        .ok_or_else(conflict)?;
    if stored.status != StageStatus::InProgress || stored.attempt_id != record.attempt_id {
        return Err(conflict());
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn meta(name: &str) -> DocumentMetadata {
        DocumentMetadata {
            parent_folder_id: "F1".to_string(),
            display_name: name.to_string(),
            byte_size: 42,
            mime_type: Some("application/pdf".to_string()),
            external_created_at: None,
            external_modified_at: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_record_if_new_yields_one_winner() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.record_if_new("g1", &meta("scan.pdf")).await.unwrap()
            }));
        }

        let mut outcomes = Vec::new();
        for h in handles {
            outcomes.push(h.await.unwrap());
        }

        let winners: Vec<_> = outcomes.iter().filter(|o| o.is_new).collect();
        assert_eq!(winners.len(), 1);
        assert!(outcomes
            .iter()
            .all(|o| o.document_id == winners[0].document_id));
        assert_eq!(store.document_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn document_id_differs_from_external_id() {
        let store = InMemoryStore::new();
        let outcome = store.record_if_new("g1", &meta("a.pdf")).await.unwrap();
        assert_ne!(outcome.document_id, "g1");
        let doc = store
            .get_document(&outcome.document_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.external_id, "g1");
        assert_eq!(doc.display_name, "a.pdf");
    }

    #[tokio::test]
    async fn stage_lifecycle_persists_artifact_fields() {
        let store = InMemoryStore::new();
        let mut rec = store
            .start_stage("doc-1", StageName::Download, "scan.pdf")
            .await
            .unwrap();
        assert_eq!(rec.status, StageStatus::InProgress);

        rec.stage_file_name = Some("scan-1.pdf".to_string());
        rec.storage_key = Some("staging/scan-1.pdf".to_string());
        store.complete_stage(&mut rec).await.unwrap();

        let stored = store
            .get_stage("doc-1", &StageName::Download)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, StageStatus::Complete);
        assert!(stored.completed_at.unwrap() > stored.started_at);
        assert_eq!(stored.storage_key.as_deref(), Some("staging/scan-1.pdf"));
    }

    #[tokio::test]
    async fn stale_attempt_cannot_complete_restarted_stage() {
        let store = InMemoryStore::new();
        let mut first = store
            .start_stage("doc-1", StageName::Cleanup, "a.pdf")
            .await
            .unwrap();
        let mut second = store
            .start_stage("doc-1", StageName::Cleanup, "a.pdf")
            .await
            .unwrap();
        assert_ne!(first.attempt_id, second.attempt_id);

        // Both attempts look identical apart from the attempt id.
        first.started_at = second.started_at;
        let err = store.complete_stage(&mut first).await.unwrap_err();
        assert!(matches!(err, CoordError::StageConflict { .. }));
        store.complete_stage(&mut second).await.unwrap();
        let err = store.complete_stage(&mut second).await.unwrap_err();
        assert!(matches!(err, CoordError::StageConflict { .. }));
    }

    #[tokio::test]
    async fn stale_listing_ignores_finished_records() {
        let store = InMemoryStore::new();
        let mut done = store
            .start_stage("doc-1", StageName::Download, "a.pdf")
            .await
            .unwrap();
        store.complete_stage(&mut done).await.unwrap();
        store
            .start_stage("doc-1", StageName::OcrConvert, "a.pdf")
            .await
            .unwrap();

        let stale = store
            .list_stale_stages(now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].stage, StageName::OcrConvert);

        let all = store.list_stages("doc-1").await.unwrap();
        assert_eq!(all[0].stage, StageName::Download);
        assert_eq!(all[1].stage, StageName::OcrConvert);
    }

    #[tokio::test]
    async fn unstarted_documents_exclude_those_with_stages() {
        let store = InMemoryStore::new();
        let idle = store.record_if_new("g1", &meta("a.pdf")).await.unwrap();
        let busy = store.record_if_new("g2", &meta("b.pdf")).await.unwrap();
        store
            .start_stage(&busy.document_id, StageName::Download, "b.pdf")
            .await
            .unwrap();

        assert!(store
            .list_unstarted_documents(now() - Duration::minutes(5))
            .await
            .unwrap()
            .is_empty());
        let unstarted = store
            .list_unstarted_documents(now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(unstarted.len(), 1);
        assert_eq!(unstarted[0].id, idle.document_id);
    }
}
