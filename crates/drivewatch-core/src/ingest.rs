//! Change ingestion engine.
//!
//! Turns a channel's change feed into a clean list of new-document events:
//!
//! 1. Acquire the channel's lease; the stored cursor is the resume point.
//! 2. Page through the feed sequentially from that cursor.
//! 3. Drop removals, files outside the watched folder, files with a
//!    mime type that is not accepted, and files already seen earlier in
//!    this same call.
//! 4. Follow continuation tokens until a page hands back a resume cursor.
//! 5. On a feed error, return without releasing: the lease expires on its
//!    own and the stored cursor is not advanced past unprocessed changes.
//! 6. On success, release the lease with the resume cursor.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{CoordError, Result};
use crate::feed::{ChangeEntry, ChangeFeed, PageContinuation};
use crate::lease::LeaseLock;
use crate::models::{DocumentEvent, DocumentMetadata};

/// Deduplicated result of one ingestion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    /// New-document events in feed order.
    pub documents: Vec<DocumentEvent>,
    /// Cursor stored on the lease for the next call.
    pub next_cursor: String,
    pub pages: usize,
    /// Entries dropped by the removal, folder, mime, or dedup filters.
    pub skipped: usize,
}

pub struct IngestEngine {
    lock: LeaseLock,
    feed: Arc<dyn ChangeFeed>,
    accept_mime_types: Vec<String>,
}

impl IngestEngine {
    pub fn new(lock: LeaseLock, feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            lock,
            feed,
            accept_mime_types: Vec::new(),
        }
    }

    /// Only emit files whose mime type is in `mime_types`. Empty accepts all.
    pub fn with_mime_filter(mut self, mime_types: Vec<String>) -> Self {
        self.accept_mime_types = mime_types;
        self
    }

    pub fn lock(&self) -> &LeaseLock {
        &self.lock
    }

    /// Page the feed for `channel_id` while holding its lease.
    ///
    /// Returns `LockHeld` immediately if another invocation is polling.
    pub async fn ingest(&self, channel_id: &str, folder_id: &str) -> Result<IngestOutcome> {
        let guard = self.lock.acquire(channel_id).await?;
        let start_cursor = guard.cursor().to_string();

        match self.collect(&start_cursor, folder_id).await {
            Ok(outcome) => {
                self.lock.release(guard, &outcome.next_cursor).await?;
                info!(
                    channel_id,
                    folder_id,
                    pages = outcome.pages,
                    documents = outcome.documents.len(),
                    skipped = outcome.skipped,
                    "ingested change feed"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(
                    channel_id,
                    folder_id,
                    cursor = %start_cursor,
                    error = %e,
                    "change feed paging failed; cursor not advanced"
                );
                self.lock.abandon(guard);
                Err(e)
            }
        }
    }

    async fn collect(&self, start_cursor: &str, folder_id: &str) -> Result<IngestOutcome> {
        let mut cursor = start_cursor.to_string();
        let mut seen: HashSet<String> = HashSet::new();
        let mut documents = Vec::new();
        let mut pages = 0usize;
        let mut skipped = 0usize;

        loop {
            let page = self.feed.get_changes(&cursor).await?;
            pages += 1;
            debug!(cursor = %cursor, entries = page.entries.len(), "fetched change page");

            for entry in page.entries {
                match self.accept(&entry, folder_id, &mut seen) {
                    Some(event) => documents.push(event),
                    None => skipped += 1,
                }
            }

            match page.continuation {
                PageContinuation::NextPage(token) => {
                    if token == cursor {
                        return Err(CoordError::FeedUnavailable(format!(
                            "feed returned a non-advancing page token: {}",
                            token
                        )));
                    }
                    cursor = token;
                }
                PageContinuation::Resume(next_cursor) => {
                    return Ok(IngestOutcome {
                        documents,
                        next_cursor,
                        pages,
                        skipped,
                    });
                }
            }
        }
    }

    fn accept(
        &self,
        entry: &ChangeEntry,
        folder_id: &str,
        seen: &mut HashSet<String>,
    ) -> Option<DocumentEvent> {
        if entry.is_removal() || !entry.has_parent(folder_id) {
            return None;
        }
        let file = entry.file.as_ref()?;

        if !self.accept_mime_types.is_empty() {
            let accepted = file
                .mime_type
                .as_ref()
                .map(|m| self.accept_mime_types.iter().any(|a| a == m))
                .unwrap_or(false);
            if !accepted {
                return None;
            }
        }

        if !seen.insert(entry.external_id.clone()) {
            debug!(external_id = %entry.external_id, "duplicate entry within one ingestion call");
            return None;
        }

        Some(DocumentEvent {
            external_id: entry.external_id.clone(),
            metadata: DocumentMetadata {
                parent_folder_id: folder_id.to_string(),
                display_name: file.name.clone(),
                byte_size: file.byte_size,
                mime_type: file.mime_type.clone(),
                external_created_at: file.created_at,
                external_modified_at: file.modified_at,
            },
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::feed::{ChangePage, FileMetadata};
    use crate::models::{now, Lease};
    use crate::store::memory::InMemoryStore;
    use crate::store::LeaseStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Feed serving canned pages keyed by cursor.
    #[derive(Default)]
    pub(crate) struct ScriptedFeed {
        pages: HashMap<String, ChangePage>,
        failing: HashSet<String>,
        pub(crate) requests: Mutex<Vec<String>>,
    }

    impl ScriptedFeed {
        pub(crate) fn page(mut self, cursor: &str, entries: Vec<ChangeEntry>, next: PageContinuation) -> Self {
            self.pages.insert(
                cursor.to_string(),
                ChangePage {
                    entries,
                    continuation: next,
                },
            );
            self
        }

        pub(crate) fn fail_at(mut self, cursor: &str) -> Self {
            self.failing.insert(cursor.to_string());
            self
        }
    }

    #[async_trait]
    impl ChangeFeed for ScriptedFeed {
        async fn get_changes(&self, cursor: &str) -> Result<ChangePage> {
            self.requests.lock().unwrap().push(cursor.to_string());
            if self.failing.contains(cursor) {
                return Err(CoordError::FeedUnavailable(format!("boom at {}", cursor)));
            }
            self.pages
                .get(cursor)
                .cloned()
                .ok_or_else(|| CoordError::FeedUnavailable(format!("no page for {}", cursor)))
        }

        async fn get_start_cursor(&self) -> Result<String> {
            Ok("START".to_string())
        }
    }

    pub(crate) fn file_entry(id: &str, parent: &str, removed: bool) -> ChangeEntry {
        ChangeEntry {
            external_id: id.to_string(),
            removed,
            file: Some(FileMetadata {
                name: format!("{}.pdf", id),
                parent_folder_ids: vec![parent.to_string()],
                byte_size: 1024,
                mime_type: Some("application/pdf".to_string()),
                created_at: None,
                modified_at: None,
                trashed: false,
            }),
        }
    }

    pub(crate) fn seeded_store(channel_id: &str, cursor: &str) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store
            .put_lease(Lease {
                channel_id: channel_id.into(),
                cursor: cursor.into(),
                locked: false,
                lock_expires_at: now(),
            })
            .unwrap();
        store
    }

    fn engine(store: Arc<InMemoryStore>, feed: ScriptedFeed) -> IngestEngine {
        IngestEngine::new(LeaseLock::new(store), Arc::new(feed))
    }

    #[tokio::test]
    async fn single_page_emits_document_and_stores_cursor() {
        let store = seeded_store("F1", "C0");
        let feed = ScriptedFeed::default().page(
            "C0",
            vec![file_entry("g1", "F1", false)],
            PageContinuation::Resume("C1".into()),
        );

        let outcome = engine(store.clone(), feed).ingest("F1", "F1").await.unwrap();
        assert_eq!(outcome.documents.len(), 1);
        assert_eq!(outcome.documents[0].external_id, "g1");
        assert_eq!(outcome.next_cursor, "C1");

        let lease = store.get_lease("F1").await.unwrap().unwrap();
        assert!(!lease.locked);
        assert_eq!(lease.cursor, "C1");
    }

    #[tokio::test]
    async fn removed_entry_is_skipped() {
        let store = seeded_store("F1", "C0");
        let feed = ScriptedFeed::default().page(
            "C0",
            vec![file_entry("g1", "F1", true)],
            PageContinuation::Resume("C1".into()),
        );

        let outcome = engine(store, feed).ingest("F1", "F1").await.unwrap();
        assert!(outcome.documents.is_empty());
        assert_eq!(outcome.skipped, 1);
    }

    #[tokio::test]
    async fn sibling_folder_and_trashed_entries_are_skipped() {
        let store = seeded_store("F1", "C0");
        let mut trashed = file_entry("g3", "F1", false);
        if let Some(f) = trashed.file.as_mut() {
            f.trashed = true;
        }
        let feed = ScriptedFeed::default().page(
            "C0",
            vec![file_entry("g2", "OTHER", false), trashed],
            PageContinuation::Resume("C1".into()),
        );

        let outcome = engine(store, feed).ingest("F1", "F1").await.unwrap();
        assert!(outcome.documents.is_empty());
        assert_eq!(outcome.skipped, 2);
    }

    #[tokio::test]
    async fn same_file_on_two_pages_is_emitted_once() {
        let store = seeded_store("F1", "C0");
        let feed = ScriptedFeed::default()
            .page(
                "C0",
                vec![file_entry("g1", "F1", false)],
                PageContinuation::NextPage("P2".into()),
            )
            .page(
                "P2",
                vec![file_entry("g1", "F1", false), file_entry("g2", "F1", false)],
                PageContinuation::Resume("C9".into()),
            );

        let outcome = engine(store, feed).ingest("F1", "F1").await.unwrap();
        let ids: Vec<_> = outcome
            .documents
            .iter()
            .map(|d| d.external_id.as_str())
            .collect();
        assert_eq!(ids, vec!["g1", "g2"]);
        assert_eq!(outcome.pages, 2);
        assert_eq!(outcome.next_cursor, "C9");
    }

    #[tokio::test]
    async fn failure_mid_paging_keeps_cursor_and_lease() {
        let store = seeded_store("F1", "C0");
        let feed = ScriptedFeed::default()
            .page(
                "C0",
                vec![file_entry("g1", "F1", false)],
                PageContinuation::NextPage("P2".into()),
            )
            .fail_at("P2")
            .page("P3", vec![], PageContinuation::Resume("C3".into()));

        let err = engine(store.clone(), feed)
            .ingest("F1", "F1")
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::FeedUnavailable(_)));

        let lease = store.get_lease("F1").await.unwrap().unwrap();
        assert_eq!(lease.cursor, "C0");
        assert!(lease.locked, "lease is left to expire on its own");
    }

    #[tokio::test]
    async fn concurrent_ingest_reports_lock_held() {
        let store = seeded_store("F1", "C0");
        let lock = LeaseLock::new(store.clone());
        let held = lock.acquire("F1").await.unwrap();

        let feed = ScriptedFeed::default().page("C0", vec![], PageContinuation::Resume("C1".into()));
        let engine = IngestEngine::new(lock.clone(), Arc::new(feed));
        let err = engine.ingest("F1", "F1").await.unwrap_err();
        assert!(err.is_lock_held());

        lock.release(held, "C0").await.unwrap();
    }

    #[tokio::test]
    async fn mime_filter_drops_other_types() {
        let store = seeded_store("F1", "C0");
        let mut image = file_entry("img", "F1", false);
        if let Some(f) = image.file.as_mut() {
            f.mime_type = Some("image/png".to_string());
        }
        let feed = ScriptedFeed::default().page(
            "C0",
            vec![image, file_entry("doc", "F1", false)],
            PageContinuation::Resume("C1".into()),
        );

        let outcome = engine(store, feed)
            .with_mime_filter(vec!["application/pdf".to_string()])
            .ingest("F1", "F1")
            .await
            .unwrap();
        assert_eq!(outcome.documents.len(), 1);
        assert_eq!(outcome.documents[0].external_id, "doc");
    }
}
