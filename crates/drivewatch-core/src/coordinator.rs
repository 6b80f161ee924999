//! Per-notification coordination: ingest, record, dispatch.
//!
//! One [`ChannelNotification`] drives one ingestion call for its channel.
//! Every event the engine emits passes through the ledger's atomic
//! `record_if_new`; only documents recorded for the first time are handed to
//! the dispatcher. A cursor replay after a crash therefore re-observes files
//! without starting them twice.

use std::sync::Arc;

use tracing::{error, info};

use crate::dispatch::PipelineDispatcher;
use crate::error::Result;
use crate::ingest::IngestEngine;
use crate::models::ChannelNotification;
use crate::store::DocumentLedger;

/// What one notification produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Events emitted by the engine after intra-call dedup.
    pub discovered: usize,
    pub recorded_new: usize,
    /// Events already present in the ledger.
    pub duplicates: usize,
    pub dispatched: usize,
    pub next_cursor: String,
}

pub struct IngestCoordinator {
    engine: IngestEngine,
    ledger: Arc<dyn DocumentLedger>,
    dispatcher: PipelineDispatcher,
}

impl IngestCoordinator {
    pub fn new(
        engine: IngestEngine,
        ledger: Arc<dyn DocumentLedger>,
        dispatcher: PipelineDispatcher,
    ) -> Self {
        Self {
            engine,
            ledger,
            dispatcher,
        }
    }

    pub fn engine(&self) -> &IngestEngine {
        &self.engine
    }

    /// Handle one queued notification.
    ///
    /// `LockHeld` and feed errors come straight from the engine. After a
    /// successful ingest every event is attempted; if any record or dispatch
    /// failed, the first such error is returned once the rest are done.
    pub async fn handle(&self, notification: &ChannelNotification) -> Result<IngestReport> {
        let outcome = self
            .engine
            .ingest(&notification.channel_id, &notification.folder_id)
            .await?;

        let mut report = IngestReport {
            discovered: outcome.documents.len(),
            next_cursor: outcome.next_cursor.clone(),
            ..Default::default()
        };
        let mut first_error = None;

        for event in &outcome.documents {
            let recorded = match self
                .ledger
                .record_if_new(&event.external_id, &event.metadata)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    error!(external_id = %event.external_id, error = %e, "failed to record document");
                    first_error.get_or_insert(e);
                    continue;
                }
            };

            if !recorded.is_new {
                report.duplicates += 1;
                continue;
            }
            report.recorded_new += 1;

            match self
                .dispatcher
                .dispatch(&notification.notification_id, &recorded.document_id)
                .await
            {
                Ok(_) => report.dispatched += 1,
                Err(e) => {
                    error!(
                        document_id = %recorded.document_id,
                        error = %e,
                        "recorded document was not dispatched"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            notification_id = %notification.notification_id,
            channel_id = %notification.channel_id,
            discovered = report.discovered,
            recorded_new = report.recorded_new,
            duplicates = report.duplicates,
            dispatched = report.dispatched,
            "notification handled"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::RecordingStarter;
    use crate::error::CoordError;
    use crate::feed::PageContinuation;
    use crate::ingest::tests::{file_entry, seeded_store, ScriptedFeed};
    use crate::lease::LeaseLock;
    use crate::store::memory::InMemoryStore;
    use crate::store::LeaseStore;

    fn notification(id: &str) -> ChannelNotification {
        ChannelNotification {
            notification_id: id.into(),
            channel_id: "ch-1".into(),
            folder_id: "F1".into(),
        }
    }

    fn coordinator(
        store: Arc<InMemoryStore>,
        feed: ScriptedFeed,
        starter: Arc<RecordingStarter>,
    ) -> IngestCoordinator {
        let engine = IngestEngine::new(LeaseLock::new(store.clone()), Arc::new(feed));
        IngestCoordinator::new(engine, store, PipelineDispatcher::new(starter, "pipeline"))
    }

    #[tokio::test]
    async fn new_documents_are_recorded_and_dispatched() {
        let store = seeded_store("ch-1", "C0");
        let feed = ScriptedFeed::default().page(
            "C0",
            vec![file_entry("g1", "F1", false), file_entry("g2", "F1", false)],
            PageContinuation::Resume("C1".into()),
        );
        let starter = Arc::new(RecordingStarter::default());

        let report = coordinator(store.clone(), feed, starter.clone())
            .handle(&notification("n-1"))
            .await
            .unwrap();

        assert_eq!(report.discovered, 2);
        assert_eq!(report.recorded_new, 2);
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.next_cursor, "C1");
        assert_eq!(store.document_count().unwrap(), 2);

        let started = starter.started.lock().unwrap();
        assert!(started.iter().all(|(_, input)| input.stage == "new"));
        assert!(started.iter().all(|(_, input)| input.notification_id == "n-1"));
    }

    #[tokio::test]
    async fn cursor_replay_does_not_dispatch_twice() {
        // Both calls start from C0, as after a crash between release and
        // processing; the second sees g1 again.
        let feed = || {
            ScriptedFeed::default().page(
                "C0",
                vec![file_entry("g1", "F1", false)],
                PageContinuation::Resume("C0".into()),
            )
        };
        let store = seeded_store("ch-1", "C0");
        let starter = Arc::new(RecordingStarter::default());

        let first = coordinator(store.clone(), feed(), starter.clone())
            .handle(&notification("n-1"))
            .await
            .unwrap();
        let second = coordinator(store.clone(), feed(), starter.clone())
            .handle(&notification("n-2"))
            .await
            .unwrap();

        assert_eq!(first.dispatched, 1);
        assert_eq!(second.duplicates, 1);
        assert_eq!(second.dispatched, 0);
        assert_eq!(starter.started.lock().unwrap().len(), 1);
        assert_eq!(store.document_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn lock_held_is_returned_without_recording() {
        let store = seeded_store("ch-1", "C0");
        let lock = LeaseLock::new(store.clone());
        let held = lock.acquire("ch-1").await.unwrap();

        let feed = ScriptedFeed::default().page(
            "C0",
            vec![file_entry("g1", "F1", false)],
            PageContinuation::Resume("C1".into()),
        );
        let starter = Arc::new(RecordingStarter::default());
        let err = coordinator(store.clone(), feed, starter)
            .handle(&notification("n-1"))
            .await
            .unwrap_err();

        assert!(err.is_lock_held());
        assert_eq!(store.document_count().unwrap(), 0);
        lock.release(held, "C0").await.unwrap();
    }

    #[tokio::test]
    async fn dispatch_failure_still_records_every_document() {
        let store = seeded_store("ch-1", "C0");
        let feed = ScriptedFeed::default().page(
            "C0",
            vec![file_entry("g1", "F1", false), file_entry("g2", "F1", false)],
            PageContinuation::Resume("C1".into()),
        );
        let starter = Arc::new(RecordingStarter {
            fail: true,
            ..Default::default()
        });

        let err = coordinator(store.clone(), feed, starter)
            .handle(&notification("n-1"))
            .await
            .unwrap_err();

        assert!(matches!(err, CoordError::Workflow(_)));
        assert_eq!(store.document_count().unwrap(), 2);
        let lease = store.get_lease("ch-1").await.unwrap().unwrap();
        assert_eq!(lease.cursor, "C1");
    }
}
