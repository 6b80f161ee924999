//! Queue consumers.
//!
//! `dwatch work notifications` drains the notifications queue through the
//! [`IngestCoordinator`]; `dwatch work pipeline` drains the pipeline queue
//! through the [`PipelineRunner`]. Both share one receive/ack/nack loop:
//!
//! | Handler result | Queue action |
//! |----------------|--------------|
//! | success | ack |
//! | channel lease held | nack, redeliver after `lock_held_delay_secs` |
//! | pipeline stage running elsewhere | nack, redeliver once that stage could be stale |
//! | undecodable body, unknown document, unseeded lease | ack and log (dropped) |
//! | any other failure | nack, redeliver after `retry_delay_secs` |
//!
//! A message that keeps failing is dead-lettered by the queue once it has
//! been delivered `max_receives` times.
//!
//! Shutdown is only observed between batches: a batch that has been
//! received always runs to completion, because an ingest that has already
//! advanced a channel cursor must go on to record what it found.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use drivewatch_core::coordinator::IngestCoordinator;
use drivewatch_core::dispatch::PipelineDispatcher;
use drivewatch_core::ingest::IngestEngine;
use drivewatch_core::lease::LeaseLock;
use drivewatch_core::models::ChannelNotification;
use drivewatch_core::queue::{MessageQueue, QueuedMessage};
use drivewatch_core::CoordError;

use crate::blob::FsBlobStore;
use crate::config::{Config, QueueConfig};
use crate::db;
use crate::drive::DriveClient;
use crate::pipeline::PipelineRunner;
use crate::sqlite_queue::{SqliteQueue, NOTIFICATIONS_QUEUE, PIPELINE_QUEUE};
use crate::sqlite_store::SqliteStore;
use crate::workflow::{starter_from_config, PipelineJob};

/// What to do with a message after handling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Drop the message without retrying.
    Discard,
    Retry(Duration),
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &QueuedMessage) -> Disposition;
}

pub struct NotificationHandler {
    coordinator: IngestCoordinator,
    lock_held_delay: Duration,
    retry_delay: Duration,
}

impl NotificationHandler {
    pub fn new(coordinator: IngestCoordinator, queue: &QueueConfig) -> Self {
        Self {
            coordinator,
            lock_held_delay: Duration::from_secs(queue.lock_held_delay_secs),
            retry_delay: Duration::from_secs(queue.retry_delay_secs),
        }
    }
}

#[async_trait]
impl MessageHandler for NotificationHandler {
    async fn handle(&self, message: &QueuedMessage) -> Disposition {
        let notification: ChannelNotification = match serde_json::from_str(&message.body) {
            Ok(n) => n,
            Err(e) => {
                error!(message_id = %message.id, error = %e, "undecodable notification dropped");
                return Disposition::Discard;
            }
        };

        match self.coordinator.handle(&notification).await {
            Ok(report) => {
                info!(
                    channel_id = %notification.channel_id,
                    folder_id = %notification.folder_id,
                    discovered = report.discovered,
                    recorded_new = report.recorded_new,
                    duplicates = report.duplicates,
                    dispatched = report.dispatched,
                    "notification handled"
                );
                Disposition::Ack
            }
            Err(CoordError::LockHeld(channel_id)) => {
                debug!(%channel_id, "channel busy; notification deferred");
                Disposition::Retry(self.lock_held_delay)
            }
            Err(e @ CoordError::LeaseMissing(_)) => {
                error!(channel_id = %notification.channel_id, error = %e, "notification dropped");
                Disposition::Discard
            }
            Err(e) => {
                warn!(
                    channel_id = %notification.channel_id,
                    receive_count = message.receive_count,
                    error = %e,
                    "notification failed; will retry"
                );
                Disposition::Retry(self.retry_delay)
            }
        }
    }
}

pub struct PipelineHandler {
    runner: PipelineRunner,
    retry_delay: Duration,
}

impl PipelineHandler {
    pub fn new(runner: PipelineRunner, queue: &QueueConfig) -> Self {
        Self {
            runner,
            retry_delay: Duration::from_secs(queue.retry_delay_secs),
        }
    }
}

#[async_trait]
impl MessageHandler for PipelineHandler {
    async fn handle(&self, message: &QueuedMessage) -> Disposition {
        let job: PipelineJob = match serde_json::from_str(&message.body) {
            Ok(j) => j,
            Err(e) => {
                error!(message_id = %message.id, error = %e, "undecodable pipeline job dropped");
                return Disposition::Discard;
            }
        };
        let document_id = &job.input.document_id;

        match self.runner.run(document_id).await {
            Ok(report) => {
                info!(
                    %document_id,
                    completed = report.completed.len(),
                    skipped = report.skipped.len(),
                    "pipeline finished"
                );
                Disposition::Ack
            }
            Err(e) => match e.downcast_ref::<CoordError>() {
                Some(CoordError::NotFound { .. }) => {
                    error!(%document_id, error = %e, "pipeline job for unknown document dropped");
                    Disposition::Discard
                }
                Some(CoordError::StageBusy {
                    stage,
                    retry_after_secs,
                    ..
                }) => {
                    debug!(%document_id, %stage, retry_after_secs, "stage busy; job deferred");
                    Disposition::Retry(Duration::from_secs(*retry_after_secs).max(self.retry_delay))
                }
                _ => {
                    warn!(
                        %document_id,
                        receive_count = message.receive_count,
                        error = ?e,
                        "pipeline failed; will retry"
                    );
                    Disposition::Retry(self.retry_delay)
                }
            },
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub received: usize,
    pub acked: usize,
    pub discarded: usize,
    pub retried: usize,
}

impl DrainStats {
    fn add(&mut self, other: DrainStats) {
        self.received += other.received;
        self.acked += other.acked;
        self.discarded += other.discarded;
        self.retried += other.retried;
    }
}

pub struct Worker {
    queue: Arc<dyn MessageQueue>,
    handler: Box<dyn MessageHandler>,
    batch_size: u32,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        handler: Box<dyn MessageHandler>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            batch_size: config.batch_size,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// Receive one batch and settle every message in it.
    pub async fn poll_batch(&self) -> Result<DrainStats> {
        let batch = self.queue.receive(self.batch_size).await?;
        let mut stats = DrainStats {
            received: batch.len(),
            ..Default::default()
        };
        for message in &batch {
            match self.handler.handle(message).await {
                Disposition::Ack => {
                    self.queue.ack(&message.receipt).await?;
                    stats.acked += 1;
                }
                Disposition::Discard => {
                    self.queue.ack(&message.receipt).await?;
                    stats.discarded += 1;
                }
                Disposition::Retry(delay) => {
                    self.queue.nack(&message.receipt, delay).await?;
                    stats.retried += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Poll until a batch comes back empty or settles nothing for good.
    pub async fn drain(&self) -> Result<DrainStats> {
        let mut total = DrainStats::default();
        loop {
            let stats = self.poll_batch().await?;
            total.add(stats);
            if stats.received == 0 || stats.acked + stats.discarded == 0 {
                return Ok(total);
            }
        }
    }

    /// Poll forever, sleeping between empty batches, until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown requested; finishing current batch");
                    let _ = tx.send(true);
                }
                Err(e) => {
                    error!(error = %e, "cannot listen for Ctrl-C");
                    tx.closed().await;
                }
            }
        });
        self.run_until(rx).await
    }

    /// Poll until `shutdown` turns true or its sender goes away.
    pub async fn run_until(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            match self.poll_batch().await {
                Ok(s) if s.received > 0 => continue,
                Ok(_) => {}
                Err(e) => error!(error = %e, "queue poll failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Which queue `dwatch work` consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Notifications,
    Pipeline,
}

pub async fn run_worker(config: &Config, kind: WorkKind, once: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let drive = Arc::new(DriveClient::from_config(&config.drive)?);

    let (queue_name, handler): (&str, Box<dyn MessageHandler>) = match kind {
        WorkKind::Notifications => {
            let duration = ChronoDuration::try_seconds(config.lease.duration_secs)
                .context("lease.duration_secs is out of range")?;
            let lock = LeaseLock::with_duration(store.clone(), duration);
            let engine =
                IngestEngine::new(lock, drive).with_mime_filter(config.drive.mime_types.clone());
            let dispatcher = PipelineDispatcher::new(
                starter_from_config(config, pool.clone())?,
                &config.workflow.workflow_id,
            );
            let coordinator = IngestCoordinator::new(engine, store, dispatcher);
            (
                NOTIFICATIONS_QUEUE,
                Box::new(NotificationHandler::new(coordinator, &config.queue)),
            )
        }
        WorkKind::Pipeline => {
            let blobs = Arc::new(FsBlobStore::new(&config.blob.root));
            let runner = PipelineRunner::from_config(config, store.clone(), store, drive, blobs)?;
            (
                PIPELINE_QUEUE,
                Box::new(PipelineHandler::new(runner, &config.queue)),
            )
        }
    };

    let queue = Arc::new(SqliteQueue::from_config(pool, queue_name, &config.queue));
    let worker = Worker::new(queue, handler, &config.queue);
    info!(queue = queue_name, once, "worker started");

    if once {
        let stats = worker.drain().await?;
        println!(
            "{}: received {}, acked {}, dropped {}, retrying {}",
            queue_name, stats.received, stats.acked, stats.discarded, stats.retried
        );
        Ok(())
    } else {
        worker.run().await
    }
}
