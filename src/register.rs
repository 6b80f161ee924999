//! Channel registration, rotation, and the scheduled sweep.
//!
//! Registration is the only writer of the channel registry. Adding a folder
//! reads the feed's start cursor *before* opening the push channel, so no
//! change between the two calls is missed, then seeds the lease before the
//! channel row becomes visible to the webhook.
//!
//! Rotation gives a folder a fresh channel id and carries the old lease's
//! cursor over to the new lease. If an ingestion call still holds the old
//! lease, its release lands on the retired lease and the new channel
//! replays from the carried cursor; the ledger absorbs the replay.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use drivewatch_core::models::{now, Channel, ChannelNotification};
use drivewatch_core::queue::MessageQueue;
use drivewatch_core::store::{ChannelRegistry, LeaseStore};

use crate::config::Config;
use crate::db;
use crate::drive::{DriveClient, WatchedChannel};
use crate::sqlite_queue::{SqliteQueue, NOTIFICATIONS_QUEUE};
use crate::sqlite_store::SqliteStore;
use crate::token;

/// The push-channel half of the feed provider.
#[async_trait]
pub trait ChannelWatcher: Send + Sync {
    async fn start_cursor(&self) -> Result<String>;

    async fn watch(
        &self,
        folder_id: &str,
        channel_id: &str,
        webhook_url: &str,
        token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<WatchedChannel>;

    async fn stop(&self, channel_id: &str, resource_id: &str) -> Result<()>;
}

#[async_trait]
impl ChannelWatcher for DriveClient {
    async fn start_cursor(&self) -> Result<String> {
        Ok(self.start_page_token().await?)
    }

    async fn watch(
        &self,
        folder_id: &str,
        channel_id: &str,
        webhook_url: &str,
        token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<WatchedChannel> {
        Ok(DriveClient::watch(self, folder_id, channel_id, webhook_url, token, expires_at).await?)
    }

    async fn stop(&self, channel_id: &str, resource_id: &str) -> Result<()> {
        Ok(self.stop_channel(channel_id, resource_id).await?)
    }
}

#[derive(Debug, Default)]
pub struct RenewSummary {
    pub renewed: Vec<Channel>,
    pub failed: Vec<(String, String)>,
    pub unchanged: usize,
}

pub struct Registrar {
    watcher: Arc<dyn ChannelWatcher>,
    registry: Arc<dyn ChannelRegistry>,
    leases: Arc<dyn LeaseStore>,
    webhook_url: String,
    token_secret: Option<String>,
    ttl: Duration,
    renew_before: Duration,
}

impl Registrar {
    pub fn new(
        watcher: Arc<dyn ChannelWatcher>,
        registry: Arc<dyn ChannelRegistry>,
        leases: Arc<dyn LeaseStore>,
        webhook_url: impl Into<String>,
    ) -> Self {
        Self {
            watcher,
            registry,
            leases,
            webhook_url: webhook_url.into(),
            token_secret: None,
            ttl: Duration::hours(48),
            renew_before: Duration::hours(1),
        }
    }

    pub fn from_config(
        config: &Config,
        watcher: Arc<dyn ChannelWatcher>,
        registry: Arc<dyn ChannelRegistry>,
        leases: Arc<dyn LeaseStore>,
    ) -> Result<Self> {
        let webhook_url = config.registration.require_webhook_url()?;
        Ok(Self::new(watcher, registry, leases, webhook_url)
            .with_token_secret(config.server.channel_token_secret()?)
            .with_ttl(Duration::hours(config.drive.channel_ttl_hours))
            .with_renew_before(Duration::minutes(config.drive.renew_before_mins)))
    }

    pub fn with_token_secret(mut self, secret: Option<String>) -> Self {
        self.token_secret = secret;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_renew_before(mut self, renew_before: Duration) -> Self {
        self.renew_before = renew_before;
        self
    }

    async fn open_channel(
        &self,
        folder_id: &str,
        destination_folder_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Channel> {
        let channel_id = Uuid::new_v4().to_string();
        let token = match &self.token_secret {
            Some(secret) => Some(token::sign_channel(secret, &channel_id)?),
            None => None,
        };
        let at = now();
        let watched = self
            .watcher
            .watch(
                folder_id,
                &channel_id,
                &self.webhook_url,
                token.as_deref(),
                at + self.ttl,
            )
            .await
            .with_context(|| format!("Failed to watch folder {}", folder_id))?;

        Ok(Channel {
            folder_id: folder_id.to_string(),
            channel_id,
            resource_id: watched.resource_id,
            webhook_url: self.webhook_url.clone(),
            expires_at: watched.expires_at,
            destination_folder_id,
            created_at,
            updated_at: at,
        })
    }

    /// Start watching `folder_id`. A folder that already has a channel is
    /// rotated instead, keeping its cursor.
    pub async fn add_folder(
        &self,
        folder_id: &str,
        destination_folder_id: Option<String>,
    ) -> Result<Channel> {
        if let Some(existing) = self.registry.get_channel_by_folder(folder_id).await? {
            let destination = destination_folder_id.or(existing.destination_folder_id.clone());
            return self.rotate(&existing, destination).await;
        }

        let cursor = self.watcher.start_cursor().await?;
        let channel = self
            .open_channel(folder_id, destination_folder_id, now())
            .await?;
        self.leases.seed_lease(&channel.channel_id, &cursor).await?;
        self.registry.upsert_channel(&channel).await?;

        info!(
            folder_id,
            channel_id = %channel.channel_id,
            expires_at = %channel.expires_at,
            "channel registered"
        );
        Ok(channel)
    }

    /// Replace `old` with a new channel for the same folder.
    pub async fn rotate(
        &self,
        old: &Channel,
        destination_folder_id: Option<String>,
    ) -> Result<Channel> {
        let cursor = match self.leases.get_lease(&old.channel_id).await? {
            Some(lease) => lease.cursor,
            None => self.watcher.start_cursor().await?,
        };

        let channel = self
            .open_channel(&old.folder_id, destination_folder_id, old.created_at)
            .await?;
        self.leases.seed_lease(&channel.channel_id, &cursor).await?;
        self.registry.upsert_channel(&channel).await?;

        if let Err(e) = self.watcher.stop(&old.channel_id, &old.resource_id).await {
            warn!(
                channel_id = %old.channel_id,
                error = %e,
                "failed to stop retired channel; it will lapse at expiry"
            );
        }

        info!(
            folder_id = %channel.folder_id,
            old_channel_id = %old.channel_id,
            channel_id = %channel.channel_id,
            "channel rotated"
        );
        Ok(channel)
    }

    /// Rotate every channel that expires soon or targets another webhook.
    pub async fn renew_due(&self) -> Result<RenewSummary> {
        let at = now();
        let mut summary = RenewSummary::default();
        for channel in self.registry.list_channels().await? {
            if !channel.needs_renewal(at, self.renew_before, &self.webhook_url) {
                summary.unchanged += 1;
                continue;
            }
            match self
                .rotate(&channel, channel.destination_folder_id.clone())
                .await
            {
                Ok(renewed) => summary.renewed.push(renewed),
                Err(e) => {
                    warn!(folder_id = %channel.folder_id, error = %e, "channel renewal failed");
                    summary.failed.push((channel.folder_id.clone(), e.to_string()));
                }
            }
        }
        Ok(summary)
    }
}

/// Enqueue one notification per registered channel so each folder is
/// polled even if push signals were lost.
pub async fn sweep(registry: &dyn ChannelRegistry, queue: &dyn MessageQueue) -> Result<usize> {
    let mut sent = 0;
    for channel in registry.list_channels().await? {
        let notification = ChannelNotification {
            notification_id: Uuid::new_v4().to_string(),
            channel_id: channel.channel_id.clone(),
            folder_id: channel.folder_id.clone(),
        };
        queue.send(&serde_json::to_string(&notification)?).await?;
        sent += 1;
    }
    info!(channels = sent, "sweep enqueued");
    Ok(sent)
}

/// `dwatch channels add`
pub async fn run_add_folder(
    config: &Config,
    folder_id: &str,
    destination_folder_id: Option<String>,
) -> Result<()> {
    let registrar = registrar(config).await?;
    let channel = registrar
        .add_folder(folder_id, destination_folder_id)
        .await?;
    println!(
        "Watching folder {} via channel {} (expires {})",
        channel.folder_id,
        channel.channel_id,
        channel.expires_at.to_rfc3339()
    );
    Ok(())
}

/// `dwatch channels renew`
pub async fn run_renew(config: &Config) -> Result<()> {
    let summary = registrar(config).await?.renew_due().await?;
    for channel in &summary.renewed {
        println!("renewed  {} -> {}", channel.folder_id, channel.channel_id);
    }
    for (folder_id, error) in &summary.failed {
        println!("FAILED   {}: {}", folder_id, error);
    }
    println!(
        "{} renewed, {} failed, {} unchanged",
        summary.renewed.len(),
        summary.failed.len(),
        summary.unchanged
    );
    if !summary.failed.is_empty() {
        bail!("{} channel(s) could not be renewed", summary.failed.len());
    }
    Ok(())
}

/// `dwatch sweep`
pub async fn run_sweep(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let queue = SqliteQueue::from_config(pool, NOTIFICATIONS_QUEUE, &config.queue);
    let sent = sweep(&store, &queue).await?;
    println!("Enqueued {} notification(s).", sent);
    Ok(())
}

async fn registrar(config: &Config) -> Result<Registrar> {
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool));
    let drive = Arc::new(DriveClient::from_config(&config.drive)?);
    Registrar::from_config(config, drive, store.clone(), store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivewatch_core::queue::InMemoryQueue;
    use drivewatch_core::store::memory::InMemoryStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeWatcher {
        watched: Mutex<Vec<(String, String, Option<String>)>>,
        stopped: Mutex<Vec<String>>,
        fail_stop: bool,
    }

    #[async_trait]
    impl ChannelWatcher for FakeWatcher {
        async fn start_cursor(&self) -> Result<String> {
            Ok("START".to_string())
        }

        async fn watch(
            &self,
            folder_id: &str,
            channel_id: &str,
            _webhook_url: &str,
            token: Option<&str>,
            expires_at: DateTime<Utc>,
        ) -> Result<WatchedChannel> {
            self.watched.lock().unwrap().push((
                folder_id.to_string(),
                channel_id.to_string(),
                token.map(str::to_string),
            ));
            Ok(WatchedChannel {
                resource_id: format!("res-{}", channel_id),
                expires_at,
            })
        }

        async fn stop(&self, channel_id: &str, _resource_id: &str) -> Result<()> {
            if self.fail_stop {
                anyhow::bail!("stop failed");
            }
            self.stopped.lock().unwrap().push(channel_id.to_string());
            Ok(())
        }
    }

    fn registrar(watcher: Arc<FakeWatcher>, store: Arc<InMemoryStore>) -> Registrar {
        Registrar::new(watcher, store.clone(), store, "https://hook/webhook")
    }

    #[tokio::test]
    async fn add_seeds_lease_with_start_cursor() {
        let store = Arc::new(InMemoryStore::new());
        let watcher = Arc::new(FakeWatcher::default());
        let channel = registrar(watcher.clone(), store.clone())
            .add_folder("F1", Some("DEST".into()))
            .await
            .unwrap();

        assert_eq!(channel.resource_id, format!("res-{}", channel.channel_id));
        assert_eq!(channel.destination_folder_id.as_deref(), Some("DEST"));

        let lease = store.get_lease(&channel.channel_id).await.unwrap().unwrap();
        assert_eq!(lease.cursor, "START");
        assert!(!lease.locked);

        let stored = store.get_channel_by_folder("F1").await.unwrap().unwrap();
        assert_eq!(stored, channel);
    }

    #[tokio::test]
    async fn rotation_carries_cursor_and_stops_old_channel() {
        let store = Arc::new(InMemoryStore::new());
        let watcher = Arc::new(FakeWatcher::default());
        let reg = registrar(watcher.clone(), store.clone());
        let first = reg.add_folder("F1", None).await.unwrap();
        store.seed_lease(&first.channel_id, "C42").await.unwrap();

        let second = reg.rotate(&first, None).await.unwrap();
        assert_ne!(second.channel_id, first.channel_id);
        assert_eq!(second.created_at, first.created_at);

        let lease = store.get_lease(&second.channel_id).await.unwrap().unwrap();
        assert_eq!(lease.cursor, "C42");
        assert!(store.get_channel(&first.channel_id).await.unwrap().is_none());
        assert_eq!(*watcher.stopped.lock().unwrap(), vec![first.channel_id]);
    }

    #[tokio::test]
    async fn stop_failure_does_not_fail_rotation() {
        let store = Arc::new(InMemoryStore::new());
        let watcher = Arc::new(FakeWatcher {
            fail_stop: true,
            ..Default::default()
        });
        let reg = registrar(watcher, store.clone());
        let first = reg.add_folder("F1", None).await.unwrap();
        let second = reg.rotate(&first, None).await.unwrap();
        let current = store.get_channel_by_folder("F1").await.unwrap().unwrap();
        assert_eq!(current.channel_id, second.channel_id);
    }

    #[tokio::test]
    async fn renew_only_touches_expiring_channels() {
        let store = Arc::new(InMemoryStore::new());
        let watcher = Arc::new(FakeWatcher::default());
        let reg = registrar(watcher, store.clone()).with_ttl(Duration::hours(48));
        reg.add_folder("F1", None).await.unwrap();
        let summary = reg.renew_due().await.unwrap();
        assert_eq!(summary.unchanged, 1);
        assert!(summary.renewed.is_empty());

        let short = reg.with_renew_before(Duration::hours(72));
        let summary = short.renew_due().await.unwrap();
        assert_eq!(summary.renewed.len(), 1);
        assert!(summary.failed.is_empty());
    }

    #[tokio::test]
    async fn secret_produces_verifiable_token() {
        let store = Arc::new(InMemoryStore::new());
        let watcher = Arc::new(FakeWatcher::default());
        let channel = registrar(watcher.clone(), store)
            .with_token_secret(Some("s3cret".into()))
            .add_folder("F1", None)
            .await
            .unwrap();

        let watched = watcher.watched.lock().unwrap();
        let sent = watched[0].2.as_deref().unwrap();
        assert!(token::verify_channel("s3cret", &channel.channel_id, sent));
    }

    #[tokio::test]
    async fn sweep_enqueues_one_message_per_channel() {
        let store = Arc::new(InMemoryStore::new());
        let reg = registrar(Arc::new(FakeWatcher::default()), store.clone());
        reg.add_folder("F1", None).await.unwrap();
        reg.add_folder("F2", None).await.unwrap();

        let queue = InMemoryQueue::new();
        assert_eq!(sweep(store.as_ref(), &queue).await.unwrap(), 2);
        let bodies = queue.pending_bodies().unwrap();
        let first: ChannelNotification = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(first.folder_id, "F1");
    }
}
