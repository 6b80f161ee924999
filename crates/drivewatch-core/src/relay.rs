//! Notification relay.
//!
//! Validates an inbound push signal against the channel registry and turns
//! file additions into a minimal queue message. The relay never calls the
//! ingestion engine itself; the queue sits in between so the lease, not the
//! burst size of incoming signals, bounds polling concurrency.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoordError, Result};
use crate::models::{Channel, ChannelNotification};
use crate::queue::MessageQueue;
use crate::store::ChannelRegistry;

/// Resource state reported for a new file.
pub const STATE_ADD: &str = "add";

/// An inbound change signal, already extracted from its transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub channel_id: String,
    pub resource_id: String,
    /// Provider state: `sync`, `add`, `remove`, `update`, `trash`, ...
    pub resource_state: String,
    pub message_number: Option<u64>,
}

impl Signal {
    pub fn is_addition(&self) -> bool {
        self.resource_state == STATE_ADD
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Validated and enqueued.
    Forwarded(ChannelNotification),
    /// Accepted without forwarding (heartbeat, removal, and other
    /// non-addition states).
    Ignored { resource_state: String },
}

pub struct NotificationRelay {
    registry: Arc<dyn ChannelRegistry>,
    queue: Arc<dyn MessageQueue>,
}

impl NotificationRelay {
    pub fn new(registry: Arc<dyn ChannelRegistry>, queue: Arc<dyn MessageQueue>) -> Self {
        Self { registry, queue }
    }

    /// Resolve the channel a signal claims to come from.
    ///
    /// Fails with `InvalidChannel` unless the registry holds that channel id
    /// and its stored resource id matches the signal exactly.
    pub async fn validate(&self, signal: &Signal) -> Result<Channel> {
        let channel = self
            .registry
            .get_channel(&signal.channel_id)
            .await?
            .ok_or_else(|| {
                CoordError::InvalidChannel(format!("unknown channel {}", signal.channel_id))
            })?;

        if channel.resource_id != signal.resource_id {
            return Err(CoordError::InvalidChannel(format!(
                "resource {} does not match channel {}",
                signal.resource_id, signal.channel_id
            )));
        }

        Ok(channel)
    }

    /// Validate `signal` and enqueue a notification for file additions.
    pub async fn relay(&self, signal: &Signal) -> Result<RelayOutcome> {
        if !signal.is_addition() {
            debug!(
                channel_id = %signal.channel_id,
                resource_state = %signal.resource_state,
                "non-add signal accepted without forwarding"
            );
            return Ok(RelayOutcome::Ignored {
                resource_state: signal.resource_state.clone(),
            });
        }

        let channel = match self.validate(signal).await {
            Ok(c) => c,
            Err(e) => {
                warn!(channel_id = %signal.channel_id, error = %e, "dropping signal");
                return Err(e);
            }
        };

        let notification = ChannelNotification {
            notification_id: Uuid::new_v4().to_string(),
            channel_id: channel.channel_id.clone(),
            folder_id: channel.folder_id.clone(),
        };
        let body = serde_json::to_string(&notification)
            .map_err(|e| CoordError::Queue(format!("failed to encode notification: {}", e)))?;
        self.queue.send(&body).await?;

        info!(
            notification_id = %notification.notification_id,
            channel_id = %notification.channel_id,
            folder_id = %notification.folder_id,
            "notification enqueued"
        );
        Ok(RelayOutcome::Forwarded(notification))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now;
    use crate::queue::InMemoryQueue;
    use crate::store::memory::InMemoryStore;
    use chrono::Duration;

    async fn relay_with_channel() -> (NotificationRelay, Arc<InMemoryQueue>) {
        let store = Arc::new(InMemoryStore::new());
        let t = now();
        store
            .upsert_channel(&Channel {
                folder_id: "F1".into(),
                channel_id: "ch-1".into(),
                resource_id: "res-1".into(),
                webhook_url: "https://hook".into(),
                expires_at: t + Duration::hours(48),
                destination_folder_id: None,
                created_at: t,
                updated_at: t,
            })
            .await
            .unwrap();
        let queue = Arc::new(InMemoryQueue::new());
        (NotificationRelay::new(store, queue.clone()), queue)
    }

    fn signal(state: &str, resource: &str) -> Signal {
        Signal {
            channel_id: "ch-1".into(),
            resource_id: resource.into(),
            resource_state: state.into(),
            message_number: Some(3),
        }
    }

    #[tokio::test]
    async fn add_signal_is_forwarded() {
        let (relay, queue) = relay_with_channel().await;
        let outcome = relay.relay(&signal("add", "res-1")).await.unwrap();

        let RelayOutcome::Forwarded(n) = outcome else {
            panic!("expected forwarded outcome");
        };
        assert_eq!(n.channel_id, "ch-1");
        assert_eq!(n.folder_id, "F1");

        let bodies = queue.pending_bodies().unwrap();
        assert_eq!(bodies.len(), 1);
        let decoded: ChannelNotification = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(decoded, n);
    }

    #[tokio::test]
    async fn resource_mismatch_is_rejected() {
        let (relay, queue) = relay_with_channel().await;
        let err = relay.relay(&signal("add", "res-other")).await.unwrap_err();
        assert!(matches!(err, CoordError::InvalidChannel(_)));
        assert!(queue.pending_bodies().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_channel_is_rejected() {
        let (relay, _) = relay_with_channel().await;
        let mut s = signal("add", "res-1");
        s.channel_id = "ch-gone".into();
        assert!(matches!(
            relay.validate(&s).await,
            Err(CoordError::InvalidChannel(_))
        ));
    }

    #[tokio::test]
    async fn heartbeat_and_removal_are_accepted_silently() {
        let (relay, queue) = relay_with_channel().await;
        for state in ["sync", "remove", "trash"] {
            let outcome = relay.relay(&signal(state, "res-1")).await.unwrap();
            assert!(matches!(outcome, RelayOutcome::Ignored { .. }));
        }
        assert!(queue.pending_bodies().unwrap().is_empty());
    }
}
