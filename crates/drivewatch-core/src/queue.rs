//! Message queue abstraction.
//!
//! Delivery is at-least-once with no ordering guarantee. Consumers ack a
//! message once it is fully handled and nack it (with a redelivery delay)
//! otherwise; the ledger's idempotency absorbs the duplicates.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CoordError, Result};

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub body: String,
    /// Handle for ack/nack of this particular delivery.
    pub receipt: String,
    /// How many times this message has been delivered, including this one.
    pub receive_count: u32,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Durably enqueue `body`, returning the message id.
    async fn send(&self, body: &str) -> Result<String>;

    /// Receive up to `max` visible messages. Received messages stay hidden
    /// from other consumers until acked, nacked, or their visibility lapses.
    async fn receive(&self, max: u32) -> Result<Vec<QueuedMessage>>;

    async fn ack(&self, receipt: &str) -> Result<()>;

    /// Return the message to the queue, visible again after `delay`.
    async fn nack(&self, receipt: &str, delay: Duration) -> Result<()>;
}

/// Process-local queue for tests. Nacked messages go back to the tail and
/// the delay is ignored.
#[derive(Default)]
pub struct InMemoryQueue {
    ready: Mutex<VecDeque<QueuedMessage>>,
    in_flight: Mutex<Vec<QueuedMessage>>,
    next_id: Mutex<u64>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bodies of all messages not yet acked, oldest first.
    pub fn pending_bodies(&self) -> Result<Vec<String>> {
        let ready = self.ready.lock().map_err(poisoned)?;
        let in_flight = self.in_flight.lock().map_err(poisoned)?;
        Ok(in_flight
            .iter()
            .chain(ready.iter())
            .map(|m| m.body.clone())
            .collect())
    }
}

fn poisoned<T>(_: T) -> CoordError {
    CoordError::Queue("in-memory queue lock poisoned".to_string())
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn send(&self, body: &str) -> Result<String> {
        let mut next = self.next_id.lock().map_err(poisoned)?;
        *next += 1;
        let id = format!("m{}", *next);
        self.ready.lock().map_err(poisoned)?.push_back(QueuedMessage {
            id: id.clone(),
            body: body.to_string(),
            receipt: String::new(),
            receive_count: 0,
        });
        Ok(id)
    }

    async fn receive(&self, max: u32) -> Result<Vec<QueuedMessage>> {
        let mut ready = self.ready.lock().map_err(poisoned)?;
        let mut in_flight = self.in_flight.lock().map_err(poisoned)?;
        let mut out = Vec::new();
        while out.len() < max as usize {
            let Some(mut msg) = ready.pop_front() else {
                break;
            };
            msg.receive_count += 1;
            msg.receipt = format!("{}#{}", msg.id, msg.receive_count);
            in_flight.push(msg.clone());
            out.push(msg);
        }
        Ok(out)
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        let mut in_flight = self.in_flight.lock().map_err(poisoned)?;
        in_flight.retain(|m| m.receipt != receipt);
        Ok(())
    }

    async fn nack(&self, receipt: &str, _delay: Duration) -> Result<()> {
        let mut ready = self.ready.lock().map_err(poisoned)?;
        let mut in_flight = self.in_flight.lock().map_err(poisoned)?;
        if let Some(pos) = in_flight.iter().position(|m| m.receipt == receipt) {
            ready.push_back(in_flight.remove(pos));
        }
        Ok(())
    }
}
