//! Durable [`MessageQueue`] on the shared SQLite database.
//!
//! Several named queues share the `queue_messages` table. Delivery is
//! at-least-once: a received message stays invisible for the visibility
//! timeout and reappears unless acked. Each delivery gets a fresh receipt,
//! so an ack or nack from a consumer whose visibility lapsed is a no-op.
//! Messages delivered `max_receives` times without an ack are moved to the
//! dead-letter state instead of being delivered again.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use drivewatch_core::models::now;
use drivewatch_core::queue::{MessageQueue, QueuedMessage};
use drivewatch_core::{CoordError, Result};

use crate::config::QueueConfig;

/// Queue fed by the webhook and the sweep; consumed by `work notifications`.
pub const NOTIFICATIONS_QUEUE: &str = "notifications";
/// Queue fed by the queue-mode workflow starter; consumed by `work pipeline`.
pub const PIPELINE_QUEUE: &str = "pipeline";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: i64,
    pub in_flight: i64,
    pub dead: i64,
}

#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    name: String,
    visibility_timeout: chrono::Duration,
    max_receives: u32,
}

impl SqliteQueue {
    pub fn new(
        pool: SqlitePool,
        name: impl Into<String>,
        visibility_timeout: chrono::Duration,
        max_receives: u32,
    ) -> Self {
        Self {
            pool,
            name: name.into(),
            visibility_timeout,
            max_receives,
        }
    }

    pub fn from_config(pool: SqlitePool, name: &str, config: &QueueConfig) -> Self {
        Self::new(
            pool,
            name,
            chrono::Duration::seconds(config.visibility_timeout_secs),
            config.max_receives,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn depth(&self) -> Result<QueueDepth> {
        let at = now().timestamp_millis();
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN dead = 0 AND visible_at <= ? THEN 1 ELSE 0 END), 0) AS ready,
                COALESCE(SUM(CASE WHEN dead = 0 AND visible_at > ? THEN 1 ELSE 0 END), 0) AS in_flight,
                COALESCE(SUM(CASE WHEN dead = 1 THEN 1 ELSE 0 END), 0) AS dead
            FROM queue_messages WHERE queue = ?
            "#,
        )
        .bind(at)
        .bind(at)
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await
        .map_err(queue_err)?;

        Ok(QueueDepth {
            ready: row.try_get("ready").map_err(queue_err)?,
            in_flight: row.try_get("in_flight").map_err(queue_err)?,
            dead: row.try_get("dead").map_err(queue_err)?,
        })
    }

    /// Bodies of dead-lettered messages, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT body FROM queue_messages WHERE queue = ? AND dead = 1 ORDER BY enqueued_at",
        )
        .bind(&self.name)
        .fetch_all(&self.pool)
        .await
        .map_err(queue_err)
    }

    async fn dead_letter_exhausted(&self, at: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages SET dead = 1, receipt = NULL
            WHERE queue = ? AND dead = 0 AND visible_at <= ? AND receive_count >= ?
            "#,
        )
        .bind(&self.name)
        .bind(at)
        .bind(self.max_receives as i64)
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;

        if result.rows_affected() > 0 {
            warn!(
                queue = %self.name,
                count = result.rows_affected(),
                max_receives = self.max_receives,
                "messages moved to dead letter"
            );
        }
        Ok(())
    }
}

fn queue_err(e: sqlx::Error) -> CoordError {
    CoordError::Queue(e.to_string())
}

#[async_trait]
impl MessageQueue for SqliteQueue {
    async fn send(&self, body: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let at = now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO queue_messages (id, queue, body, enqueued_at, visible_at, receive_count, dead)
            VALUES (?, ?, ?, ?, ?, 0, 0)
            "#,
        )
        .bind(&id)
        .bind(&self.name)
        .bind(body)
        .bind(at)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;
        Ok(id)
    }

    async fn receive(&self, max: u32) -> Result<Vec<QueuedMessage>> {
        let at = now().timestamp_millis();
        self.dead_letter_exhausted(at).await?;

        let hidden_until = (now() + self.visibility_timeout).timestamp_millis();
        let mut out = Vec::new();
        while out.len() < max as usize {
            let receipt = Uuid::new_v4().to_string();
            // Claim one message per statement; concurrent consumers never
            // both win the same row.
            let row = sqlx::query(
                r#"
                UPDATE queue_messages
                SET receive_count = receive_count + 1, visible_at = ?, receipt = ?
                WHERE id = (
                    SELECT id FROM queue_messages
                    WHERE queue = ? AND dead = 0 AND visible_at <= ?
                    ORDER BY enqueued_at, id
                    LIMIT 1
                )
                AND dead = 0 AND visible_at <= ?
                RETURNING id, body, receive_count
                "#,
            )
            .bind(hidden_until)
            .bind(&receipt)
            .bind(&self.name)
            .bind(at)
            .bind(at)
            .fetch_optional(&self.pool)
            .await
            .map_err(queue_err)?;

            let Some(row) = row else {
                break;
            };
            let receive_count: i64 = row.try_get("receive_count").map_err(queue_err)?;
            out.push(QueuedMessage {
                id: row.try_get("id").map_err(queue_err)?,
                body: row.try_get("body").map_err(queue_err)?,
                receipt,
                receive_count: receive_count as u32,
            });
        }
        Ok(out)
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE queue = ? AND receipt = ? AND dead = 0")
            .bind(&self.name)
            .bind(receipt)
            .execute(&self.pool)
            .await
            .map_err(queue_err)?;
        Ok(())
    }

    async fn nack(&self, receipt: &str, delay: Duration) -> Result<()> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| CoordError::Queue(format!("invalid nack delay: {}", e)))?;
        let visible_at = (now() + delay).timestamp_millis();
        sqlx::query(
            "UPDATE queue_messages SET visible_at = ? WHERE queue = ? AND receipt = ? AND dead = 0",
        )
        .bind(visible_at)
        .bind(&self.name)
        .bind(receipt)
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;
        Ok(())
    }
}
