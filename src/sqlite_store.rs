//! SQLite-backed implementation of the coordination store traits.
//!
//! Every atomic primitive the core relies on is a single SQL statement:
//!
//! | Operation | Statement |
//! |-----------|-----------|
//! | `acquire_lease` | `UPDATE … WHERE locked = 0 OR lock_expires_at <= now RETURNING cursor` |
//! | `release_lease` | `UPDATE … WHERE locked = 1 AND lock_expires_at = granted_until` |
//! | `record_if_new` | `INSERT … ON CONFLICT(external_id) DO NOTHING` |
//! | `complete_stage` / `fail_stage` | `UPDATE … WHERE status = 'in-progress' AND attempt_id = ?` |
//!
//! Timestamps are stored as epoch milliseconds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use drivewatch_core::models::{
    now, Channel, DiscoveredDocument, DocumentMetadata, Lease, ProcessingStage, RecordOutcome,
    StageName, StageStatus,
};
use drivewatch_core::store::{stage_order, ChannelRegistry, DocumentLedger, LeaseStore};
use drivewatch_core::{CoordError, Result};

/// SQLite implementation of [`ChannelRegistry`], [`LeaseStore`], and
/// [`DocumentLedger`] over one shared pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn document_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)
    }

    async fn lease_exists(&self, channel_id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM leases WHERE channel_id = ?")
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(found.is_some())
    }

    /// Shared fenced update for complete/fail. `done` is the finished
    /// record; it is written only if `original` still owns the row.
    async fn finish_stage(&self, original: &ProcessingStage, done: &ProcessingStage) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE processing_stages
            SET status = ?, completed_at = ?, stage_file_name = ?, storage_key = ?, detail = ?
            WHERE document_id = ? AND stage = ? AND status = 'in-progress' AND attempt_id = ?
            "#,
        )
        .bind(done.status.as_str())
        .bind(done.completed_at.map(to_ms))
        .bind(&done.stage_file_name)
        .bind(&done.storage_key)
        .bind(&done.detail)
        .bind(&original.document_id)
        .bind(original.stage.as_str())
        .bind(&original.attempt_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(CoordError::StageConflict {
                document_id: original.document_id.clone(),
                stage: original.stage.to_string(),
            });
        }
        Ok(())
    }
}

fn store_err(e: sqlx::Error) -> CoordError {
    CoordError::Store(e.to_string())
}

fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| CoordError::Store(format!("timestamp out of range: {}", ms)))
}

fn from_opt_ms(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_ms).transpose()
}

fn channel_from_row(row: &SqliteRow) -> Result<Channel> {
    Ok(Channel {
        folder_id: row.try_get("folder_id").map_err(store_err)?,
        channel_id: row.try_get("channel_id").map_err(store_err)?,
        resource_id: row.try_get("resource_id").map_err(store_err)?,
        webhook_url: row.try_get("webhook_url").map_err(store_err)?,
        expires_at: from_ms(row.try_get("expires_at").map_err(store_err)?)?,
        destination_folder_id: row.try_get("destination_folder_id").map_err(store_err)?,
        created_at: from_ms(row.try_get("created_at").map_err(store_err)?)?,
        updated_at: from_ms(row.try_get("updated_at").map_err(store_err)?)?,
    })
}

fn document_from_row(row: &SqliteRow) -> Result<DiscoveredDocument> {
    Ok(DiscoveredDocument {
        id: row.try_get("id").map_err(store_err)?,
        external_id: row.try_get("external_id").map_err(store_err)?,
        parent_folder_id: row.try_get("parent_folder_id").map_err(store_err)?,
        display_name: row.try_get("display_name").map_err(store_err)?,
        byte_size: row.try_get("byte_size").map_err(store_err)?,
        mime_type: row.try_get("mime_type").map_err(store_err)?,
        external_created_at: from_opt_ms(row.try_get("external_created_at").map_err(store_err)?)?,
        external_modified_at: from_opt_ms(
            row.try_get("external_modified_at").map_err(store_err)?,
        )?,
        discovered_at: from_ms(row.try_get("discovered_at").map_err(store_err)?)?,
    })
}

fn stage_from_row(row: &SqliteRow) -> Result<ProcessingStage> {
    let stage: String = row.try_get("stage").map_err(store_err)?;
    let status: String = row.try_get("status").map_err(store_err)?;
    Ok(ProcessingStage {
        document_id: row.try_get("document_id").map_err(store_err)?,
        stage: StageName::from(stage),
        status: status.parse::<StageStatus>().map_err(CoordError::Store)?,
        attempt_id: row.try_get("attempt_id").map_err(store_err)?,
        started_at: from_ms(row.try_get("started_at").map_err(store_err)?)?,
        completed_at: from_opt_ms(row.try_get("completed_at").map_err(store_err)?)?,
        original_file_name: row.try_get("original_file_name").map_err(store_err)?,
        stage_file_name: row.try_get("stage_file_name").map_err(store_err)?,
        storage_key: row.try_get("storage_key").map_err(store_err)?,
        detail: row.try_get("detail").map_err(store_err)?,
    })
}

const STAGE_COLUMNS: &str = "document_id, stage, status, attempt_id, started_at, completed_at, \
     original_file_name, stage_file_name, storage_key, detail";

#[async_trait]
impl ChannelRegistry for SqliteStore {
    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>> {
        let row = sqlx::query("SELECT * FROM channels WHERE channel_id = ?")
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(channel_from_row).transpose()
    }

    async fn get_channel_by_folder(&self, folder_id: &str) -> Result<Option<Channel>> {
        let row = sqlx::query("SELECT * FROM channels WHERE folder_id = ?")
            .bind(folder_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(channel_from_row).transpose()
    }

    async fn list_channels(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query("SELECT * FROM channels ORDER BY folder_id")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(channel_from_row).collect()
    }

    async fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channels (folder_id, channel_id, resource_id, webhook_url,
                                  expires_at, destination_folder_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(folder_id) DO UPDATE SET
                channel_id = excluded.channel_id,
                resource_id = excluded.resource_id,
                webhook_url = excluded.webhook_url,
                expires_at = excluded.expires_at,
                destination_folder_id = excluded.destination_folder_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&channel.folder_id)
        .bind(&channel.channel_id)
        .bind(&channel.resource_id)
        .bind(&channel.webhook_url)
        .bind(to_ms(channel.expires_at))
        .bind(&channel.destination_folder_id)
        .bind(to_ms(channel.created_at))
        .bind(to_ms(channel.updated_at))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for SqliteStore {
    async fn seed_lease(&self, channel_id: &str, cursor: &str) -> Result<()> {
        let at = to_ms(now());
        let result = sqlx::query(
            r#"
            INSERT INTO leases (channel_id, cursor, locked, lock_expires_at)
            VALUES (?, ?, 0, ?)
            ON CONFLICT(channel_id) DO UPDATE SET
                cursor = excluded.cursor,
                locked = 0,
                lock_expires_at = excluded.lock_expires_at
            WHERE leases.locked = 0 OR leases.lock_expires_at <= excluded.lock_expires_at
            "#,
        )
        .bind(channel_id)
        .bind(cursor)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(CoordError::LockHeld(channel_id.to_string()));
        }
        Ok(())
    }

    async fn acquire_lease(
        &self,
        channel_id: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<String> {
        let cursor: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE leases
            SET locked = 1, lock_expires_at = ?
            WHERE channel_id = ? AND (locked = 0 OR lock_expires_at <= ?)
            RETURNING cursor
            "#,
        )
        .bind(to_ms(until))
        .bind(channel_id)
        .bind(to_ms(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        match cursor {
            Some(c) => Ok(c),
            None if self.lease_exists(channel_id).await? => {
                Err(CoordError::LockHeld(channel_id.to_string()))
            }
            None => Err(CoordError::LeaseMissing(channel_id.to_string())),
        }
    }

    async fn release_lease(
        &self,
        channel_id: &str,
        granted_until: DateTime<Utc>,
        cursor: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE leases
            SET locked = 0, cursor = ?
            WHERE channel_id = ? AND locked = 1 AND lock_expires_at = ?
            "#,
        )
        .bind(cursor)
        .bind(channel_id)
        .bind(to_ms(granted_until))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            if self.lease_exists(channel_id).await? {
                return Err(CoordError::LeaseLost(channel_id.to_string()));
            }
            return Err(CoordError::LeaseMissing(channel_id.to_string()));
        }
        Ok(())
    }

    async fn get_lease(&self, channel_id: &str) -> Result<Option<Lease>> {
        let row = sqlx::query(
            "SELECT channel_id, cursor, locked, lock_expires_at FROM leases WHERE channel_id = ?",
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let locked: i64 = row.try_get("locked").map_err(store_err)?;
        Ok(Some(Lease {
            channel_id: row.try_get("channel_id").map_err(store_err)?,
            cursor: row.try_get("cursor").map_err(store_err)?,
            locked: locked != 0,
            lock_expires_at: from_ms(row.try_get("lock_expires_at").map_err(store_err)?)?,
        }))
    }
}

#[async_trait]
impl DocumentLedger for SqliteStore {
    async fn record_if_new(
        &self,
        external_id: &str,
        metadata: &DocumentMetadata,
    ) -> Result<RecordOutcome> {
        let doc = DiscoveredDocument::new(Uuid::new_v4().to_string(), external_id, metadata);
        let result = sqlx::query(
            r#"
            INSERT INTO documents (id, external_id, parent_folder_id, display_name, byte_size,
                                   mime_type, external_created_at, external_modified_at,
                                   discovered_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(external_id) DO NOTHING
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.external_id)
        .bind(&doc.parent_folder_id)
        .bind(&doc.display_name)
        .bind(doc.byte_size)
        .bind(&doc.mime_type)
        .bind(doc.external_created_at.map(to_ms))
        .bind(doc.external_modified_at.map(to_ms))
        .bind(to_ms(doc.discovered_at))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 1 {
            return Ok(RecordOutcome {
                document_id: doc.id,
                is_new: true,
            });
        }

        let existing: String = sqlx::query_scalar("SELECT id FROM documents WHERE external_id = ?")
            .bind(external_id)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(RecordOutcome {
            document_id: existing,
            is_new: false,
        })
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<DiscoveredDocument>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn start_stage(
        &self,
        document_id: &str,
        stage: StageName,
        original_file_name: &str,
    ) -> Result<ProcessingStage> {
        let record = ProcessingStage::start(document_id, stage, original_file_name);
        sqlx::query(
            r#"
            INSERT INTO processing_stages (document_id, stage, status, attempt_id, started_at,
                                           completed_at, original_file_name, stage_file_name,
                                           storage_key, detail)
            VALUES (?, ?, ?, ?, ?, NULL, ?, NULL, NULL, NULL)
            ON CONFLICT(document_id, stage) DO UPDATE SET
                status = excluded.status,
                attempt_id = excluded.attempt_id,
                started_at = excluded.started_at,
                completed_at = NULL,
                original_file_name = excluded.original_file_name,
                stage_file_name = NULL,
                storage_key = NULL,
                detail = NULL
            "#,
        )
        .bind(&record.document_id)
        .bind(record.stage.as_str())
        .bind(record.status.as_str())
        .bind(&record.attempt_id)
        .bind(to_ms(record.started_at))
        .bind(&record.original_file_name)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(record)
    }

    async fn complete_stage(&self, record: &mut ProcessingStage) -> Result<()> {
        let mut done = record.clone();
        done.mark_complete(now());
        self.finish_stage(record, &done).await?;
        *record = done;
        Ok(())
    }

    async fn fail_stage(&self, record: &mut ProcessingStage, detail: &str) -> Result<()> {
        let mut failed = record.clone();
        failed.mark_failed(detail, now());
        self.finish_stage(record, &failed).await?;
        *record = failed;
        Ok(())
    }

    async fn get_stage(
        &self,
        document_id: &str,
        stage: &StageName,
    ) -> Result<Option<ProcessingStage>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM processing_stages WHERE document_id = ? AND stage = ?",
            STAGE_COLUMNS
        ))
        .bind(document_id)
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(stage_from_row).transpose()
    }

    async fn list_stages(&self, document_id: &str) -> Result<Vec<ProcessingStage>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM processing_stages WHERE document_id = ?",
            STAGE_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut records = rows
            .iter()
            .map(stage_from_row)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by_key(|r| (stage_order(&r.stage), r.started_at));
        Ok(records)
    }

    async fn list_stale_stages(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProcessingStage>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM processing_stages \
             WHERE status = 'in-progress' AND started_at < ? ORDER BY started_at",
            STAGE_COLUMNS
        ))
        .bind(to_ms(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(stage_from_row).collect()
    }

    async fn list_unstarted_documents(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DiscoveredDocument>> {
        let rows = sqlx::query(
            r#"
            SELECT d.* FROM documents d
            WHERE d.discovered_at < ?
              AND NOT EXISTS (SELECT 1 FROM processing_stages s WHERE s.document_id = d.id)
            ORDER BY d.discovered_at
            "#,
        )
        .bind(to_ms(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(document_from_row).collect()
    }
}
