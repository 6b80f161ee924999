use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
///
/// Timestamps are stored as epoch milliseconds.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            folder_id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL UNIQUE,
            resource_id TEXT NOT NULL,
            webhook_url TEXT NOT NULL,
            expires_at INTEGER NOT NULL,
            destination_folder_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS leases (
            channel_id TEXT PRIMARY KEY,
            cursor TEXT NOT NULL,
            locked INTEGER NOT NULL DEFAULT 0,
            lock_expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            parent_folder_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            byte_size INTEGER NOT NULL,
            mime_type TEXT,
            external_created_at INTEGER,
            external_modified_at INTEGER,
            discovered_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_stages (
            document_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            status TEXT NOT NULL,
            attempt_id TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            original_file_name TEXT NOT NULL,
            stage_file_name TEXT,
            storage_key TEXT,
            detail TEXT,
            PRIMARY KEY (document_id, stage),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_messages (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            body TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL,
            visible_at INTEGER NOT NULL,
            receive_count INTEGER NOT NULL DEFAULT 0,
            receipt TEXT,
            dead INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_stages_status_started ON processing_stages(status, started_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_queue_ready ON queue_messages(queue, dead, visible_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_parent ON documents(parent_folder_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
