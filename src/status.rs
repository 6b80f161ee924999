//! Read-only operator views: channels, queues, and stage records.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};

use drivewatch_core::models::now;
use drivewatch_core::store::{ChannelRegistry, DocumentLedger, LeaseStore};
use drivewatch_core::CoordError;

use crate::config::Config;
use crate::db;
use crate::sqlite_queue::{SqliteQueue, NOTIFICATIONS_QUEUE, PIPELINE_QUEUE};
use crate::sqlite_store::SqliteStore;

pub async fn list_channels(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let channels = store.list_channels().await?;

    if channels.is_empty() {
        println!("No channels registered.");
        return Ok(());
    }

    let at = now();
    println!(
        "{:<24} {:<38} {:<22} {:<10} CURSOR",
        "FOLDER", "CHANNEL", "EXPIRES", "LEASE"
    );
    for channel in channels {
        let (lease_state, cursor) = match store.get_lease(&channel.channel_id).await? {
            Some(lease) if !lease.is_available(at) => ("held", lease.cursor),
            Some(lease) => ("free", lease.cursor),
            None => ("missing", "-".to_string()),
        };
        println!(
            "{:<24} {:<38} {:<22} {:<10} {}",
            channel.folder_id,
            channel.channel_id,
            channel.expires_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            lease_state,
            cursor
        );
    }
    Ok(())
}

pub async fn show_queues(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    println!("{:<16} {:>8} {:>10} {:>6}", "QUEUE", "READY", "IN-FLIGHT", "DEAD");
    for name in [NOTIFICATIONS_QUEUE, PIPELINE_QUEUE] {
        let queue = SqliteQueue::from_config(pool.clone(), name, &config.queue);
        let depth = queue.depth().await?;
        println!(
            "{:<16} {:>8} {:>10} {:>6}",
            name, depth.ready, depth.in_flight, depth.dead
        );
    }
    Ok(())
}

pub async fn show_dead_letters(config: &Config, queue_name: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let queue = SqliteQueue::from_config(pool, queue_name, &config.queue);
    let bodies = queue.dead_letters().await?;
    if bodies.is_empty() {
        println!("No dead letters in {}.", queue_name);
    }
    for body in bodies {
        println!("{}", body);
    }
    Ok(())
}

/// `now - older_than_secs`, defaulting to the configured stage timeout.
pub(crate) fn cutoff(config: &Config, older_than_secs: Option<i64>) -> Result<DateTime<Utc>> {
    let secs = older_than_secs.unwrap_or(config.pipeline.stage_timeout_secs);
    let age = Duration::try_seconds(secs)
        .with_context(|| format!("{} seconds is out of range", secs))?;
    now()
        .checked_sub_signed(age)
        .with_context(|| format!("{} seconds is out of range", secs))
}

/// In-progress stages older than `older_than_secs` (default: the
/// configured stage timeout).
pub async fn list_stale(config: &Config, older_than_secs: Option<i64>) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let stale = store
        .list_stale_stages(cutoff(config, older_than_secs)?)
        .await?;

    if stale.is_empty() {
        println!("No stale stages.");
        return Ok(());
    }

    println!("{:<38} {:<14} {:<22} FILE", "DOCUMENT", "STAGE", "STARTED");
    for record in stale {
        println!(
            "{:<38} {:<14} {:<22} {}",
            record.document_id,
            record.stage.as_str(),
            record.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            record.original_file_name
        );
    }
    Ok(())
}

/// Documents recorded longer ago than `older_than_secs` whose pipeline
/// never started.
pub async fn list_unstarted(config: &Config, older_than_secs: Option<i64>) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let docs = store
        .list_unstarted_documents(cutoff(config, older_than_secs)?)
        .await?;

    if docs.is_empty() {
        println!("No unstarted documents.");
        return Ok(());
    }

    println!("{:<38} {:<22} NAME", "DOCUMENT", "DISCOVERED");
    for doc in docs {
        println!(
            "{:<38} {:<22} {}",
            doc.id,
            doc.discovered_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            doc.display_name
        );
    }
    Ok(())
}

pub async fn show_document(config: &Config, document_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let document = store
        .get_document(document_id)
        .await?
        .ok_or_else(|| CoordError::not_found("document", document_id))?;

    println!("--- Document ---");
    println!("id:          {}", document.id);
    println!("external_id: {}", document.external_id);
    println!("folder:      {}", document.parent_folder_id);
    println!("name:        {}", document.display_name);
    println!("size:        {}", document.byte_size);
    println!(
        "mime_type:   {}",
        document.mime_type.as_deref().unwrap_or("-")
    );
    println!("discovered:  {}", document.discovered_at.to_rfc3339());

    let stages = store.list_stages(document_id).await?;
    println!("--- Stages ({}) ---", stages.len());
    for record in stages {
        let finished = record
            .completed_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<14} {:<12} started {} finished {}",
            record.stage.as_str(),
            record.status.as_str(),
            record.started_at.to_rfc3339(),
            finished
        );
        if let Some(key) = &record.storage_key {
            println!("    artifact: {}", key);
        }
        if let Some(detail) = &record.detail {
            println!("    detail:   {}", detail);
        }
    }
    Ok(())
}
