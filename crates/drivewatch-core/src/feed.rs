//! Change-feed provider abstraction.
//!
//! A change feed is paged by an opaque cursor. Every page carries either a
//! continuation token (more pages follow) or a new resume cursor marking the
//! end of currently available changes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// File metadata attached to a change entry. Absent for removals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub parent_folder_ids: Vec<String>,
    pub byte_size: i64,
    pub mime_type: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    /// Moved to the provider's trash; treated like a removal.
    #[serde(default)]
    pub trashed: bool,
}

/// One entry in a change-feed page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub external_id: String,
    pub removed: bool,
    pub file: Option<FileMetadata>,
}

impl ChangeEntry {
    pub fn is_removal(&self) -> bool {
        self.removed || self.file.as_ref().map(|f| f.trashed).unwrap_or(true)
    }

    pub fn has_parent(&self, folder_id: &str) -> bool {
        self.file
            .as_ref()
            .map(|f| f.parent_folder_ids.iter().any(|p| p == folder_id))
            .unwrap_or(false)
    }
}

/// How a page ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageContinuation {
    /// More pages follow; request the next one with this token.
    NextPage(String),
    /// Last page; resume from this cursor on the next ingestion call.
    Resume(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePage {
    pub entries: Vec<ChangeEntry>,
    pub continuation: PageContinuation,
}

/// External change-feed provider.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Fetch one page starting at `cursor`. Transport and provider failures
    /// surface as `FeedUnavailable`.
    async fn get_changes(&self, cursor: &str) -> Result<ChangePage>;

    /// Cursor marking "now" in the feed; used once when a channel is created.
    async fn get_start_cursor(&self) -> Result<String>;
}
