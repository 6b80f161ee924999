//! Google Drive v3 REST client.
//!
//! Provides the change feed consumed by the ingestion engine plus the file
//! operations used by registration and by the pipeline stages.
//!
//! # Endpoints
//!
//! | Operation | Request |
//! |-----------|---------|
//! | change page | `GET {api_base}/changes?pageToken=…` |
//! | start cursor | `GET {api_base}/changes/startPageToken` |
//! | watch folder | `POST {api_base}/files/{id}/watch` |
//! | stop channel | `POST {api_base}/channels/stop` |
//! | download | `GET {api_base}/files/{id}?alt=media` |
//! | upload | `POST {upload_base}/files?uploadType=media`, then `PATCH` name and parent |
//!
//! # Authentication
//!
//! Every request carries `Authorization: Bearer <token>`, with the token read
//! once from the environment variable named by `drive.token_env`. Obtaining
//! and refreshing that token is left to the deployment.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use drivewatch_core::feed::{ChangeEntry, ChangeFeed, ChangePage, FileMetadata, PageContinuation};
use drivewatch_core::CoordError;

use crate::config::DriveConfig;

const CHANGE_FIELDS: &str = "nextPageToken,newStartPageToken,\
     changes(fileId,removed,file(id,name,parents,size,createdTime,modifiedTime,mimeType,trashed))";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("drive request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("drive {operation} failed (HTTP {status}): {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("drive response malformed: {0}")]
    Malformed(String),
}

pub type DriveResult<T> = std::result::Result<T, DriveError>;

// ═══════════════════════════════════════════════════════════════════════
// Wire types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangesResponse {
    next_page_token: Option<String>,
    new_start_page_token: Option<String>,
    #[serde(default)]
    changes: Vec<DriveChange>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveChange {
    file_id: String,
    #[serde(default)]
    removed: bool,
    file: Option<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    parents: Vec<String>,
    /// int64 encoded as a JSON string.
    size: Option<String>,
    created_time: Option<DateTime<Utc>>,
    modified_time: Option<DateTime<Utc>>,
    mime_type: Option<String>,
    #[serde(default)]
    trashed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPageTokenResponse {
    start_page_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WatchRequest<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    address: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    /// Epoch milliseconds, as a string.
    expiration: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    resource_id: String,
    expiration: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest<'a> {
    id: &'a str,
    resource_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

/// Result of a successful `files.watch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedChannel {
    pub resource_id: String,
    pub expires_at: DateTime<Utc>,
}

fn page_from_response(resp: ChangesResponse) -> DriveResult<ChangePage> {
    let entries = resp
        .changes
        .into_iter()
        .map(|c| ChangeEntry {
            external_id: c.file_id,
            removed: c.removed,
            file: c.file.map(|f| FileMetadata {
                name: f.name,
                parent_folder_ids: f.parents,
                byte_size: f.size.and_then(|s| s.parse().ok()).unwrap_or(0),
                mime_type: f.mime_type,
                created_at: f.created_time,
                modified_at: f.modified_time,
                trashed: f.trashed,
            }),
        })
        .collect();

    let continuation = match (resp.next_page_token, resp.new_start_page_token) {
        (Some(next), _) => PageContinuation::NextPage(next),
        (None, Some(resume)) => PageContinuation::Resume(resume),
        (None, None) => {
            return Err(DriveError::Malformed(
                "change page has neither nextPageToken nor newStartPageToken".to_string(),
            ))
        }
    };

    Ok(ChangePage {
        entries,
        continuation,
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct DriveClient {
    http: reqwest::Client,
    api_base: String,
    upload_base: String,
    token: String,
}

impl DriveClient {
    pub fn new(
        api_base: impl Into<String>,
        upload_base: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> DriveResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            upload_base: upload_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub fn from_config(config: &DriveConfig) -> anyhow::Result<Self> {
        let token = config.access_token()?;
        Ok(Self::new(
            &config.api_base,
            &config.upload_base,
            token,
            Duration::from_secs(config.timeout_secs),
        )?)
    }

    async fn checked(
        operation: &'static str,
        resp: reqwest::Response,
    ) -> DriveResult<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(DriveError::Status {
            operation,
            status,
            body: body.chars().take(500).collect(),
        })
    }

    pub async fn list_changes(&self, page_token: &str) -> DriveResult<ChangePage> {
        let resp = self
            .http
            .get(format!("{}/changes", self.api_base))
            .bearer_auth(&self.token)
            .query(&[
                ("pageToken", page_token),
                ("fields", CHANGE_FIELDS),
                ("includeRemoved", "true"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ])
            .send()
            .await?;
        let resp = Self::checked("changes.list", resp).await?;
        let body: ChangesResponse = resp.json().await?;
        debug!(page_token, changes = body.changes.len(), "drive change page");
        page_from_response(body)
    }

    pub async fn start_page_token(&self) -> DriveResult<String> {
        let resp = self
            .http
            .get(format!("{}/changes/startPageToken", self.api_base))
            .bearer_auth(&self.token)
            .query(&[("supportsAllDrives", "true")])
            .send()
            .await?;
        let resp = Self::checked("changes.getStartPageToken", resp).await?;
        let body: StartPageTokenResponse = resp.json().await?;
        Ok(body.start_page_token)
    }

    /// Open a push channel for `folder_id` delivering to `webhook_url`.
    pub async fn watch(
        &self,
        folder_id: &str,
        channel_id: &str,
        webhook_url: &str,
        token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> DriveResult<WatchedChannel> {
        let request = WatchRequest {
            id: channel_id,
            kind: "web_hook",
            address: webhook_url,
            token,
            expiration: expires_at.timestamp_millis().to_string(),
        };
        let resp = self
            .http
            .post(format!("{}/files/{}/watch", self.api_base, folder_id))
            .bearer_auth(&self.token)
            .query(&[("supportsAllDrives", "true")])
            .json(&request)
            .send()
            .await?;
        let resp = Self::checked("files.watch", resp).await?;
        let body: WatchResponse = resp.json().await?;

        // Drive may shorten the requested expiration.
        let granted = body
            .expiration
            .as_deref()
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or(expires_at);

        Ok(WatchedChannel {
            resource_id: body.resource_id,
            expires_at: granted,
        })
    }

    pub async fn stop_channel(&self, channel_id: &str, resource_id: &str) -> DriveResult<()> {
        let resp = self
            .http
            .post(format!("{}/channels/stop", self.api_base))
            .bearer_auth(&self.token)
            .json(&StopRequest {
                id: channel_id,
                resource_id,
            })
            .send()
            .await?;
        Self::checked("channels.stop", resp).await?;
        Ok(())
    }

    pub async fn download(&self, file_id: &str) -> DriveResult<Vec<u8>> {
        let resp = self
            .http
            .get(format!("{}/files/{}", self.api_base, file_id))
            .bearer_auth(&self.token)
            .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            .send()
            .await?;
        let resp = Self::checked("files.get", resp).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Upload `bytes` as a new file named `name` inside `parent_folder_id`.
    /// Returns the new file id.
    pub async fn upload(
        &self,
        parent_folder_id: &str,
        name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> DriveResult<String> {
        let resp = self
            .http
            .post(format!("{}/files", self.upload_base))
            .bearer_auth(&self.token)
            .query(&[("uploadType", "media"), ("supportsAllDrives", "true")])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;
        let resp = Self::checked("files.create", resp).await?;
        let created: UploadResponse = resp.json().await?;

        let resp = self
            .http
            .patch(format!("{}/files/{}", self.api_base, created.id))
            .bearer_auth(&self.token)
            .query(&[
                ("addParents", parent_folder_id),
                ("supportsAllDrives", "true"),
            ])
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        Self::checked("files.update", resp).await?;

        Ok(created.id)
    }
}

#[async_trait]
impl ChangeFeed for DriveClient {
    async fn get_changes(&self, cursor: &str) -> drivewatch_core::Result<ChangePage> {
        self.list_changes(cursor)
            .await
            .map_err(|e| CoordError::FeedUnavailable(e.to_string()))
    }

    async fn get_start_cursor(&self) -> drivewatch_core::Result<String> {
        self.start_page_token()
            .await
            .map_err(|e| CoordError::FeedUnavailable(e.to_string()))
    }
}
