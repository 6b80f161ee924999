//! Workflow starters.
//!
//! | Mode | Behavior |
//! |------|----------|
//! | `queue` | enqueue the step input on the local `pipeline` queue, drained by `dwatch work pipeline` |
//! | `http` | `POST {workflow_id, input}` to an external workflow service |
//!
//! `dwatch stages redispatch` starts the pipeline again for documents that
//! were recorded but never reached their first stage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use drivewatch_core::dispatch::{ExecutionHandle, PipelineDispatcher, WorkflowStarter};
use drivewatch_core::models::StepInput;
use drivewatch_core::queue::MessageQueue;
use drivewatch_core::store::DocumentLedger;
use drivewatch_core::{CoordError, Result};

use crate::config::{Config, WorkflowMode};
use crate::db;
use crate::sqlite_queue::{SqliteQueue, PIPELINE_QUEUE};
use crate::sqlite_store::SqliteStore;
use crate::status;

/// Body of a pipeline-queue message and of an HTTP start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineJob {
    pub workflow_id: String,
    pub input: StepInput,
}

pub struct QueueStarter {
    queue: Arc<dyn MessageQueue>,
}

impl QueueStarter {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl WorkflowStarter for QueueStarter {
    async fn start(&self, workflow_id: &str, input: &StepInput) -> Result<ExecutionHandle> {
        let job = PipelineJob {
            workflow_id: workflow_id.to_string(),
            input: input.clone(),
        };
        let body = serde_json::to_string(&job)
            .map_err(|e| CoordError::Workflow(format!("failed to encode job: {}", e)))?;
        let execution_id = self.queue.send(&body).await?;
        Ok(ExecutionHandle { execution_id })
    }
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    execution_id: Option<String>,
}

pub struct HttpStarter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpStarter {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CoordError::Workflow(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl WorkflowStarter for HttpStarter {
    async fn start(&self, workflow_id: &str, input: &StepInput) -> Result<ExecutionHandle> {
        let job = PipelineJob {
            workflow_id: workflow_id.to_string(),
            input: input.clone(),
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&job)
            .send()
            .await
            .map_err(|e| CoordError::Workflow(format!("start request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CoordError::Workflow(format!(
                "workflow service returned HTTP {}: {}",
                status,
                body.chars().take(500).collect::<String>()
            )));
        }

        // Services that do not report an id still get a traceable handle.
        let parsed: StartResponse = resp
            .json()
            .await
            .unwrap_or(StartResponse { execution_id: None });
        let execution_id = parsed
            .execution_id
            .unwrap_or_else(|| format!("{}:{}", workflow_id, input.document_id));
        Ok(ExecutionHandle { execution_id })
    }
}

pub fn starter_from_config(
    config: &Config,
    pool: SqlitePool,
) -> anyhow::Result<Arc<dyn WorkflowStarter>> {
    match config.workflow.mode {
        WorkflowMode::Queue => {
            let queue = SqliteQueue::from_config(pool, PIPELINE_QUEUE, &config.queue);
            Ok(Arc::new(QueueStarter::new(Arc::new(queue))))
        }
        WorkflowMode::Http => {
            let endpoint = config
                .workflow
                .endpoint
                .clone()
                .ok_or_else(|| anyhow::anyhow!("workflow.endpoint is required in http mode"))?;
            Ok(Arc::new(HttpStarter::new(endpoint)?))
        }
    }
}

/// Dispatch every document discovered before `cutoff` that has no stage
/// record yet. Returns how many were dispatched; the first failure is
/// returned after the rest have been tried.
pub async fn redispatch_unstarted(
    ledger: &dyn DocumentLedger,
    dispatcher: &PipelineDispatcher,
    cutoff: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let mut dispatched = 0;
    let mut first_err = None;
    for doc in ledger.list_unstarted_documents(cutoff).await? {
        let notification_id = Uuid::new_v4().to_string();
        match dispatcher.dispatch(&notification_id, &doc.id).await {
            Ok(_) => dispatched += 1,
            Err(e) => {
                warn!(document_id = %doc.id, error = %e, "redispatch failed");
                first_err.get_or_insert(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e.into()),
        None => Ok(dispatched),
    }
}

/// `dwatch stages redispatch`
pub async fn run_redispatch(config: &Config, older_than_secs: Option<i64>) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let dispatcher = PipelineDispatcher::new(
        starter_from_config(config, pool)?,
        &config.workflow.workflow_id,
    );
    let cutoff = status::cutoff(config, older_than_secs)?;
    let dispatched = redispatch_unstarted(&store, &dispatcher, cutoff).await?;
    info!(dispatched, "unstarted documents redispatched");
    println!("Redispatched {} document(s).", dispatched);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use drivewatch_core::models::{now, DocumentMetadata, StageName, STAGE_NEW};
    use drivewatch_core::queue::InMemoryQueue;
    use drivewatch_core::store::memory::InMemoryStore;

    #[tokio::test]
    async fn queue_starter_enqueues_job() {
        let queue = Arc::new(InMemoryQueue::new());
        let starter = QueueStarter::new(queue.clone());
        let input = StepInput {
            notification_id: "n-1".into(),
            document_id: "doc-1".into(),
            stage: STAGE_NEW.into(),
        };

        let handle = starter.start("document-pipeline", &input).await.unwrap();
        assert!(!handle.execution_id.is_empty());

        let bodies = queue.pending_bodies().unwrap();
        let job: PipelineJob = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(job.workflow_id, "document-pipeline");
        assert_eq!(job.input, input);
    }

    #[tokio::test]
    async fn redispatch_only_starts_documents_without_stages() {
        let store = InMemoryStore::new();
        let meta = DocumentMetadata {
            parent_folder_id: "F1".into(),
            display_name: "a.pdf".into(),
            byte_size: 1,
            mime_type: None,
            external_created_at: None,
            external_modified_at: None,
        };
        let stranded = store.record_if_new("g1", &meta).await.unwrap();
        let running = store.record_if_new("g2", &meta).await.unwrap();
        store
            .start_stage(&running.document_id, StageName::Download, "a.pdf")
            .await
            .unwrap();

        let queue = Arc::new(InMemoryQueue::new());
        let dispatcher =
            PipelineDispatcher::new(Arc::new(QueueStarter::new(queue.clone())), "document-pipeline");
        let n = redispatch_unstarted(&store, &dispatcher, now() + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(n, 1);

        let bodies = queue.pending_bodies().unwrap();
        assert_eq!(bodies.len(), 1);
        let job: PipelineJob = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(job.input.document_id, stranded.document_id);
        assert_eq!(job.input.stage, STAGE_NEW);
    }
}
