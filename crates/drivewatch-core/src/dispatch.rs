//! Hand-off from ingestion to the per-document processing workflow.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::models::{StepInput, STAGE_NEW};

/// Identifies a started workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub execution_id: String,
}

/// External workflow execution service.
#[async_trait]
pub trait WorkflowStarter: Send + Sync {
    /// Start one execution of `workflow_id` with `input`. Failures surface
    /// as `Workflow` errors.
    async fn start(&self, workflow_id: &str, input: &StepInput) -> Result<ExecutionHandle>;
}

/// Starts one pipeline execution per newly recorded document.
#[derive(Clone)]
pub struct PipelineDispatcher {
    starter: Arc<dyn WorkflowStarter>,
    workflow_id: String,
}

impl PipelineDispatcher {
    pub fn new(starter: Arc<dyn WorkflowStarter>, workflow_id: impl Into<String>) -> Self {
        Self {
            starter,
            workflow_id: workflow_id.into(),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub async fn dispatch(
        &self,
        notification_id: &str,
        document_id: &str,
    ) -> Result<ExecutionHandle> {
        let input = StepInput {
            notification_id: notification_id.to_string(),
            document_id: document_id.to_string(),
            stage: STAGE_NEW.to_string(),
        };
        let handle = self.starter.start(&self.workflow_id, &input).await?;
        info!(
            workflow_id = %self.workflow_id,
            document_id,
            execution_id = %handle.execution_id,
            "pipeline execution started"
        );
        Ok(handle)
    }
}
