//! Caller-side API: start clustering runs, inspect them and collect their
//! results.

use std::sync::Arc;
use std::time::Duration;

use fishsense_core::image::{DiveRef, ImageRef};
use fishsense_core::workflow::{OrchestratorState, WorkflowStatus};

use crate::broker::{
    BrokerError, ExecutionRecord, InvocationRecord, StartWorkflowRequest, TaskQueue,
    WorkflowHandle,
};
use crate::history::{HistoryEvent, WorkflowError};
use crate::workflows::{DiveFrameClusteringInput, DIVE_FRAME_CLUSTERING};

/// How often [`WorkflowClient::result`] re-reads the execution.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("workflow ended {}: {error}", status.name())]
    Workflow {
        status: WorkflowStatus,
        error: WorkflowError,
    },

    #[error("cannot decode workflow result: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Starts and observes workflow runs on one task queue.
#[derive(Clone)]
pub struct WorkflowClient {
    broker: Arc<dyn TaskQueue>,
    task_queue: String,
    poll_interval: Duration,
}

impl WorkflowClient {
    pub fn new(broker: Arc<dyn TaskQueue>, task_queue: impl Into<String>) -> Self {
        Self {
            broker,
            task_queue: task_queue.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Workflow id used for a dive; at most one run per dive is open.
    pub fn dive_workflow_id(dive: &DiveRef) -> String {
        format!("dive-frame-clustering-{}", dive.id)
    }

    pub async fn start_dive_frame_clustering(
        &self,
        dive: &DiveRef,
        images: &[ImageRef],
    ) -> Result<WorkflowHandle, ClientError> {
        let input = DiveFrameClusteringInput {
            dive: dive.clone(),
            images: images.to_vec(),
        };
        let handle = self
            .broker
            .start_workflow(StartWorkflowRequest {
                workflow_id: Self::dive_workflow_id(dive),
                workflow_type: DIVE_FRAME_CLUSTERING.to_string(),
                task_queue: self.task_queue.clone(),
                input: serde_json::to_value(&input)?,
            })
            .await?;
        tracing::debug!(dive_id = dive.id, images = images.len(), run_id = %handle.run_id, "Enqueued dive frame clustering");
        Ok(handle)
    }

    pub async fn describe(&self, handle: &WorkflowHandle) -> Result<ExecutionRecord, ClientError> {
        Ok(self.broker.describe_workflow(handle).await?)
    }

    pub async fn activity_invocations(
        &self,
        handle: &WorkflowHandle,
    ) -> Result<Vec<InvocationRecord>, ClientError> {
        Ok(self.broker.list_activity_invocations(handle).await?)
    }

    pub async fn history(&self, handle: &WorkflowHandle) -> Result<Vec<HistoryEvent>, ClientError> {
        Ok(self.broker.history(handle).await?)
    }

    /// Where the run stands, combining the execution and its clustering
    /// invocation.
    pub async fn orchestrator_state(
        &self,
        handle: &WorkflowHandle,
    ) -> Result<OrchestratorState, ClientError> {
        let execution = self.describe(handle).await?;
        let invocations = self.activity_invocations(handle).await?;
        let activity = invocations.first().map(|i| (i.status, i.attempt));
        Ok(OrchestratorState::derive(execution.status, activity))
    }

    pub async fn cancel(&self, handle: &WorkflowHandle) -> Result<(), ClientError> {
        Ok(self.broker.request_cancel_workflow(handle).await?)
    }

    /// Wait until the run closes, then decode its clusters or return the
    /// recorded failure.
    pub async fn result(&self, handle: &WorkflowHandle) -> Result<Vec<Vec<ImageRef>>, ClientError> {
        loop {
            let record = self.describe(handle).await?;
            if record.status.is_terminal() {
                return Self::into_result(record);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn into_result(record: ExecutionRecord) -> Result<Vec<Vec<ImageRef>>, ClientError> {
        match (record.status, record.result, record.error) {
            (WorkflowStatus::Completed, Some(result), _) => Ok(serde_json::from_value(result)?),
            (status, _, Some(error)) => Err(ClientError::Workflow { status, error }),
            (WorkflowStatus::Cancelled, _, None) => Err(ClientError::Workflow {
                status: WorkflowStatus::Cancelled,
                error: WorkflowError::Cancelled,
            }),
            (status, _, None) => Err(ClientError::Workflow {
                status,
                error: WorkflowError::Decode {
                    message: "closed execution has no result".to_string(),
                },
            }),
        }
    }
}
