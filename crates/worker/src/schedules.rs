//! Recurring workflow schedules.

use fishsense_pipeline::{ClientError, WorkflowClient};

/// Register recurring schedules with the broker. Clustering runs are
/// started on demand per dive, so nothing recurs yet.
pub async fn schedule_workflows(_client: &WorkflowClient) -> Result<(), ClientError> {
    tracing::debug!("No recurring workflow schedules to register");
    Ok(())
}
