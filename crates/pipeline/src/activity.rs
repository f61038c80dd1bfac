//! Activity definitions and the registry the worker dispatches from.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::broker::WorkflowHandle;
use crate::history::Failure;

/// Error type recorded when an input or output payload cannot be decoded.
/// Retried like any other failure; a policy may list it as non-retryable.
pub const DECODE_ERROR: &str = "DecodeError";

/// Error type recorded when an activity panics.
pub const PANIC_ERROR: &str = "PanicError";

/// Where an attempt runs: the owning execution, the invocation and the
/// attempt number.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub workflow: WorkflowHandle,
    pub activity_id: String,
    pub attempt: u32,
}

/// Error returned by an activity attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error_type}: {message}")]
pub struct ActivityError {
    pub message: String,
    pub error_type: String,
    /// Fail the invocation now instead of consulting the retry policy.
    pub non_retryable: bool,
}

impl ActivityError {
    pub fn retryable(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
            non_retryable: false,
        }
    }

    pub fn non_retryable(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
            non_retryable: true,
        }
    }

    pub fn decode(err: serde_json::Error) -> Self {
        Self::retryable(DECODE_ERROR, err.to_string())
    }
}

impl From<ActivityError> for Failure {
    fn from(err: ActivityError) -> Self {
        Failure {
            message: err.message,
            error_type: err.error_type,
            non_retryable: err.non_retryable,
        }
    }
}

#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Activity type name used when scheduling.
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError>;
}

/// Activity definitions by type name.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    activities: HashMap<&'static str, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, activity: impl Activity) -> &mut Self {
        self.activities.insert(activity.name(), Arc::new(activity));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.activities.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Run one attempt on its own task so that a panic surfaces as a
/// retryable [`PANIC_ERROR`] instead of tearing down the caller.
pub async fn run_activity(
    activity: Arc<dyn Activity>,
    ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let attempt = tokio::spawn(async move { activity.execute(ctx, input).await });
    match attempt.await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(ActivityError::retryable(PANIC_ERROR, e.to_string())),
        Err(e) => Err(ActivityError::retryable("Aborted", e.to_string())),
    }
}
