//! Workflow definitions and the replay step that turns a workflow task
//! into commands.

mod context;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use serde_json::Value;

pub use context::{ActivityFuture, WorkflowContext};

use crate::broker::WorkflowTask;
use crate::history::{Command, WorkflowError};

/// A deterministic workflow body.
///
/// `run` is replayed from the start on every workflow task, so it must
/// reach the same activity calls in the same order each time and must not
/// touch clocks, randomness or I/O directly.
pub trait Workflow: Send + Sync + 'static {
    /// Type name recorded on executions; routes tasks to this definition.
    fn name(&self) -> &'static str;

    fn run(&self, ctx: WorkflowContext, input: Value) -> BoxFuture<'static, Result<Value, WorkflowError>>;
}

/// Workflow definitions by type name.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<&'static str, Arc<dyn Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, workflow: impl Workflow) -> &mut Self {
        self.workflows.insert(workflow.name(), Arc::new(workflow));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Workflow>> {
        self.workflows.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.workflows.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Why a workflow task could not produce commands. The broker retries the
/// task later.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplayError {
    #[error("no workflow registered for type {0}")]
    UnknownWorkflow(String),
    #[error("nondeterministic replay: {0}")]
    NonDeterminism(String),
    #[error("workflow panicked: {0}")]
    Panicked(String),
}

/// Replay a workflow task's history and collect the resulting commands.
pub fn replay(registry: &WorkflowRegistry, task: &WorkflowTask) -> Result<Vec<Command>, ReplayError> {
    let workflow = registry
        .get(&task.workflow_type)
        .ok_or_else(|| ReplayError::UnknownWorkflow(task.workflow_type.clone()))?;

    let ctx = WorkflowContext::new(task.history.clone());
    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);

    let polled = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let mut body = workflow.run(ctx.clone(), task.input.clone());
        body.as_mut().poll(&mut cx)
    }))
    .map_err(|payload| ReplayError::Panicked(panic_message(payload.as_ref())))?;

    if let Some(message) = ctx.nondeterminism() {
        return Err(ReplayError::NonDeterminism(message));
    }

    let mut commands = ctx.take_commands();
    match polled {
        Poll::Pending => {}
        Poll::Ready(Ok(result)) => commands.push(Command::CompleteWorkflow { result }),
        Poll::Ready(Err(error)) if error.is_cancellation() => commands.push(Command::CancelWorkflow),
        Poll::Ready(Err(error)) => commands.push(Command::FailWorkflow { error }),
    }
    Ok(commands)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
