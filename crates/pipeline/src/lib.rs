//! Workflow orchestration for FishSense data processing.
//!
//! A workflow is a deterministic program replayed from its event history;
//! activities do the actual work and may be retried. Both are dispatched
//! through a [`broker::TaskQueue`], which persists executions, history and
//! activity invocations and enforces retries and timeouts.

pub mod activities;
pub mod activity;
pub mod broker;
pub mod client;
pub mod history;
pub mod workflow;
pub mod workflows;

/// Task queue served by the data-processing worker.
pub const TASK_QUEUE: &str = "fishsense_data_processing_queue";

pub use activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
pub use broker::{BrokerError, InMemoryBroker, PostgresBroker, TaskQueue, WorkflowHandle};
pub use client::{ClientError, WorkflowClient};
pub use history::{ActivityFailure, Command, Failure, HistoryEvent, TimeoutKind, WorkflowError};
pub use workflow::{replay, ReplayError, Workflow, WorkflowContext, WorkflowRegistry};

/// Registries holding every workflow and activity this crate defines.
pub fn default_registries() -> (WorkflowRegistry, ActivityRegistry) {
    let mut workflow_registry = WorkflowRegistry::new();
    workflow_registry.register(workflows::DiveFrameClusteringWorkflow);
    let mut activity_registry = ActivityRegistry::new();
    activity_registry.register(activities::ClusterDiveFramesActivity);
    (workflow_registry, activity_registry)
}
