//! In-process broker.
//!
//! Deadlines use `tokio::time::Instant`, so tests can pause and advance
//! the clock. Wall-clock timestamps are only used for reporting.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fishsense_core::retry::ActivityOptions;
use fishsense_core::types::Timestamp;
use fishsense_core::workflow::{ActivityStatus, WorkflowStatus};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    check_activity_transition, check_workflow_transition, close_outcome, close_payload,
    retry_delay, start_to_close_failure, validate_commands,
    ActivityTask, ActivityTaskToken, BrokerError, ExecutionRecord, InvocationRecord,
    StartWorkflowRequest, TaskQueue, WorkflowHandle, WorkflowTask, WorkflowTaskToken,
    WORKFLOW_TASK_LEASE, WORKFLOW_TASK_RETRY_DELAY,
};
use crate::history::{Command, Failure, HistoryEvent, TimeoutKind};

struct Invocation {
    activity_id: String,
    activity_type: String,
    task_queue: String,
    status: ActivityStatus,
    input: Value,
    options: ActivityOptions,
    attempt: u32,
    available_at: Instant,
    schedule_to_close_deadline: Instant,
    start_to_close_deadline: Option<Instant>,
    last_failure: Option<Failure>,
    result: Option<Value>,
}

impl Invocation {
    fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    fn record(&self) -> InvocationRecord {
        InvocationRecord {
            activity_id: self.activity_id.clone(),
            activity_type: self.activity_type.clone(),
            status: self.status,
            attempt: self.attempt,
            last_failure: self.last_failure.clone(),
            result: self.result.clone(),
        }
    }

    fn is_current(&self, token: &ActivityTaskToken) -> bool {
        self.status == ActivityStatus::Started && self.attempt == token.attempt
    }

    fn transition(&mut self, run_id: Uuid, to: ActivityStatus) -> Result<(), BrokerError> {
        check_activity_transition(run_id, self.status, to)?;
        self.status = to;
        Ok(())
    }
}

struct Execution {
    handle: WorkflowHandle,
    workflow_type: String,
    task_queue: String,
    status: WorkflowStatus,
    input: Value,
    cancel_requested: bool,
    task_pending: bool,
    lease_id: Option<Uuid>,
    locked_until: Option<Instant>,
    history: Vec<HistoryEvent>,
    activities: Vec<Invocation>,
    created_at: Timestamp,
    closed_at: Option<Timestamp>,
}

impl Execution {
    fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    fn task_due(&self, task_queue: &str, now: Instant) -> bool {
        self.is_open()
            && self.task_pending
            && self.task_queue == task_queue
            && self.locked_until.is_none_or(|until| until <= now)
    }

    fn invocation_mut(&mut self, activity_id: &str) -> Option<&mut Invocation> {
        self.activities
            .iter_mut()
            .find(|a| a.activity_id == activity_id)
    }

    fn push_event(&mut self, event: HistoryEvent) {
        self.history.push(event);
        self.task_pending = true;
    }

    fn check_lease(&self, token: &WorkflowTaskToken) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::ExecutionClosed(token.run_id));
        }
        if self.lease_id != Some(token.lease_id) {
            return Err(BrokerError::StaleLease(token.run_id));
        }
        Ok(())
    }

    fn transition(&mut self, to: WorkflowStatus) -> Result<(), BrokerError> {
        check_workflow_transition(self.handle.run_id, self.status, to)?;
        self.status = to;
        Ok(())
    }

    fn close(&mut self, status: WorkflowStatus, event: HistoryEvent) -> Result<(), BrokerError> {
        self.transition(status)?;
        self.history.push(event);
        self.closed_at = Some(Utc::now());
        self.task_pending = false;
        let run_id = self.handle.run_id;
        for activity in self.activities.iter_mut().filter(|a| a.is_open()) {
            activity.transition(run_id, ActivityStatus::Cancelled)?;
        }
        Ok(())
    }

    fn record(&self) -> ExecutionRecord {
        let (result, error) = match self.history.last() {
            Some(event) if !self.is_open() => close_payload(event),
            _ => (None, None),
        };
        ExecutionRecord {
            handle: self.handle.clone(),
            workflow_type: self.workflow_type.clone(),
            task_queue: self.task_queue.clone(),
            status: self.status,
            input: self.input.clone(),
            result,
            error,
            cancel_requested: self.cancel_requested,
            created_at: self.created_at,
            closed_at: self.closed_at,
        }
    }

    /// Apply an attempt failure: reschedule, or close the invocation and
    /// record `final_event`.
    fn fail_attempt(
        &mut self,
        activity_id: &str,
        failure: Failure,
        final_event: HistoryEvent,
    ) -> Result<(), BrokerError> {
        let now = Instant::now();
        let run_id = self.handle.run_id;
        let Some(activity) = self.invocation_mut(activity_id) else {
            return Ok(());
        };
        match retry_delay(&activity.options, activity.attempt, &failure) {
            Some(delay) => {
                tracing::debug!(
                    activity_id,
                    attempt = activity.attempt,
                    ?delay,
                    "Retrying activity"
                );
                activity.transition(run_id, ActivityStatus::Scheduled)?;
                activity.attempt += 1;
                activity.available_at = now + delay;
                activity.start_to_close_deadline = None;
                activity.last_failure = Some(failure);
            }
            None => {
                let final_status = match final_event {
                    HistoryEvent::ActivityTaskTimedOut { .. } => ActivityStatus::TimedOut,
                    _ => ActivityStatus::Failed,
                };
                activity.transition(run_id, final_status)?;
                activity.last_failure = Some(failure);
                self.push_event(final_event);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct State {
    /// In creation order; polling picks the oldest due task.
    executions: Vec<Execution>,
}

impl State {
    fn execution(&self, run_id: Uuid) -> Result<&Execution, BrokerError> {
        self.executions
            .iter()
            .find(|e| e.handle.run_id == run_id)
            .ok_or(BrokerError::NotFound(run_id))
    }

    fn execution_mut(&mut self, run_id: Uuid) -> Result<&mut Execution, BrokerError> {
        self.executions
            .iter_mut()
            .find(|e| e.handle.run_id == run_id)
            .ok_or(BrokerError::NotFound(run_id))
    }
}

/// Broker that keeps all state in memory.
pub struct InMemoryBroker {
    state: Mutex<State>,
    lease: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            lease: WORKFLOW_TASK_LEASE,
        }
    }

    /// Override how long a workflow task lease lasts.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve an attempt, or `None` if it is not the running one.
    fn current_attempt<'a>(
        state: &'a mut State,
        token: &ActivityTaskToken,
    ) -> Result<Option<&'a mut Execution>, BrokerError> {
        let execution = state.execution_mut(token.run_id)?;
        let current = execution.is_open()
            && execution
                .activities
                .iter()
                .any(|a| a.activity_id == token.activity_id && a.is_current(token));
        Ok(current.then_some(execution))
    }
}

#[async_trait]
impl TaskQueue for InMemoryBroker {
    async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<WorkflowHandle, BrokerError> {
        let mut state = self.lock();
        if state
            .executions
            .iter()
            .any(|e| e.is_open() && e.handle.workflow_id == request.workflow_id)
        {
            return Err(BrokerError::AlreadyStarted(request.workflow_id));
        }

        let handle = WorkflowHandle {
            workflow_id: request.workflow_id,
            run_id: Uuid::new_v4(),
        };
        state.executions.push(Execution {
            handle: handle.clone(),
            history: vec![HistoryEvent::WorkflowExecutionStarted {
                workflow_type: request.workflow_type.clone(),
                input: request.input.clone(),
            }],
            workflow_type: request.workflow_type,
            task_queue: request.task_queue,
            status: WorkflowStatus::Scheduled,
            input: request.input,
            cancel_requested: false,
            task_pending: true,
            lease_id: None,
            locked_until: None,
            activities: Vec::new(),
            created_at: Utc::now(),
            closed_at: None,
        });
        tracing::info!(workflow_id = %handle.workflow_id, run_id = %handle.run_id, "Workflow started");
        Ok(handle)
    }

    async fn poll_workflow_task(
        &self,
        task_queue: &str,
    ) -> Result<Option<WorkflowTask>, BrokerError> {
        let now = Instant::now();
        let lease = self.lease;
        let mut state = self.lock();
        let Some(execution) = state
            .executions
            .iter_mut()
            .find(|e| e.task_due(task_queue, now))
        else {
            return Ok(None);
        };

        let lease_id = Uuid::new_v4();
        execution.lease_id = Some(lease_id);
        execution.locked_until = Some(now + lease);
        if execution.status == WorkflowStatus::Scheduled {
            execution.transition(WorkflowStatus::Running)?;
        }

        Ok(Some(WorkflowTask {
            token: WorkflowTaskToken {
                run_id: execution.handle.run_id,
                lease_id,
                last_event_id: execution.history.len() as u64,
            },
            handle: execution.handle.clone(),
            workflow_type: execution.workflow_type.clone(),
            input: execution.input.clone(),
            history: execution.history.clone(),
        }))
    }

    async fn complete_workflow_task(
        &self,
        token: WorkflowTaskToken,
        commands: Vec<Command>,
    ) -> Result<(), BrokerError> {
        let now = Instant::now();
        let mut state = self.lock();
        let execution = state.execution_mut(token.run_id)?;
        execution.check_lease(&token)?;
        validate_commands(&commands, |id| {
            execution.activities.iter().any(|a| a.activity_id == id)
        })?;

        let has_new_events = execution.history.len() as u64 > token.last_event_id;

        for command in commands {
            if let Some((status, event)) = close_outcome(&command) {
                tracing::info!(run_id = %token.run_id, status = status.name(), "Workflow closed");
                execution.close(status, event)?;
                break;
            }
            match command {
                Command::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => {
                    execution.history.push(HistoryEvent::ActivityTaskScheduled {
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        input: input.clone(),
                        options: options.clone(),
                    });
                    execution.activities.push(Invocation {
                        activity_id,
                        activity_type,
                        task_queue: execution.task_queue.clone(),
                        status: ActivityStatus::Scheduled,
                        input,
                        attempt: 1,
                        available_at: now,
                        schedule_to_close_deadline: now + options.schedule_to_close_timeout,
                        start_to_close_deadline: None,
                        options,
                        last_failure: None,
                        result: None,
                    });
                }
                Command::RequestCancelActivity { activity_id } => {
                    let cancelled = match execution.invocation_mut(&activity_id) {
                        Some(activity) if activity.is_open() => {
                            activity.transition(token.run_id, ActivityStatus::Cancelled)?;
                            true
                        }
                        _ => false,
                    };
                    if cancelled {
                        execution
                            .history
                            .push(HistoryEvent::ActivityTaskCancelled { activity_id });
                    }
                }
                _ => {}
            }
        }

        execution.lease_id = None;
        execution.locked_until = None;
        if execution.is_open() {
            execution.task_pending = has_new_events;
        }
        Ok(())
    }

    async fn fail_workflow_task(
        &self,
        token: WorkflowTaskToken,
        message: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let execution = state.execution_mut(token.run_id)?;
        execution.check_lease(&token)?;
        tracing::warn!(run_id = %token.run_id, error = message, "Workflow task failed");
        execution.lease_id = None;
        execution.locked_until = Some(Instant::now() + WORKFLOW_TASK_RETRY_DELAY);
        execution.task_pending = true;
        Ok(())
    }

    async fn poll_activity_task(
        &self,
        task_queue: &str,
    ) -> Result<Option<ActivityTask>, BrokerError> {
        let now = Instant::now();
        let mut state = self.lock();

        let mut due: Option<(usize, usize, Instant)> = None;
        for (ei, execution) in state.executions.iter().enumerate() {
            if !execution.is_open() {
                continue;
            }
            for (ai, activity) in execution.activities.iter().enumerate() {
                let ready = activity.status == ActivityStatus::Scheduled
                    && activity.task_queue == task_queue
                    && activity.available_at <= now;
                if ready && due.is_none_or(|(_, _, at)| activity.available_at < at) {
                    due = Some((ei, ai, activity.available_at));
                }
            }
        }
        let Some((ei, ai, _)) = due else {
            return Ok(None);
        };

        let execution = &mut state.executions[ei];
        let handle = execution.handle.clone();
        let activity = &mut execution.activities[ai];
        activity.transition(handle.run_id, ActivityStatus::Started)?;
        activity.start_to_close_deadline =
            activity.options.start_to_close_timeout.map(|t| now + t);

        Ok(Some(ActivityTask {
            token: ActivityTaskToken {
                run_id: handle.run_id,
                activity_id: activity.activity_id.clone(),
                attempt: activity.attempt,
            },
            handle,
            activity_type: activity.activity_type.clone(),
            input: activity.input.clone(),
            options: activity.options.clone(),
        }))
    }

    async fn complete_activity_task(
        &self,
        token: &ActivityTaskToken,
        result: Value,
    ) -> Result<bool, BrokerError> {
        let mut state = self.lock();
        let Some(execution) = Self::current_attempt(&mut *state, token)? else {
            tracing::debug!(activity_id = %token.activity_id, attempt = token.attempt, "Discarding stale activity result");
            return Ok(false);
        };
        if let Some(activity) = execution.invocation_mut(&token.activity_id) {
            activity.transition(token.run_id, ActivityStatus::Completed)?;
            activity.result = Some(result.clone());
        }
        execution.push_event(HistoryEvent::ActivityTaskCompleted {
            activity_id: token.activity_id.clone(),
            attempt: token.attempt,
            result,
        });
        Ok(true)
    }

    async fn fail_activity_task(
        &self,
        token: &ActivityTaskToken,
        failure: Failure,
    ) -> Result<bool, BrokerError> {
        let mut state = self.lock();
        let Some(execution) = Self::current_attempt(&mut *state, token)? else {
            tracing::debug!(activity_id = %token.activity_id, attempt = token.attempt, "Discarding stale activity failure");
            return Ok(false);
        };
        let final_event = HistoryEvent::ActivityTaskFailed {
            activity_id: token.activity_id.clone(),
            attempt: token.attempt,
            failure: failure.clone(),
        };
        execution.fail_attempt(&token.activity_id, failure, final_event)?;
        Ok(true)
    }

    async fn request_cancel_workflow(&self, handle: &WorkflowHandle) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let execution = state.execution_mut(handle.run_id)?;
        if !execution.is_open() {
            return Err(BrokerError::ExecutionClosed(handle.run_id));
        }
        if !execution.cancel_requested {
            execution.cancel_requested = true;
            execution.push_event(HistoryEvent::WorkflowCancelRequested);
            tracing::info!(run_id = %handle.run_id, "Workflow cancellation requested");
        }
        Ok(())
    }

    async fn sweep_timeouts(&self) -> Result<usize, BrokerError> {
        let now = Instant::now();
        let mut state = self.lock();
        let mut changed = 0;

        for execution in state.executions.iter_mut().filter(|e| e.is_open()) {
            let run_id = execution.handle.run_id;
            let mut expired = Vec::new();
            for activity in execution.activities.iter().filter(|a| a.is_open()) {
                if activity.schedule_to_close_deadline <= now {
                    expired.push((activity.activity_id.clone(), activity.attempt, TimeoutKind::ScheduleToClose));
                } else if activity.status == ActivityStatus::Started
                    && activity.start_to_close_deadline.is_some_and(|d| d <= now)
                {
                    expired.push((activity.activity_id.clone(), activity.attempt, TimeoutKind::StartToClose));
                }
            }

            for (activity_id, attempt, kind) in expired {
                changed += 1;
                let event = HistoryEvent::ActivityTaskTimedOut {
                    activity_id: activity_id.clone(),
                    attempt,
                    kind,
                };
                match kind {
                    TimeoutKind::ScheduleToClose => {
                        tracing::warn!(%run_id, activity_id, "Activity schedule-to-close timeout");
                        if let Some(activity) = execution.invocation_mut(&activity_id) {
                            activity.transition(run_id, ActivityStatus::TimedOut)?;
                        }
                        execution.push_event(event);
                    }
                    TimeoutKind::StartToClose => {
                        tracing::warn!(%run_id, activity_id, attempt, "Activity start-to-close timeout");
                        let timeout = execution
                            .invocation_mut(&activity_id)
                            .and_then(|a| a.options.start_to_close_timeout);
                        execution.fail_attempt(&activity_id, start_to_close_failure(timeout), event)?;
                    }
                }
            }
        }
        Ok(changed)
    }

    async fn describe_workflow(
        &self,
        handle: &WorkflowHandle,
    ) -> Result<ExecutionRecord, BrokerError> {
        Ok(self.lock().execution(handle.run_id)?.record())
    }

    async fn list_activity_invocations(
        &self,
        handle: &WorkflowHandle,
    ) -> Result<Vec<InvocationRecord>, BrokerError> {
        let state = self.lock();
        let execution = state.execution(handle.run_id)?;
        Ok(execution.activities.iter().map(Invocation::record).collect())
    }

    async fn history(&self, handle: &WorkflowHandle) -> Result<Vec<HistoryEvent>, BrokerError> {
        Ok(self.lock().execution(handle.run_id)?.history.clone())
    }
}
