//! PostgreSQL-backed broker.
//!
//! Every state change runs in one transaction that first row-locks the
//! workflow execution, then any activity invocation it touches. Holding
//! locks in that order keeps workers, clients and the timeout sweeper from
//! deadlocking one another.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fishsense_core::retry::ActivityOptions;
use fishsense_core::types::{DbId, Timestamp};
use fishsense_core::workflow::{ActivityStatus, WorkflowStatus};
use fishsense_db::models::workflow::{
    ActivityInvocation, HistoryRecord, NewActivityInvocation, NewWorkflowExecution,
    WorkflowExecution,
};
use fishsense_db::repositories::{
    ActivityInvocationRepo, WorkflowExecutionRepo, WorkflowHistoryRepo,
};
use fishsense_db::DbPool;
use serde_json::Value;
use uuid::Uuid;

use super::{
    check_activity_transition, check_workflow_transition, close_outcome, close_payload,
    retry_delay, start_to_close_failure, validate_commands,
    ActivityTask, ActivityTaskToken, BrokerError, ExecutionRecord, InvocationRecord,
    StartWorkflowRequest, TaskQueue, WorkflowHandle, WorkflowTask, WorkflowTaskToken,
    WORKFLOW_TASK_LEASE, WORKFLOW_TASK_RETRY_DELAY,
};
use crate::history::{Command, Failure, HistoryEvent, TimeoutKind};

type Tx<'a> = sqlx::Transaction<'a, sqlx::Postgres>;

/// Broker persisting executions, history and invocations to PostgreSQL.
#[derive(Clone)]
pub struct PostgresBroker {
    pool: DbPool,
    lease: Duration,
}

impl PostgresBroker {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            lease: WORKFLOW_TASK_LEASE,
        }
    }

    /// Override how long a workflow task lease lasts.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn append(tx: &mut Tx<'_>, execution_id: DbId, event: &HistoryEvent) -> Result<i64, BrokerError> {
        let value = serde_json::to_value(event)?;
        Ok(WorkflowHistoryRepo::append(&mut **tx, execution_id, &value).await?)
    }

    /// Record an attempt failure: reschedule it, or close the invocation
    /// with `final_status` and append `final_event`.
    async fn apply_attempt_failure(
        tx: &mut Tx<'_>,
        run_id: Uuid,
        invocation: &ActivityInvocation,
        failure: &Failure,
        final_status: ActivityStatus,
        final_event: HistoryEvent,
        now: Timestamp,
    ) -> Result<(), BrokerError> {
        let options: ActivityOptions = serde_json::from_value(invocation.options.clone())?;
        let failure_json = serde_json::to_value(failure)?;
        let attempt = attempt_number(invocation);
        let from = activity_status(invocation)?;

        match retry_delay(&options, attempt, failure) {
            Some(delay) => {
                check_activity_transition(run_id, from, ActivityStatus::Scheduled)?;
                tracing::debug!(
                    activity_id = %invocation.activity_id,
                    attempt,
                    ?delay,
                    "Retrying activity"
                );
                ActivityInvocationRepo::retry(
                    &mut **tx,
                    invocation.id,
                    invocation.attempt,
                    now + to_chrono(delay),
                    &failure_json,
                )
                .await?;
            }
            None => {
                check_activity_transition(run_id, from, final_status)?;
                ActivityInvocationRepo::close(
                    &mut **tx,
                    invocation.id,
                    final_status,
                    Some(&failure_json),
                    now,
                )
                .await?;
                Self::append(tx, invocation.execution_id, &final_event).await?;
                WorkflowExecutionRepo::mark_task_pending(&mut **tx, invocation.execution_id)
                    .await?;
            }
        }
        Ok(())
    }

    /// Lock the execution and the running attempt named by `token`.
    /// Returns `None` if that attempt is no longer current.
    async fn lock_current_attempt(
        tx: &mut Tx<'_>,
        token: &ActivityTaskToken,
    ) -> Result<Option<ActivityInvocation>, BrokerError> {
        let execution = WorkflowExecutionRepo::lock_by_run_id(&mut **tx, token.run_id)
            .await?
            .ok_or(BrokerError::NotFound(token.run_id))?;
        if is_closed(&execution) {
            return Ok(None);
        }
        let invocation =
            ActivityInvocationRepo::lock(&mut **tx, execution.id, &token.activity_id).await?;
        Ok(invocation.filter(|inv| {
            inv.status() == Some(ActivityStatus::Started) && attempt_number(inv) == token.attempt
        }))
    }

    /// Enforce one timeout under lock. Returns whether anything changed.
    async fn time_out(
        &self,
        execution_id: DbId,
        activity_id: &str,
        kind: TimeoutKind,
        now: Timestamp,
    ) -> Result<bool, BrokerError> {
        let mut tx = self.pool.begin().await?;
        let Some(execution) = WorkflowExecutionRepo::lock_by_id(&mut *tx, execution_id).await?
        else {
            return Ok(false);
        };
        if is_closed(&execution) {
            return Ok(false);
        }
        let Some(invocation) =
            ActivityInvocationRepo::lock(&mut *tx, execution_id, activity_id).await?
        else {
            return Ok(false);
        };
        let status = invocation.status();
        let event = HistoryEvent::ActivityTaskTimedOut {
            activity_id: activity_id.to_string(),
            attempt: attempt_number(&invocation),
            kind,
        };

        match kind {
            TimeoutKind::ScheduleToClose => {
                let Some(from) = status.filter(|s| !s.is_terminal()) else {
                    return Ok(false);
                };
                if invocation.schedule_to_close_deadline > now {
                    return Ok(false);
                }
                check_activity_transition(execution.run_id, from, ActivityStatus::TimedOut)?;
                tracing::warn!(run_id = %execution.run_id, activity_id, "Activity schedule-to-close timeout");
                ActivityInvocationRepo::close(
                    &mut *tx,
                    invocation.id,
                    ActivityStatus::TimedOut,
                    None,
                    now,
                )
                .await?;
                Self::append(&mut tx, execution_id, &event).await?;
                WorkflowExecutionRepo::mark_task_pending(&mut *tx, execution_id).await?;
            }
            TimeoutKind::StartToClose => {
                let expired = invocation.start_to_close_deadline.is_some_and(|d| d <= now);
                if status != Some(ActivityStatus::Started) || !expired {
                    return Ok(false);
                }
                tracing::warn!(
                    run_id = %execution.run_id,
                    activity_id,
                    attempt = invocation.attempt,
                    "Activity start-to-close timeout"
                );
                let timeout = invocation
                    .start_to_close_ms
                    .map(|ms| Duration::from_millis(ms.max(0) as u64));
                Self::apply_attempt_failure(
                    &mut tx,
                    execution.run_id,
                    &invocation,
                    &start_to_close_failure(timeout),
                    ActivityStatus::TimedOut,
                    event,
                    now,
                )
                .await?;
            }
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn find_execution(&self, run_id: Uuid) -> Result<WorkflowExecution, BrokerError> {
        WorkflowExecutionRepo::find_by_run_id(&self.pool, run_id)
            .await?
            .ok_or(BrokerError::NotFound(run_id))
    }
}

// ---------------------------------------------------------------------------
// Row conversions
// ---------------------------------------------------------------------------

fn is_closed(execution: &WorkflowExecution) -> bool {
    execution.status().is_none_or(WorkflowStatus::is_terminal)
}

fn check_lease(execution: &WorkflowExecution, token: &WorkflowTaskToken) -> Result<(), BrokerError> {
    if is_closed(execution) {
        return Err(BrokerError::ExecutionClosed(token.run_id));
    }
    if execution.lease_id != Some(token.lease_id) {
        return Err(BrokerError::StaleLease(token.run_id));
    }
    Ok(())
}

fn workflow_status(execution: &WorkflowExecution) -> Result<WorkflowStatus, BrokerError> {
    execution.status().ok_or_else(|| {
        BrokerError::Corrupt(format!("unknown workflow status id {}", execution.status_id))
    })
}

fn activity_status(invocation: &ActivityInvocation) -> Result<ActivityStatus, BrokerError> {
    invocation.status().ok_or_else(|| {
        BrokerError::Corrupt(format!("unknown activity status id {}", invocation.status_id))
    })
}

fn attempt_number(invocation: &ActivityInvocation) -> u32 {
    invocation.attempt.max(0) as u32
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

fn handle_of(execution: &WorkflowExecution) -> WorkflowHandle {
    WorkflowHandle {
        workflow_id: execution.workflow_id.clone(),
        run_id: execution.run_id,
    }
}

fn decode_history(records: Vec<HistoryRecord>) -> Result<Vec<HistoryEvent>, BrokerError> {
    records
        .into_iter()
        .map(|r| serde_json::from_value(r.event).map_err(BrokerError::from))
        .collect()
}

fn execution_record(execution: WorkflowExecution) -> Result<ExecutionRecord, BrokerError> {
    let status = workflow_status(&execution)?;
    let error = execution.failure.map(serde_json::from_value).transpose()?;
    Ok(ExecutionRecord {
        handle: WorkflowHandle {
            workflow_id: execution.workflow_id,
            run_id: execution.run_id,
        },
        workflow_type: execution.workflow_type,
        task_queue: execution.task_queue,
        status,
        input: execution.input,
        result: execution.result,
        error,
        cancel_requested: execution.cancel_requested,
        created_at: execution.created_at,
        closed_at: execution.closed_at,
    })
}

fn invocation_record(invocation: ActivityInvocation) -> Result<InvocationRecord, BrokerError> {
    let status = activity_status(&invocation)?;
    let attempt = attempt_number(&invocation);
    Ok(InvocationRecord {
        activity_id: invocation.activity_id,
        activity_type: invocation.activity_type,
        status,
        attempt,
        last_failure: invocation.last_failure.map(serde_json::from_value).transpose()?,
        result: invocation.result,
    })
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

#[async_trait]
impl TaskQueue for PostgresBroker {
    async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<WorkflowHandle, BrokerError> {
        let started = HistoryEvent::WorkflowExecutionStarted {
            workflow_type: request.workflow_type.clone(),
            input: request.input.clone(),
        };
        let new = NewWorkflowExecution {
            workflow_id: request.workflow_id,
            run_id: Uuid::new_v4(),
            workflow_type: request.workflow_type,
            task_queue: request.task_queue,
            input: request.input,
        };

        let mut tx = self.pool.begin().await?;
        let execution = match WorkflowExecutionRepo::insert(&mut *tx, &new).await {
            Ok(execution) => execution,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(BrokerError::AlreadyStarted(new.workflow_id));
            }
            Err(e) => return Err(e.into()),
        };
        Self::append(&mut tx, execution.id, &started).await?;
        tx.commit().await?;

        tracing::info!(workflow_id = %execution.workflow_id, run_id = %execution.run_id, "Workflow started");
        Ok(handle_of(&execution))
    }

    async fn poll_workflow_task(
        &self,
        task_queue: &str,
    ) -> Result<Option<WorkflowTask>, BrokerError> {
        let now = Utc::now();
        let lease_id = Uuid::new_v4();

        let mut tx = self.pool.begin().await?;
        let Some(execution) = WorkflowExecutionRepo::claim_next_task(
            &mut *tx,
            task_queue,
            now,
            lease_id,
            now + to_chrono(self.lease),
        )
        .await?
        else {
            return Ok(None);
        };
        let records = WorkflowHistoryRepo::list(&mut *tx, execution.id).await?;
        tx.commit().await?;

        let last_event_id = records.last().map_or(0, |r| r.event_id.max(0) as u64);
        Ok(Some(WorkflowTask {
            token: WorkflowTaskToken {
                run_id: execution.run_id,
                lease_id,
                last_event_id,
            },
            handle: handle_of(&execution),
            workflow_type: execution.workflow_type,
            input: execution.input,
            history: decode_history(records)?,
        }))
    }

    async fn complete_workflow_task(
        &self,
        token: WorkflowTaskToken,
        commands: Vec<Command>,
    ) -> Result<(), BrokerError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let execution = WorkflowExecutionRepo::lock_by_run_id(&mut *tx, token.run_id)
            .await?
            .ok_or(BrokerError::NotFound(token.run_id))?;
        check_lease(&execution, &token)?;

        let known = ActivityInvocationRepo::list_by_execution(&mut *tx, execution.id).await?;
        validate_commands(&commands, |id| known.iter().any(|i| i.activity_id == id))?;

        let last_event_id = WorkflowHistoryRepo::last_event_id(&mut *tx, execution.id).await?;
        let has_new_events = last_event_id.max(0) as u64 > token.last_event_id;
        let mut closed = false;

        for command in commands {
            if let Some((status, event)) = close_outcome(&command) {
                check_workflow_transition(token.run_id, workflow_status(&execution)?, status)?;
                let (result, error) = close_payload(&event);
                let failure = error.map(|e| serde_json::to_value(&e)).transpose()?;
                Self::append(&mut tx, execution.id, &event).await?;
                WorkflowExecutionRepo::close(
                    &mut *tx,
                    execution.id,
                    status,
                    result.as_ref(),
                    failure.as_ref(),
                    now,
                )
                .await?;
                for invocation in
                    ActivityInvocationRepo::list_by_execution(&mut *tx, execution.id).await?
                {
                    let from = activity_status(&invocation)?;
                    if from.is_terminal() {
                        continue;
                    }
                    check_activity_transition(token.run_id, from, ActivityStatus::Cancelled)?;
                    ActivityInvocationRepo::close(
                        &mut *tx,
                        invocation.id,
                        ActivityStatus::Cancelled,
                        None,
                        now,
                    )
                    .await?;
                }
                tracing::info!(run_id = %token.run_id, status = status.name(), "Workflow closed");
                closed = true;
                break;
            }

            match command {
                Command::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => {
                    let new = NewActivityInvocation {
                        execution_id: execution.id,
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        task_queue: execution.task_queue.clone(),
                        input: input.clone(),
                        options: serde_json::to_value(&options)?,
                        scheduled_at: now,
                        schedule_to_close_deadline: now
                            + to_chrono(options.schedule_to_close_timeout),
                        start_to_close_ms: options
                            .start_to_close_timeout
                            .map(|t| t.as_millis() as i64),
                    };
                    ActivityInvocationRepo::insert(&mut *tx, &new).await?;
                    let event = HistoryEvent::ActivityTaskScheduled {
                        activity_id,
                        activity_type,
                        input,
                        options,
                    };
                    Self::append(&mut tx, execution.id, &event).await?;
                }
                Command::RequestCancelActivity { activity_id } => {
                    let Some(invocation) =
                        ActivityInvocationRepo::lock(&mut *tx, execution.id, &activity_id).await?
                    else {
                        continue;
                    };
                    let from = activity_status(&invocation)?;
                    if from.is_terminal() {
                        continue;
                    }
                    check_activity_transition(token.run_id, from, ActivityStatus::Cancelled)?;
                    let cancelled = ActivityInvocationRepo::close(
                        &mut *tx,
                        invocation.id,
                        ActivityStatus::Cancelled,
                        None,
                        now,
                    )
                    .await?;
                    if cancelled {
                        let event = HistoryEvent::ActivityTaskCancelled { activity_id };
                        Self::append(&mut tx, execution.id, &event).await?;
                    }
                }
                _ => {}
            }
        }

        if !closed {
            WorkflowExecutionRepo::release_task(&mut *tx, execution.id, has_new_events, None)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fail_workflow_task(
        &self,
        token: WorkflowTaskToken,
        message: &str,
    ) -> Result<(), BrokerError> {
        let mut tx = self.pool.begin().await?;
        let execution = WorkflowExecutionRepo::lock_by_run_id(&mut *tx, token.run_id)
            .await?
            .ok_or(BrokerError::NotFound(token.run_id))?;
        check_lease(&execution, &token)?;
        tracing::warn!(run_id = %token.run_id, error = message, "Workflow task failed");

        let retry_at = Utc::now() + to_chrono(WORKFLOW_TASK_RETRY_DELAY);
        WorkflowExecutionRepo::release_task(&mut *tx, execution.id, true, Some(retry_at)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn poll_activity_task(
        &self,
        task_queue: &str,
    ) -> Result<Option<ActivityTask>, BrokerError> {
        let now = Utc::now();
        let Some(invocation) = ActivityInvocationRepo::claim_next(&self.pool, task_queue, now).await?
        else {
            return Ok(None);
        };
        let execution = WorkflowExecutionRepo::find_by_id(&self.pool, invocation.execution_id)
            .await?
            .ok_or_else(|| {
                BrokerError::Corrupt(format!(
                    "activity invocation {} has no execution",
                    invocation.id
                ))
            })?;

        let options: ActivityOptions = serde_json::from_value(invocation.options.clone())?;
        let handle = handle_of(&execution);
        Ok(Some(ActivityTask {
            token: ActivityTaskToken {
                run_id: handle.run_id,
                activity_id: invocation.activity_id.clone(),
                attempt: attempt_number(&invocation),
            },
            handle,
            activity_type: invocation.activity_type,
            input: invocation.input,
            options,
        }))
    }

    async fn complete_activity_task(
        &self,
        token: &ActivityTaskToken,
        result: Value,
    ) -> Result<bool, BrokerError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let Some(invocation) = Self::lock_current_attempt(&mut tx, token).await? else {
            tracing::debug!(activity_id = %token.activity_id, attempt = token.attempt, "Discarding stale activity result");
            return Ok(false);
        };

        check_activity_transition(
            token.run_id,
            activity_status(&invocation)?,
            ActivityStatus::Completed,
        )?;
        ActivityInvocationRepo::complete(&mut *tx, invocation.id, invocation.attempt, &result, now)
            .await?;
        let event = HistoryEvent::ActivityTaskCompleted {
            activity_id: token.activity_id.clone(),
            attempt: token.attempt,
            result,
        };
        Self::append(&mut tx, invocation.execution_id, &event).await?;
        WorkflowExecutionRepo::mark_task_pending(&mut *tx, invocation.execution_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn fail_activity_task(
        &self,
        token: &ActivityTaskToken,
        failure: Failure,
    ) -> Result<bool, BrokerError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let Some(invocation) = Self::lock_current_attempt(&mut tx, token).await? else {
            tracing::debug!(activity_id = %token.activity_id, attempt = token.attempt, "Discarding stale activity failure");
            return Ok(false);
        };

        let event = HistoryEvent::ActivityTaskFailed {
            activity_id: token.activity_id.clone(),
            attempt: token.attempt,
            failure: failure.clone(),
        };
        Self::apply_attempt_failure(
            &mut tx,
            token.run_id,
            &invocation,
            &failure,
            ActivityStatus::Failed,
            event,
            now,
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn request_cancel_workflow(&self, handle: &WorkflowHandle) -> Result<(), BrokerError> {
        let mut tx = self.pool.begin().await?;
        let execution = WorkflowExecutionRepo::lock_by_run_id(&mut *tx, handle.run_id)
            .await?
            .ok_or(BrokerError::NotFound(handle.run_id))?;
        if is_closed(&execution) {
            return Err(BrokerError::ExecutionClosed(handle.run_id));
        }
        if WorkflowExecutionRepo::request_cancel(&mut *tx, execution.id).await? {
            Self::append(&mut tx, execution.id, &HistoryEvent::WorkflowCancelRequested).await?;
            tracing::info!(run_id = %handle.run_id, "Workflow cancellation requested");
        }
        tx.commit().await?;
        Ok(())
    }

    async fn sweep_timeouts(&self) -> Result<usize, BrokerError> {
        let now = Utc::now();
        let mut changed = 0;

        // Candidates are read without locks and re-checked under lock.
        let schedule_to_close =
            ActivityInvocationRepo::list_schedule_to_close_expired(&self.pool, now).await?;
        for invocation in schedule_to_close {
            if self
                .time_out(
                    invocation.execution_id,
                    &invocation.activity_id,
                    TimeoutKind::ScheduleToClose,
                    now,
                )
                .await?
            {
                changed += 1;
            }
        }

        let start_to_close =
            ActivityInvocationRepo::list_start_to_close_expired(&self.pool, now).await?;
        for invocation in start_to_close {
            if self
                .time_out(
                    invocation.execution_id,
                    &invocation.activity_id,
                    TimeoutKind::StartToClose,
                    now,
                )
                .await?
            {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn describe_workflow(
        &self,
        handle: &WorkflowHandle,
    ) -> Result<ExecutionRecord, BrokerError> {
        execution_record(self.find_execution(handle.run_id).await?)
    }

    async fn list_activity_invocations(
        &self,
        handle: &WorkflowHandle,
    ) -> Result<Vec<InvocationRecord>, BrokerError> {
        let execution = self.find_execution(handle.run_id).await?;
        ActivityInvocationRepo::list_by_execution(&self.pool, execution.id)
            .await?
            .into_iter()
            .map(invocation_record)
            .collect()
    }

    async fn history(&self, handle: &WorkflowHandle) -> Result<Vec<HistoryEvent>, BrokerError> {
        let execution = self.find_execution(handle.run_id).await?;
        decode_history(WorkflowHistoryRepo::list(&self.pool, execution.id).await?)
    }
}
