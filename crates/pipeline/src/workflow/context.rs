//! Replay context handed to workflow code.
//!
//! A workflow body never waits on real I/O. Each activity call resolves
//! from history if the outcome is already recorded; otherwise it emits a
//! `ScheduleActivity` command once and stays pending until a later task
//! replays it with the outcome in history.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use fishsense_core::retry::ActivityOptions;
use serde_json::Value;

use crate::history::{ActivityFailure, Command, HistoryEvent};

#[derive(Debug, Default)]
struct ReplayState {
    history: Vec<HistoryEvent>,
    /// Activity calls made so far in this replay.
    next_seq: u32,
    commands: Vec<Command>,
    nondeterminism: Option<String>,
}

impl ReplayState {
    fn cancel_requested(&self) -> bool {
        self.history
            .iter()
            .any(|e| matches!(e, HistoryEvent::WorkflowCancelRequested))
    }

    fn scheduled_type(&self, activity_id: &str) -> Option<String> {
        self.history.iter().find_map(|e| match e {
            HistoryEvent::ActivityTaskScheduled {
                activity_id: id,
                activity_type,
                ..
            } if id == activity_id => Some(activity_type.clone()),
            _ => None,
        })
    }

    /// The recorded outcome of an activity, if it has closed.
    fn outcome(&self, activity_id: &str, activity_type: &str) -> Option<Result<Value, ActivityFailure>> {
        self.history.iter().find_map(|e| {
            if e.activity_id() != Some(activity_id) {
                return None;
            }
            match e {
                HistoryEvent::ActivityTaskCompleted { result, .. } => Some(Ok(result.clone())),
                HistoryEvent::ActivityTaskFailed { attempt, failure, .. } => {
                    Some(Err(ActivityFailure::Failed {
                        activity_id: activity_id.to_string(),
                        activity_type: activity_type.to_string(),
                        attempt: *attempt,
                        failure: failure.clone(),
                    }))
                }
                HistoryEvent::ActivityTaskTimedOut { attempt, kind, .. } => {
                    Some(Err(ActivityFailure::TimedOut {
                        activity_id: activity_id.to_string(),
                        activity_type: activity_type.to_string(),
                        attempt: *attempt,
                        kind: *kind,
                    }))
                }
                HistoryEvent::ActivityTaskCancelled { .. } => Some(Err(ActivityFailure::Cancelled {
                    activity_id: activity_id.to_string(),
                    activity_type: activity_type.to_string(),
                })),
                _ => None,
            }
        })
    }
}

/// Handle through which a workflow body schedules activities.
///
/// Clones share the same replay state.
#[derive(Debug, Clone, Default)]
pub struct WorkflowContext {
    state: Arc<Mutex<ReplayState>>,
}

impl WorkflowContext {
    pub(crate) fn new(history: Vec<HistoryEvent>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ReplayState {
                history,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a client asked this run to cancel.
    pub fn is_cancel_requested(&self) -> bool {
        self.lock().cancel_requested()
    }

    /// Run an activity and wait for its outcome.
    ///
    /// Activity ids are assigned from the call order, so a workflow must
    /// issue the same calls in the same order on every replay.
    pub fn execute_activity(
        &self,
        activity_type: &str,
        input: Value,
        options: ActivityOptions,
    ) -> ActivityFuture {
        let activity_id = {
            let mut state = self.lock();
            state.next_seq += 1;
            state.next_seq.to_string()
        };
        ActivityFuture {
            ctx: self.clone(),
            activity_id,
            activity_type: activity_type.to_string(),
            input: Some(input),
            options,
            cancel_sent: false,
        }
    }

    pub(crate) fn take_commands(&self) -> Vec<Command> {
        std::mem::take(&mut self.lock().commands)
    }

    /// Describe any divergence between this replay and the recorded history.
    pub(crate) fn nondeterminism(&self) -> Option<String> {
        let state = self.lock();
        if let Some(message) = &state.nondeterminism {
            return Some(message.clone());
        }
        let recorded = state
            .history
            .iter()
            .filter(|e| matches!(e, HistoryEvent::ActivityTaskScheduled { .. }))
            .count();
        (recorded > state.next_seq as usize).then(|| {
            format!(
                "history records {recorded} scheduled activities but the workflow requested {}",
                state.next_seq
            )
        })
    }
}

/// Outcome of one activity call.
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct ActivityFuture {
    ctx: WorkflowContext,
    activity_id: String,
    activity_type: String,
    input: Option<Value>,
    options: ActivityOptions,
    cancel_sent: bool,
}

impl Future for ActivityFuture {
    type Output = Result<Value, ActivityFailure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.ctx.lock();

        match state.scheduled_type(&this.activity_id) {
            Some(recorded) if recorded != this.activity_type => {
                state.nondeterminism = Some(format!(
                    "activity {} was scheduled as {recorded} but replay requested {}",
                    this.activity_id, this.activity_type
                ));
                Poll::Pending
            }
            Some(_) => {
                if let Some(outcome) = state.outcome(&this.activity_id, &this.activity_type) {
                    return Poll::Ready(outcome);
                }
                if state.cancel_requested() {
                    if !this.cancel_sent {
                        this.cancel_sent = true;
                        state.commands.push(Command::RequestCancelActivity {
                            activity_id: this.activity_id.clone(),
                        });
                    }
                    return Poll::Ready(Err(ActivityFailure::Cancelled {
                        activity_id: this.activity_id.clone(),
                        activity_type: this.activity_type.clone(),
                    }));
                }
                Poll::Pending
            }
            None if state.cancel_requested() => Poll::Ready(Err(ActivityFailure::Cancelled {
                activity_id: this.activity_id.clone(),
                activity_type: this.activity_type.clone(),
            })),
            None => {
                if let Some(input) = this.input.take() {
                    state.commands.push(Command::ScheduleActivity {
                        activity_id: this.activity_id.clone(),
                        activity_type: this.activity_type.clone(),
                        input,
                        options: this.options.clone(),
                    });
                }
                Poll::Pending
            }
        }
    }
}
