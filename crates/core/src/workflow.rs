//! Workflow and activity lifecycles.
//!
//! Status enums map to the SMALLINT status columns of the broker tables.
//! Terminal states have no outgoing transitions; the broker refuses to
//! write to an execution or invocation once it has reached one.

use serde::{Deserialize, Serialize};

/// Status ID type matching SMALLINT in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Look up a status by its database ID.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( $val => Some(Self::$variant), )+
                    _ => None,
                }
            }

            /// Human-readable name (for logs and error messages).
            pub fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => stringify!($variant), )+
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }
    };
}

define_status_enum! {
    /// Lifecycle of one workflow execution.
    WorkflowStatus {
        Scheduled = 1,
        Running = 2,
        Completed = 3,
        Failed = 4,
        TimedOut = 5,
        Cancelled = 6,
    }
}

define_status_enum! {
    /// Lifecycle of one activity invocation.
    ActivityStatus {
        Scheduled = 1,
        Started = 2,
        Completed = 3,
        Failed = 4,
        TimedOut = 5,
        Cancelled = 6,
    }
}

impl WorkflowStatus {
    /// Returns the set of statuses reachable from `self`.
    pub fn valid_transitions(self) -> &'static [WorkflowStatus] {
        use WorkflowStatus::*;
        match self {
            Scheduled => &[Running, Failed, Cancelled],
            Running => &[Completed, Failed, TimedOut, Cancelled],
            Completed | Failed | TimedOut | Cancelled => &[],
        }
    }

    pub fn can_transition(self, to: WorkflowStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Validate a state transition, returning an error message for invalid ones.
    pub fn validate_transition(self, to: WorkflowStatus) -> Result<(), String> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(format!(
                "Invalid workflow transition: {} -> {}",
                self.name(),
                to.name()
            ))
        }
    }

    pub fn is_terminal(self) -> bool {
        self.valid_transitions().is_empty()
    }
}

impl ActivityStatus {
    /// Returns the set of statuses reachable from `self`.
    ///
    /// `Started -> Scheduled` is a retry.
    pub fn valid_transitions(self) -> &'static [ActivityStatus] {
        use ActivityStatus::*;
        match self {
            Scheduled => &[Started, TimedOut, Cancelled],
            Started => &[Completed, Scheduled, Failed, TimedOut, Cancelled],
            Completed | Failed | TimedOut | Cancelled => &[],
        }
    }

    pub fn can_transition(self, to: ActivityStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Validate a state transition, returning an error message for invalid ones.
    pub fn validate_transition(self, to: ActivityStatus) -> Result<(), String> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(format!(
                "Invalid activity transition: {} -> {}",
                self.name(),
                to.name()
            ))
        }
    }

    pub fn is_terminal(self) -> bool {
        self.valid_transitions().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator view
// ---------------------------------------------------------------------------

/// Where one dive-processing request stands, combining the execution and
/// its single activity invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestratorState {
    Scheduled,
    ActivityScheduled,
    ActivityRunning,
    ActivityRetry,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl OrchestratorState {
    /// Returns the set of states reachable from `self`.
    pub fn valid_transitions(self) -> &'static [OrchestratorState] {
        use OrchestratorState::*;
        match self {
            Scheduled => &[ActivityScheduled, Failed, Cancelled],
            ActivityScheduled => &[ActivityRunning, ActivityRetry, Failed, TimedOut, Cancelled],
            ActivityRunning => &[Completed, ActivityRetry, Failed, TimedOut, Cancelled],
            ActivityRetry => &[ActivityScheduled, ActivityRunning, TimedOut, Cancelled],
            Completed | Failed | TimedOut | Cancelled => &[],
        }
    }

    pub fn can_transition(self, to: OrchestratorState) -> bool {
        self.valid_transitions().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        self.valid_transitions().is_empty()
    }

    /// Derive the state from the execution status and, when one exists, the
    /// activity invocation's status and attempt number.
    pub fn derive(workflow: WorkflowStatus, activity: Option<(ActivityStatus, u32)>) -> Self {
        match workflow {
            WorkflowStatus::Completed => return Self::Completed,
            WorkflowStatus::Failed => return Self::Failed,
            WorkflowStatus::TimedOut => return Self::TimedOut,
            WorkflowStatus::Cancelled => return Self::Cancelled,
            WorkflowStatus::Scheduled | WorkflowStatus::Running => {}
        }
        match activity {
            None => Self::Scheduled,
            Some((ActivityStatus::Scheduled, attempt)) if attempt > 1 => Self::ActivityRetry,
            Some((ActivityStatus::Scheduled, _)) => Self::ActivityScheduled,
            Some((ActivityStatus::Started, _)) => Self::ActivityRunning,
            // Activity closed, workflow task not yet processed.
            Some((ActivityStatus::Completed, _)) => Self::ActivityRunning,
            Some((ActivityStatus::Failed, _)) => Self::Failed,
            Some((ActivityStatus::TimedOut, _)) => Self::TimedOut,
            Some((ActivityStatus::Cancelled, _)) => Self::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Workflow execution
    // -----------------------------------------------------------------------

    #[test]
    fn scheduled_to_running() {
        assert!(WorkflowStatus::Scheduled.can_transition(WorkflowStatus::Running));
    }

    #[test]
    fn running_to_each_terminal_state() {
        for to in [
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::TimedOut,
            WorkflowStatus::Cancelled,
        ] {
            assert!(WorkflowStatus::Running.can_transition(to), "{to:?}");
        }
    }

    #[test]
    fn terminal_workflow_states_are_closed() {
        for from in [
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::TimedOut,
            WorkflowStatus::Cancelled,
        ] {
            assert!(from.is_terminal());
            assert!(from.validate_transition(WorkflowStatus::Running).is_err());
        }
    }

    #[test]
    fn scheduled_cannot_complete_directly() {
        let err = WorkflowStatus::Scheduled
            .validate_transition(WorkflowStatus::Completed)
            .unwrap_err();
        assert_eq!(err, "Invalid workflow transition: Scheduled -> Completed");
    }

    #[test]
    fn status_ids_round_trip() {
        for status in [
            WorkflowStatus::Scheduled,
            WorkflowStatus::Running,
            WorkflowStatus::TimedOut,
        ] {
            assert_eq!(WorkflowStatus::from_id(status.id()), Some(status));
        }
        assert_eq!(ActivityStatus::from_id(0), None);
    }

    // -----------------------------------------------------------------------
    // Activity invocation
    // -----------------------------------------------------------------------

    #[test]
    fn started_activity_can_be_rescheduled_for_retry() {
        assert!(ActivityStatus::Started.can_transition(ActivityStatus::Scheduled));
    }

    #[test]
    fn queued_activity_cannot_complete_without_starting() {
        assert!(!ActivityStatus::Scheduled.can_transition(ActivityStatus::Completed));
    }

    #[test]
    fn queued_activity_can_time_out_or_be_cancelled() {
        assert!(ActivityStatus::Scheduled.can_transition(ActivityStatus::TimedOut));
        assert!(ActivityStatus::Scheduled.can_transition(ActivityStatus::Cancelled));
    }

    // -----------------------------------------------------------------------
    // Orchestrator
    // -----------------------------------------------------------------------

    #[test]
    fn orchestrator_happy_path() {
        use OrchestratorState::*;
        let path = [Scheduled, ActivityScheduled, ActivityRunning, Completed];
        assert!(path.windows(2).all(|w| w[0].can_transition(w[1])));
    }

    #[test]
    fn orchestrator_retry_loop() {
        use OrchestratorState::*;
        assert!(ActivityRunning.can_transition(ActivityRetry));
        assert!(ActivityRetry.can_transition(ActivityScheduled));
        assert!(!ActivityRetry.can_transition(Completed));
    }

    #[test]
    fn derive_reports_retry_for_rescheduled_attempts() {
        assert_eq!(
            OrchestratorState::derive(WorkflowStatus::Running, Some((ActivityStatus::Scheduled, 2))),
            OrchestratorState::ActivityRetry
        );
        assert_eq!(
            OrchestratorState::derive(WorkflowStatus::Running, Some((ActivityStatus::Scheduled, 1))),
            OrchestratorState::ActivityScheduled
        );
    }

    #[test]
    fn derive_prefers_terminal_workflow_status() {
        assert_eq!(
            OrchestratorState::derive(WorkflowStatus::Cancelled, Some((ActivityStatus::Started, 1))),
            OrchestratorState::Cancelled
        );
        assert_eq!(
            OrchestratorState::derive(WorkflowStatus::Scheduled, None),
            OrchestratorState::Scheduled
        );
    }
}
