//! Clusters the frames of one dive.

use fishsense_core::image::{DiveRef, ImageRef};
use fishsense_core::retry::ActivityOptions;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activities::CLUSTER_DIVE_FRAMES;
use crate::history::WorkflowError;
use crate::workflow::{Workflow, WorkflowContext};

/// Workflow type name.
pub const DIVE_FRAME_CLUSTERING: &str = "DiveFrameClusteringWorkflow";

/// Start arguments as the client sends them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiveFrameClusteringInput {
    pub dive: DiveRef,
    pub images: Vec<ImageRef>,
}

/// Options for the clustering call: a 10 minute schedule-to-close budget
/// and the default retry policy.
pub fn cluster_activity_options() -> ActivityOptions {
    ActivityOptions::default()
}

/// Forwards the dive's images to [`CLUSTER_DIVE_FRAMES`] and completes with
/// its clusters. The images are not inspected here; the activity decodes
/// them, so malformed frames fail its attempts under the retry policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiveFrameClusteringWorkflow;

impl Workflow for DiveFrameClusteringWorkflow {
    fn name(&self) -> &'static str {
        DIVE_FRAME_CLUSTERING
    }

    fn run(&self, ctx: WorkflowContext, input: Value) -> BoxFuture<'static, Result<Value, WorkflowError>> {
        Box::pin(async move {
            let images = input.get("images").cloned().unwrap_or(Value::Null);
            Ok(ctx
                .execute_activity(CLUSTER_DIVE_FRAMES, images, cluster_activity_options())
                .await?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{WorkflowHandle, WorkflowTask, WorkflowTaskToken};
    use crate::history::{Command, HistoryEvent};
    use crate::workflow::{replay, WorkflowRegistry};
    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};
    use fishsense_core::image::Priority;
    use serde_json::json;
    use uuid::Uuid;

    fn input() -> DiveFrameClusteringInput {
        DiveFrameClusteringInput {
            dive: DiveRef {
                id: 7,
                name: Some("Scripps pier".into()),
                path: "2024.03.01/dive1".into(),
                dive_datetime: None,
                priority: Priority::High,
                flip_dive_slate: false,
                camera_id: None,
                dive_slate_id: None,
            },
            images: (1..=3)
                .map(|id| ImageRef {
                    id,
                    path: format!("P{id}.ORF"),
                    taken_at: Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, id as u32).unwrap()),
                    checksum: "00".into(),
                    dive_id: Some(7),
                })
                .collect(),
        }
    }

    fn task(input: Value, extra: Vec<HistoryEvent>) -> WorkflowTask {
        let mut history = vec![HistoryEvent::WorkflowExecutionStarted {
            workflow_type: DIVE_FRAME_CLUSTERING.into(),
            input: input.clone(),
        }];
        history.extend(extra);
        WorkflowTask {
            token: WorkflowTaskToken {
                run_id: Uuid::new_v4(),
                lease_id: Uuid::new_v4(),
                last_event_id: history.len() as u64,
            },
            handle: WorkflowHandle {
                workflow_id: "dive-frame-clustering-7".into(),
                run_id: Uuid::new_v4(),
            },
            workflow_type: DIVE_FRAME_CLUSTERING.into(),
            input,
            history,
        }
    }

    fn registry() -> WorkflowRegistry {
        let mut registry = WorkflowRegistry::new();
        registry.register(DiveFrameClusteringWorkflow);
        registry
    }

    #[test]
    fn schedules_one_clustering_call_with_the_images() {
        let input = input();
        let commands = replay(&registry(), &task(serde_json::to_value(&input).unwrap(), vec![]))
            .unwrap();
        assert_matches!(
            commands.as_slice(),
            [Command::ScheduleActivity { activity_id, activity_type, input: images, options }]
                if activity_id == "1"
                    && activity_type == CLUSTER_DIVE_FRAMES
                    && images == &serde_json::to_value(&input.images).unwrap()
                    && options.schedule_to_close_timeout.as_secs() == 600
                    && options.retry_policy.maximum_attempts == 5
                    && options.retry_policy.non_retryable_error_types.is_empty()
        );
    }

    #[test]
    fn completes_with_the_activity_result() {
        let input = input();
        let clusters = vec![input.images.clone()];
        let commands = replay(
            &registry(),
            &task(
                serde_json::to_value(&input).unwrap(),
                vec![
                    HistoryEvent::ActivityTaskScheduled {
                        activity_id: "1".into(),
                        activity_type: CLUSTER_DIVE_FRAMES.into(),
                        input: serde_json::to_value(&input.images).unwrap(),
                        options: cluster_activity_options(),
                    },
                    HistoryEvent::ActivityTaskCompleted {
                        activity_id: "1".into(),
                        attempt: 3,
                        result: serde_json::to_value(&clusters).unwrap(),
                    },
                ],
            ),
        )
        .unwrap();
        assert_eq!(
            commands,
            vec![Command::CompleteWorkflow {
                result: serde_json::to_value(&clusters).unwrap()
            }]
        );
    }

    #[test]
    fn malformed_images_are_left_to_the_activity() {
        let commands = replay(&registry(), &task(json!({ "dive": 1, "images": "nope" }), vec![]))
            .unwrap();
        assert_matches!(
            commands.as_slice(),
            [Command::ScheduleActivity { input, .. }] if input == &json!("nope")
        );

        let commands = replay(&registry(), &task(json!({ "dive": 1 }), vec![])).unwrap();
        assert_matches!(
            commands.as_slice(),
            [Command::ScheduleActivity { input: Value::Null, .. }]
        );
    }
}
