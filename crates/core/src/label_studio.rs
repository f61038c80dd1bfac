//! Typed parsing of Label Studio task exports.
//!
//! A task is kept loosely typed (`serde_json::Value`) only at the leaves the
//! annotation tool does not guarantee; everything the labels depend on is
//! pulled out through [`LabelStudioTask`] and fails with
//! [`CoreError::MalformedAnnotation`] when absent.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Timestamp;

/// Keypoint label marking the fish head on head/tail tasks.
pub const HEAD_LABEL: &str = "Snout";

/// Keypoint label marking the fish tail on head/tail tasks.
pub const TAIL_LABEL: &str = "Fork";

// ---------------------------------------------------------------------------
// Raw task shapes
// ---------------------------------------------------------------------------

/// One Label Studio task, with its raw JSON retained for storage.
#[derive(Debug, Clone)]
pub struct LabelStudioTask {
    pub id: i64,
    pub annotations: Vec<Annotation>,
    pub raw: serde_json::Value,
}

/// One annotation of a task. Only the first annotation is ever read.
#[derive(Debug, Clone, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    pub result: Vec<serde_json::Value>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskEnvelope {
    id: i64,
    #[serde(default)]
    annotations: Vec<Annotation>,
}

/// Keypoint result region as exported by the keypoint labeling template.
#[derive(Debug, Deserialize)]
struct KeypointResult {
    original_width: u32,
    original_height: u32,
    value: KeypointValue,
}

#[derive(Debug, Deserialize)]
struct KeypointValue {
    x: f64,
    y: f64,
    #[serde(default)]
    keypointlabels: Vec<String>,
}

impl LabelStudioTask {
    /// Deserialize a task from its exported JSON.
    pub fn from_json(raw: serde_json::Value) -> Result<Self, CoreError> {
        let envelope: TaskEnvelope = serde_json::from_value(raw.clone())
            .map_err(|e| CoreError::MalformedAnnotation(format!("task: {e}")))?;
        Ok(Self {
            id: envelope.id,
            annotations: envelope.annotations,
            raw,
        })
    }

    /// Whether the first annotation carries at least one result region.
    pub fn has_result(&self) -> bool {
        self.annotations
            .first()
            .is_some_and(|a| !a.result.is_empty())
    }

    /// `updated_at` of the first annotation, or `None` for unannotated tasks.
    pub fn updated_at(&self) -> Result<Option<Timestamp>, CoreError> {
        let Some(annotation) = self.annotations.first() else {
            return Ok(None);
        };
        let raw = annotation.updated_at.as_deref().ok_or_else(|| {
            CoreError::MalformedAnnotation(format!("task {}: missing updated_at", self.id))
        })?;
        parse_timestamp(raw).map(Some).ok_or_else(|| {
            CoreError::MalformedAnnotation(format!("task {}: bad updated_at {raw:?}", self.id))
        })
    }

    fn results(&self) -> Result<Vec<KeypointResult>, CoreError> {
        let Some(annotation) = self.annotations.first() else {
            return Ok(Vec::new());
        };
        annotation
            .result
            .iter()
            .map(|r| {
                serde_json::from_value(r.clone()).map_err(|e| {
                    CoreError::MalformedAnnotation(format!("task {}: result: {e}", self.id))
                })
            })
            .collect()
    }
}

/// ISO-8601 with offset, or a naive datetime taken as UTC.
fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Parsed labels
// ---------------------------------------------------------------------------

/// Pixel position on the original image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: i32,
    pub y: i32,
}

/// The closed set of label geometries the pipeline understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LabelShape {
    /// Head and tail of a fish.
    KeypointPair { head: Keypoint, tail: Keypoint },
    /// A single labelled point, e.g. a laser dot.
    SingleKeypoint { point: Keypoint, label: String },
}

/// A task reduced to what the label tables store.
#[derive(Debug, Clone)]
pub struct ParsedLabel {
    pub task_id: i64,
    /// `None` until an annotator has submitted a result.
    pub shape: Option<LabelShape>,
    pub updated_at: Option<Timestamp>,
    pub completed: bool,
    pub raw: serde_json::Value,
}

/// Convert a percentage of `dimension` to a pixel, rounding half to even.
pub fn percent_to_pixel(percent: f64, dimension: u32) -> i32 {
    (percent * f64::from(dimension) / 100.0).round_ties_even() as i32
}

fn to_keypoint(result: &KeypointResult) -> Keypoint {
    Keypoint {
        x: percent_to_pixel(result.value.x, result.original_width),
        y: percent_to_pixel(result.value.y, result.original_height),
    }
}

/// Parse a head/tail task: the `Snout` keypoint is the head, `Fork` the tail.
pub fn parse_head_tail(task: &LabelStudioTask) -> Result<ParsedLabel, CoreError> {
    let shape = if task.has_result() {
        let results = task.results()?;
        let find = |label: &str| {
            results
                .iter()
                .find(|r| r.value.keypointlabels.iter().any(|l| l == label))
                .map(to_keypoint)
                .ok_or_else(|| {
                    CoreError::MalformedAnnotation(format!("task {}: no {label} keypoint", task.id))
                })
        };
        Some(LabelShape::KeypointPair {
            head: find(HEAD_LABEL)?,
            tail: find(TAIL_LABEL)?,
        })
    } else {
        None
    };

    Ok(ParsedLabel {
        task_id: task.id,
        shape,
        updated_at: task.updated_at()?,
        completed: task.has_result(),
        raw: task.raw.clone(),
    })
}

/// Parse a laser task: the first result region and its first label.
pub fn parse_laser(task: &LabelStudioTask) -> Result<ParsedLabel, CoreError> {
    let shape = if task.has_result() {
        let results = task.results()?;
        let first = results.first().ok_or_else(|| {
            CoreError::MalformedAnnotation(format!("task {}: empty result", task.id))
        })?;
        let label = first.value.keypointlabels.first().cloned().ok_or_else(|| {
            CoreError::MalformedAnnotation(format!("task {}: keypoint without label", task.id))
        })?;
        Some(LabelShape::SingleKeypoint {
            point: to_keypoint(first),
            label,
        })
    } else {
        None
    };

    Ok(ParsedLabel {
        task_id: task.id,
        shape,
        updated_at: task.updated_at()?,
        completed: task.has_result(),
        raw: task.raw.clone(),
    })
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// A Label Studio account as returned by its user listing.
#[derive(Debug, Clone, Deserialize)]
pub struct LabelStudioUser {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub last_activity: Option<Timestamp>,
    pub date_joined: Option<Timestamp>,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn keypoint(label: &str, x: f64, y: f64) -> serde_json::Value {
        json!({
            "original_width": 4000,
            "original_height": 3000,
            "value": { "x": x, "y": y, "keypointlabels": [label] }
        })
    }

    fn task(results: Vec<serde_json::Value>) -> LabelStudioTask {
        LabelStudioTask::from_json(json!({
            "id": 42,
            "data": { "img": "s3://bucket/P0001.JPG" },
            "annotations": [{
                "result": results,
                "updated_at": "2024-05-02T17:30:00.500000Z"
            }]
        }))
        .unwrap()
    }

    #[test]
    fn head_tail_maps_snout_and_fork() {
        let parsed = parse_head_tail(&task(vec![
            keypoint("Fork", 75.0, 50.0),
            keypoint("Snout", 25.0, 10.0),
        ]))
        .unwrap();

        assert!(parsed.completed);
        assert_eq!(parsed.task_id, 42);
        assert_eq!(
            parsed.shape,
            Some(LabelShape::KeypointPair {
                head: Keypoint { x: 1000, y: 300 },
                tail: Keypoint { x: 3000, y: 1500 },
            })
        );
        assert_eq!(
            parsed.updated_at,
            Some(Utc.with_ymd_and_hms(2024, 5, 2, 17, 30, 0).unwrap() + chrono::Duration::milliseconds(500))
        );
        assert_eq!(parsed.raw["data"]["img"], "s3://bucket/P0001.JPG");
    }

    #[test]
    fn head_tail_without_fork_is_malformed() {
        let err = parse_head_tail(&task(vec![keypoint("Snout", 25.0, 10.0)])).unwrap_err();
        assert_matches!(err, CoreError::MalformedAnnotation(msg) if msg.contains("Fork"));
    }

    #[test]
    fn laser_takes_first_result_and_label() {
        let parsed = parse_laser(&task(vec![
            keypoint("Red Laser", 50.0, 50.0),
            keypoint("Green Laser", 10.0, 10.0),
        ]))
        .unwrap();
        assert_eq!(
            parsed.shape,
            Some(LabelShape::SingleKeypoint {
                point: Keypoint { x: 2000, y: 1500 },
                label: "Red Laser".to_string(),
            })
        );
    }

    #[test]
    fn unannotated_task_is_incomplete() {
        let task = LabelStudioTask::from_json(json!({ "id": 7, "annotations": [] })).unwrap();
        let parsed = parse_laser(&task).unwrap();
        assert!(!parsed.completed);
        assert_eq!(parsed.shape, None);
        assert_eq!(parsed.updated_at, None);
    }

    #[test]
    fn skipped_annotation_keeps_updated_at() {
        let parsed = parse_head_tail(&task(Vec::new())).unwrap();
        assert!(!parsed.completed);
        assert_eq!(parsed.shape, None);
        assert!(parsed.updated_at.is_some());
    }

    #[test]
    fn missing_coordinates_are_malformed() {
        let bad = json!({ "original_width": 10, "original_height": 10, "value": {} });
        assert_matches!(parse_laser(&task(vec![bad])), Err(CoreError::MalformedAnnotation(_)));
    }

    #[test]
    fn task_without_id_is_malformed() {
        assert_matches!(
            LabelStudioTask::from_json(json!({ "annotations": [] })),
            Err(CoreError::MalformedAnnotation(_))
        );
    }

    #[test]
    fn pixel_rounding_is_half_to_even() {
        // 0.125% of 400 px is exactly 0.5 px.
        assert_eq!(percent_to_pixel(0.125, 400), 0);
        assert_eq!(percent_to_pixel(0.375, 400), 2);
        assert_eq!(percent_to_pixel(33.3, 1000), 333);
    }

    #[test]
    fn naive_updated_at_is_utc() {
        assert_eq!(
            parse_timestamp("2024-05-02T17:30:00"),
            Some(Utc.with_ymd_and_hms(2024, 5, 2, 17, 30, 0).unwrap())
        );
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn user_listing_deserializes() {
        let user: LabelStudioUser = serde_json::from_value(json!({
            "id": 3,
            "email": "diver@example.org",
            "first_name": "Ana",
            "last_name": "Reyes",
            "last_activity": "2024-05-02T17:30:00Z",
            "date_joined": null
        }))
        .unwrap();
        assert_eq!(user.id, 3);
        assert!(user.last_activity.is_some());
        assert!(user.date_joined.is_none());
    }
}
