//! Value types passed across the workflow boundary.
//!
//! These are the serialized shapes a caller enqueues and a workflow returns;
//! the database rows in `fishsense-db` convert into them.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::types::{self, DbId, Timestamp};

/// Processing priority of a dive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    #[default]
    Low,
    High,
}

impl Priority {
    /// Database representation (`LOW` / `HIGH`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::High => "HIGH",
        }
    }

    /// Parse the database representation. Unknown values map to `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(Self::Low),
            "HIGH" => Some(Self::High),
            _ => None,
        }
    }
}

/// A dive as carried in a workflow input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiveRef {
    pub id: DbId,
    pub name: Option<String>,
    pub path: String,
    pub dive_datetime: Option<Timestamp>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub flip_dive_slate: bool,
    pub camera_id: Option<DbId>,
    pub dive_slate_id: Option<DbId>,
}

/// Immutable reference to one captured image.
///
/// Two references are equal when their ids are equal, whatever the other
/// fields say.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRef {
    pub id: DbId,
    pub path: String,
    pub taken_at: Option<Timestamp>,
    pub checksum: String,
    pub dive_id: Option<DbId>,
}

impl ImageRef {
    /// Capture instant in seconds since the Unix epoch, or `0.0` when the
    /// image has no timestamp.
    pub fn epoch_seconds(&self) -> f64 {
        types::epoch_seconds(self.taken_at)
    }
}

impl PartialEq for ImageRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ImageRef {}

impl Hash for ImageRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn image(id: DbId, path: &str) -> ImageRef {
        ImageRef {
            id,
            path: path.to_string(),
            taken_at: None,
            checksum: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            dive_id: Some(1),
        }
    }

    #[test]
    fn equality_is_by_id_only() {
        assert_eq!(image(1, "a.ORF"), image(1, "b.ORF"));
        assert_ne!(image(1, "a.ORF"), image(2, "a.ORF"));
    }

    #[test]
    fn missing_timestamp_is_epoch_zero() {
        assert_eq!(image(1, "a.ORF").epoch_seconds(), 0.0);
    }

    #[test]
    fn epoch_seconds_keeps_microseconds() {
        let mut img = image(1, "a.ORF");
        img.taken_at = Some(
            chrono::Utc
                .with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
                .unwrap()
                .checked_add_signed(chrono::Duration::microseconds(250_000))
                .unwrap(),
        );
        assert_eq!(img.epoch_seconds(), 1_709_294_400.25);
    }

    #[test]
    fn priority_round_trips_database_strings() {
        assert_eq!(Priority::parse("HIGH"), Some(Priority::High));
        assert_eq!(Priority::Low.as_str(), "LOW");
        assert_eq!(Priority::parse("urgent"), None);
    }

    #[test]
    fn dive_ref_defaults_optional_flags() {
        let dive: DiveRef = serde_json::from_value(serde_json::json!({
            "id": 7,
            "name": null,
            "path": "2024.03.01/dive1",
            "dive_datetime": null,
            "camera_id": null,
            "dive_slate_id": null
        }))
        .unwrap();
        assert_eq!(dive.priority, Priority::Low);
        assert!(!dive.flip_dive_slate);
    }
}
