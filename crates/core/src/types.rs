//! Identifier and time types shared by every FishSense crate.

/// Row id of a FishSense table. Dives, images, labels, clusters and
/// workflow runs all use PostgreSQL `BIGSERIAL` keys.
pub type DbId = i64;

/// Capture, annotation and audit times, always in UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Seconds since the Unix epoch, or `0.0` for an untimed frame.
///
/// Computed from whole microseconds so the value matches a `micros / 1e6`
/// division bit for bit.
pub fn epoch_seconds(ts: Option<Timestamp>) -> f64 {
    ts.map_or(0.0, |ts| ts.timestamp_micros() as f64 / 1_000_000.0)
}
