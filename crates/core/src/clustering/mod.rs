//! Grouping of dive frames by capture time.
//!
//! Frames taken in a burst (a slate shot, a fish pass) sit close together on
//! the time axis; density clustering over the capture timestamps recovers
//! those bursts and discards isolated frames.

mod hdbscan;

use std::collections::BTreeMap;

use crate::image::ImageRef;

pub use hdbscan::hdbscan_labels;

/// Smallest group of frames reported as a cluster.
pub const MIN_CLUSTER_SIZE: usize = 2;

/// Partition `images` into time-based clusters.
///
/// Images without a timestamp are placed at the epoch. Noise images are
/// dropped. Clusters come back in label order and each keeps the input
/// order of its members. Fewer than two images yield no clusters.
pub fn group_dive_frames(images: &[ImageRef]) -> Vec<Vec<ImageRef>> {
    let points: Vec<f64> = images.iter().map(ImageRef::epoch_seconds).collect();
    let labels = hdbscan_labels(&points, MIN_CLUSTER_SIZE);

    let mut clusters: BTreeMap<usize, Vec<ImageRef>> = BTreeMap::new();
    for (image, label) in images.iter().zip(labels) {
        if let Some(label) = label {
            clusters.entry(label).or_default().push(image.clone());
        }
    }
    clusters.into_values().collect()
}
