//! Activity implementations registered by the worker.

mod cluster_dive_frames;

pub use cluster_dive_frames::{ClusterDiveFramesActivity, CLUSTER_DIVE_FRAMES};
