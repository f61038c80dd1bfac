//! Workflow implementations registered by the worker.

mod dive_frame_clustering;

pub use dive_frame_clustering::{
    cluster_activity_options, DiveFrameClusteringInput, DiveFrameClusteringWorkflow,
    DIVE_FRAME_CLUSTERING,
};
