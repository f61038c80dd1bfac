//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async data access.
//! Single statements accept any `PgExecutor`; multi-statement operations
//! have an `*_in_tx` form and a standalone form that commits on its own.

pub mod activity_invocation_repo;
pub mod camera_repo;
pub mod dive_frame_cluster_repo;
pub mod dive_repo;
pub mod dive_slate_repo;
pub mod image_repo;
pub mod label_repo;
pub mod user_repo;
pub mod workflow_execution_repo;
pub mod workflow_history_repo;

pub use activity_invocation_repo::ActivityInvocationRepo;
pub use camera_repo::CameraRepo;
pub use dive_frame_cluster_repo::DiveFrameClusterRepo;
pub use dive_repo::DiveRepo;
pub use dive_slate_repo::DiveSlateRepo;
pub use image_repo::ImageRepo;
pub use label_repo::{HeadTailLabelRepo, LaserLabelRepo};
pub use user_repo::UserRepo;
pub use workflow_execution_repo::WorkflowExecutionRepo;
pub use workflow_history_repo::WorkflowHistoryRepo;
