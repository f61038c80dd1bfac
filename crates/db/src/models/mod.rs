//! Row structs and insert DTOs.
//!
//! Each submodule contains a `FromRow` entity struct matching the table row
//! and an upsert/insert DTO keyed on the table's natural key.

pub mod camera;
pub mod dive;
pub mod dive_frame_cluster;
pub mod dive_slate;
pub mod image;
pub mod label;
pub mod user;
pub mod workflow;
