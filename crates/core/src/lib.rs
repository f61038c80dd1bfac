//! Domain types and pure logic for the FishSense data-processing worker.
//!
//! Nothing in this crate performs I/O. The clustering engine, the Label
//! Studio parser, the workflow state machines and the retry policy are all
//! plain functions over plain values so that the pipeline and database
//! crates can share them.

pub mod clustering;
pub mod error;
pub mod image;
pub mod label_studio;
pub mod retry;
pub mod types;
pub mod workflow;
