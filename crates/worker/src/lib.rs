//! FishSense data-processing worker: configuration, broker connection and
//! the polling runtime that executes workflow and activity tasks.

pub mod config;
pub mod connect;
pub mod logging;
pub mod runtime;
pub mod schedules;

pub use config::{ConfigError, WorkerConfig};
pub use connect::{connect, connect_options};
pub use logging::LoggingError;
pub use runtime::Worker;
pub use schedules::schedule_workflows;
