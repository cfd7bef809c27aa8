//! Core scheduling logic
//!
//! Domain models, the job scheduler, configuration, and the error/retry
//! machinery shared by the pipeline stages.

pub mod config;
pub mod error_handling;
pub mod events;
pub mod manager;
pub mod models;

#[cfg(test)]
pub(crate) mod testing;


#[cfg(test)]
mod integration_tests;

// Re-export commonly used types
pub use config::AppConfig;
pub use error_handling::JobError;
pub use manager::DownloadManager;
pub use models::{DownloadRequest, Job, JobStatus, QueueStatus};
