//! # session-doctor
//!
//! Integrity scanning, repair, and prioritized scheduling for JSONL
//! coding-agent session logs.
//!
//! Session history is stored as one JSON object per line, each message
//! declaring the id of its logical predecessor. Crashes, partial writes, or
//! concurrent mutation by an external CLI can break that chain: messages whose
//! declared parent no longer exists ("orphans"), truncated chains, or
//! unreadable files. This crate validates and repairs that structure:
//!
//! - [`scanner`] — stateless scan/repair over individual log files
//! - [`cache`] — durable scan-result cache keyed on file size + mtime
//! - [`scheduler`] — priority queue draining scans through a bounded worker pool
//! - [`service`] — startup/shutdown orchestration and the collaborator surface
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use session_doctor::{FileScanner, GlobDiscovery, RepairService, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), session_doctor::DoctorError> {
//!     let config = ServiceConfig::default();
//!     let discovery = GlobDiscovery::new(config.base_dir.clone());
//!     let service = RepairService::new(config, Arc::new(FileScanner), Arc::new(discovery));
//!
//!     service.start().await?;
//!
//!     // Block until the session the user is about to resume is safe.
//!     let result = service
//!         .wait_for_session("my-session", Duration::from_secs(10))
//!         .await?;
//!     println!("{:?}", result.status);
//!
//!     service.stop().await;
//!     Ok(())
//! }
//! ```

#![deny(rustdoc::broken_intra_doc_links)]

pub mod cache;
pub mod config;
pub mod scanner;
pub mod scheduler;
pub mod service;
pub mod types;

pub use cache::{CacheEntry, ScanCache};
pub use config::{
    DEFAULT_CONCURRENCY, DEFAULT_RETENTION_DAYS, ServiceConfig, ServiceConfigBuilder,
};
pub use scanner::{FileScanner, Scanner, session_id_for};
pub use scheduler::PriorityScheduler;
pub use service::{GlobDiscovery, RepairService, SessionDiscovery};
pub use types::{
    ParsedMessage, Priority, QueueItem, RepairResult, RepairStatus, ScanResult, ScanStatus,
    ServiceEvent, SessionFocus,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DoctorError {
    #[error("Session not in queue: {id}")]
    NotInQueue { id: String },

    #[error("Timed out waiting for session: {id}")]
    Timeout { id: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type DoctorResult<T> = std::result::Result<T, DoctorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DoctorError::NotInQueue {
            id: "sess-123".to_string(),
        };
        assert!(err.to_string().contains("sess-123"));
    }

    #[test]
    fn test_timeout_display() {
        let err = DoctorError::Timeout {
            id: "sess-456".to_string(),
        };
        assert!(err.to_string().contains("Timed out"));
    }
}
