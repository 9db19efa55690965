//! Core data types for session log integrity tracking.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Narrow projection of one log line, sufficient for chain validation.
///
/// Everything else on the line is opaque to this subsystem and is preserved
/// verbatim by repair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedMessage {
    /// Message identifier.
    pub id: String,
    /// Identifier of the logical predecessor, if the message declares one.
    pub parent_id: Option<String>,
    /// Message kind (e.g. "user", "assistant"), if declared.
    pub kind: Option<String>,
    /// 1-based line number within the log file.
    pub line_number: usize,
}

/// Health classification of a session log file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// Readable, zero orphans.
    Healthy,
    /// Readable and parses, but at least one orphan.
    Corrupted,
    /// File absent.
    Missing,
    /// File exists but cannot be read.
    Unreadable,
}

/// Outcome of scanning a single session log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub session_id: String,
    pub file_path: PathBuf,
    pub status: ScanStatus,
    /// Messages reachable walking backward from the newest message until the
    /// first missing link. A recoverability metric, not a total count.
    pub chain_depth: usize,
    /// Messages whose declared parent matches no id anywhere in the file.
    pub orphan_count: usize,
    pub file_size: u64,
    /// Successfully parsed messages carrying an id (not raw line count).
    pub message_count: usize,
}

/// Outcome classification of a repair attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    Repaired,
    AlreadyHealthy,
    Failed,
}

/// Outcome of repairing a single session log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepairResult {
    pub session_id: String,
    pub status: RepairStatus,
    /// Backup written immediately before mutation; `None` when nothing was
    /// mutated.
    pub backup_path: Option<PathBuf>,
    pub orphans_fixed: usize,
    /// Chain depth measured by re-scanning the file after the rewrite.
    pub new_chain_depth: usize,
    pub error: Option<String>,
}

/// Scheduling urgency tier. Declaration order is urgency order: `Active` is
/// the most urgent and compares lowest, so selecting the minimum `(priority,
/// seq)` pair yields the next session to process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// The session the user is looking at right now.
    Active,
    /// On screen but not focused.
    Visible,
    /// Known to the client but off screen.
    Background,
    /// Found on disk, nobody is looking at it.
    Disk,
}

impl Priority {
    /// The more urgent of two tiers.
    pub fn most_urgent(self, other: Priority) -> Priority {
        self.min(other)
    }
}

/// One unit of scheduled work. At most one item per session id is resident in
/// the scheduler; re-enqueuing the same id updates the existing item in place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueItem {
    pub session_id: String,
    /// `None` when a collaborator names a session whose location on disk has
    /// not been resolved yet. Such items stay queued until a later enqueue
    /// supplies the real path.
    pub file_path: Option<PathBuf>,
    pub priority: Priority,
}

impl QueueItem {
    pub fn new(session_id: impl Into<String>, file_path: PathBuf, priority: Priority) -> Self {
        Self {
            session_id: session_id.into(),
            file_path: Some(file_path),
            priority,
        }
    }

    /// Item with a not-yet-resolved file path.
    pub fn placeholder(session_id: impl Into<String>, priority: Priority) -> Self {
        Self {
            session_id: session_id.into(),
            file_path: None,
            priority,
        }
    }
}

/// A collaborator's view of which sessions the user is currently looking at.
#[derive(Clone, Debug, Default)]
pub struct SessionFocus {
    pub active: Option<String>,
    pub visible: Vec<String>,
    pub background: Vec<String>,
}

/// Events surfaced to collaborators as scans and repairs complete.
#[derive(Clone, Debug)]
pub enum ServiceEvent {
    Scanned(ScanResult),
    Repaired(RepairResult),
    Error { session_id: String, message: String },
}
