//! Stateless scanning and repair of JSONL session logs.
//!
//! A session log is UTF-8 text, one JSON object per line, each message
//! declaring the id of its logical predecessor. [`scan`](Scanner::scan) builds
//! the parent-linked graph and classifies file health;
//! [`repair`](Scanner::repair) non-destructively reparents orphaned messages
//! after writing a timestamped backup.
//!
//! Neither operation fails at the API level: every failure mode is encoded in
//! the returned status, so a batch scan of one broken file never affects its
//! siblings.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;

use crate::types::{ParsedMessage, RepairResult, RepairStatus, ScanResult, ScanStatus};

/// Accepted id field names, in lookup order. The CLI writes `uuid`; older
/// tooling wrote a bare `id`.
const ID_KEYS: [&str; 2] = ["uuid", "id"];
/// Accepted predecessor field names, in lookup order.
const PARENT_KEYS: [&str; 3] = ["parentUuid", "parentId", "parent"];
const KIND_KEY: &str = "type";

/// Capability interface over scan and repair, swappable with a test double at
/// construction time.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Classify the health of a single session log. Never fails; absence,
    /// read errors, and corruption are all statuses.
    async fn scan(&self, path: &Path) -> ScanResult;

    /// Reparent orphaned messages in place, backing the file up first.
    /// Idempotent: a file with zero orphans yields `AlreadyHealthy` and is
    /// not touched.
    async fn repair(&self, path: &Path) -> RepairResult;

    /// One `scan` per path, fully parallel, order preserving.
    async fn scan_batch(&self, paths: &[PathBuf]) -> Vec<ScanResult> {
        join_all(paths.iter().map(|p| self.scan(p))).await
    }
}

/// Production scanner reading the local filesystem. Blocking I/O runs on the
/// blocking thread pool.
pub struct FileScanner;

#[async_trait]
impl Scanner for FileScanner {
    async fn scan(&self, path: &Path) -> ScanResult {
        let owned = path.to_path_buf();
        match tokio::task::spawn_blocking(move || scan_sync(&owned)).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Scan task failed");
                ScanResult {
                    session_id: session_id_for(path),
                    file_path: path.to_path_buf(),
                    status: ScanStatus::Unreadable,
                    chain_depth: 0,
                    orphan_count: 0,
                    file_size: 0,
                    message_count: 0,
                }
            }
        }
    }

    async fn repair(&self, path: &Path) -> RepairResult {
        let owned = path.to_path_buf();
        match tokio::task::spawn_blocking(move || repair_sync(&owned)).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Repair task failed");
                RepairResult {
                    session_id: session_id_for(path),
                    status: RepairStatus::Failed,
                    backup_path: None,
                    orphans_fixed: 0,
                    new_chain_depth: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

/// Session id for a log file: its file stem.
pub fn session_id_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

// ============================================================================
// Line parsing
// ============================================================================

/// One raw line of the log plus, when it parses to a message, the retained
/// JSON object and its chain projection. Repair rewrites only the parent
/// field of `value`; unmodified lines are written back from `raw` verbatim.
struct LogLine {
    raw: String,
    value: Option<Value>,
    message: Option<ParsedMessage>,
    modified: bool,
}

fn parse_lines(path: &Path, content: &str) -> Vec<LogLine> {
    content
        .split('\n')
        .enumerate()
        .map(|(idx, raw)| {
            let line_number = idx + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return LogLine {
                    raw: raw.to_string(),
                    value: None,
                    message: None,
                    modified: false,
                };
            }
            let value = match serde_json::from_str::<Value>(trimmed) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        line = line_number,
                        error = %e,
                        "Skipping malformed log line"
                    );
                    None
                }
            };
            let message = value.as_ref().and_then(|v| project_message(v, line_number));
            LogLine {
                raw: raw.to_string(),
                value,
                message,
                modified: false,
            }
        })
        .collect()
}

/// Extract the chain projection from a parsed line. Lines without an id are
/// excluded from the graph (non-fatal).
fn project_message(value: &Value, line_number: usize) -> Option<ParsedMessage> {
    let obj = value.as_object()?;
    let id = ID_KEYS.iter().find_map(|k| obj.get(*k).and_then(id_string))?;
    let parent_id = PARENT_KEYS
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(id_string);
    let kind = obj.get(KIND_KEY).and_then(|v| v.as_str()).map(String::from);
    Some(ParsedMessage {
        id,
        parent_id,
        kind,
        line_number,
    })
}

/// Normalize an identifier value to its string form so numeric and string ids
/// compare. Null and structured values carry no identifier.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ============================================================================
// Graph measurement
// ============================================================================

/// Walk backward from the last message in file order, following parent links
/// and counting visited nodes, stopping at the first missing parent. A
/// revisited node also terminates the walk, so a parent cycle cannot hang it.
fn chain_depth(messages: &[ParsedMessage]) -> usize {
    let mut by_id: HashMap<&str, &ParsedMessage> = HashMap::with_capacity(messages.len());
    for msg in messages {
        by_id.insert(msg.id.as_str(), msg);
    }

    let Some(mut current) = messages.last() else {
        return 0;
    };

    let mut visited: HashSet<&str> = HashSet::new();
    let mut depth = 0;
    loop {
        depth += 1;
        visited.insert(current.id.as_str());
        let Some(parent_id) = current.parent_id.as_deref() else {
            break;
        };
        match by_id.get(parent_id).copied() {
            Some(parent) if !visited.contains(parent.id.as_str()) => current = parent,
            _ => break,
        }
    }
    depth
}

fn count_orphans(messages: &[ParsedMessage]) -> usize {
    let ids: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    messages
        .iter()
        .filter(|m| m.parent_id.as_deref().is_some_and(|p| !ids.contains(p)))
        .count()
}

// ============================================================================
// Scan (blocking)
// ============================================================================

fn scan_sync(path: &Path) -> ScanResult {
    let session_id = session_id_for(path);
    let status_only = |status: ScanStatus, file_size: u64| ScanResult {
        session_id: session_id.clone(),
        file_path: path.to_path_buf(),
        status,
        chain_depth: 0,
        orphan_count: 0,
        file_size,
        message_count: 0,
    };

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return status_only(ScanStatus::Missing, 0);
        }
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Stat failed");
            return status_only(ScanStatus::Unreadable, 0);
        }
    };

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Read failed");
            return status_only(ScanStatus::Unreadable, metadata.len());
        }
    };

    let lines = parse_lines(path, &content);
    let messages: Vec<ParsedMessage> = lines.into_iter().filter_map(|l| l.message).collect();
    let orphan_count = count_orphans(&messages);

    ScanResult {
        session_id,
        file_path: path.to_path_buf(),
        status: if orphan_count > 0 {
            ScanStatus::Corrupted
        } else {
            ScanStatus::Healthy
        },
        chain_depth: chain_depth(&messages),
        orphan_count,
        file_size: metadata.len(),
        message_count: messages.len(),
    }
}

// ============================================================================
// Repair (blocking)
// ============================================================================

fn repair_sync(path: &Path) -> RepairResult {
    let session_id = session_id_for(path);
    let failed = |error: String, backup_path: Option<PathBuf>| RepairResult {
        session_id: session_id.clone(),
        status: RepairStatus::Failed,
        backup_path,
        orphans_fixed: 0,
        new_chain_depth: 0,
        error: Some(error),
    };

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => return failed(format!("Failed to read {}: {}", path.display(), e), None),
    };

    let mut lines = parse_lines(path, &content);
    let ids: HashSet<String> = lines
        .iter()
        .filter_map(|l| l.message.as_ref())
        .map(|m| m.id.clone())
        .collect();

    let orphan_indices: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| {
            line.message
                .as_ref()
                .and_then(|m| m.parent_id.as_ref())
                .is_some_and(|p| !ids.contains(p))
        })
        .map(|(idx, _)| idx)
        .collect();

    if orphan_indices.is_empty() {
        let messages: Vec<ParsedMessage> =
            lines.into_iter().filter_map(|l| l.message).collect();
        return RepairResult {
            session_id,
            status: RepairStatus::AlreadyHealthy,
            backup_path: None,
            orphans_fixed: 0,
            new_chain_depth: chain_depth(&messages),
            error: None,
        };
    }

    // Backup before any mutation. If this write fails the original is
    // untouched and no backup is reported.
    let backup_path = PathBuf::from(format!(
        "{}.backup-{}",
        path.display(),
        Utc::now().timestamp_millis()
    ));
    if let Err(e) = std::fs::write(&backup_path, &content) {
        return failed(
            format!("Failed to write backup {}: {}", backup_path.display(), e),
            None,
        );
    }

    // Single left-to-right pass in ascending line order. An orphan repaired
    // earlier in the pass is a valid candidate parent for a later one, so the
    // candidate check reads the current (possibly already fixed) parent
    // values. Deliberately not a multi-pass fixed point.
    let mut orphans_fixed = 0;
    for idx in orphan_indices {
        let new_parent = lines[..idx].iter().rev().find_map(|line| {
            let msg = line.message.as_ref()?;
            match msg.parent_id.as_ref() {
                None => Some(msg.id.clone()),
                Some(p) if ids.contains(p) => Some(msg.id.clone()),
                Some(_) => None,
            }
        });
        set_parent(&mut lines[idx], new_parent);
        orphans_fixed += 1;
    }

    let mut rendered: Vec<String> = Vec::with_capacity(lines.len());
    for line in &lines {
        match (&line.value, line.modified) {
            (Some(value), true) => match serde_json::to_string(value) {
                Ok(s) => rendered.push(s),
                Err(e) => {
                    return failed(
                        format!("Failed to serialize repaired line: {}", e),
                        Some(backup_path),
                    );
                }
            },
            _ => rendered.push(line.raw.clone()),
        }
    }

    if let Err(e) = std::fs::write(path, rendered.join("\n")) {
        // The backup remains as the recovery path; no automatic rollback.
        return failed(
            format!("Failed to write {}: {}", path.display(), e),
            Some(backup_path),
        );
    }

    // Measured fresh from disk to catch any residual break.
    let rescan = scan_sync(path);

    tracing::info!(
        path = %path.display(),
        orphans_fixed,
        new_chain_depth = rescan.chain_depth,
        "Repaired session log"
    );

    RepairResult {
        session_id,
        status: RepairStatus::Repaired,
        backup_path: Some(backup_path),
        orphans_fixed,
        new_chain_depth: rescan.chain_depth,
        error: None,
    }
}

/// Rewrite the parent field of a line, leaving every other field untouched.
fn set_parent(line: &mut LogLine, new_parent: Option<String>) {
    let new_value = match &new_parent {
        Some(id) => Value::String(id.clone()),
        None => Value::Null,
    };
    if let Some(obj) = line.value.as_mut().and_then(|v| v.as_object_mut()) {
        let key = PARENT_KEYS
            .iter()
            .find(|k| obj.contains_key(**k))
            .copied()
            .unwrap_or(PARENT_KEYS[0]);
        obj.insert(key.to_string(), new_value);
    }
    if let Some(msg) = line.message.as_mut() {
        msg.parent_id = new_parent;
    }
    line.modified = true;
}
