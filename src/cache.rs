//! Durable scan-result cache keyed on file metadata.
//!
//! Re-parsing thousands of session logs on every startup is wasted I/O: a
//! file that has not changed since its last scan still has its last result. A
//! [`CacheEntry`] records the `(mtime_ms, size)` pair observed when the result
//! was computed and is honored only while the live pair still matches, so
//! staleness comes from filesystem metadata, never from a TTL.
//!
//! The whole map persists as a single JSON document, written with an atomic
//! write-replace (temp file in the same directory, then rename) under a
//! FIFO-fair mutex so concurrent persists cannot interleave.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::types::ScanResult;
use crate::{DoctorError, DoctorResult};

/// A previously computed scan result plus the file metadata it was computed
/// against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    pub file_path: PathBuf,
    pub mtime_ms: u64,
    pub size: u64,
    pub result: ScanResult,
}

/// Durable key/value store of scan results, keyed by normalized absolute
/// path.
pub struct ScanCache {
    doc_path: PathBuf,
    entries: DashMap<String, CacheEntry>,
    // Serializes persist() callers; tokio's Mutex is FIFO-fair.
    write_lock: Mutex<()>,
}

impl ScanCache {
    pub fn new(doc_path: PathBuf) -> Self {
        Self {
            doc_path,
            entries: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the backing document.
    pub fn doc_path(&self) -> &Path {
        &self.doc_path
    }

    /// Return the cached entry for a file only if the file's current size and
    /// mtime still match the stored pair. Re-stats on every call.
    pub async fn get(&self, file_path: &Path) -> Option<CacheEntry> {
        let key = normalize_key(file_path);
        let entry = self.entries.get(&key).map(|e| e.value().clone())?;

        let metadata = tokio::fs::metadata(file_path).await.ok()?;
        let mtime = mtime_ms(&metadata)?;
        if metadata.len() == entry.size && mtime == entry.mtime_ms {
            Some(entry)
        } else {
            None
        }
    }

    /// Store a scan result alongside the file's current size and mtime. A
    /// file that cannot be stat-ed (e.g. a `Missing` result) is not cached;
    /// `get` could never validate it anyway.
    pub async fn set(&self, file_path: &Path, result: ScanResult) {
        let metadata = match tokio::fs::metadata(file_path).await {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(path = %file_path.display(), error = %e, "Not caching unstattable file");
                return;
            }
        };
        let Some(mtime) = mtime_ms(&metadata) else {
            return;
        };

        let key = normalize_key(file_path);
        self.entries.insert(
            key,
            CacheEntry {
                file_path: file_path.to_path_buf(),
                mtime_ms: mtime,
                size: metadata.len(),
                result,
            },
        );
    }

    /// Populate the in-memory map from the on-disk document. A missing or
    /// corrupt document starts the cache empty; this never fails.
    pub async fn load(&self) {
        let content = match tokio::fs::read_to_string(&self.doc_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.doc_path.display(), "No cache document yet");
                return;
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.doc_path.display(),
                    error = %e,
                    "Failed to read cache document, starting empty"
                );
                return;
            }
        };

        match serde_json::from_str::<HashMap<String, CacheEntry>>(&content) {
            Ok(map) => {
                for (key, entry) in map {
                    self.entries.insert(key, entry);
                }
                tracing::debug!(entries = self.entries.len(), "Loaded scan cache");
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.doc_path.display(),
                    error = %e,
                    "Corrupt cache document, starting empty"
                );
            }
        }
    }

    /// Write the in-memory map back to disk. Atomic write-replace: the
    /// document is fully written to a sibling temp file and renamed over the
    /// target, so a kill mid-write cannot leave a half-written document.
    pub async fn persist(&self) -> DoctorResult<()> {
        let _guard = self.write_lock.lock().await;

        let snapshot: HashMap<String, CacheEntry> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let json = serde_json::to_string(&snapshot)?;

        if let Some(parent) = self.doc_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DoctorError::Storage {
                    message: format!("Failed to create {}: {}", parent.display(), e),
                })?;
        }

        let tmp_path = temp_sibling(&self.doc_path);
        tokio::fs::write(&tmp_path, &json)
            .await
            .map_err(|e| DoctorError::Storage {
                message: format!("Failed to write {}: {}", tmp_path.display(), e),
            })?;
        tokio::fs::rename(&tmp_path, &self.doc_path)
            .await
            .map_err(|e| DoctorError::Storage {
                message: format!(
                    "Failed to replace {}: {}",
                    self.doc_path.display(),
                    e
                ),
            })?;

        tracing::debug!(entries = snapshot.len(), "Persisted scan cache");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "scan-cache.json".to_string());
    path.with_file_name(format!("{}.tmp", file_name))
}

fn mtime_ms(metadata: &std::fs::Metadata) -> Option<u64> {
    let modified = metadata.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(since_epoch.as_millis() as u64)
}

/// Cache key for a file: its absolute path, case-folded on filesystems that
/// are case-insensitive by default, so two differently-cased references to
/// the same file share one entry.
fn normalize_key(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let key = absolute.to_string_lossy().into_owned();
    #[cfg(any(windows, target_os = "macos"))]
    let key = key.to_lowercase();
    key
}
