//! Repair service: startup orchestration and the collaborator surface.
//!
//! Collaborators get exactly two operations that matter plus an event stream:
//! "tell me when this session is safe to resume"
//! ([`wait_for_session`](RepairService::wait_for_session)) and "this session
//! just became important"
//! ([`prioritize_sessions`](RepairService::prioritize_sessions)). Everything
//! else — cache loading, backup retention, file discovery, queue seeding —
//! happens inside [`start`](RepairService::start).
//!
//! There is no ambient singleton: construct an instance at wiring time and
//! hand it to collaborators.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;

use crate::cache::ScanCache;
use crate::config::ServiceConfig;
use crate::scanner::{Scanner, session_id_for};
use crate::scheduler::PriorityScheduler;
use crate::types::{Priority, QueueItem, ScanResult, ServiceEvent, SessionFocus};
use crate::{DoctorError, DoctorResult};

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// How candidate session files are found on disk. Supplied by the
/// collaborator that owns the storage layout.
#[async_trait]
pub trait SessionDiscovery: Send + Sync {
    async fn discover(&self) -> Vec<PathBuf>;
}

/// Production discovery over the CLI storage layout:
/// `<base_dir>/projects/<encoded-project>/<session-id>.jsonl`.
pub struct GlobDiscovery {
    base_dir: PathBuf,
}

impl GlobDiscovery {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl SessionDiscovery for GlobDiscovery {
    async fn discover(&self) -> Vec<PathBuf> {
        let pattern = format!("{}/projects/*/*.jsonl", self.base_dir.display());
        tokio::task::spawn_blocking(move || match glob::glob(&pattern) {
            Ok(paths) => paths.filter_map(|p| p.ok()).collect(),
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Invalid discovery pattern");
                Vec::new()
            }
        })
        .await
        .unwrap_or_default()
    }
}

/// Orchestrates scanning and repair across the whole session population.
pub struct RepairService {
    config: ServiceConfig,
    cache: Arc<ScanCache>,
    scheduler: PriorityScheduler,
    discovery: Arc<dyn SessionDiscovery>,
    events: broadcast::Sender<ServiceEvent>,
}

impl RepairService {
    pub fn new(
        config: ServiceConfig,
        scanner: Arc<dyn Scanner>,
        discovery: Arc<dyn SessionDiscovery>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let cache = Arc::new(ScanCache::new(config.cache_path.clone()));
        let scheduler = PriorityScheduler::new(
            scanner,
            Arc::clone(&cache),
            events.clone(),
            config.concurrency,
        );
        Self {
            config,
            cache,
            scheduler,
            discovery,
            events,
        }
    }

    /// Subscribe to `Scanned`/`Repaired`/`Error` events. Events emitted while
    /// no receiver exists are dropped.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    /// Load the cache, delete expired backups, seed the queue with every
    /// discovered session at the lowest tier, and start the worker pool.
    pub async fn start(&self) -> DoctorResult<()> {
        if let Some(parent) = self.config.cache_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DoctorError::Storage {
                    message: format!("Failed to create {}: {}", parent.display(), e),
                })?;
        }

        self.cache.load().await;
        self.cleanup_backups().await;

        let files = self.discovery.discover().await;
        tracing::info!(files = files.len(), "Seeding scan queue from disk");
        let items = files
            .into_iter()
            .map(|path| QueueItem::new(session_id_for(&path), path, Priority::Disk))
            .collect();
        self.scheduler.enqueue(items).await;

        self.scheduler.start().await;
        Ok(())
    }

    /// Drain the scheduler and persist the cache.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
        if let Err(e) = self.cache.persist().await {
            tracing::warn!(error = %e, "Failed to persist scan cache on shutdown");
        }
    }

    /// Translate the collaborator's focus change into priority bumps.
    /// Sessions whose on-disk location is not yet known are enqueued as
    /// placeholders and picked up once a discovery pass or a later enqueue
    /// resolves their path.
    pub async fn prioritize_sessions(&self, focus: SessionFocus) {
        let mut items = Vec::new();
        if let Some(id) = focus.active {
            items.push(QueueItem::placeholder(id, Priority::Active));
        }
        for id in focus.visible {
            items.push(QueueItem::placeholder(id, Priority::Visible));
        }
        for id in focus.background {
            items.push(QueueItem::placeholder(id, Priority::Background));
        }
        self.scheduler.enqueue(items).await;
    }

    /// Block until the session's scan/repair completes, so resume never races
    /// an in-flight repair.
    pub async fn wait_for_session(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> DoctorResult<ScanResult> {
        self.scheduler.wait_for(session_id, timeout).await
    }

    async fn cleanup_backups(&self) {
        let base_dir = self.config.base_dir.clone();
        let retention_days = self.config.retention_days;
        let removed =
            tokio::task::spawn_blocking(move || cleanup_backups_sync(&base_dir, retention_days))
                .await
                .unwrap_or(0);
        if removed > 0 {
            tracing::info!(removed, "Deleted expired repair backups");
        }
    }
}

fn cleanup_backups_sync(base_dir: &Path, retention_days: u32) -> usize {
    let pattern = format!("{}/projects/*/*.backup-*", base_dir.display());
    let paths = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "Invalid backup cleanup pattern");
            return 0;
        }
    };

    let cutoff = Utc::now().timestamp_millis() - i64::from(retention_days) * MILLIS_PER_DAY;
    let mut removed = 0;
    for path in paths.filter_map(|p| p.ok()) {
        let Some(created_ms) = backup_timestamp(&path) else {
            continue;
        };
        if created_ms < cutoff {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to delete expired backup");
                }
            }
        }
    }
    removed
}

/// Creation time encoded in a backup file name (`<path>.backup-<unixMillis>`).
fn backup_timestamp(path: &Path) -> Option<i64> {
    let name = path.file_name()?.to_str()?;
    let (_, millis) = name.rsplit_once(".backup-")?;
    millis.parse().ok()
}
