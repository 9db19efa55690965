//! Service configuration.

use std::path::PathBuf;

/// Bounded worker-pool width for steady-state queue draining. Small on
/// purpose: larger values contend for disk when thousands of sessions are
/// queued, smaller ones delay background convergence.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// How long repair backups are kept before the cleanup pass deletes them.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

const CACHE_FILE: &str = "scan-cache.json";

/// Configuration for the repair service.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Root of the session storage layout (default: `~/.claude`). Session
    /// logs live under `<base_dir>/projects/<encoded-project>/<id>.jsonl`.
    pub base_dir: PathBuf,
    /// Location of the cache document (default: `<base_dir>/scan-cache.json`).
    pub cache_path: PathBuf,
    /// Backup retention window in days.
    pub retention_days: u32,
    /// Worker-pool width.
    pub concurrency: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let base_dir = directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".claude"))
            .unwrap_or_else(|| PathBuf::from(".claude"));
        Self {
            cache_path: base_dir.join(CACHE_FILE),
            base_dir,
            retention_days: DEFAULT_RETENTION_DAYS,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl ServiceConfig {
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Default)]
pub struct ServiceConfigBuilder {
    base_dir: Option<PathBuf>,
    cache_path: Option<PathBuf>,
    retention_days: Option<u32>,
    concurrency: Option<usize>,
}

impl ServiceConfigBuilder {
    pub fn base_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(path.into());
        self
    }

    pub fn cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn retention_days(mut self, days: u32) -> Self {
        self.retention_days = Some(days);
        self
    }

    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = Some(workers.max(1));
        self
    }

    pub fn build(self) -> ServiceConfig {
        let default = ServiceConfig::default();
        let base_dir = self.base_dir.unwrap_or(default.base_dir);
        ServiceConfig {
            cache_path: self.cache_path.unwrap_or_else(|| base_dir.join(CACHE_FILE)),
            base_dir,
            retention_days: self.retention_days.unwrap_or(default.retention_days),
            concurrency: self.concurrency.unwrap_or(default.concurrency),
        }
    }
}
