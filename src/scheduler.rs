//! Priority work queue draining scans through a bounded worker pool.
//!
//! One entry per session id, in one of three states: `Queued`, `Processing`,
//! `Done`. Re-enqueuing an id updates the resident entry in place instead of
//! duplicating it, so shifting user focus is a cheap priority bump. Workers
//! always pick the most urgent queued entry (ties broken by arrival order),
//! consult the cache, scan on a miss, repair corrupted files, and release any
//! callers blocked in [`wait_for`](PriorityScheduler::wait_for).
//!
//! The pool is deliberately small (see
//! [`DEFAULT_CONCURRENCY`](crate::config::DEFAULT_CONCURRENCY)): draining
//! thousands of queued sessions with unbounded parallelism would saturate
//! disk I/O.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use crate::cache::ScanCache;
use crate::scanner::Scanner;
use crate::types::{Priority, QueueItem, RepairStatus, ScanResult, ScanStatus, ServiceEvent};
use crate::{DoctorError, DoctorResult};

enum EntryState {
    Queued,
    Processing,
    Done(ScanResult),
}

struct Entry {
    file_path: Option<PathBuf>,
    priority: Priority,
    /// Arrival order, used to break priority ties.
    seq: u64,
    state: EntryState,
    waiters: Vec<oneshot::Sender<ScanResult>>,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

struct Inner {
    state: Mutex<QueueState>,
    /// Wakes idle workers when new work arrives.
    work_notify: Notify,
    /// Wakes `wait_for` callers watching for an id to appear or complete.
    queue_changed: Notify,
    scanner: Arc<dyn Scanner>,
    cache: Arc<ScanCache>,
    events: broadcast::Sender<ServiceEvent>,
}

/// In-memory priority scheduler. All public operations only mutate queue
/// state on the caller's task; file I/O happens inside worker slots.
pub struct PriorityScheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    concurrency: usize,
}

impl PriorityScheduler {
    pub fn new(
        scanner: Arc<dyn Scanner>,
        cache: Arc<ScanCache>,
        events: broadcast::Sender<ServiceEvent>,
        concurrency: usize,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                work_notify: Notify::new(),
                queue_changed: Notify::new(),
                scanner,
                cache,
                events,
            }),
            workers: Mutex::new(Vec::new()),
            shutdown_tx,
            concurrency: concurrency.max(1),
        }
    }

    /// Insert or update one entry per item. An id already `Queued` is updated
    /// in place; an id that is `Processing` has the update recorded without
    /// preempting the in-flight scan; a `Done` id is re-queued (renewed
    /// interest — the cache makes the rescan cheap). When a real-path item
    /// resolves a placeholder, the more urgent of the two tiers wins.
    pub async fn enqueue(&self, items: Vec<QueueItem>) {
        if items.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock().await;
        for item in items {
            let seq = state.next_seq;
            state.next_seq += 1;
            match state.entries.get_mut(&item.session_id) {
                Some(entry) => match entry.state {
                    EntryState::Queued => {
                        if entry.file_path.is_none() && item.file_path.is_some() {
                            entry.file_path = item.file_path;
                            entry.priority = entry.priority.most_urgent(item.priority);
                        } else {
                            entry.priority = item.priority;
                            if item.file_path.is_some() {
                                entry.file_path = item.file_path;
                            }
                        }
                    }
                    EntryState::Processing => {
                        entry.priority = item.priority;
                        if item.file_path.is_some() {
                            entry.file_path = item.file_path;
                        }
                    }
                    EntryState::Done(_) => {
                        entry.state = EntryState::Queued;
                        entry.priority = item.priority;
                        entry.seq = seq;
                        if item.file_path.is_some() {
                            entry.file_path = item.file_path;
                        }
                    }
                },
                None => {
                    state.entries.insert(
                        item.session_id,
                        Entry {
                            file_path: item.file_path,
                            priority: item.priority,
                            seq,
                            state: EntryState::Queued,
                            waiters: Vec::new(),
                        },
                    );
                }
            }
        }
        drop(state);
        self.inner.work_notify.notify_waiters();
        self.inner.queue_changed.notify_waiters();
    }

    /// The most urgent still-queued entry, without dequeuing it.
    pub async fn peek(&self) -> Option<QueueItem> {
        let state = self.inner.state.lock().await;
        state
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.state, EntryState::Queued))
            .min_by_key(|(_, e)| (e.priority, e.seq))
            .map(|(id, e)| QueueItem {
                session_id: id.clone(),
                file_path: e.file_path.clone(),
                priority: e.priority,
            })
    }

    /// Spawn the worker pool. Idempotent while running.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        let _ = self.shutdown_tx.send(false);
        for _ in 0..self.concurrency {
            let inner = Arc::clone(&self.inner);
            let shutdown = self.shutdown_tx.subscribe();
            workers.push(tokio::spawn(worker_loop(inner, shutdown)));
        }
        tracing::debug!(workers = self.concurrency, "Scheduler started");
    }

    /// Finish in-flight work, start nothing new, and return once every worker
    /// has exited.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.inner.work_notify.notify_waiters();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Worker task failed during shutdown");
            }
        }
        tracing::debug!("Scheduler stopped");
    }

    /// Block until the session's scan (and repair, if needed) completes.
    ///
    /// Returns immediately if the session is already done. Errors
    /// [`DoctorError::NotInQueue`] if the id is unknown at call time and is
    /// never enqueued before the timeout, [`DoctorError::Timeout`] if the
    /// entry exists but has not completed in time. A timed-out waiter
    /// abandons only itself; the underlying work continues.
    pub async fn wait_for(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> DoctorResult<ScanResult> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Registered before the state check so an enqueue racing this
            // call cannot be missed.
            let arrival = self.inner.queue_changed.notified();

            let rx = {
                let mut state = self.inner.state.lock().await;
                match state.entries.get_mut(session_id) {
                    Some(entry) => {
                        if let EntryState::Done(result) = &entry.state {
                            return Ok(result.clone());
                        }
                        let (tx, rx) = oneshot::channel();
                        entry.waiters.push(tx);
                        Some(rx)
                    }
                    None => None,
                }
            };

            match rx {
                Some(rx) => {
                    return match tokio::time::timeout_at(deadline, rx).await {
                        Ok(Ok(result)) => Ok(result),
                        // Sender dropped without a result: the scheduler
                        // stopped before this entry completed.
                        Ok(Err(_)) | Err(_) => Err(DoctorError::Timeout {
                            id: session_id.to_string(),
                        }),
                    };
                }
                None => {
                    if tokio::time::timeout_at(deadline, arrival).await.is_err() {
                        return Err(DoctorError::NotInQueue {
                            id: session_id.to_string(),
                        });
                    }
                }
            }
        }
    }
}

async fn worker_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        // Registered before the queue check so an enqueue landing in between
        // still wakes this worker.
        let notified = inner.work_notify.notified();
        match inner.take_next().await {
            Some((session_id, path)) => inner.process(session_id, path).await,
            None => {
                tokio::select! {
                    _ = notified => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

impl Inner {
    /// Claim the most urgent queued entry with a resolved path. Placeholder
    /// entries stay queued until a later enqueue supplies their location.
    async fn take_next(&self) -> Option<(String, PathBuf)> {
        let mut state = self.state.lock().await;
        let session_id = state
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.state, EntryState::Queued) && e.file_path.is_some())
            .min_by_key(|(_, e)| (e.priority, e.seq))
            .map(|(id, _)| id.clone())?;
        let entry = state.entries.get_mut(&session_id)?;
        entry.state = EntryState::Processing;
        let path = entry.file_path.clone()?;
        Some((session_id, path))
    }

    async fn process(&self, session_id: String, path: PathBuf) {
        let mut result = match self.cache.get(&path).await {
            Some(entry) => {
                tracing::debug!(session_id = %session_id, "Cache hit, skipping scan");
                entry.result
            }
            None => self.scanner.scan(&path).await,
        };

        if result.status == ScanStatus::Corrupted {
            let repair = self.scanner.repair(&path).await;
            let _ = self.events.send(ServiceEvent::Repaired(repair.clone()));
            match repair.status {
                RepairStatus::Failed => {
                    let _ = self.events.send(ServiceEvent::Error {
                        session_id: session_id.clone(),
                        message: repair
                            .error
                            .unwrap_or_else(|| "repair failed".to_string()),
                    });
                }
                _ => {
                    result = self.scanner.scan(&path).await;
                }
            }
        }

        result.session_id = session_id.clone();

        self.cache.set(&path, result.clone()).await;
        if let Err(e) = self.cache.persist().await {
            // Cache I/O failures never halt the loop; the session still
            // completes with the computed result.
            tracing::warn!(session_id = %session_id, error = %e, "Failed to persist scan cache");
            let _ = self.events.send(ServiceEvent::Error {
                session_id: session_id.clone(),
                message: e.to_string(),
            });
        }

        let _ = self.events.send(ServiceEvent::Scanned(result.clone()));

        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get_mut(&session_id) {
            for tx in entry.waiters.drain(..) {
                let _ = tx.send(result.clone());
            }
            entry.state = EntryState::Done(result);
        }
        drop(state);
        self.queue_changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::FileScanner;
    use crate::types::{RepairResult, ScanStatus};
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    /// Test double recording scan order.
    struct MockScanner {
        scanned: std::sync::Mutex<Vec<PathBuf>>,
    }

    impl MockScanner {
        fn new() -> Self {
            Self {
                scanned: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn scanned_paths(&self) -> Vec<PathBuf> {
            self.scanned.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Scanner for MockScanner {
        async fn scan(&self, path: &Path) -> ScanResult {
            self.scanned.lock().unwrap().push(path.to_path_buf());
            ScanResult {
                session_id: crate::scanner::session_id_for(path),
                file_path: path.to_path_buf(),
                status: ScanStatus::Healthy,
                chain_depth: 1,
                orphan_count: 0,
                file_size: 0,
                message_count: 1,
            }
        }

        async fn repair(&self, path: &Path) -> RepairResult {
            RepairResult {
                session_id: crate::scanner::session_id_for(path),
                status: RepairStatus::AlreadyHealthy,
                backup_path: None,
                orphans_fixed: 0,
                new_chain_depth: 1,
                error: None,
            }
        }
    }

    fn scheduler_with(
        scanner: Arc<dyn Scanner>,
        dir: &TempDir,
        concurrency: usize,
    ) -> PriorityScheduler {
        let cache = Arc::new(ScanCache::new(dir.path().join("cache.json")));
        let (events, _) = broadcast::channel(64);
        PriorityScheduler::new(scanner, cache, events, concurrency)
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockScanner::new());
        let scheduler = scheduler_with(mock.clone(), &dir, 1);

        let path_a = dir.path().join("a.jsonl");
        let path_b = dir.path().join("b.jsonl");
        scheduler
            .enqueue(vec![
                QueueItem::new("a", path_a.clone(), Priority::Background),
                QueueItem::new("b", path_b.clone(), Priority::Active),
            ])
            .await;
        scheduler.start().await;

        scheduler
            .wait_for("a", Duration::from_secs(5))
            .await
            .unwrap();
        scheduler
            .wait_for("b", Duration::from_secs(5))
            .await
            .unwrap();
        scheduler.stop().await;

        // Active beats Background despite arriving second.
        assert_eq!(mock.scanned_paths(), vec![path_b, path_a]);
    }

    #[tokio::test]
    async fn test_enqueue_order_breaks_ties() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockScanner::new());
        let scheduler = scheduler_with(mock.clone(), &dir, 1);

        let paths: Vec<PathBuf> = (0..4)
            .map(|i| dir.path().join(format!("s{}.jsonl", i)))
            .collect();
        let items = paths
            .iter()
            .enumerate()
            .map(|(i, p)| QueueItem::new(format!("s{}", i), p.clone(), Priority::Disk))
            .collect();
        scheduler.enqueue(items).await;
        scheduler.start().await;

        for i in 0..4 {
            scheduler
                .wait_for(&format!("s{}", i), Duration::from_secs(5))
                .await
                .unwrap();
        }
        scheduler.stop().await;

        assert_eq!(mock.scanned_paths(), paths);
    }

    #[tokio::test]
    async fn test_reenqueue_updates_in_place() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler_with(Arc::new(MockScanner::new()), &dir, 1);

        let path = dir.path().join("s.jsonl");
        scheduler
            .enqueue(vec![QueueItem::new("s", path.clone(), Priority::Disk)])
            .await;
        scheduler
            .enqueue(vec![QueueItem::placeholder("s", Priority::Active)])
            .await;

        let top = scheduler.peek().await.unwrap();
        assert_eq!(top.session_id, "s");
        assert_eq!(top.priority, Priority::Active);
        // The known path survives a placeholder re-prioritization.
        assert_eq!(top.file_path, Some(path));
    }

    #[tokio::test]
    async fn test_placeholder_resolution_takes_most_urgent_tier() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler_with(Arc::new(MockScanner::new()), &dir, 1);

        scheduler
            .enqueue(vec![QueueItem::placeholder("s", Priority::Visible)])
            .await;
        let path = dir.path().join("s.jsonl");
        scheduler
            .enqueue(vec![QueueItem::new("s", path.clone(), Priority::Disk)])
            .await;

        let top = scheduler.peek().await.unwrap();
        assert_eq!(top.priority, Priority::Visible);
        assert_eq!(top.file_path, Some(path));
    }

    #[tokio::test]
    async fn test_wait_for_unknown_session_rejects() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler_with(Arc::new(MockScanner::new()), &dir, 1);
        scheduler.start().await;

        let started = std::time::Instant::now();
        let err = scheduler
            .wait_for("never-enqueued", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DoctorError::NotInQueue { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_wait_for_unresolved_placeholder_times_out() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler_with(Arc::new(MockScanner::new()), &dir, 1);
        scheduler.start().await;

        scheduler
            .enqueue(vec![QueueItem::placeholder("pending", Priority::Active)])
            .await;
        let err = scheduler
            .wait_for("pending", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, DoctorError::Timeout { .. }));

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_wait_for_session_enqueued_after_call() {
        let dir = TempDir::new().unwrap();
        let scheduler = Arc::new(scheduler_with(Arc::new(MockScanner::new()), &dir, 1));
        scheduler.start().await;

        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                scheduler.wait_for("late", Duration::from_secs(5)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler
            .enqueue(vec![QueueItem::new(
                "late",
                dir.path().join("late.jsonl"),
                Priority::Visible,
            )])
            .await;

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.session_id, "late");

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_wait_for_done_returns_immediately() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler_with(Arc::new(MockScanner::new()), &dir, 1);
        scheduler.start().await;

        scheduler
            .enqueue(vec![QueueItem::new(
                "s",
                dir.path().join("s.jsonl"),
                Priority::Active,
            )])
            .await;
        scheduler.wait_for("s", Duration::from_secs(5)).await.unwrap();

        // Already done: even a zero-ish timeout succeeds.
        let result = scheduler
            .wait_for("s", Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(result.session_id, "s");

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_done_entry_requeues_on_renewed_interest() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockScanner::new());
        let scheduler = scheduler_with(mock.clone(), &dir, 1);
        scheduler.start().await;

        let path = dir.path().join("s.jsonl");
        scheduler
            .enqueue(vec![QueueItem::new("s", path.clone(), Priority::Disk)])
            .await;
        scheduler.wait_for("s", Duration::from_secs(5)).await.unwrap();

        scheduler
            .enqueue(vec![QueueItem::new("s", path, Priority::Active)])
            .await;
        scheduler.wait_for("s", Duration::from_secs(5)).await.unwrap();
        scheduler.stop().await;

        assert_eq!(mock.scanned_paths().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_starts_no_new_work() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockScanner::new());
        let scheduler = scheduler_with(mock.clone(), &dir, 2);
        scheduler.start().await;
        scheduler.stop().await;

        scheduler
            .enqueue(vec![QueueItem::new(
                "s",
                dir.path().join("s.jsonl"),
                Priority::Active,
            )])
            .await;
        let err = scheduler
            .wait_for("s", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, DoctorError::Timeout { .. }));
        assert!(mock.scanned_paths().is_empty());
    }

    #[tokio::test]
    async fn test_worker_repairs_corrupted_file() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("sick.jsonl");
        std::fs::write(
            &log,
            "{\"id\":\"a\"}\n{\"id\":\"b\",\"parent\":\"ghost\"}",
        )
        .unwrap();

        let cache = Arc::new(ScanCache::new(dir.path().join("cache.json")));
        let (events, mut rx) = broadcast::channel(64);
        let scheduler =
            PriorityScheduler::new(Arc::new(FileScanner), cache, events, 1);
        scheduler.start().await;

        scheduler
            .enqueue(vec![QueueItem::new("sick", log.clone(), Priority::Active)])
            .await;
        let result = scheduler
            .wait_for("sick", Duration::from_secs(5))
            .await
            .unwrap();
        scheduler.stop().await;

        assert_eq!(result.status, ScanStatus::Healthy);
        assert_eq!(result.orphan_count, 0);
        assert_eq!(result.chain_depth, 2);

        let mut saw_repaired = false;
        let mut saw_scanned = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                ServiceEvent::Repaired(r) => {
                    assert_eq!(r.status, RepairStatus::Repaired);
                    assert_eq!(r.orphans_fixed, 1);
                    saw_repaired = true;
                }
                ServiceEvent::Scanned(s) => {
                    assert_eq!(s.session_id, "sick");
                    saw_scanned = true;
                }
                ServiceEvent::Error { .. } => panic!("unexpected error event"),
            }
        }
        assert!(saw_repaired);
        assert!(saw_scanned);
    }

    #[tokio::test]
    async fn test_second_pass_hits_cache() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("ok.jsonl");
        std::fs::write(&log, "{\"id\":\"a\"}").unwrap();

        let mock = Arc::new(MockScanner::new());
        let cache = Arc::new(ScanCache::new(dir.path().join("cache.json")));
        let (events, _) = broadcast::channel(64);
        let scheduler =
            PriorityScheduler::new(mock.clone(), Arc::clone(&cache), events, 1);
        scheduler.start().await;

        scheduler
            .enqueue(vec![QueueItem::new("ok", log.clone(), Priority::Disk)])
            .await;
        scheduler.wait_for("ok", Duration::from_secs(5)).await.unwrap();
        assert_eq!(mock.scanned_paths().len(), 1);

        // Unchanged file: the second pass is served from the cache.
        scheduler
            .enqueue(vec![QueueItem::new("ok", log, Priority::Active)])
            .await;
        scheduler.wait_for("ok", Duration::from_secs(5)).await.unwrap();
        scheduler.stop().await;

        assert_eq!(mock.scanned_paths().len(), 1);
    }
}
