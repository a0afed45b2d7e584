use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::engine::SecurityPolicyEngine;
use crate::error::GateError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Something that can reload itself from disk.
pub trait ReloadTarget: Send + Sync {
    fn reload(&self) -> Result<usize, GateError>;
}

impl ReloadTarget for SecurityPolicyEngine {
    fn reload(&self) -> Result<usize, GateError> {
        SecurityPolicyEngine::reload(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WatcherHealth {
    pub running: bool,
    pub path: PathBuf,
    pub last_reload_time: Option<DateTime<Utc>>,
    pub last_reload_age_ms: Option<u64>,
    pub reloads_total: u64,
    pub last_error: Option<String>,
}

/// Shared between the watcher handle, the poll task and debounce tasks.
struct WatchState {
    target: Arc<dyn ReloadTarget>,
    pending: Mutex<Option<JoinHandle<()>>>,
    last_reload: Mutex<Option<(DateTime<Utc>, Instant)>>,
    last_error: Mutex<Option<String>>,
    reloads: AtomicU64,
}

impl WatchState {
    fn reload(&self, path: &Path) -> Result<usize, GateError> {
        let result = self.target.reload();
        match &result {
            Ok(count) => {
                *self.last_reload.lock() = Some((Utc::now(), Instant::now()));
                *self.last_error.lock() = None;
                self.reloads.fetch_add(1, Ordering::Relaxed);
                info!(path = %path.display(), rules = count, "watched file reloaded");
            }
            Err(e) => {
                *self.last_error.lock() = Some(e.to_string());
                warn!(path = %path.display(), error = %e, "watched file reload failed");
            }
        }
        result
    }

    /// Replace any pending reload with a fresh one `debounce` from now.
    fn schedule(self: &Arc<Self>, path: PathBuf, debounce: Duration) {
        let state = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let _ = state.reload(&path);
        });

        if let Some(previous) = self.pending.lock().replace(task) {
            previous.abort();
        }
    }

    fn cancel_pending(&self) {
        if let Some(task) = self.pending.lock().take() {
            task.abort();
        }
    }
}

/// Polls one file and reloads its target after changes settle.
///
/// Changes are detected by content hash, so touching a file without
/// changing it does nothing. A burst of changes yields one trailing reload
/// once the file has been quiet for the debounce interval. A deleted file
/// never triggers a reload; the write that recreates it does.
pub struct ConfigWatcher {
    path: PathBuf,
    debounce: Duration,
    poll_interval: Duration,
    state: Arc<WatchState>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigWatcher {
    pub fn new(
        path: impl Into<PathBuf>,
        target: Arc<dyn ReloadTarget>,
        debounce: Duration,
        poll_interval: Duration,
    ) -> Self {
        ConfigWatcher {
            path: path.into(),
            debounce,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            state: Arc::new(WatchState {
                target,
                pending: Mutex::new(None),
                last_reload: Mutex::new(None),
                last_error: Mutex::new(None),
                reloads: AtomicU64::new(0),
            }),
            poll_task: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begin watching. Returns false if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut poll_task = self.poll_task.lock();
        if poll_task.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }

        let path = self.path.clone();
        let debounce = self.debounce;
        let every = self.poll_interval;
        let state = self.state.clone();
        let mut last_seen = fingerprint(&path);

        *poll_task = Some(tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let current = fingerprint(&path);
                if current == last_seen {
                    continue;
                }

                match &current {
                    Some(_) => {
                        debug!(path = %path.display(), "watched file changed");
                        state.schedule(path.clone(), debounce);
                    }
                    None => debug!(path = %path.display(), "watched file removed"),
                }
                last_seen = current;
            }
        }));

        info!(
            path = %self.path.display(),
            debounce_ms = self.debounce.as_millis() as u64,
            "config watcher started"
        );
        true
    }

    /// Stop watching and cancel any pending reload. Safe to call repeatedly.
    pub fn stop(&self) {
        let task = self.poll_task.lock().take();
        if let Some(task) = task {
            task.abort();
            info!(path = %self.path.display(), "config watcher stopped");
        }
        self.state.cancel_pending();
    }

    pub fn is_running(&self) -> bool {
        self.poll_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Reload immediately, bypassing the debounce.
    pub fn trigger_reload(&self) -> Result<usize, GateError> {
        self.state.cancel_pending();
        self.state.reload(&self.path)
    }

    pub fn health_check(&self) -> WatcherHealth {
        let last_reload = *self.state.last_reload.lock();

        WatcherHealth {
            running: self.is_running(),
            path: self.path.clone(),
            last_reload_time: last_reload.map(|(at, _)| at),
            last_reload_age_ms: last_reload.map(|(_, since)| since.elapsed().as_millis() as u64),
            reloads_total: self.state.reloads.load(Ordering::Relaxed),
            last_error: self.state.last_error.lock().clone(),
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Content hash of the file, or None if it does not exist.
fn fingerprint(path: &Path) -> Option<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => Some(Sha256::digest(&bytes).to_vec()),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read watched file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingTarget {
        calls: AtomicUsize,
    }

    impl ReloadTarget for CountingTarget {
        fn reload(&self) -> Result<usize, GateError> {
            Ok(self.calls.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    struct FailingTarget;

    impl ReloadTarget for FailingTarget {
        fn reload(&self) -> Result<usize, GateError> {
            Err(GateError::config("broken rules"))
        }
    }

    fn setup() -> (TempDir, PathBuf, Arc<CountingTarget>, ConfigWatcher) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, "rules: []\n").unwrap();

        let target = Arc::new(CountingTarget::default());
        let watcher = ConfigWatcher::new(
            &path,
            target.clone(),
            Duration::from_millis(100),
            Duration::from_millis(10),
        );
        (dir, path, target, watcher)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_file_does_not_reload() {
        let (_dir, path, target, watcher) = setup();
        assert!(watcher.start());

        std::fs::write(&path, "rules: []\n").unwrap();
        settle().await;

        assert_eq!(target.calls.load(Ordering::SeqCst), 0);
        watcher.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_reload() {
        let (_dir, path, target, watcher) = setup();
        watcher.start();

        for i in 0..5 {
            std::fs::write(&path, format!("rules: []\n# edit {}\n", i)).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(target.calls.load(Ordering::SeqCst), 0);

        settle().await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);

        let health = watcher.health_check();
        assert_eq!(health.reloads_total, 1);
        assert!(health.last_reload_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_then_recreate_reloads_once() {
        let (_dir, path, target, watcher) = setup();
        watcher.start();

        std::fs::remove_file(&path).unwrap();
        settle().await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 0);

        std::fs::write(&path, "rules: []\n# recreated\n").unwrap();
        settle().await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_reload() {
        let (_dir, path, target, watcher) = setup();
        watcher.start();

        std::fs::write(&path, "rules: []\n# changed\n").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        watcher.stop();
        watcher.stop();
        settle().await;

        assert_eq!(target.calls.load(Ordering::SeqCst), 0);
        assert!(!watcher.health_check().running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (_dir, _path, _target, watcher) = setup();

        assert!(watcher.start());
        assert!(!watcher.start());
        assert!(watcher.is_running());

        watcher.stop();
        assert!(!watcher.is_running());
        assert!(watcher.start());
    }

    #[tokio::test]
    async fn test_trigger_reload() {
        let (_dir, _path, target, watcher) = setup();

        assert_eq!(watcher.health_check().last_reload_time, None);
        assert_eq!(watcher.trigger_reload().unwrap(), 1);

        let health = watcher.health_check();
        assert!(health.last_reload_time.is_some());
        assert!(health.last_reload_age_ms.is_some());
        assert!(!health.running);
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_reload_is_reported() {
        let dir = TempDir::new().unwrap();
        let watcher = ConfigWatcher::new(
            dir.path().join("rules.yaml"),
            Arc::new(FailingTarget),
            Duration::from_millis(10),
            DEFAULT_POLL_INTERVAL,
        );

        assert!(watcher.trigger_reload().is_err());

        let health = watcher.health_check();
        assert_eq!(health.last_error.as_deref(), Some("invalid configuration: broken rules"));
        assert_eq!(health.last_reload_time, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_reloads_engine() {
        use crate::domain::ToolRequest;
        use crate::pattern::{PatternCache, PatternEngine};

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, "rules: []\n").unwrap();

        let engine = Arc::new(
            SecurityPolicyEngine::builder()
                .pattern_engine(PatternEngine::new(Arc::new(PatternCache::new(16))))
                .rules_path(&path)
                .build()
                .unwrap(),
        );
        let watcher = ConfigWatcher::new(
            &path,
            engine.clone(),
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        watcher.start();

        std::fs::write(
            &path,
            "rules:\n  - id: deny_rm\n    conditions:\n      tool_name: rm\n    action: deny\n",
        )
        .unwrap();
        settle().await;

        assert_eq!(engine.get_rules_count(), 1);
        let d = engine.evaluate(&ToolRequest::new("rm")).await;
        assert_eq!(d.rule_id.as_deref(), Some("deny_rm"));
    }
}
