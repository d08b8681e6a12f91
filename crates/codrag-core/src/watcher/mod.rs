//! Debounced auto-rebuild watcher.
//!
//! Consumes a filesystem event source (the `notify` crate in production, a
//! manual source in tests) and drives the rebuild state machine:
//!
//! ```text
//! disabled -> idle -> debouncing -> (throttled) -> building -> idle
//! ```
//!
//! Relevant events mark the project stale and arm a debounce timer; the
//! timer respects a minimum gap between rebuild triggers; builds already in
//! flight defer the trigger and a poller watches for completion. Any
//! accepted event leads to exactly one rebuild, no sooner than `debounce_ms`
//! after the last event and `min_rebuild_gap_ms` after the previous trigger.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::WatcherTuning;
use crate::error::{CoreError, CoreResult};
use crate::globs::{to_posix, PathMatcher};
use crate::policy;

// ---------------------------------------------------------------------------
// Event source contract
// ---------------------------------------------------------------------------

/// A filesystem event delivered by an event source.
#[derive(Debug, Clone)]
pub struct FsEvent {
    /// Absolute path the event concerns.
    pub path: PathBuf,
    /// Destination path for moves, when known.
    pub dest_path: Option<PathBuf>,
    /// Whether the event concerns a directory (such events are ignored).
    pub is_directory: bool,
}

/// Callback receiving events from a source.
pub type EventSink = Arc<dyn Fn(FsEvent) + Send + Sync>;

/// A recursive filesystem event subscription with at-least-once delivery.
pub trait EventSource: Send {
    /// Start delivering events beneath `root` to `sink`.
    fn subscribe(&mut self, root: &Path, sink: EventSink) -> CoreResult<()>;

    /// Stop delivering events.
    fn unsubscribe(&mut self);
}

/// Production event source backed by the `notify` crate.
#[derive(Default)]
pub struct NotifyEventSource {
    watcher: Option<notify::RecommendedWatcher>,
}

impl NotifyEventSource {
    /// Create an unsubscribed source.
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventSource for NotifyEventSource {
    fn subscribe(&mut self, root: &Path, sink: EventSink) -> CoreResult<()> {
        use notify::Watcher;

        let handler = move |res: Result<notify::Event, notify::Error>| {
            let Ok(event) = res else { return };
            for path in event.paths {
                let is_directory = std::fs::metadata(&path).map(|m| m.is_dir()).unwrap_or(false);
                sink(FsEvent { path, dest_path: None, is_directory });
            }
        };

        let mut watcher = notify::recommended_watcher(handler)
            .map_err(|e| CoreError::Internal(format!("failed to create watcher: {e}")))?;
        watcher
            .watch(root, notify::RecursiveMode::Recursive)
            .map_err(|e| CoreError::Internal(format!("failed to watch {}: {e}", root.display())))?;

        self.watcher = Some(watcher);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.watcher = None;
    }
}

/// Manual event source for tests: emits events pushed through its handle.
#[derive(Default)]
pub struct ManualEventSource {
    sink: Arc<Mutex<Option<EventSink>>>,
}

impl ManualEventSource {
    /// Create an unsubscribed source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for pushing events after the source has been subscribed.
    pub fn handle(&self) -> ManualEventHandle {
        ManualEventHandle { sink: Arc::clone(&self.sink) }
    }
}

/// Emits events into a subscribed [`ManualEventSource`].
#[derive(Clone)]
pub struct ManualEventHandle {
    sink: Arc<Mutex<Option<EventSink>>>,
}

impl ManualEventHandle {
    /// Deliver a file event.
    pub fn emit(&self, path: &Path) {
        self.emit_event(FsEvent { path: path.to_path_buf(), dest_path: None, is_directory: false });
    }

    /// Deliver an arbitrary event.
    pub fn emit_event(&self, event: FsEvent) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }
}

impl EventSource for ManualEventSource {
    fn subscribe(&mut self, _root: &Path, sink: EventSink) -> CoreResult<()> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        *self.sink.lock() = None;
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Watcher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchState {
    /// Not started.
    Disabled,
    /// Waiting for events.
    Idle,
    /// Events pending, debounce timer armed.
    Debouncing,
    /// Debounce fired too soon after the previous trigger; re-armed.
    Throttled,
    /// A build is in flight; completion poller active.
    Building,
}

impl WatchState {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Idle => "idle",
            Self::Debouncing => "debouncing",
            Self::Throttled => "throttled",
            Self::Building => "building",
        }
    }
}

/// Snapshot of watcher state for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchStatus {
    /// Whether the watcher is running.
    pub enabled: bool,
    /// Current state.
    pub state: WatchState,
    /// Configured debounce interval.
    pub debounce_ms: u64,
    /// Whether a relevant change has been seen since the last completed build.
    pub stale: bool,
    /// When staleness began.
    pub stale_since: Option<String>,
    /// Number of coalesced pending paths.
    pub pending_paths_count: usize,
    /// When the armed rebuild will fire, if any.
    pub next_rebuild_at: Option<String>,
    /// Timestamp of the last accepted event.
    pub last_event_at: Option<String>,
    /// Timestamp of the last completed rebuild.
    pub last_rebuild_at: Option<String>,
}

/// Callback that attempts to start a rebuild for the pending paths; returns
/// true when a build was started.
pub type TriggerBuild = Box<dyn Fn(Vec<String>) -> bool + Send + Sync>;
/// Callback reporting whether a build is currently running.
pub type IsBuilding = Box<dyn Fn() -> bool + Send + Sync>;

struct WatchMut {
    enabled: bool,
    state: WatchState,
    pending: BTreeSet<String>,
    stale: bool,
    stale_since: Option<String>,
    last_event_at: Option<String>,
    last_rebuild_at: Option<String>,
    next_rebuild_at: Option<String>,
    last_trigger_at: Option<Instant>,
    timer_generation: u64,
    poller_active: bool,
}

struct WatcherInner {
    repo_root: PathBuf,
    index_dir: PathBuf,
    tuning: WatcherTuning,
    extra_exclude_globs: Vec<String>,
    on_trigger: TriggerBuild,
    is_building: IsBuilding,
    state: Mutex<WatchMut>,
}

/// Watches a repository and triggers debounced rebuilds.
pub struct AutoRebuildWatcher {
    inner: Arc<WatcherInner>,
    source: Mutex<Box<dyn EventSource>>,
}

impl AutoRebuildWatcher {
    /// Create a stopped watcher.
    ///
    /// `on_trigger` is invoked with the coalesced pending paths when the
    /// debounce window closes; `is_building` reports in-flight builds.
    pub fn new(
        repo_root: &Path,
        index_dir: &Path,
        tuning: WatcherTuning,
        source: Box<dyn EventSource>,
        on_trigger: TriggerBuild,
        is_building: IsBuilding,
    ) -> Self {
        let repo_root = repo_root.canonicalize().unwrap_or_else(|_| repo_root.to_path_buf());
        let index_dir = index_dir.canonicalize().unwrap_or_else(|_| index_dir.to_path_buf());

        // The index directory subtree must never self-trigger.
        let mut extra_exclude_globs = vec![
            "**/.codrag/**".to_string(),
            "**/.index_build_*/**".to_string(),
            "**/.index_backup_*/**".to_string(),
        ];
        if let Ok(rel) = index_dir.strip_prefix(&repo_root) {
            let rel_posix = to_posix(&rel.to_string_lossy());
            let rel_posix = rel_posix.trim_end_matches('/');
            if !rel_posix.is_empty() {
                extra_exclude_globs.push(format!("{rel_posix}/**"));
            }
        }

        Self {
            inner: Arc::new(WatcherInner {
                repo_root,
                index_dir,
                tuning,
                extra_exclude_globs,
                on_trigger,
                is_building,
                state: Mutex::new(WatchMut {
                    enabled: false,
                    state: WatchState::Disabled,
                    pending: BTreeSet::new(),
                    stale: false,
                    stale_since: None,
                    last_event_at: None,
                    last_rebuild_at: None,
                    next_rebuild_at: None,
                    last_trigger_at: None,
                    timer_generation: 0,
                    poller_active: false,
                }),
            }),
            source: Mutex::new(source),
        }
    }

    /// Start watching: establish the policy-derived filter and subscribe the
    /// event source. Idempotent.
    pub fn start(&self) -> CoreResult<()> {
        {
            let mut state = self.inner.state.lock();
            if state.enabled {
                return Ok(());
            }
            state.enabled = true;
            state.state = WatchState::Idle;
            state.pending.clear();
            state.stale = false;
            state.stale_since = None;
            state.last_event_at = None;
            state.next_rebuild_at = None;
        }

        policy::ensure_repo_policy(&self.inner.index_dir, &self.inner.repo_root, false)?;

        let inner = Arc::clone(&self.inner);
        let sink: EventSink = Arc::new(move |event| WatcherInner::on_event(&inner, event));
        self.source.lock().subscribe(&self.inner.repo_root, sink)?;

        tracing::info!(root = %self.inner.repo_root.display(), "watcher started");
        Ok(())
    }

    /// Stop watching: cancel the timer, detach the subscription, clear
    /// pending state. An in-flight build is not interrupted.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.enabled = false;
            state.state = WatchState::Disabled;
            state.pending.clear();
            state.next_rebuild_at = None;
            state.timer_generation += 1; // cancels any armed timer
        }
        self.source.lock().unsubscribe();
        tracing::info!(root = %self.inner.repo_root.display(), "watcher stopped");
    }

    /// Snapshot of the current watcher state.
    pub fn status(&self) -> WatchStatus {
        let state = self.inner.state.lock();
        let mut shown_state = state.state;
        if state.enabled && (self.inner.is_building)() {
            shown_state = WatchState::Building;
        }
        WatchStatus {
            enabled: state.enabled,
            state: shown_state,
            debounce_ms: self.inner.tuning.debounce_ms,
            stale: state.stale,
            stale_since: state.stale_since.clone(),
            pending_paths_count: state.pending.len(),
            next_rebuild_at: state.next_rebuild_at.clone(),
            last_event_at: state.last_event_at.clone(),
            last_rebuild_at: state.last_rebuild_at.clone(),
        }
    }
}

impl WatcherInner {
    fn on_event(inner: &Arc<WatcherInner>, event: FsEvent) {
        if event.is_directory {
            return;
        }
        Self::queue_path(inner, &event.path);
        if let Some(dest) = &event.dest_path {
            Self::queue_path(inner, dest);
        }
    }

    fn queue_path(inner: &Arc<WatcherInner>, abs_path: &Path) {
        let Ok(rel) = abs_path.strip_prefix(&inner.repo_root) else { return };
        let rel_posix = to_posix(&rel.to_string_lossy());
        if rel_posix.is_empty() {
            return;
        }

        if !inner.is_relevant(&rel_posix) {
            return;
        }

        let now = chrono::Utc::now();
        let mut state = inner.state.lock();
        if !state.enabled {
            return;
        }

        state.pending.insert(rel_posix);
        state.last_event_at = Some(now.to_rfc3339());
        state.stale = true;
        if state.stale_since.is_none() {
            state.stale_since = Some(now.to_rfc3339());
        }

        if (inner.is_building)() || state.state == WatchState::Building {
            state.state = WatchState::Building;
            Self::ensure_poller(inner, &mut state);
            return;
        }

        state.state = WatchState::Debouncing;
        let delay = Duration::from_millis(inner.tuning.debounce_ms.max(1));
        state.next_rebuild_at =
            Some((now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())).to_rfc3339());
        Self::arm_timer(inner, &mut state, delay);
    }

    /// Arm (or re-arm) the debounce timer. Bumping the generation cancels any
    /// previously armed timer.
    fn arm_timer(inner: &Arc<WatcherInner>, state: &mut WatchMut, delay: Duration) {
        state.timer_generation += 1;
        let generation = state.timer_generation;
        let inner = Arc::clone(inner);
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            let fire = {
                let state = inner.state.lock();
                state.enabled && state.timer_generation == generation
            };
            if fire {
                Self::on_debounce_fire(&inner);
            }
        });
    }

    fn on_debounce_fire(inner: &Arc<WatcherInner>) {
        let paths: Vec<String> = {
            let mut state = inner.state.lock();
            if !state.enabled {
                return;
            }
            if state.pending.is_empty() {
                state.state = WatchState::Idle;
                state.next_rebuild_at = None;
                return;
            }
            state.next_rebuild_at = None;
            std::mem::take(&mut state.pending).into_iter().collect()
        };

        if (inner.is_building)() {
            let mut state = inner.state.lock();
            state.pending.extend(paths);
            state.state = WatchState::Building;
            Self::ensure_poller(inner, &mut state);
            return;
        }

        // Enforce the minimum gap since the previous trigger.
        let min_gap = Duration::from_millis(inner.tuning.min_rebuild_gap_ms);
        let since_last = {
            let state = inner.state.lock();
            state.last_trigger_at.map(|t| t.elapsed())
        };
        if let Some(elapsed) = since_last {
            if elapsed < min_gap {
                let remaining = min_gap - elapsed;
                let mut state = inner.state.lock();
                state.pending.extend(paths);
                state.state = WatchState::Throttled;
                state.next_rebuild_at = Some(
                    (chrono::Utc::now()
                        + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero()))
                    .to_rfc3339(),
                );
                Self::arm_timer(inner, &mut state, remaining.max(Duration::from_millis(1)));
                return;
            }
        }

        let started = (inner.on_trigger)(paths.clone());

        if !started {
            let mut state = inner.state.lock();
            state.pending.extend(paths);
            if (inner.is_building)() {
                state.state = WatchState::Building;
                Self::ensure_poller(inner, &mut state);
            } else {
                state.state = WatchState::Debouncing;
                let delay = Duration::from_millis(inner.tuning.debounce_ms.max(1));
                state.next_rebuild_at = Some(
                    (chrono::Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()))
                        .to_rfc3339(),
                );
                Self::arm_timer(inner, &mut state, delay);
            }
            return;
        }

        let mut state = inner.state.lock();
        state.state = WatchState::Building;
        state.last_trigger_at = Some(Instant::now());
        Self::ensure_poller(inner, &mut state);
    }

    /// Spawn the build-completion poller if one is not already running.
    fn ensure_poller(inner: &Arc<WatcherInner>, state: &mut WatchMut) {
        if state.poller_active {
            return;
        }
        state.poller_active = true;

        let inner = Arc::clone(inner);
        std::thread::spawn(move || {
            let poll = Duration::from_millis(inner.tuning.poll_interval_ms.max(10));
            loop {
                {
                    let state = inner.state.lock();
                    if !state.enabled {
                        return;
                    }
                }
                if !(inner.is_building)() {
                    break;
                }
                std::thread::sleep(poll);
            }

            let mut state = inner.state.lock();
            state.poller_active = false;
            if !state.enabled {
                return;
            }

            state.last_rebuild_at = Some(chrono::Utc::now().to_rfc3339());

            if state.pending.is_empty() {
                state.state = WatchState::Idle;
                state.stale = false;
                state.stale_since = None;
                state.next_rebuild_at = None;
            } else {
                state.state = WatchState::Debouncing;
                let delay = Duration::from_millis(inner.tuning.debounce_ms.max(1));
                state.next_rebuild_at = Some(
                    (chrono::Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()))
                        .to_rfc3339(),
                );
                Self::arm_timer(&inner, &mut state, delay);
            }
        });
    }

    /// A path is relevant iff the policy excludes don't match and the policy
    /// includes are empty or match. The index directory is unconditionally
    /// excluded.
    fn is_relevant(&self, rel_posix: &str) -> bool {
        let (include_globs, mut exclude_globs) = self.load_policy_globs();
        exclude_globs.extend(self.extra_exclude_globs.iter().cloned());
        PathMatcher::new(&include_globs, &exclude_globs).is_relevant(rel_posix)
    }

    fn load_policy_globs(&self) -> (Vec<String>, Vec<String>) {
        let path = policy::policy_path_for_index(&self.index_dir);
        let loaded = policy::load_repo_policy(&path)
            .filter(|p| p.repo_root == self.repo_root.to_string_lossy());
        match loaded {
            Some(p) => (p.include_globs, p.exclude_globs),
            None => match policy::ensure_repo_policy(&self.index_dir, &self.repo_root, false) {
                Ok(p) => (p.include_globs, p.exclude_globs),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to ensure repo policy, accepting all paths");
                    (Vec::new(), Vec::new())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Harness {
        watcher: AutoRebuildWatcher,
        handle: ManualEventHandle,
        root: PathBuf,
        triggers: Arc<AtomicUsize>,
        trigger_times: Arc<Mutex<Vec<Instant>>>,
        building: Arc<AtomicBool>,
        _dir: tempfile::TempDir,
    }

    fn harness(debounce_ms: u64, min_gap_ms: u64) -> Harness {
        let dir = tempfile::tempdir().expect("create temp dir");
        let root = dir.path().join("repo");
        std::fs::create_dir_all(&root).expect("mkdir");
        std::fs::write(root.join("main.py"), "def main(): pass\n").expect("write");
        let root = root.canonicalize().expect("canonicalize");
        let index_dir = root.join(".codrag");

        let triggers = Arc::new(AtomicUsize::new(0));
        let trigger_times = Arc::new(Mutex::new(Vec::new()));
        let building = Arc::new(AtomicBool::new(false));

        let source = ManualEventSource::new();
        let handle = source.handle();

        let t = Arc::clone(&triggers);
        let times = Arc::clone(&trigger_times);
        let b = Arc::clone(&building);
        let on_trigger: TriggerBuild = Box::new(move |_paths| {
            t.fetch_add(1, Ordering::SeqCst);
            times.lock().push(Instant::now());
            b.store(true, Ordering::SeqCst);
            true
        });
        let b2 = Arc::clone(&building);
        let is_building: IsBuilding = Box::new(move || b2.load(Ordering::SeqCst));

        let tuning = WatcherTuning {
            debounce_ms,
            min_rebuild_gap_ms: min_gap_ms,
            poll_interval_ms: 10,
        };
        let watcher = AutoRebuildWatcher::new(
            &root,
            &index_dir,
            tuning,
            Box::new(source),
            on_trigger,
            is_building,
        );

        Harness { watcher, handle, root, triggers, trigger_times, building, _dir: dir }
    }

    fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_starts_idle_and_stops_disabled() {
        let h = harness(100, 50);
        assert_eq!(h.watcher.status().state, WatchState::Disabled);
        assert!(!h.watcher.status().enabled);

        h.watcher.start().expect("start");
        assert_eq!(h.watcher.status().state, WatchState::Idle);
        assert!(h.watcher.status().enabled);

        h.watcher.stop();
        assert_eq!(h.watcher.status().state, WatchState::Disabled);
    }

    #[test]
    fn test_event_burst_triggers_exactly_one_build() {
        let h = harness(100, 50);
        h.watcher.start().expect("start");

        let started = Instant::now();
        for _ in 0..10 {
            h.handle.emit(&h.root.join("main.py"));
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(h.watcher.status().stale);
        assert!(h.watcher.status().pending_paths_count > 0);

        assert!(wait_until(2000, || h.triggers.load(Ordering::SeqCst) == 1));
        // Debounce honored: at least debounce_ms after the last event.
        assert!(started.elapsed() >= Duration::from_millis(100));

        // Build completes; watcher returns to idle and clears staleness.
        h.building.store(false, Ordering::SeqCst);
        assert!(wait_until(2000, || {
            let s = h.watcher.status();
            s.state == WatchState::Idle && !s.stale && s.pending_paths_count == 0
        }));
        assert_eq!(h.triggers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_irrelevant_paths_are_ignored() {
        let h = harness(50, 10);
        h.watcher.start().expect("start");

        // Policy for a python repo includes *.py / *.md; a .bin file is noise.
        h.handle.emit(&h.root.join("blob.bin"));
        // The index directory never self-triggers.
        h.handle.emit(&h.root.join(".codrag/documents.json"));

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(h.triggers.load(Ordering::SeqCst), 0);
        assert!(!h.watcher.status().stale);
    }

    #[test]
    fn test_directory_events_are_ignored() {
        let h = harness(50, 10);
        h.watcher.start().expect("start");

        h.handle.emit_event(FsEvent {
            path: h.root.join("src"),
            dest_path: None,
            is_directory: true,
        });

        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(h.triggers.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_events_during_build_defer_and_refire() {
        let h = harness(50, 10);
        h.watcher.start().expect("start");

        // First burst -> first build.
        h.handle.emit(&h.root.join("main.py"));
        assert!(wait_until(2000, || h.triggers.load(Ordering::SeqCst) == 1));

        // Event while building: deferred, watcher stays stale.
        h.handle.emit(&h.root.join("main.py"));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(h.triggers.load(Ordering::SeqCst), 1);
        assert!(h.watcher.status().stale);

        // Completion drains the pending paths into a second build.
        h.building.store(false, Ordering::SeqCst);
        assert!(wait_until(3000, || h.triggers.load(Ordering::SeqCst) == 2));
    }

    #[test]
    fn test_stop_cancels_pending_rebuild() {
        let h = harness(200, 10);
        h.watcher.start().expect("start");

        h.handle.emit(&h.root.join("main.py"));
        assert_eq!(h.watcher.status().state, WatchState::Debouncing);

        h.watcher.stop();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(h.triggers.load(Ordering::SeqCst), 0);
        assert_eq!(h.watcher.status().pending_paths_count, 0);
    }

    #[test]
    fn test_min_rebuild_gap_throttles() {
        let h = harness(30, 500);
        h.watcher.start().expect("start");

        // First build fires and completes immediately.
        h.handle.emit(&h.root.join("main.py"));
        assert!(wait_until(2000, || h.triggers.load(Ordering::SeqCst) == 1));
        h.building.store(false, Ordering::SeqCst);
        assert!(wait_until(2000, || h.watcher.status().state == WatchState::Idle));

        // Second event lands immediately; the gap forces a throttle wait.
        h.handle.emit(&h.root.join("main.py"));
        assert!(wait_until(3000, || h.triggers.load(Ordering::SeqCst) == 2));

        // The second trigger fired no sooner than min_rebuild_gap_ms after
        // the first.
        let times = h.trigger_times.lock();
        assert_eq!(times.len(), 2);
        assert!(times[1].duration_since(times[0]) >= Duration::from_millis(500));
    }
}
