//! Watcher end to end: an event burst produces exactly one debounced build,
//! staleness tracks the window between first event and completion, and the
//! index directory never self-triggers.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use codrag_core::config::{EngineConfig, ProjectConfig, WatcherTuning};
use codrag_core::embedder::FakeEmbedder;
use codrag_core::registry::ProjectMode;
use codrag_core::watcher::{ManualEventSource, WatchState};
use codrag_core::Engine;

fn engine_in(dir: &Path) -> Engine {
    let config = EngineConfig { data_dir: dir.join("data"), ..EngineConfig::default() };
    Engine::new(config, Arc::new(FakeEmbedder::default())).expect("create engine")
}

fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn burst_of_events_triggers_exactly_one_build() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).expect("mkdir");
    std::fs::write(repo.join("main.py"), "def main():\n    return 1\n").expect("write");
    let repo = repo.canonicalize().expect("canonicalize");

    let engine = engine_in(dir.path());
    let config = ProjectConfig {
        watcher: Some(WatcherTuning {
            debounce_ms: 100,
            min_rebuild_gap_ms: 50,
            poll_interval_ms: 10,
        }),
        ..ProjectConfig::default()
    };
    let project = engine
        .add_project(&repo, None, ProjectMode::Embedded, Some(config))
        .expect("add project");

    let source = ManualEventSource::new();
    let handle = source.handle();
    engine
        .watch_start_with_source(&project.id, Box::new(source))
        .expect("start watcher");
    assert_eq!(engine.watch_status(&project.id).expect("status").state, WatchState::Idle);

    // Ten events inside a 50ms window against a relevant file.
    for _ in 0..10 {
        handle.emit(&repo.join("main.py"));
        std::thread::sleep(Duration::from_millis(5));
    }

    // Stale between first event and completion.
    let status = engine.watch_status(&project.id).expect("status");
    assert!(status.stale);
    assert!(status.stale_since.is_some());
    assert!(status.pending_paths_count > 0);

    // Exactly one build results; the watcher settles back to idle.
    assert!(wait_until(10_000, || {
        let s = engine.watch_status(&project.id).expect("status");
        s.state == WatchState::Idle && !s.stale
    }));
    let settled = engine.watch_status(&project.id).expect("status");
    assert_eq!(settled.pending_paths_count, 0);
    assert!(settled.last_rebuild_at.is_some());

    let built_at = engine.status(&project.id).expect("status").index.built_at.expect("built_at");
    assert!(engine.status(&project.id).expect("status").index.loaded);

    // No further events: no second build fires.
    std::thread::sleep(Duration::from_millis(400));
    let built_at_after =
        engine.status(&project.id).expect("status").index.built_at.expect("built_at");
    assert_eq!(built_at, built_at_after);

    engine.watch_stop(&project.id).expect("stop watcher");
    assert_eq!(
        engine.watch_status(&project.id).expect("status").state,
        WatchState::Disabled
    );
    engine.shutdown();
}

#[test]
fn index_directory_changes_do_not_self_trigger() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).expect("mkdir");
    std::fs::write(repo.join("main.py"), "def main(): pass\n").expect("write");
    let repo = repo.canonicalize().expect("canonicalize");

    let engine = engine_in(dir.path());
    let config = ProjectConfig {
        watcher: Some(WatcherTuning {
            debounce_ms: 50,
            min_rebuild_gap_ms: 10,
            poll_interval_ms: 10,
        }),
        ..ProjectConfig::default()
    };
    let project = engine
        .add_project(&repo, None, ProjectMode::Embedded, Some(config))
        .expect("add project");

    let source = ManualEventSource::new();
    let handle = source.handle();
    engine
        .watch_start_with_source(&project.id, Box::new(source))
        .expect("start watcher");

    // Writes inside .codrag (as a build would produce) are not relevant.
    handle.emit(&repo.join(".codrag").join("documents.json"));
    handle.emit(&repo.join(".codrag").join("fts.sqlite3"));

    std::thread::sleep(Duration::from_millis(200));
    let status = engine.watch_status(&project.id).expect("status");
    assert!(!status.stale);
    assert_eq!(status.pending_paths_count, 0);
    assert_eq!(status.state, WatchState::Idle);

    engine.shutdown();
}
