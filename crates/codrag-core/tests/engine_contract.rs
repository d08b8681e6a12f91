//! Engine facade contract: validation, not-ready, conflict, and purge-safety
//! behavior.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use codrag_core::config::EngineConfig;
use codrag_core::embedder::{Embedder, EmbeddingResult, FakeEmbedder};
use codrag_core::index::BuildOptions;
use codrag_core::registry::ProjectMode;
use codrag_core::search::context::ContextOptions;
use codrag_core::{CoreError, CoreResult, Engine};

fn engine_in(dir: &Path) -> Engine {
    let config = EngineConfig { data_dir: dir.join("data"), ..EngineConfig::default() };
    Engine::new(config, Arc::new(FakeEmbedder::default())).expect("create engine")
}

fn small_repo(dir: &Path) -> PathBuf {
    let repo = dir.join("repo");
    std::fs::create_dir_all(&repo).expect("mkdir");
    std::fs::write(repo.join("main.py"), "def main(): pass\n").expect("write");
    repo
}

/// Embedder that sleeps per call, keeping builds in flight long enough to
/// observe the conflict path.
struct SlowEmbedder {
    inner: FakeEmbedder,
    delay: Duration,
}

impl Embedder for SlowEmbedder {
    fn model_tag(&self) -> String {
        self.inner.model_tag()
    }

    fn embed(&self, text: &str) -> CoreResult<EmbeddingResult> {
        std::thread::sleep(self.delay);
        self.inner.embed(text)
    }
}

#[test]
fn validation_errors() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let repo = small_repo(dir.path());
    let engine = engine_in(dir.path());
    let project = engine
        .add_project(&repo, None, ProjectMode::Standalone, None)
        .expect("add project");

    let err = engine.search(&project.id, "   ", 5, 0.0).expect_err("empty query");
    assert!(matches!(err, CoreError::Validation { .. }));

    let err = engine.search(&project.id, "query", 0, 0.0).expect_err("zero k");
    assert!(matches!(err, CoreError::Validation { .. }));

    let bad = ContextOptions { max_chars: 0, ..ContextOptions::default() };
    let err = engine.context(&project.id, "query", &bad).expect_err("zero budget");
    assert!(matches!(err, CoreError::Validation { .. }));

    let err = engine
        .add_project(dir.path().join("missing").as_path(), None, ProjectMode::Standalone, None)
        .expect_err("missing root");
    assert!(matches!(err, CoreError::Validation { .. }));
}

#[test]
fn unknown_project_and_not_ready() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let repo = small_repo(dir.path());
    let engine = engine_in(dir.path());

    let err = engine.search("no-such-id", "query", 5, 0.0).expect_err("unknown project");
    assert!(matches!(err, CoreError::ProjectNotFound { .. }));

    let project = engine
        .add_project(&repo, None, ProjectMode::Standalone, None)
        .expect("add project");

    // Index not built yet.
    let err = engine.search(&project.id, "query", 5, 0.0).expect_err("not built");
    assert!(matches!(err, CoreError::IndexNotBuilt { .. }));
    let err = engine
        .context(&project.id, "query", &ContextOptions::default())
        .expect_err("not built");
    assert!(matches!(err, CoreError::IndexNotBuilt { .. }));

    let status = engine.status(&project.id).expect("status");
    assert!(!status.index_exists);
    assert!(!status.index.loaded);
}

#[test]
fn duplicate_registration_is_rejected() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let repo = small_repo(dir.path());
    let engine = engine_in(dir.path());

    engine
        .add_project(&repo, None, ProjectMode::Standalone, None)
        .expect("first add");
    let err = engine
        .add_project(&repo, Some("other"), ProjectMode::Embedded, None)
        .expect_err("duplicate");
    assert!(matches!(err, CoreError::ProjectAlreadyExists { .. }));
}

#[test]
fn concurrent_build_is_rejected() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let repo = small_repo(dir.path());

    let config = EngineConfig { data_dir: dir.path().join("data"), ..EngineConfig::default() };
    let slow = SlowEmbedder { inner: FakeEmbedder::default(), delay: Duration::from_millis(200) };
    let engine = Engine::new(config, Arc::new(slow)).expect("create engine");

    let project = engine
        .add_project(&repo, None, ProjectMode::Standalone, None)
        .expect("add project");

    engine.start_build(&project.id, BuildOptions::default()).expect("first build");
    let err = engine
        .start_build(&project.id, BuildOptions::default())
        .expect_err("second build must conflict");
    assert!(matches!(err, CoreError::BuildAlreadyRunning { .. }));

    assert!(engine.status(&project.id).expect("status").building);
    engine.wait_for_build(&project.id).expect("wait");
    assert!(!engine.status(&project.id).expect("status").building);

    // After completion a new build is accepted again.
    engine.start_build(&project.id, BuildOptions::default()).expect("third build");
    engine.wait_for_build(&project.id).expect("wait");
}

#[test]
fn builds_for_different_projects_run_in_parallel() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let repo_a = dir.path().join("a");
    let repo_b = dir.path().join("b");
    for repo in [&repo_a, &repo_b] {
        std::fs::create_dir_all(repo).expect("mkdir");
        std::fs::write(repo.join("main.py"), "def main(): pass\n").expect("write");
    }

    let engine = engine_in(dir.path());
    let a = engine.add_project(&repo_a, None, ProjectMode::Standalone, None).expect("add a");
    let b = engine.add_project(&repo_b, None, ProjectMode::Standalone, None).expect("add b");

    engine.start_build(&a.id, BuildOptions::default()).expect("build a");
    engine.start_build(&b.id, BuildOptions::default()).expect("build b");
    engine.wait_for_build(&a.id).expect("wait a");
    engine.wait_for_build(&b.id).expect("wait b");

    assert!(engine.status(&a.id).expect("status").index.loaded);
    assert!(engine.status(&b.id).expect("status").index.loaded);
}

#[test]
fn remove_project_with_purge_deletes_embedded_index() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let repo = small_repo(dir.path());
    let engine = engine_in(dir.path());

    let project = engine
        .add_project(&repo, None, ProjectMode::Embedded, None)
        .expect("add project");
    engine.start_build(&project.id, BuildOptions::default()).expect("build");
    engine.wait_for_build(&project.id).expect("wait");

    let index_dir = repo.join(".codrag");
    assert!(index_dir.join("documents.json").exists());

    engine.remove_project(&project.id, true).expect("remove");
    assert!(!index_dir.exists());
    assert!(matches!(
        engine.get_project(&project.id).expect_err("gone"),
        CoreError::ProjectNotFound { .. }
    ));
    // The repo itself is untouched.
    assert!(repo.join("main.py").exists());
}

#[test]
fn update_project_bumps_ordering() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let engine = engine_in(dir.path());

    let mut ids = Vec::new();
    for name in ["one", "two"] {
        let repo = dir.path().join(name);
        std::fs::create_dir_all(&repo).expect("mkdir");
        std::fs::write(repo.join("x.py"), "x = 1\n").expect("write");
        let p = engine
            .add_project(&repo, Some(name), ProjectMode::Standalone, None)
            .expect("add");
        ids.push(p.id);
    }

    std::thread::sleep(Duration::from_millis(5));
    engine.update_project(&ids[0], Some("renamed"), None).expect("update");

    let listed = engine.list_projects().expect("list");
    assert_eq!(listed[0].name, "renamed");
    assert_eq!(listed.len(), 2);
}

#[test]
fn failed_build_is_published_via_status() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let repo = dir.path().join("empty-repo");
    std::fs::create_dir_all(&repo).expect("mkdir");
    let engine = engine_in(dir.path());

    let project = engine
        .add_project(&repo, None, ProjectMode::Standalone, None)
        .expect("add project");

    // An empty repo yields zero chunks: the worker records the failure
    // instead of tearing anything down.
    engine.start_build(&project.id, BuildOptions::default()).expect("start");
    engine.wait_for_build(&project.id).expect("wait");

    let status = engine.status(&project.id).expect("status");
    assert!(!status.building);
    assert!(status.last_build_error.is_some());
    assert!(!status.index.loaded);
}
