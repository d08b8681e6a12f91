//! End-to-end trust loop: register a project, build, search, assemble
//! context, then rebuild incrementally after a single-file change.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use codrag_core::config::EngineConfig;
use codrag_core::embedder::FakeEmbedder;
use codrag_core::index::BuildOptions;
use codrag_core::registry::ProjectMode;
use codrag_core::search::context::ContextOptions;
use codrag_core::types::BuildMode;
use codrag_core::Engine;

fn engine_in(dir: &Path) -> Engine {
    let config = EngineConfig { data_dir: dir.join("data"), ..EngineConfig::default() };
    Engine::new(config, Arc::new(FakeEmbedder::default())).expect("create engine")
}

fn demo_repo(dir: &Path) -> PathBuf {
    let repo = dir.join("repo");
    std::fs::create_dir_all(&repo).expect("mkdir");
    std::fs::write(repo.join("main.py"), "def main():\n    return \"hello world\"\n")
        .expect("write main.py");
    std::fs::write(repo.join("utils.py"), "def add(a, b):\n    return a + b\n")
        .expect("write utils.py");
    std::fs::write(repo.join("README.md"), "# Demo\n\nA small demo repository.\n")
        .expect("write README.md");
    repo
}

fn build_and_wait(engine: &Engine, project_id: &str) {
    engine.start_build(project_id, BuildOptions::default()).expect("start build");
    engine.wait_for_build(project_id).expect("wait for build");
    let status = engine.status(project_id).expect("status");
    assert_eq!(status.last_build_error, None, "build failed: {:?}", status.last_build_error);
}

#[test]
fn trust_loop_build_search_context() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let repo = demo_repo(dir.path());
    let engine = engine_in(dir.path());

    let project = engine
        .add_project(&repo, None, ProjectMode::Embedded, None)
        .expect("add project");

    build_and_wait(&engine, &project.id);

    let status = engine.status(&project.id).expect("status");
    assert!(status.index_exists);
    assert!(status.index.loaded);
    assert!(status.index.total_documents >= 3);
    assert!(!status.building);

    // Embedded mode: the index lives inside the repo.
    assert!(repo.join(".codrag").join("documents.json").exists());

    let hits = engine.search(&project.id, "add two numbers", 5, 0.0).expect("search");
    assert!(!hits.is_empty());
    assert_eq!(hits[0].chunk.source_path, "utils.py");

    let options = ContextOptions { k: 3, min_score: 0.0, ..ContextOptions::default() };
    let context = engine.context(&project.id, "multiply numbers", &options).expect("context");
    assert!(!context.is_empty());
}

#[test]
fn incremental_rebuild_reuses_unchanged_files() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let repo = demo_repo(dir.path());
    let engine = engine_in(dir.path());

    let project = engine
        .add_project(&repo, None, ProjectMode::Embedded, None)
        .expect("add project");
    build_and_wait(&engine, &project.id);

    // Modify utils.py only.
    std::fs::write(
        repo.join("utils.py"),
        "def add(a, b):\n    return a + b\n\ndef multiply(a, b):\n    return a * b\n",
    )
    .expect("rewrite utils.py");

    build_and_wait(&engine, &project.id);

    let manifest_text =
        std::fs::read_to_string(repo.join(".codrag").join("manifest.json")).expect("read manifest");
    let manifest: codrag_core::types::EmbeddingManifest =
        serde_json::from_str(&manifest_text).expect("parse manifest");

    assert_eq!(manifest.build.mode, BuildMode::Incremental);
    assert_eq!(manifest.build.files_total, 3);
    assert_eq!(manifest.build.files_reused, 2);
    assert_eq!(manifest.build.files_embedded, 1);

    // The new function is now searchable.
    let hits = engine.search(&project.id, "multiply", 5, 0.0).expect("search");
    assert!(hits.iter().any(|h| h.chunk.source_path == "utils.py"));
}

#[test]
fn structured_context_reports_budget() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let repo = demo_repo(dir.path());
    let engine = engine_in(dir.path());

    let project = engine
        .add_project(&repo, None, ProjectMode::Embedded, None)
        .expect("add project");
    build_and_wait(&engine, &project.id);

    let options = ContextOptions { k: 3, min_score: 0.0, ..ContextOptions::default() };
    let ctx = engine
        .context_structured(&project.id, "hello world", &options, None)
        .expect("structured context");

    assert!(!ctx.context.is_empty());
    assert!(!ctx.chunks.is_empty());
    assert_eq!(ctx.estimated_tokens, ctx.total_chars / 4);
    for chunk in &ctx.chunks {
        assert!(!chunk.chunk_id.is_empty());
        assert!(!chunk.source_path.is_empty());
        assert!(!chunk.trace_expanded);
    }
}
