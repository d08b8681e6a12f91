//! Atomic build and recovery: a failed build never disturbs the live index,
//! interrupted swaps are repaired at startup, and corruption degrades to
//! "not loaded" until the next build.

use std::path::Path;
use std::sync::atomic::AtomicBool;

use codrag_core::atomic::StagedCommit;
use codrag_core::embedder::FakeEmbedder;
use codrag_core::index::{BuildOptions, CodeIndex};

fn build_repo(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let repo = dir.join("repo");
    std::fs::create_dir_all(&repo).expect("mkdir");
    std::fs::write(repo.join("main.py"), "def main():\n    return 1\n").expect("write");

    let index_dir = dir.join("index");
    let embedder = FakeEmbedder::default();
    let mut index = CodeIndex::open(&index_dir);
    index
        .build(&repo, &embedder, &BuildOptions::default(), &AtomicBool::new(false))
        .expect("build");
    (repo, index_dir)
}

fn snapshot(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut out: Vec<(String, Vec<u8>)> = std::fs::read_dir(dir)
        .expect("read dir")
        .flatten()
        .filter(|e| e.path().is_file())
        .map(|e| {
            (
                e.file_name().to_string_lossy().to_string(),
                std::fs::read(e.path()).expect("read file"),
            )
        })
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

#[test]
fn failure_after_staging_leaves_live_index_unchanged() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let (_repo, index_dir) = build_repo(dir.path());
    let before = snapshot(&index_dir);

    // Stage a would-be new index, then fail before the swap: the staged
    // commit is dropped uncommitted.
    {
        let staged = StagedCommit::begin(&index_dir).expect("begin");
        staged.write_file("documents.json", b"[{\"broken\": true}]").expect("write");
        staged.write_file("manifest.json", b"{}").expect("write");
    }

    // Live target is byte-identical to its pre-build state.
    assert_eq!(snapshot(&index_dir), before);

    // No staging directory remains.
    let leftovers: Vec<String> = std::fs::read_dir(dir.path())
        .expect("read dir")
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with(".index_build_") || n.starts_with(".index_backup_"))
        .collect();
    assert!(leftovers.is_empty(), "leftover artifacts: {leftovers:?}");
}

#[test]
fn failed_rebuild_preserves_previous_index_and_stats() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let (repo, index_dir) = build_repo(dir.path());

    let index = CodeIndex::open(&index_dir);
    let built_at_before = index.stats().built_at.expect("built_at");
    drop(index);

    // A build over an empty selection fails with "no documents indexed"
    // before anything is committed.
    let embedder = FakeEmbedder::default();
    let mut index = CodeIndex::open(&index_dir);
    let options = BuildOptions {
        include_globs: vec!["**/*.does_not_exist".into()],
        ..BuildOptions::default()
    };
    index
        .build(&repo, &embedder, &options, &AtomicBool::new(false))
        .expect_err("build over nothing must fail");

    // The previous committed index is still live and loadable.
    let index = CodeIndex::open(&index_dir);
    assert!(index.is_loaded());
    assert_eq!(index.stats().built_at.expect("built_at"), built_at_before);
}

#[test]
fn interrupted_swap_is_promoted_at_startup() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let (_repo, index_dir) = build_repo(dir.path());
    let before = snapshot(&index_dir);

    // Simulate a crash between backup and swap: the target was renamed to a
    // backup and the process died before staging moved into place.
    let backup = dir.path().join(".index_backup_crash");
    std::fs::rename(&index_dir, &backup).expect("rename to backup");
    assert!(!index_dir.exists());

    // Opening the index runs startup recovery and promotes the backup.
    let index = CodeIndex::open(&index_dir);
    assert!(index.is_loaded());
    assert_eq!(snapshot(&index_dir), before);
}

#[test]
fn corrupted_documents_report_not_loaded_until_rebuild() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let (repo, index_dir) = build_repo(dir.path());

    std::fs::write(index_dir.join("documents.json"), "not json at all").expect("corrupt");

    let index = CodeIndex::open(&index_dir);
    assert!(!index.is_loaded());
    assert!(!index.stats().loaded);

    let embedder = FakeEmbedder::default();
    let mut index = CodeIndex::open(&index_dir);
    index
        .build(&repo, &embedder, &BuildOptions::default(), &AtomicBool::new(false))
        .expect("rebuild");
    assert!(index.is_loaded());
    assert!(index.stats().loaded);
}

#[test]
fn count_mismatch_is_treated_as_corruption() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let (_repo, index_dir) = build_repo(dir.path());

    // Append a forged chunk record so documents and matrix disagree.
    let docs_path = index_dir.join("documents.json");
    let text = std::fs::read_to_string(&docs_path).expect("read");
    let mut docs: Vec<serde_json::Value> = serde_json::from_str(&text).expect("parse");
    let mut forged = docs[0].clone();
    forged["id"] = serde_json::json!("f".repeat(16));
    docs.push(forged);
    std::fs::write(&docs_path, serde_json::to_string(&docs).expect("serialize")).expect("write");

    let index = CodeIndex::open(&index_dir);
    assert!(!index.is_loaded());
}
