//! Trace builder: scans source files, extracts symbols and imports, and
//! emits a deterministic node/edge graph with a manifest.
//!
//! Output inside the index directory:
//!
//! - `trace_nodes.jsonl` -- one node per line, sorted by
//!   (kind, file_path, start_line, name), keys in sorted order
//! - `trace_edges.jsonl` -- one edge per line, sorted by
//!   (kind, source, target, id), keys in sorted order
//! - `trace_manifest.json` -- counts, config snapshot, capped error list
//!
//! Python files get full symbol and import extraction; other supported
//! extensions (ts/tsx, js/jsx, go, rs) get file nodes only. Validation
//! failures write a zero-count manifest and leave any previously committed
//! nodes/edges untouched.

pub mod index;
pub mod python;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::atomic::StagedCommit;
use crate::error::{CoreError, CoreResult};
use crate::globs::PathMatcher;
use crate::ids::{stable_external_module_id, stable_file_node_id};
use crate::types::{
    TraceCounts, TraceEdge, TraceFileError, TraceManifest, TraceManifestConfig, TraceNode,
    TraceNodeKind, TRACE_MANIFEST_VERSION,
};

pub use index::{NeighborDirection, NeighborSet, TraceIndex, TraceStatus};

/// Filename of the trace manifest.
pub const TRACE_MANIFEST_FILENAME: &str = "trace_manifest.json";
/// Filename of the node JSONL.
pub const TRACE_NODES_FILENAME: &str = "trace_nodes.jsonl";
/// Filename of the edge JSONL.
pub const TRACE_EDGES_FILENAME: &str = "trace_edges.jsonl";

/// Options controlling one trace build.
#[derive(Debug, Clone)]
pub struct TraceBuildOptions {
    /// Include globs; defaults cover the supported languages.
    pub include_globs: Vec<String>,
    /// Exclude globs; defaults are the fixed safety set.
    pub exclude_globs: Vec<String>,
    /// Skip files larger than this many bytes.
    pub max_file_bytes: u64,
    /// Stop scanning after this many files.
    pub max_files: usize,
    /// Abort scanning when the node count exceeds this.
    pub max_nodes: usize,
    /// Abort scanning when the edge count exceeds this.
    pub max_edges: usize,
    /// Cap on recorded per-file parse errors.
    pub max_failures: usize,
}

impl Default for TraceBuildOptions {
    fn default() -> Self {
        Self {
            include_globs: vec![
                "**/*.py".into(),
                "**/*.ts".into(),
                "**/*.tsx".into(),
                "**/*.js".into(),
                "**/*.jsx".into(),
                "**/*.go".into(),
                "**/*.rs".into(),
            ],
            exclude_globs: vec![
                "**/node_modules/**".into(),
                "**/.git/**".into(),
                "**/venv/**".into(),
                "**/__pycache__/**".into(),
                "**/dist/**".into(),
                "**/build/**".into(),
                "**/.codrag/**".into(),
                "**/.index_build_*/**".into(),
                "**/.index_backup_*/**".into(),
            ],
            max_file_bytes: 500_000,
            max_files: 10_000,
            max_nodes: 100_000,
            max_edges: 500_000,
            max_failures: 50,
        }
    }
}

/// Infer the trace language from a file extension.
fn detect_language(rel_path: &str) -> Option<&'static str> {
    let ext = rel_path.rsplit('.').next().unwrap_or("");
    match ext {
        "py" => Some("python"),
        "ts" | "tsx" => Some("typescript"),
        "js" | "jsx" => Some("javascript"),
        "go" => Some("go"),
        "rs" => Some("rust"),
        _ => None,
    }
}

/// Builds the trace index files for one repository.
pub struct TraceBuilder {
    repo_root: PathBuf,
    index_dir: PathBuf,
    options: TraceBuildOptions,
}

impl TraceBuilder {
    /// Create a builder for the given repo root and index directory.
    pub fn new(repo_root: &Path, index_dir: &Path, options: TraceBuildOptions) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            index_dir: index_dir.to_path_buf(),
            options,
        }
    }

    /// Run the build. The cancel flag is checked between files.
    ///
    /// Returns the manifest that was written; a validation failure is
    /// reported through `last_error` with zero counts rather than as an Err.
    pub fn build(&self, cancel: &AtomicBool) -> CoreResult<TraceManifest> {
        let repo_root = self
            .repo_root
            .canonicalize()
            .map_err(|e| CoreError::validation(format!("repo root {}: {e}", self.repo_root.display())))?;

        let matcher = PathMatcher::new(&self.options.include_globs, &self.options.exclude_globs);
        let mut files = crate::index::enumerate_files(&repo_root, &[], &matcher, self.options.max_file_bytes)?;
        if files.len() > self.options.max_files {
            tracing::warn!(
                found = files.len(),
                max_files = self.options.max_files,
                "file count exceeds cap, truncating scan"
            );
            files.truncate(self.options.max_files);
        }

        let mut nodes: Vec<TraceNode> = Vec::new();
        let mut edges: Vec<TraceEdge> = Vec::new();
        let mut external_modules: BTreeMap<String, TraceNode> = BTreeMap::new();
        let mut file_errors: Vec<TraceFileError> = Vec::new();
        let mut files_parsed = 0usize;
        let mut files_failed = 0usize;

        for (abs_path, rel_path) in &files {
            if cancel.load(Ordering::Relaxed) {
                return Err(CoreError::Build { message: "trace build cancelled".into() });
            }

            let language = detect_language(rel_path);
            let file_name = rel_path.rsplit('/').next().unwrap_or(rel_path).to_string();
            nodes.push(TraceNode {
                id: stable_file_node_id(rel_path),
                kind: TraceNodeKind::File,
                name: file_name,
                file_path: rel_path.clone(),
                span: None,
                language: language.map(str::to_string),
                metadata: BTreeMap::new(),
            });

            if language == Some("python") {
                let source = match std::fs::read(abs_path) {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(e) => {
                        files_failed += 1;
                        if file_errors.len() < self.options.max_failures {
                            file_errors.push(TraceFileError {
                                file_path: rel_path.clone(),
                                error_type: "IoError".into(),
                                message: e.to_string(),
                            });
                        }
                        continue;
                    }
                };

                match python::analyze(rel_path, &source, &repo_root) {
                    Ok(analysis) => {
                        nodes.extend(analysis.nodes);

                        for edge in &analysis.edges {
                            if edge.metadata.get("external") == Some(&serde_json::json!(true)) {
                                if let Some(module) = edge
                                    .metadata
                                    .get("import")
                                    .and_then(|v| v.as_str())
                                    .filter(|m| !m.is_empty())
                                {
                                    external_modules.entry(module.to_string()).or_insert_with(|| {
                                        TraceNode {
                                            id: stable_external_module_id(module),
                                            kind: TraceNodeKind::ExternalModule,
                                            name: module.to_string(),
                                            file_path: String::new(),
                                            span: None,
                                            language: None,
                                            metadata: BTreeMap::from([(
                                                "external".to_string(),
                                                serde_json::json!(true),
                                            )]),
                                        }
                                    });
                                }
                            }
                        }

                        edges.extend(analysis.edges);
                        files_parsed += 1;
                    }
                    Err(message) => {
                        files_failed += 1;
                        if file_errors.len() < self.options.max_failures {
                            file_errors.push(TraceFileError {
                                file_path: rel_path.clone(),
                                error_type: "ParseError".into(),
                                message,
                            });
                        }
                    }
                }
            } else {
                files_parsed += 1;
            }

            if nodes.len() > self.options.max_nodes {
                tracing::warn!(max_nodes = self.options.max_nodes, "node count exceeds cap, stopping scan");
                break;
            }
            if edges.len() > self.options.max_edges {
                tracing::warn!(max_edges = self.options.max_edges, "edge count exceeds cap, stopping scan");
                break;
            }
        }

        nodes.extend(external_modules.into_values());

        if let Err(validation_error) = validate(&nodes, &edges) {
            tracing::error!(error = %validation_error, "trace validation failed");
            let manifest = self.manifest(
                TraceCounts { nodes: 0, edges: 0, files_parsed, files_failed },
                file_errors,
                Some(validation_error),
            );
            self.write_manifest_only(&manifest)?;
            return Ok(manifest);
        }

        sort_nodes(&mut nodes);
        sort_edges(&mut edges);

        let manifest = self.manifest(
            TraceCounts { nodes: nodes.len(), edges: edges.len(), files_parsed, files_failed },
            file_errors,
            None,
        );

        let staged = StagedCommit::begin(&self.index_dir)?;
        staged.write_file(TRACE_NODES_FILENAME, jsonl(&nodes)?.as_bytes())?;
        staged.write_file(TRACE_EDGES_FILENAME, jsonl(&edges)?.as_bytes())?;
        staged.write_file(
            TRACE_MANIFEST_FILENAME,
            serde_json::to_string_pretty(&serde_json::to_value(&manifest)?)?.as_bytes(),
        )?;
        staged.commit()?;

        tracing::info!(
            index_dir = %self.index_dir.display(),
            nodes = manifest.counts.nodes,
            edges = manifest.counts.edges,
            files_failed = manifest.counts.files_failed,
            "trace index committed"
        );
        Ok(manifest)
    }

    fn manifest(
        &self,
        counts: TraceCounts,
        file_errors: Vec<TraceFileError>,
        last_error: Option<String>,
    ) -> TraceManifest {
        TraceManifest {
            version: TRACE_MANIFEST_VERSION.to_string(),
            built_at: chrono::Utc::now().to_rfc3339(),
            repo_root: self.repo_root.to_string_lossy().to_string(),
            config: TraceManifestConfig {
                include_globs: self.options.include_globs.clone(),
                exclude_globs: self.options.exclude_globs.clone(),
                max_file_bytes: self.options.max_file_bytes,
            },
            counts,
            file_errors,
            last_error,
        }
    }

    /// Commit just the manifest, leaving any existing nodes/edges files as
    /// they are (used on validation failure).
    fn write_manifest_only(&self, manifest: &TraceManifest) -> CoreResult<()> {
        let staged = StagedCommit::begin(&self.index_dir)?;
        staged.write_file(
            TRACE_MANIFEST_FILENAME,
            serde_json::to_string_pretty(&serde_json::to_value(manifest)?)?.as_bytes(),
        )?;
        staged.commit()
    }
}

/// Serialize records as JSONL with keys in sorted order.
fn jsonl<T: serde::Serialize>(items: &[T]) -> CoreResult<String> {
    let mut out = String::new();
    for item in items {
        // Through Value so object keys serialize sorted.
        let value = serde_json::to_value(item)?;
        out.push_str(&serde_json::to_string(&value)?);
        out.push('\n');
    }
    Ok(out)
}

fn validate(nodes: &[TraceNode], edges: &[TraceEdge]) -> Result<(), String> {
    let mut node_ids: HashSet<&str> = HashSet::with_capacity(nodes.len());
    for node in nodes {
        if !node_ids.insert(&node.id) {
            return Err(format!("duplicate node id: {}", node.id));
        }
        if !node.file_path.is_empty()
            && (node.file_path.starts_with('/') || node.file_path.contains('\\'))
        {
            return Err(format!("non-portable file_path in node {}: {}", node.id, node.file_path));
        }
    }

    let mut edge_ids: HashSet<&str> = HashSet::with_capacity(edges.len());
    for edge in edges {
        if !edge_ids.insert(&edge.id) {
            return Err(format!("duplicate edge id: {}", edge.id));
        }
        if !node_ids.contains(edge.source.as_str()) {
            return Err(format!("edge {} references unknown source: {}", edge.id, edge.source));
        }
        if !node_ids.contains(edge.target.as_str()) {
            return Err(format!("edge {} references unknown target: {}", edge.id, edge.target));
        }
    }

    Ok(())
}

fn sort_nodes(nodes: &mut [TraceNode]) {
    nodes.sort_by(|a, b| {
        let a_line = a.span.map(|s| s.start_line).unwrap_or(0);
        let b_line = b.span.map(|s| s.start_line).unwrap_or(0);
        a.kind
            .sort_rank()
            .cmp(&b.kind.sort_rank())
            .then_with(|| a.file_path.cmp(&b.file_path))
            .then_with(|| a_line.cmp(&b_line))
            .then_with(|| a.name.cmp(&b.name))
    });
}

fn sort_edges(edges: &mut [TraceEdge]) {
    edges.sort_by(|a, b| {
        a.kind
            .as_str()
            .cmp(b.kind.as_str())
            .then_with(|| a.source.cmp(&b.source))
            .then_with(|| a.target.cmp(&b.target))
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Span;

    fn file_node(path: &str) -> TraceNode {
        TraceNode {
            id: stable_file_node_id(path),
            kind: TraceNodeKind::File,
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            file_path: path.to_string(),
            span: None,
            language: detect_language(path).map(str::to_string),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_detect_language() {
        assert_eq!(detect_language("a.py"), Some("python"));
        assert_eq!(detect_language("a.tsx"), Some("typescript"));
        assert_eq!(detect_language("a.jsx"), Some("javascript"));
        assert_eq!(detect_language("a.go"), Some("go"));
        assert_eq!(detect_language("a.rs"), Some("rust"));
        assert_eq!(detect_language("a.txt"), None);
    }

    #[test]
    fn test_validate_rejects_duplicates_and_dangling() {
        let a = file_node("a.py");
        let dup = file_node("a.py");
        assert!(validate(&[a.clone(), dup], &[]).is_err());

        let edge = TraceEdge {
            id: "edge:imports:file:a.py:file:missing.py".into(),
            kind: crate::types::TraceEdgeKind::Imports,
            source: "file:a.py".into(),
            target: "file:missing.py".into(),
            metadata: BTreeMap::new(),
        };
        assert!(validate(&[a], &[edge]).is_err());
    }

    #[test]
    fn test_validate_rejects_non_portable_paths() {
        let mut bad = file_node("a.py");
        bad.file_path = "/abs/a.py".into();
        assert!(validate(&[bad], &[]).is_err());

        let mut backslash = file_node("b.py");
        backslash.file_path = "dir\\b.py".into();
        assert!(validate(&[backslash], &[]).is_err());
    }

    #[test]
    fn test_sort_nodes_order() {
        let mut sym = file_node("a.py");
        sym.kind = TraceNodeKind::Symbol;
        sym.id = "sym:alpha@a.py:2".into();
        sym.name = "alpha".into();
        sym.span = Some(Span { start_line: 2, end_line: 2 });

        let mut nodes = vec![sym, file_node("b.py"), file_node("a.py")];
        sort_nodes(&mut nodes);
        assert_eq!(nodes[0].id, "file:a.py");
        assert_eq!(nodes[1].id, "file:b.py");
        assert_eq!(nodes[2].id, "sym:alpha@a.py:2");
    }

    #[test]
    fn test_build_s3_shape() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).expect("mkdir");
        std::fs::write(repo.join("a.py"), "import b\ndef alpha(): return 1\n").expect("write");
        std::fs::write(repo.join("b.py"), "class B: pass\n").expect("write");

        let index_dir = dir.path().join("index");
        let builder = TraceBuilder::new(&repo, &index_dir, TraceBuildOptions::default());
        let manifest = builder.build(&AtomicBool::new(false)).expect("build");

        assert!(manifest.last_error.is_none());
        assert_eq!(manifest.counts.files_failed, 0);

        let nodes_text =
            std::fs::read_to_string(index_dir.join(TRACE_NODES_FILENAME)).expect("read nodes");
        for id in ["file:a.py", "file:b.py", "sym:alpha@a.py:2", "sym:B@b.py:1"] {
            assert!(nodes_text.contains(&format!("\"id\":\"{id}\"")), "missing node {id}");
        }

        let edges_text =
            std::fs::read_to_string(index_dir.join(TRACE_EDGES_FILENAME)).expect("read edges");
        for id in [
            "edge:contains:file:a.py:sym:alpha@a.py:2",
            "edge:imports:file:a.py:file:b.py:b:1",
            "edge:contains:file:b.py:sym:B@b.py:1",
        ] {
            assert!(edges_text.contains(&format!("\"id\":\"{id}\"")), "missing edge {id}");
        }
    }

    #[test]
    fn test_rebuild_is_byte_identical() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).expect("mkdir");
        std::fs::write(repo.join("a.py"), "import b\ndef alpha(): return 1\n").expect("write");
        std::fs::write(repo.join("b.py"), "class B: pass\n").expect("write");

        let index_dir = dir.path().join("index");
        let builder = TraceBuilder::new(&repo, &index_dir, TraceBuildOptions::default());

        builder.build(&AtomicBool::new(false)).expect("build");
        let nodes1 = std::fs::read(index_dir.join(TRACE_NODES_FILENAME)).expect("read");
        let edges1 = std::fs::read(index_dir.join(TRACE_EDGES_FILENAME)).expect("read");

        builder.build(&AtomicBool::new(false)).expect("rebuild");
        let nodes2 = std::fs::read(index_dir.join(TRACE_NODES_FILENAME)).expect("read");
        let edges2 = std::fs::read(index_dir.join(TRACE_EDGES_FILENAME)).expect("read");

        assert_eq!(nodes1, nodes2);
        assert_eq!(edges1, edges2);
    }

    #[test]
    fn test_parse_errors_are_counted() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).expect("mkdir");
        std::fs::write(repo.join("good.py"), "def ok(): pass\n").expect("write");
        std::fs::write(repo.join("bad.py"), "def broken(:\n").expect("write");

        let index_dir = dir.path().join("index");
        let builder = TraceBuilder::new(&repo, &index_dir, TraceBuildOptions::default());
        let manifest = builder.build(&AtomicBool::new(false)).expect("build");

        assert_eq!(manifest.counts.files_parsed, 1);
        assert_eq!(manifest.counts.files_failed, 1);
        assert_eq!(manifest.file_errors.len(), 1);
        assert_eq!(manifest.file_errors[0].file_path, "bad.py");
        assert!(manifest.last_error.is_none());

        // The failing file still has a file node.
        let nodes_text =
            std::fs::read_to_string(index_dir.join(TRACE_NODES_FILENAME)).expect("read");
        assert!(nodes_text.contains("\"id\":\"file:bad.py\""));
    }

    #[test]
    fn test_non_python_files_get_file_nodes_only() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).expect("mkdir");
        std::fs::write(repo.join("lib.rs"), "pub fn x() {}\n").expect("write");

        let index_dir = dir.path().join("index");
        let builder = TraceBuilder::new(&repo, &index_dir, TraceBuildOptions::default());
        let manifest = builder.build(&AtomicBool::new(false)).expect("build");

        assert_eq!(manifest.counts.nodes, 1);
        assert_eq!(manifest.counts.edges, 0);

        let nodes_text =
            std::fs::read_to_string(index_dir.join(TRACE_NODES_FILENAME)).expect("read");
        assert!(nodes_text.contains("\"id\":\"file:lib.rs\""));
        assert!(nodes_text.contains("\"language\":\"rust\""));
    }
}
