//! Trace index: loads the committed node/edge graph into memory and serves
//! name search, node lookup, and bounded neighbor traversal.
//!
//! The adjacency structure is a petgraph `DiGraph` whose node weights are
//! trace node ids and whose edge weights index into the edge list, so
//! traversal answers carry the full edge records in file order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::types::{TraceCounts, TraceEdge, TraceEdgeKind, TraceManifest, TraceNode, TraceNodeKind};

use super::{TRACE_EDGES_FILENAME, TRACE_MANIFEST_FILENAME, TRACE_NODES_FILENAME};

/// Hard ceiling on `search_nodes` results.
const SEARCH_LIMIT_CEILING: usize = 100;

/// Traversal direction for neighbor queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeighborDirection {
    /// Edges pointing at the node.
    In,
    /// Edges leaving the node.
    Out,
    /// Both directions.
    Both,
}

/// Result of a neighbor query: truncated edge lists per direction plus the
/// resolved node records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborSet {
    /// Incoming edges, capped at `max_nodes`.
    pub in_edges: Vec<TraceEdge>,
    /// Outgoing edges, capped at `max_nodes`.
    pub out_edges: Vec<TraceEdge>,
    /// Source nodes of the incoming edges.
    pub in_nodes: Vec<TraceNode>,
    /// Target nodes of the outgoing edges.
    pub out_nodes: Vec<TraceNode>,
}

/// Summary of the trace subsystem for one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStatus {
    /// Whether the committed trace files exist on disk.
    pub exists: bool,
    /// Node and edge counts from the manifest.
    pub counts: TraceCounts,
    /// Timestamp of the last committed build.
    pub last_build_at: Option<String>,
    /// Error from the last build, if it did not commit.
    pub last_error: Option<String>,
}

/// In-memory view of a committed trace index.
pub struct TraceIndex {
    index_dir: PathBuf,
    manifest: Option<TraceManifest>,
    nodes: HashMap<String, TraceNode>,
    edges: Vec<TraceEdge>,
    graph: DiGraph<String, usize>,
    node_indices: HashMap<String, NodeIndex>,
    loaded: bool,
}

impl TraceIndex {
    /// Create an unloaded view over an index directory.
    pub fn new(index_dir: &Path) -> Self {
        Self {
            index_dir: index_dir.to_path_buf(),
            manifest: None,
            nodes: HashMap::new(),
            edges: Vec::new(),
            graph: DiGraph::new(),
            node_indices: HashMap::new(),
            loaded: false,
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.index_dir.join(TRACE_MANIFEST_FILENAME)
    }

    fn nodes_path(&self) -> PathBuf {
        self.index_dir.join(TRACE_NODES_FILENAME)
    }

    fn edges_path(&self) -> PathBuf {
        self.index_dir.join(TRACE_EDGES_FILENAME)
    }

    /// Whether all three committed trace files exist.
    pub fn exists(&self) -> bool {
        self.manifest_path().exists() && self.nodes_path().exists() && self.edges_path().exists()
    }

    /// Whether a graph is loaded in memory.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Load the committed graph. Returns false when files are missing or
    /// unparseable; the previous in-memory state is cleared either way.
    pub fn load(&mut self) -> bool {
        self.manifest = None;
        self.nodes.clear();
        self.edges.clear();
        self.graph = DiGraph::new();
        self.node_indices.clear();
        self.loaded = false;

        if !self.exists() {
            return false;
        }

        let manifest: TraceManifest = match std::fs::read_to_string(self.manifest_path())
            .map_err(|e| e.to_string())
            .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
        {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(error = %e, "failed to load trace manifest");
                return false;
            }
        };

        let nodes = match read_jsonl::<TraceNode>(&self.nodes_path()) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "failed to load trace nodes");
                return false;
            }
        };
        let edges = match read_jsonl::<TraceEdge>(&self.edges_path()) {
            Ok(e) => e,
            Err(e) => {
                tracing::error!(error = %e, "failed to load trace edges");
                return false;
            }
        };

        for node in nodes {
            let idx = self.graph.add_node(node.id.clone());
            self.node_indices.insert(node.id.clone(), idx);
            self.nodes.insert(node.id.clone(), node);
        }

        for (i, edge) in edges.iter().enumerate() {
            let (Some(&src), Some(&tgt)) = (
                self.node_indices.get(&edge.source),
                self.node_indices.get(&edge.target),
            ) else {
                tracing::warn!(edge = %edge.id, "edge references unknown node, skipping");
                continue;
            };
            self.graph.add_edge(src, tgt, i);
        }

        self.edges = edges;
        self.manifest = Some(manifest);
        self.loaded = true;
        true
    }

    /// Status summary without loading the graph: existence check plus
    /// manifest fields.
    pub fn peek_status(index_dir: &Path) -> TraceStatus {
        let manifest_path = index_dir.join(TRACE_MANIFEST_FILENAME);
        let exists = manifest_path.exists()
            && index_dir.join(TRACE_NODES_FILENAME).exists()
            && index_dir.join(TRACE_EDGES_FILENAME).exists();
        if !exists {
            return TraceStatus {
                exists: false,
                counts: TraceCounts::default(),
                last_build_at: None,
                last_error: None,
            };
        }

        let manifest: Option<TraceManifest> = std::fs::read_to_string(&manifest_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok());
        TraceStatus {
            exists: true,
            counts: manifest.as_ref().map(|m| m.counts.clone()).unwrap_or_default(),
            last_build_at: manifest.as_ref().map(|m| m.built_at.clone()),
            last_error: manifest.and_then(|m| m.last_error),
        }
    }

    /// Status summary for engine aggregation.
    pub fn status(&mut self) -> TraceStatus {
        if !self.exists() {
            return TraceStatus {
                exists: false,
                counts: TraceCounts::default(),
                last_build_at: None,
                last_error: None,
            };
        }

        if !self.loaded {
            self.load();
        }

        let manifest = self.manifest.as_ref();
        TraceStatus {
            exists: true,
            counts: manifest.map(|m| m.counts.clone()).unwrap_or_default(),
            last_build_at: manifest.map(|m| m.built_at.clone()),
            last_error: manifest.and_then(|m| m.last_error.clone()),
        }
    }

    /// Map lookup of a node by id.
    pub fn get_node(&self, node_id: &str) -> Option<&TraceNode> {
        self.nodes.get(node_id)
    }

    /// Rank nodes by name match quality.
    ///
    /// Exact name = 1.0, prefix = 0.8, contains = 0.6, qualname contains =
    /// 0.4; ties broken by (file_path, name); capped at `limit` with a hard
    /// ceiling of 100.
    pub fn search_nodes(
        &self,
        query: &str,
        kind: Option<TraceNodeKind>,
        limit: usize,
    ) -> Vec<&TraceNode> {
        let query_lower = query.to_lowercase();
        let mut results: Vec<(f64, &TraceNode)> = Vec::new();

        for node in self.nodes.values() {
            if let Some(want) = kind {
                if node.kind != want {
                    continue;
                }
            }

            let name = node.name.to_lowercase();
            let qualname = node
                .metadata
                .get("qualname")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_lowercase();

            let score = if name == query_lower {
                1.0
            } else if name.starts_with(&query_lower) {
                0.8
            } else if name.contains(&query_lower) {
                0.6
            } else if !qualname.is_empty() && qualname.contains(&query_lower) {
                0.4
            } else {
                0.0
            };

            if score > 0.0 {
                results.push((score, node));
            }
        }

        results.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.file_path.cmp(&b.1.file_path))
                .then_with(|| a.1.name.cmp(&b.1.name))
        });

        results
            .into_iter()
            .take(limit.min(SEARCH_LIMIT_CEILING))
            .map(|(_, n)| n)
            .collect()
    }

    /// Bounded neighbor traversal around a node.
    ///
    /// Edge lists per direction follow committed file order, are filtered by
    /// `edge_kinds` when given, and truncated to `max_nodes`.
    pub fn get_neighbors(
        &self,
        node_id: &str,
        direction: NeighborDirection,
        edge_kinds: Option<&[TraceEdgeKind]>,
        max_nodes: usize,
    ) -> NeighborSet {
        let mut result = NeighborSet {
            in_edges: Vec::new(),
            out_edges: Vec::new(),
            in_nodes: Vec::new(),
            out_nodes: Vec::new(),
        };

        let Some(&idx) = self.node_indices.get(node_id) else {
            return result;
        };

        let keep = |edge: &TraceEdge| match edge_kinds {
            Some(kinds) => kinds.contains(&edge.kind),
            None => true,
        };

        if matches!(direction, NeighborDirection::In | NeighborDirection::Both) {
            let mut edge_positions: Vec<usize> = self
                .graph
                .edges_directed(idx, Direction::Incoming)
                .map(|e| *e.weight())
                .collect();
            edge_positions.sort_unstable();

            for pos in edge_positions {
                let edge = &self.edges[pos];
                if !keep(edge) {
                    continue;
                }
                if result.in_edges.len() >= max_nodes {
                    break;
                }
                result.in_edges.push(edge.clone());
                if let Some(node) = self.nodes.get(&edge.source) {
                    result.in_nodes.push(node.clone());
                }
            }
        }

        if matches!(direction, NeighborDirection::Out | NeighborDirection::Both) {
            let mut edge_positions: Vec<usize> = self
                .graph
                .edges_directed(idx, Direction::Outgoing)
                .map(|e| *e.weight())
                .collect();
            edge_positions.sort_unstable();

            for pos in edge_positions {
                let edge = &self.edges[pos];
                if !keep(edge) {
                    continue;
                }
                if result.out_edges.len() >= max_nodes {
                    break;
                }
                result.out_edges.push(edge.clone());
                if let Some(node) = self.nodes.get(&edge.target) {
                    result.out_nodes.push(node.clone());
                }
            }
        }

        result
    }
}

fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        out.push(serde_json::from_str(line).map_err(|e| e.to_string())?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{TraceBuildOptions, TraceBuilder};
    use std::sync::atomic::AtomicBool;

    fn built_index() -> (tempfile::TempDir, TraceIndex) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).expect("mkdir");
        std::fs::write(repo.join("a.py"), "import b\nimport os\n\ndef alpha():\n    return 1\n")
            .expect("write");
        std::fs::write(repo.join("b.py"), "class Builder:\n    def run(self):\n        pass\n")
            .expect("write");

        let index_dir = dir.path().join("index");
        TraceBuilder::new(&repo, &index_dir, TraceBuildOptions::default())
            .build(&AtomicBool::new(false))
            .expect("build");

        let mut index = TraceIndex::new(&index_dir);
        assert!(index.load());
        (dir, index)
    }

    #[test]
    fn test_load_and_lookup() {
        let (_dir, index) = built_index();
        assert!(index.is_loaded());

        let node = index.get_node("file:a.py").expect("file node");
        assert_eq!(node.kind, TraceNodeKind::File);
        assert_eq!(node.language.as_deref(), Some("python"));

        assert!(index.get_node("file:missing.py").is_none());
    }

    #[test]
    fn test_search_nodes_ranking() {
        let (_dir, index) = built_index();

        let hits = index.search_nodes("alpha", None, 10);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].name, "alpha");

        // Prefix match ranks above contains.
        let hits = index.search_nodes("Build", Some(TraceNodeKind::Symbol), 10);
        assert_eq!(hits[0].name, "Builder");

        // Qualname contains.
        let hits = index.search_nodes("builder.run", Some(TraceNodeKind::Symbol), 10);
        assert!(hits.iter().any(|n| n.name == "run"));
    }

    #[test]
    fn test_search_nodes_kind_filter_and_limit() {
        let (_dir, index) = built_index();

        let files = index.search_nodes("py", Some(TraceNodeKind::File), 1);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].kind, TraceNodeKind::File);

        let capped = index.search_nodes("py", None, 10_000);
        assert!(capped.len() <= SEARCH_LIMIT_CEILING);
    }

    #[test]
    fn test_neighbors_out_from_file() {
        let (_dir, index) = built_index();

        let neighbors = index.get_neighbors("file:a.py", NeighborDirection::Out, None, 50);
        assert!(neighbors.in_edges.is_empty());
        assert!(neighbors.out_edges.len() >= 3); // contains alpha, imports b, imports ext:os
        assert!(neighbors.out_nodes.iter().any(|n| n.id == "file:b.py"));
        assert!(neighbors.out_nodes.iter().any(|n| n.id == "ext:os"));
    }

    #[test]
    fn test_neighbors_kind_filter() {
        let (_dir, index) = built_index();

        let imports = index.get_neighbors(
            "file:a.py",
            NeighborDirection::Out,
            Some(&[TraceEdgeKind::Imports]),
            50,
        );
        assert!(imports.out_edges.iter().all(|e| e.kind == TraceEdgeKind::Imports));
        assert!(!imports.out_edges.is_empty());
    }

    #[test]
    fn test_neighbors_in_direction_and_cap() {
        let (_dir, index) = built_index();

        let inbound = index.get_neighbors("file:b.py", NeighborDirection::In, None, 50);
        assert!(inbound.in_nodes.iter().any(|n| n.id == "file:a.py"));

        let capped = index.get_neighbors("file:a.py", NeighborDirection::Both, None, 1);
        assert!(capped.out_edges.len() <= 1);
        assert!(capped.in_edges.len() <= 1);
    }

    #[test]
    fn test_unknown_node_yields_empty() {
        let (_dir, index) = built_index();
        let neighbors = index.get_neighbors("file:nope.py", NeighborDirection::Both, None, 10);
        assert!(neighbors.in_edges.is_empty() && neighbors.out_edges.is_empty());
    }

    #[test]
    fn test_status_reports_counts() {
        let (_dir, mut index) = built_index();
        let status = index.status();
        assert!(status.exists);
        assert!(status.counts.nodes >= 4);
        assert!(status.last_build_at.is_some());
        assert!(status.last_error.is_none());
    }

    #[test]
    fn test_missing_index_does_not_load() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut index = TraceIndex::new(&dir.path().join("absent"));
        assert!(!index.exists());
        assert!(!index.load());
        assert!(!index.status().exists);
    }
}
