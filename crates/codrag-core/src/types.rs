//! Core domain types shared across all codrag-core subsystems.
//!
//! These types form the API contract between modules and the on-disk JSON
//! schema of the index artifacts. Changing them requires a manifest version
//! bump, so they should be stable and minimal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Coarse classification of a file's place in the repository.
///
/// Assigned per file by path heuristics at build time and used by the
/// search reweighting stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Source code.
    Code,
    /// Documentation (markdown, rst, docs directories).
    Docs,
    /// Test code or test fixtures.
    Tests,
    /// Anything else (configs, data, assets).
    Other,
}

impl Role {
    /// Stable string form used in manifests and role-weight maps.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Docs => "docs",
            Self::Tests => "tests",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

/// A 1-based inclusive line range within a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// First line of the range (1-based).
    pub start_line: u32,
    /// Last line of the range (inclusive, `>= start_line`).
    pub end_line: u32,
}

/// A document chunk as persisted in `documents.json`.
///
/// The i-th record's embedding vector lives in row i of the matrix in
/// `embeddings.npy`; the two files are parallel arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Deterministic chunk id (SHA-256 prefix, see `ids`).
    pub id: String,
    /// Repo-relative source path with POSIX separators.
    pub source_path: String,
    /// First 16 hex of SHA-256 of the source file bytes at build time.
    pub file_hash: String,
    /// Role of the source file.
    pub role: Role,
    /// Heading chain for markdown chunks (joined by " > "), empty for code.
    pub section: String,
    /// Line range the chunk covers.
    pub span: Span,
    /// The chunk text, trimmed of leading/trailing whitespace.
    pub content: String,
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// A search result: chunk metadata plus the final hybrid score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// The matched chunk.
    pub chunk: ChunkRecord,
    /// Final score after all boosts and reweighting (higher is better).
    pub score: f32,
}

// ---------------------------------------------------------------------------
// Embedding manifest
// ---------------------------------------------------------------------------

/// Current on-disk manifest schema version.
pub const MANIFEST_VERSION: &str = "1.0";

/// Whether a build reused any prior per-file work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Every file was re-chunked and re-embedded.
    Full,
    /// At least one file's chunks and vectors were carried over unchanged.
    Incremental,
}

/// Per-build counters recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStats {
    /// Full or incremental.
    pub mode: BuildMode,
    /// Files considered by the build.
    pub files_total: usize,
    /// Files whose chunks were reused from the previous index.
    pub files_reused: usize,
    /// Files that were re-chunked and re-embedded.
    pub files_embedded: usize,
    /// Chunks in the committed index.
    pub chunks_total: usize,
    /// Chunks carried over from the previous index.
    pub chunks_reused: usize,
    /// Chunks embedded during this build.
    pub chunks_embedded: usize,
}

/// Snapshot of the build configuration recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Include globs used to enumerate candidate files.
    pub include_globs: Vec<String>,
    /// Exclude globs applied after inclusion.
    pub exclude_globs: Vec<String>,
    /// Files larger than this were skipped.
    pub max_file_bytes: u64,
    /// Role → score multiplier map used by search.
    pub role_weights: BTreeMap<String, f64>,
}

/// Metadata written alongside a committed embedding index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingManifest {
    /// Manifest schema version.
    pub version: String,
    /// UTC ISO-8601 timestamp of the commit.
    pub built_at: String,
    /// Model tag reported by the embedder that produced the vectors.
    pub model: String,
    /// Selected subtrees the build was scoped to (empty = whole root).
    pub roots: Vec<String>,
    /// Number of chunks (== documents.json length == matrix rows).
    pub count: usize,
    /// Embedding dimensionality D.
    pub embedding_dim: usize,
    /// Per-build counters.
    pub build: BuildStats,
    /// Configuration snapshot.
    pub config: ManifestConfig,
}

// ---------------------------------------------------------------------------
// Trace graph
// ---------------------------------------------------------------------------

/// Current trace manifest schema version.
pub const TRACE_MANIFEST_VERSION: &str = "1.0";

/// Kind of a trace node. Order matters for serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceNodeKind {
    /// A scanned source file.
    File,
    /// A symbol (function, class, method) extracted from a file.
    Symbol,
    /// A module imported from outside the repository.
    ExternalModule,
}

impl TraceNodeKind {
    /// Ordering used when serializing nodes: file < symbol < external_module.
    pub fn sort_rank(&self) -> u8 {
        match self {
            Self::File => 0,
            Self::Symbol => 1,
            Self::ExternalModule => 2,
        }
    }

    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Symbol => "symbol",
            Self::ExternalModule => "external_module",
        }
    }
}

/// Kind of a trace edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEdgeKind {
    /// File contains symbol.
    Contains,
    /// File imports file or external module.
    Imports,
    /// Symbol calls symbol.
    Calls,
    /// Symbol implements symbol.
    Implements,
    /// Symbol is documented by a chunk.
    DocumentedBy,
}

impl TraceEdgeKind {
    /// Stable string form used in edge ids and filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::Imports => "imports",
            Self::Calls => "calls",
            Self::Implements => "implements",
            Self::DocumentedBy => "documented_by",
        }
    }

    /// Parse from the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "contains" => Some(Self::Contains),
            "imports" => Some(Self::Imports),
            "calls" => Some(Self::Calls),
            "implements" => Some(Self::Implements),
            "documented_by" => Some(Self::DocumentedBy),
            _ => None,
        }
    }
}

/// A node in the trace graph, one JSON object per line in `trace_nodes.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceNode {
    /// Stable id (`file:…`, `sym:…`, `ext:…`).
    pub id: String,
    /// Node kind.
    pub kind: TraceNodeKind,
    /// Short name (file basename, symbol name, module name).
    pub name: String,
    /// Repo-relative POSIX path; empty for external modules.
    pub file_path: String,
    /// Line range for symbols; absent for files and external modules.
    pub span: Option<Span>,
    /// Detected language, if any.
    pub language: Option<String>,
    /// Kind-specific metadata (qualname, docstring, decorators, …).
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// An edge in the trace graph, one JSON object per line in `trace_edges.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEdge {
    /// Stable id (`edge:<kind>:<source>:<target>[:<disambiguator>]`).
    pub id: String,
    /// Edge kind.
    pub kind: TraceEdgeKind,
    /// Source node id. Must exist in the same index.
    pub source: String,
    /// Target node id. Must exist in the same index.
    pub target: String,
    /// Edge metadata: confidence in [0, 1], optional line, external flag.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A capped record of a file that failed to parse during a trace build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceFileError {
    /// Repo-relative POSIX path of the failing file.
    pub file_path: String,
    /// Short error classification.
    pub error_type: String,
    /// Human-readable message.
    pub message: String,
}

/// Node/edge counters recorded in the trace manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceCounts {
    /// Nodes serialized.
    pub nodes: usize,
    /// Edges serialized.
    pub edges: usize,
    /// Files successfully scanned.
    pub files_parsed: usize,
    /// Files that failed to parse.
    pub files_failed: usize,
}

/// Configuration snapshot recorded in the trace manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceManifestConfig {
    /// Include globs used to enumerate candidate files.
    pub include_globs: Vec<String>,
    /// Exclude globs applied after inclusion.
    pub exclude_globs: Vec<String>,
    /// Files larger than this were skipped.
    pub max_file_bytes: u64,
}

/// Metadata written alongside a committed trace index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceManifest {
    /// Manifest schema version.
    pub version: String,
    /// UTC ISO-8601 timestamp of the commit.
    pub built_at: String,
    /// Absolute repository root the trace was built from.
    pub repo_root: String,
    /// Configuration snapshot.
    pub config: TraceManifestConfig,
    /// Node/edge counters; all zero when validation failed.
    pub counts: TraceCounts,
    /// Capped list of per-file parse errors.
    pub file_errors: Vec<TraceFileError>,
    /// Validation or build error, if the build did not commit.
    pub last_error: Option<String>,
}
