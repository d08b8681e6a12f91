//! Embedding index: per-project store of chunks, vectors, and keyword rows.
//!
//! On-disk format inside the index directory:
//!
//! - `documents.json` -- JSON array of chunk records
//! - `embeddings.npy` -- N x D f32 matrix, row i belongs to chunk i
//! - `manifest.json`  -- build metadata and config snapshot
//! - `fts.sqlite3`    -- FTS5 keyword index
//! - `repo_policy.json` -- persisted profiler policy
//!
//! Builds are incremental: a file whose content hash matches the previous
//! build's record (under the same embedding model tag) carries its chunks and
//! vector rows over unchanged. All commits go through the atomic
//! stage-then-swap pipeline, so readers only ever observe fully committed
//! state.

pub mod fts;
pub mod npy;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::atomic::{startup_recovery, StagedCommit};
use crate::chunker::{self, Chunk};
use crate::config::PrimerConfig;
use crate::embedder::Embedder;
use crate::error::{CoreError, CoreResult};
use crate::globs::{to_posix, PathMatcher};
use crate::policy::{self, RepoPolicy};
use crate::profile::classify_rel_path;
use crate::types::{
    BuildMode, BuildStats, ChunkRecord, EmbeddingManifest, ManifestConfig, MANIFEST_VERSION,
};

/// Exclusions applied to every build regardless of policy: the engine's own
/// artifacts must never feed back into the index.
const SELF_EXCLUDE_GLOBS: &[&str] = &[
    "**/.codrag/**",
    "**/.index_build_*/**",
    "**/.index_backup_*/**",
];

/// Options controlling one embedding build.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Include globs; empty falls back to the repo policy.
    pub include_globs: Vec<String>,
    /// Exclude globs; empty falls back to the repo policy.
    pub exclude_globs: Vec<String>,
    /// Selected subtrees (repo-relative); empty means the whole root.
    pub roots: Vec<String>,
    /// Skip files larger than this many bytes (0 = default).
    pub max_file_bytes: u64,
}

/// Index statistics exposed through engine status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    /// Whether documents and matrix are loaded and consistent.
    pub loaded: bool,
    /// The index directory.
    pub index_dir: String,
    /// Embedding model tag, when known.
    pub model: Option<String>,
    /// Commit timestamp, when known.
    pub built_at: Option<String>,
    /// Number of chunks.
    pub total_documents: usize,
    /// Embedding dimensionality.
    pub embedding_dim: usize,
}

/// A hybrid semantic + keyword search index for one repository.
pub struct CodeIndex {
    index_dir: PathBuf,
    documents: Option<Vec<ChunkRecord>>,
    embeddings: Option<Array2<f32>>,
    manifest: Option<EmbeddingManifest>,
    primer: PrimerConfig,
}

impl CodeIndex {
    /// Open an index directory: run startup recovery, then load whatever
    /// committed state exists.
    pub fn open(index_dir: &Path) -> Self {
        startup_recovery(index_dir);
        let mut index = Self {
            index_dir: index_dir.to_path_buf(),
            documents: None,
            embeddings: None,
            manifest: None,
            primer: PrimerConfig::default(),
        };
        index.load();
        index
    }

    /// Path of `documents.json`.
    pub fn documents_path(&self) -> PathBuf {
        self.index_dir.join("documents.json")
    }

    /// Path of `embeddings.npy`.
    pub fn embeddings_path(&self) -> PathBuf {
        self.index_dir.join("embeddings.npy")
    }

    /// Path of `manifest.json`.
    pub fn manifest_path(&self) -> PathBuf {
        self.index_dir.join("manifest.json")
    }

    /// Path of the FTS keyword index.
    pub fn fts_path(&self) -> PathBuf {
        self.index_dir.join("fts.sqlite3")
    }

    /// The index directory this store lives in.
    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// (Re)load committed state from disk.
    ///
    /// Corruption -- unparseable files or a row-count mismatch -- leaves the
    /// index unloaded; a subsequent build regenerates cleanly.
    pub fn load(&mut self) {
        self.documents = None;
        self.embeddings = None;
        self.manifest = None;

        let documents_path = self.documents_path();
        let embeddings_path = self.embeddings_path();
        if !documents_path.exists() || !embeddings_path.exists() {
            return;
        }

        let documents: Vec<ChunkRecord> = match std::fs::read_to_string(&documents_path)
            .map_err(CoreError::from)
            .and_then(|s| serde_json::from_str(&s).map_err(CoreError::from))
        {
            Ok(docs) => docs,
            Err(e) => {
                tracing::warn!(path = %documents_path.display(), error = %e, "failed to load documents");
                return;
            }
        };

        let embeddings = match npy::read_npy(&embeddings_path) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %embeddings_path.display(), error = %e, "failed to load embeddings");
                return;
            }
        };

        if documents.len() != embeddings.nrows() {
            tracing::warn!(
                documents = documents.len(),
                rows = embeddings.nrows(),
                "documents/matrix count mismatch, treating index as not loaded"
            );
            return;
        }

        let manifest_path = self.manifest_path();
        if manifest_path.exists() {
            match std::fs::read_to_string(&manifest_path)
                .map_err(CoreError::from)
                .and_then(|s| serde_json::from_str(&s).map_err(CoreError::from))
            {
                Ok(m) => self.manifest = Some(m),
                Err(e) => {
                    tracing::warn!(path = %manifest_path.display(), error = %e, "failed to load manifest");
                }
            }
        }

        if let Some(p) = policy::load_repo_policy(&policy::policy_path_for_index(&self.index_dir)) {
            self.primer = p.primer;
        }

        self.documents = Some(documents);
        self.embeddings = Some(embeddings);
    }

    /// Whether a consistent index is in memory and ready for search.
    pub fn is_loaded(&self) -> bool {
        matches!(&self.documents, Some(docs) if !docs.is_empty()) && self.embeddings.is_some()
    }

    /// Index statistics.
    pub fn stats(&self) -> IndexStats {
        if !self.is_loaded() {
            return IndexStats {
                loaded: false,
                index_dir: self.index_dir.to_string_lossy().to_string(),
                model: None,
                built_at: None,
                total_documents: 0,
                embedding_dim: 0,
            };
        }

        IndexStats {
            loaded: true,
            index_dir: self.index_dir.to_string_lossy().to_string(),
            model: self.manifest.as_ref().map(|m| m.model.clone()),
            built_at: self.manifest.as_ref().map(|m| m.built_at.clone()),
            total_documents: self.documents.as_ref().map(Vec::len).unwrap_or(0),
            embedding_dim: self.embeddings.as_ref().map(|m| m.ncols()).unwrap_or(0),
        }
    }

    /// The loaded chunk records, if any.
    pub fn documents(&self) -> Option<&[ChunkRecord]> {
        self.documents.as_deref()
    }

    /// The loaded embedding matrix, if any.
    pub fn embeddings(&self) -> Option<&Array2<f32>> {
        self.embeddings.as_ref()
    }

    /// The loaded manifest, if any.
    pub fn manifest(&self) -> Option<&EmbeddingManifest> {
        self.manifest.as_ref()
    }

    /// The primer configuration from the loaded policy.
    pub fn primer(&self) -> &PrimerConfig {
        &self.primer
    }

    /// Point lookup of a chunk by id.
    pub fn get_chunk(&self, chunk_id: &str) -> Option<&ChunkRecord> {
        self.documents.as_ref()?.iter().find(|d| d.id == chunk_id)
    }

    // -----------------------------------------------------------------------
    // Build
    // -----------------------------------------------------------------------

    /// Build (or rebuild) the index from a repository.
    ///
    /// Reuses unchanged files from the previous committed build when the
    /// embedding model tag matches, embeds the rest, and commits atomically.
    /// The cancel flag is checked between files.
    pub fn build(
        &mut self,
        repo_root: &Path,
        embedder: &dyn Embedder,
        options: &BuildOptions,
        cancel: &AtomicBool,
    ) -> CoreResult<EmbeddingManifest> {
        let repo_root = repo_root
            .canonicalize()
            .map_err(|e| CoreError::validation(format!("repo root {}: {e}", repo_root.display())))?;

        let repo_policy = policy::ensure_repo_policy(&self.index_dir, &repo_root, false)?;
        self.primer = repo_policy.primer.clone();

        let include_globs = if options.include_globs.is_empty() {
            if repo_policy.include_globs.is_empty() {
                vec!["**/*.md".to_string(), "**/*.py".to_string()]
            } else {
                repo_policy.include_globs.clone()
            }
        } else {
            options.include_globs.clone()
        };
        let exclude_globs = if options.exclude_globs.is_empty() {
            repo_policy.exclude_globs.clone()
        } else {
            options.exclude_globs.clone()
        };
        let max_file_bytes = if options.max_file_bytes == 0 {
            crate::config::DEFAULT_MAX_FILE_BYTES
        } else {
            options.max_file_bytes
        };

        let mut effective_excludes = exclude_globs.clone();
        for glob in SELF_EXCLUDE_GLOBS {
            effective_excludes.push((*glob).to_string());
        }
        if let Ok(rel_index) = self.index_dir.strip_prefix(&repo_root) {
            let rel = to_posix(&rel_index.to_string_lossy());
            if !rel.is_empty() {
                effective_excludes.push(format!("{rel}/**"));
            }
        }

        let matcher = PathMatcher::new(&include_globs, &effective_excludes);
        let files = enumerate_files(&repo_root, &options.roots, &matcher, max_file_bytes)?;

        // Reuse gate: previous chunks must exist and the model tag must match.
        let model_tag = embedder.model_tag();
        let previous = self.reusable_previous(&model_tag);

        let mut docs: Vec<ChunkRecord> = Vec::new();
        let mut vectors: Vec<Vec<f32>> = Vec::new();
        let mut stats = BuildStats {
            mode: BuildMode::Full,
            files_total: files.len(),
            files_reused: 0,
            files_embedded: 0,
            chunks_total: 0,
            chunks_reused: 0,
            chunks_embedded: 0,
        };
        let mut embedding_dim: Option<usize> = None;

        for (abs_path, rel_path) in &files {
            if cancel.load(Ordering::Relaxed) {
                return Err(CoreError::Build { message: "build cancelled".into() });
            }

            let raw = match std::fs::read(abs_path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(path = %abs_path.display(), error = %e, "skipping unreadable file");
                    continue;
                }
            };
            let text = String::from_utf8_lossy(&raw).into_owned();
            let file_hash = crate::ids::stable_file_hash(text.as_bytes());

            if let Some(prev) = &previous {
                if let Some((prev_hash, prev_rows)) = prev.get(rel_path.as_str()) {
                    if *prev_hash == file_hash {
                        for (record, vector) in prev_rows {
                            docs.push(record.clone());
                            vectors.push(vector.clone());
                        }
                        stats.files_reused += 1;
                        stats.chunks_reused += prev_rows.len();
                        continue;
                    }
                }
            }

            let role = classify_rel_path(rel_path);
            let chunks = chunk_file(&text, rel_path);
            stats.files_embedded += 1;

            for chunk in &chunks {
                let embed_text = format_chunk_for_embedding(chunk, &file_hash);
                let result = embedder.embed(&embed_text)?;
                if let Some(dim) = embedding_dim {
                    if result.vector.len() != dim {
                        return Err(CoreError::Build {
                            message: format!(
                                "embedder returned inconsistent dimensions: {} then {}",
                                dim,
                                result.vector.len()
                            ),
                        });
                    }
                } else {
                    embedding_dim = Some(result.vector.len());
                }

                docs.push(ChunkRecord {
                    id: chunk.chunk_id.clone(),
                    source_path: rel_path.clone(),
                    file_hash: file_hash.clone(),
                    role,
                    section: chunk.section.clone(),
                    span: chunk.span,
                    content: chunk.content.clone(),
                });
                vectors.push(result.vector);
                stats.chunks_embedded += 1;
            }
        }

        if docs.is_empty() {
            return Err(CoreError::Build { message: "no documents indexed".into() });
        }

        stats.chunks_total = docs.len();
        stats.mode = if stats.files_reused > 0 { BuildMode::Incremental } else { BuildMode::Full };

        let dim = embedding_dim
            .or_else(|| vectors.first().map(Vec::len))
            .ok_or_else(|| CoreError::Build { message: "no vectors produced".into() })?;
        let mut matrix = Array2::<f32>::zeros((vectors.len(), dim));
        for (i, v) in vectors.iter().enumerate() {
            if v.len() != dim {
                return Err(CoreError::Build {
                    message: format!("vector {} has dimension {}, expected {dim}", i, v.len()),
                });
            }
            for (j, x) in v.iter().enumerate() {
                matrix[(i, j)] = *x;
            }
        }

        let manifest = EmbeddingManifest {
            version: MANIFEST_VERSION.to_string(),
            built_at: chrono::Utc::now().to_rfc3339(),
            model: model_tag,
            roots: options.roots.clone(),
            count: docs.len(),
            embedding_dim: dim,
            build: stats,
            config: ManifestConfig {
                include_globs,
                exclude_globs,
                max_file_bytes,
                role_weights: repo_policy.role_weights.clone(),
            },
        };

        self.commit(&docs, &matrix, &manifest, &repo_policy)?;
        self.load();

        let loaded_manifest = self.manifest.clone().unwrap_or(manifest);
        tracing::info!(
            index_dir = %self.index_dir.display(),
            chunks = loaded_manifest.count,
            files_reused = loaded_manifest.build.files_reused,
            files_embedded = loaded_manifest.build.files_embedded,
            mode = ?loaded_manifest.build.mode,
            "embedding index committed"
        );
        Ok(loaded_manifest)
    }

    /// Map of source_path -> (file_hash, rows) from the previous committed
    /// build, available only when the model tag is unchanged.
    #[allow(clippy::type_complexity)]
    fn reusable_previous(
        &self,
        model_tag: &str,
    ) -> Option<BTreeMap<String, (String, Vec<(ChunkRecord, Vec<f32>)>)>> {
        let documents = self.documents.as_ref()?;
        let embeddings = self.embeddings.as_ref()?;
        let manifest = self.manifest.as_ref()?;
        if documents.is_empty() || manifest.model != model_tag {
            return None;
        }

        let mut by_path: BTreeMap<String, (String, Vec<(ChunkRecord, Vec<f32>)>)> = BTreeMap::new();
        for (i, record) in documents.iter().enumerate() {
            let row = embeddings.row(i).to_vec();
            by_path
                .entry(record.source_path.clone())
                .or_insert_with(|| (record.file_hash.clone(), Vec::new()))
                .1
                .push((record.clone(), row));
        }
        Some(by_path)
    }

    fn commit(
        &self,
        docs: &[ChunkRecord],
        matrix: &Array2<f32>,
        manifest: &EmbeddingManifest,
        repo_policy: &RepoPolicy,
    ) -> CoreResult<()> {
        let staged = StagedCommit::begin(&self.index_dir)?;

        let docs_json = serde_json::to_string(docs)?;
        staged.write_file("documents.json", docs_json.as_bytes())?;
        staged.write_file("embeddings.npy", &npy::to_npy_bytes(matrix))?;

        // Stable key order for the manifest.
        let manifest_value = serde_json::to_value(manifest)?;
        staged.write_file("manifest.json", serde_json::to_string_pretty(&manifest_value)?.as_bytes())?;

        staged.write_file(
            policy::POLICY_FILENAME,
            serde_json::to_string_pretty(repo_policy)?.as_bytes(),
        )?;

        if let Err(e) = fts::rebuild(&staged.staging_path("fts.sqlite3"), docs) {
            tracing::warn!(error = %e, "FTS rebuild failed, continuing without keyword index");
        } else {
            staged.sync_file("fts.sqlite3")?;
        }

        staged.commit()
    }
}

/// Format a chunk through the canonical embedding template.
fn format_chunk_for_embedding(chunk: &Chunk, file_hash: &str) -> String {
    let mut bits: Vec<String> = Vec::new();
    if !chunk.name.is_empty() {
        bits.push(format!("Name: {}", chunk.name));
    }
    bits.push(format!("Path: {}", chunk.source_path));
    if !chunk.section.is_empty() {
        bits.push(format!("Section: {}", chunk.section));
    }
    bits.push(format!("Hash: {file_hash}"));
    bits.push(String::new());
    bits.push(chunk.content.clone());
    bits.join("\n")
}

/// Chunk a file by extension: markdown by headings, everything else by the
/// sliding code window.
fn chunk_file(text: &str, rel_path: &str) -> Vec<Chunk> {
    let lower = rel_path.to_lowercase();
    if lower.ends_with(".md") || lower.ends_with(".markdown") {
        chunker::chunk_markdown(text, rel_path, None, chunker::MD_MAX_CHARS, chunker::MD_MIN_CHARS)
    } else {
        chunker::chunk_code(text, rel_path, chunker::CODE_MAX_CHARS, chunker::CODE_OVERLAP_CHARS)
    }
}

/// Enumerate candidate files under the root (or the selected subtrees),
/// sorted by relative POSIX path for determinism.
pub(crate) fn enumerate_files(
    repo_root: &Path,
    roots: &[String],
    matcher: &PathMatcher,
    max_file_bytes: u64,
) -> CoreResult<Vec<(PathBuf, String)>> {
    let mut out: BTreeMap<String, PathBuf> = BTreeMap::new();

    let walk_roots: Vec<PathBuf> = if roots.is_empty() {
        vec![repo_root.to_path_buf()]
    } else {
        roots.iter().map(|r| repo_root.join(r)).collect()
    };

    for walk_root in walk_roots {
        if !walk_root.exists() {
            continue;
        }
        walk_dir(repo_root, &walk_root, matcher, max_file_bytes, &mut out)?;
    }

    Ok(out.into_iter().map(|(rel, abs)| (abs, rel)).collect())
}

fn walk_dir(
    repo_root: &Path,
    dir: &Path,
    matcher: &PathMatcher,
    max_file_bytes: u64,
    out: &mut BTreeMap<String, PathBuf>,
) -> CoreResult<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
            return Ok(());
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = std::fs::symlink_metadata(&path) else { continue };
        if meta.file_type().is_symlink() {
            continue;
        }

        if meta.is_dir() {
            walk_dir(repo_root, &path, matcher, max_file_bytes, out)?;
            continue;
        }
        if !meta.is_file() {
            continue;
        }

        let Ok(rel) = path.strip_prefix(repo_root) else { continue };
        let rel_posix = to_posix(&rel.to_string_lossy());
        if !matcher.is_relevant(&rel_posix) {
            continue;
        }
        if meta.len() > max_file_bytes {
            continue;
        }

        out.insert(rel_posix, path);
    }

    Ok(())
}
