//! Context assembly: turns search results into a char-budgeted block
//! sequence suitable for prompt injection.
//!
//! Blocks are separated by `\n\n---\n\n` and begin with a
//! `[<section> | @<source_path>]` header (missing parts omitted). A block
//! that would overflow the budget is truncated with an ellipsis when at
//! least 200 characters of budget remain after the header; otherwise
//! assembly stops. Primer chunks, when configured for always-include, are
//! emitted first within their own budget and excluded from the main loop.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::embedder::Embedder;
use crate::error::CoreResult;
use crate::index::CodeIndex;
use crate::trace::{NeighborDirection, TraceIndex};
use crate::types::{ChunkRecord, Span, TraceNodeKind};

/// Minimum budget left over (after the header) for a truncated block.
const TRUNCATION_FLOOR: usize = 200;

/// Block separator in assembled context.
const SEPARATOR: &str = "\n\n---\n\n";

/// Options for context assembly.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Number of search results to draw from.
    pub k: usize,
    /// Character budget for the main block sequence.
    pub max_chars: usize,
    /// Minimum search score.
    pub min_score: f32,
    /// Whether block headers include `@source_path`.
    pub include_sources: bool,
    /// Whether block headers include the score.
    pub include_scores: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            k: 5,
            max_chars: 6000,
            min_score: 0.15,
            include_sources: true,
            include_scores: false,
        }
    }
}

/// Per-block metadata in structured context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextChunkMeta {
    /// Chunk id (or file node id for trace-expanded blocks).
    pub chunk_id: String,
    /// Repo-relative source path.
    pub source_path: String,
    /// Section heading chain, empty for code.
    pub section: String,
    /// Line span, when known.
    pub span: Option<Span>,
    /// Search score (0 for primer/trace-expanded blocks).
    pub score: f32,
    /// Whether the block content was truncated.
    pub truncated: bool,
    /// Whether the block was added by trace expansion.
    pub trace_expanded: bool,
}

/// Structured context: the rendered string plus per-block metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredContext {
    /// The assembled context string.
    pub context: String,
    /// Per-block metadata, in emission order.
    pub chunks: Vec<ContextChunkMeta>,
    /// Sum of emitted block lengths.
    pub total_chars: usize,
    /// `total_chars / 4`.
    pub estimated_tokens: usize,
}

impl StructuredContext {
    fn empty() -> Self {
        Self { context: String::new(), chunks: Vec::new(), total_chars: 0, estimated_tokens: 0 }
    }
}

/// Assemble a plain context string for a query.
pub fn get_context(
    index: &CodeIndex,
    embedder: &dyn Embedder,
    query: &str,
    options: &ContextOptions,
) -> CoreResult<String> {
    Ok(assemble(index, embedder, query, options)?.context)
}

/// Assemble structured context for a query.
pub fn get_context_structured(
    index: &CodeIndex,
    embedder: &dyn Embedder,
    query: &str,
    options: &ContextOptions,
) -> CoreResult<StructuredContext> {
    assemble(index, embedder, query, options)
}

fn assemble(
    index: &CodeIndex,
    embedder: &dyn Embedder,
    query: &str,
    options: &ContextOptions,
) -> CoreResult<StructuredContext> {
    let mut out = StructuredContext::empty();
    let mut parts: Vec<String> = Vec::new();

    // Primer chunks first, within their own budget, excluded from the main
    // loop to avoid duplication.
    let primer = index.primer().clone();
    let mut primer_ids: HashSet<String> = HashSet::new();
    if primer.enabled && primer.always_include {
        if let Some(docs) = index.documents() {
            let mut primer_total = 0usize;
            for doc in docs {
                if !primer.matches_path(&doc.source_path) {
                    continue;
                }
                primer_ids.insert(doc.id.clone());
                let block = render_block(doc, None, options);
                match fit_block(&block, primer_total, primer.max_primer_chars) {
                    Fit::Whole => {
                        primer_total += block.len();
                        out.total_chars += block.len();
                        parts.push(block);
                        out.chunks.push(meta_for(doc, 0.0, false));
                    }
                    Fit::Truncated(truncated) => {
                        primer_total += truncated.len();
                        out.total_chars += truncated.len();
                        parts.push(truncated);
                        out.chunks.push(meta_for(doc, 0.0, true));
                        break;
                    }
                    Fit::Stop => break,
                }
            }
        }
    }

    let hits = super::search(index, embedder, query, options.k, options.min_score)?;
    let mut main_total = 0usize;

    for hit in &hits {
        if primer_ids.contains(&hit.chunk.id) {
            continue;
        }
        let block = render_block(&hit.chunk, Some(hit.score), options);
        match fit_block(&block, main_total, options.max_chars) {
            Fit::Whole => {
                main_total += block.len();
                out.total_chars += block.len();
                parts.push(block);
                out.chunks.push(meta_for(&hit.chunk, hit.score, false));
            }
            Fit::Truncated(truncated) => {
                main_total += truncated.len();
                out.total_chars += truncated.len();
                parts.push(truncated);
                out.chunks.push(meta_for(&hit.chunk, hit.score, true));
                break;
            }
            Fit::Stop => break,
        }
    }

    out.context = parts.join(SEPARATOR);
    out.estimated_tokens = out.total_chars / 4;
    Ok(out)
}

enum Fit {
    Whole,
    Truncated(String),
    Stop,
}

/// Budget check for one block: fits whole, fits truncated with an ellipsis
/// (when at least the truncation floor remains), or stops assembly.
fn fit_block(block: &str, total: usize, max_chars: usize) -> Fit {
    if total + block.len() <= max_chars {
        return Fit::Whole;
    }
    let remaining = max_chars.saturating_sub(total);
    if remaining > TRUNCATION_FLOOR {
        let cut = floor_char_boundary(block, remaining);
        Fit::Truncated(format!("{}...", &block[..cut]))
    } else {
        Fit::Stop
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn render_block(chunk: &ChunkRecord, score: Option<f32>, options: &ContextOptions) -> String {
    let mut bits: Vec<String> = Vec::new();
    if !chunk.section.is_empty() {
        bits.push(chunk.section.clone());
    }
    if options.include_sources && !chunk.source_path.is_empty() {
        bits.push(format!("@{}", chunk.source_path));
    }
    if options.include_scores {
        if let Some(score) = score {
            bits.push(format!("score={score:.3}"));
        }
    }

    let header = if bits.is_empty() { chunk.source_path.clone() } else { bits.join(" | ") };
    format!("[{header}]\n{}", chunk.content)
}

fn meta_for(chunk: &ChunkRecord, score: f32, truncated: bool) -> ContextChunkMeta {
    ContextChunkMeta {
        chunk_id: chunk.id.clone(),
        source_path: chunk.source_path.clone(),
        section: chunk.section.clone(),
        span: Some(chunk.span),
        score,
        truncated,
        trace_expanded: false,
    }
}

// ---------------------------------------------------------------------------
// Trace expansion
// ---------------------------------------------------------------------------

/// Options for trace-driven context expansion.
#[derive(Debug, Clone)]
pub struct TraceExpansionOptions {
    /// Neighbor direction to follow from each result file.
    pub direction: NeighborDirection,
    /// Cap on neighbors consulted per file node.
    pub max_nodes: usize,
    /// Character budget for all appended content.
    pub max_additional_chars: usize,
}

impl Default for TraceExpansionOptions {
    fn default() -> Self {
        Self { direction: NeighborDirection::Out, max_nodes: 10, max_additional_chars: 4000 }
    }
}

/// Append one flagged chunk per trace-related file not already present in the
/// context, bounded by `max_additional_chars` in total.
pub fn expand_with_trace(
    context: &mut StructuredContext,
    trace: &TraceIndex,
    repo_root: &Path,
    options: &TraceExpansionOptions,
) {
    let mut included: HashSet<String> =
        context.chunks.iter().map(|c| c.source_path.clone()).collect();
    let base_paths: Vec<String> = {
        let mut seen = HashSet::new();
        context
            .chunks
            .iter()
            .filter(|c| !c.trace_expanded)
            .map(|c| c.source_path.clone())
            .filter(|p| seen.insert(p.clone()))
            .collect()
    };

    let mut used = 0usize;

    'outer: for path in base_paths {
        let node_id = crate::ids::stable_file_node_id(&path);
        let neighbors = trace.get_neighbors(&node_id, options.direction, None, options.max_nodes);

        let related = neighbors.in_nodes.iter().chain(neighbors.out_nodes.iter());
        for node in related {
            if node.kind != TraceNodeKind::File || node.file_path.is_empty() {
                continue;
            }
            if !included.insert(node.file_path.clone()) {
                continue;
            }

            let Ok(bytes) = std::fs::read(repo_root.join(&node.file_path)) else { continue };
            let content = String::from_utf8_lossy(&bytes);
            let content = content.trim();
            if content.is_empty() {
                continue;
            }

            let remaining = options.max_additional_chars.saturating_sub(used);
            if remaining < TRUNCATION_FLOOR {
                break 'outer;
            }

            let (body, truncated) = if content.len() > remaining {
                let cut = floor_char_boundary(content, remaining);
                (format!("{}...", &content[..cut]), true)
            } else {
                (content.to_string(), false)
            };

            let block = format!("[@{}]\n{body}", node.file_path);
            used += block.len();
            context.total_chars += block.len();
            if !context.context.is_empty() {
                context.context.push_str(SEPARATOR);
            }
            context.context.push_str(&block);
            context.chunks.push(ContextChunkMeta {
                chunk_id: node.id.clone(),
                source_path: node.file_path.clone(),
                section: String::new(),
                span: None,
                score: 0.0,
                truncated,
                trace_expanded: true,
            });
        }
    }

    context.estimated_tokens = context.total_chars / 4;
}
