//! Hybrid retrieval: cosine similarity over the embedding matrix, fused with
//! keyword and FTS boosts, then reweighted by role and query intent.
//!
//! The scoring pipeline per chunk:
//!
//! 1. cosine(query, row), denominator clamped away from zero
//! 2. + keyword boost: 0.03 per query token found in source_path/section, capped at 0.25
//! 3. + FTS boost: 0.35 / (1 + rank) for BM25 hits, best rank wins
//! 4. × role_weight[role] × intent_multiplier[role]
//! 5. + primer boost for configured primer files
//!
//! Ties are broken by chunk insertion order (stable sort), results below
//! `min_score` are dropped, and the top k survive.

pub mod context;
pub mod intent;

use crate::embedder::Embedder;
use crate::error::CoreResult;
use crate::index::{fts, CodeIndex};
use crate::types::SearchHit;

pub use intent::Intent;

/// Additive boost per matched keyword token.
const KEYWORD_BOOST_PER_TOKEN: f32 = 0.03;
/// Cap on the total keyword boost per chunk.
const KEYWORD_BOOST_CAP: f32 = 0.25;
/// Numerator of the FTS rank boost.
const FTS_BOOST_SCALE: f32 = 0.35;

/// Search the index, returning up to `k` hits scoring at least `min_score`.
///
/// Returns an empty result when the index is not loaded or the query embeds
/// to a zero vector.
pub fn search(
    index: &CodeIndex,
    embedder: &dyn Embedder,
    query: &str,
    k: usize,
    min_score: f32,
) -> CoreResult<Vec<SearchHit>> {
    let (Some(docs), Some(matrix)) = (index.documents(), index.embeddings()) else {
        return Ok(Vec::new());
    };
    if docs.is_empty() {
        return Ok(Vec::new());
    }

    let query_vec = embedder.embed(query)?.vector;
    let query_norm = l2_norm(&query_vec);
    if query_norm == 0.0 {
        return Ok(Vec::new());
    }

    let mut scores: Vec<f32> = Vec::with_capacity(docs.len());
    for row in matrix.rows() {
        let dot: f32 = row.iter().zip(query_vec.iter()).map(|(a, b)| a * b).sum();
        let row_norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        let denom = (row_norm * query_norm).max(1e-8);
        scores.push(dot / denom);
    }

    apply_keyword_boosts(query, docs, &mut scores);
    apply_fts_boosts(index, query, k, docs, &mut scores);

    // Role and intent reweighting.
    let query_intent = Intent::classify(query);
    let role_weights = index.manifest().map(|m| m.config.role_weights.clone()).unwrap_or_default();
    for (i, doc) in docs.iter().enumerate() {
        let role_weight = role_weights.get(doc.role.as_str()).copied().unwrap_or(1.0) as f32;
        scores[i] *= role_weight * query_intent.role_multiplier(doc.role);
    }

    // Primer boost.
    let primer = index.primer();
    if primer.enabled {
        for (i, doc) in docs.iter().enumerate() {
            if primer.matches_path(&doc.source_path) {
                scores[i] += primer.score_boost;
            }
        }
    }

    // Stable sort: equal scores keep chunk insertion order.
    let mut order: Vec<usize> = (0..docs.len()).collect();
    order.sort_by(|a, b| scores[*b].partial_cmp(&scores[*a]).unwrap_or(std::cmp::Ordering::Equal));

    let mut out = Vec::new();
    for idx in order {
        if scores[idx] < min_score {
            break;
        }
        out.push(SearchHit { chunk: docs[idx].clone(), score: scores[idx] });
        if out.len() >= k {
            break;
        }
    }

    Ok(out)
}

/// Lowercase tokens of length >= 3 matching `[a-z0-9_./-]+`.
fn query_tokens(query: &str) -> Vec<String> {
    let lowered = query.to_lowercase();
    let mut tokens: Vec<String> = Vec::new();
    let mut current = String::new();
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-') {
            current.push(c);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens.retain(|t| t.len() >= 3);
    tokens.sort_unstable();
    tokens.dedup();
    tokens
}

fn apply_keyword_boosts(query: &str, docs: &[crate::types::ChunkRecord], scores: &mut [f32]) {
    let tokens = query_tokens(query);
    if tokens.is_empty() {
        return;
    }

    for (i, doc) in docs.iter().enumerate() {
        let mut boost = 0.0f32;
        for field in [doc.source_path.as_str(), doc.section.as_str()] {
            if field.is_empty() {
                continue;
            }
            let lowered = field.to_lowercase();
            for token in &tokens {
                if lowered.contains(token.as_str()) {
                    boost += KEYWORD_BOOST_PER_TOKEN;
                }
            }
        }
        scores[i] += boost.min(KEYWORD_BOOST_CAP);
    }
}

fn apply_fts_boosts(
    index: &CodeIndex,
    query: &str,
    k: usize,
    docs: &[crate::types::ChunkRecord],
    scores: &mut [f32],
) {
    let limit = 10usize.max(k.saturating_mul(4));
    let rows = fts::query(&index.fts_path(), query, limit);
    if rows.is_empty() {
        return;
    }

    let id_to_idx: std::collections::HashMap<&str, usize> =
        docs.iter().enumerate().map(|(i, d)| (d.id.as_str(), i)).collect();

    // Best rank wins when a chunk appears more than once.
    let mut boosts: std::collections::HashMap<usize, f32> = std::collections::HashMap::new();
    for (chunk_id, rank) in rows {
        let Some(&i) = id_to_idx.get(chunk_id.as_str()) else { continue };
        let rank = rank.max(0.0) as f32;
        let boost = FTS_BOOST_SCALE / (1.0 + rank);
        let entry = boosts.entry(i).or_insert(0.0);
        *entry = (*entry).max(boost);
    }

    for (i, boost) in boosts {
        scores[i] += boost;
    }
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}
