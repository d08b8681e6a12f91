//! Embedding capability: maps text to a unit-norm vector plus a model tag.
//!
//! The engine treats the embedding provider as a synchronous, batch-capable,
//! potentially slow external collaborator. Transient failures (HTTP 5xx,
//! connection errors, malformed responses) are retried with exponential
//! backoff and jitter; permanent failures propagate with the cause preserved.
//!
//! Two implementations exist: an Ollama-style HTTP provider for production,
//! and a deterministic fake for tests that requires no external service.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::EmbeddingProviderConfig;
use crate::error::{CoreError, CoreResult};

/// Result of an embedding operation.
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// The embedding vector (unit norm for well-behaved providers).
    pub vector: Vec<f32>,
    /// Tag of the model that produced the vector.
    pub model: String,
}

/// Abstract embedding provider.
pub trait Embedder: Send + Sync {
    /// Tag identifying the model; recorded in manifests and used by the
    /// incremental-build reuse gate.
    fn model_tag(&self) -> String;

    /// Generate an embedding vector for the given text.
    fn embed(&self, text: &str) -> CoreResult<EmbeddingResult>;

    /// Generate embeddings for multiple texts.
    fn embed_batch(&self, texts: &[&str]) -> CoreResult<Vec<EmbeddingResult>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

// ---------------------------------------------------------------------------
// Ollama provider
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingsResponse {
    embedding: Option<Vec<f32>>,
    model: Option<String>,
}

/// Ollama-based embedder using the `/api/embeddings` endpoint.
pub struct OllamaEmbedder {
    config: EmbeddingProviderConfig,
    client: reqwest::blocking::Client,
}

impl OllamaEmbedder {
    /// Create an embedder for the configured endpoint.
    pub fn new(config: EmbeddingProviderConfig) -> CoreResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_s))
            .build()
            .map_err(|e| CoreError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn request_once(&self, text: &str) -> Result<EmbeddingResult, String> {
        let url = format!("{}/api/embeddings", self.config.base_url.trim_end_matches('/'));
        let payload = serde_json::json!({
            "model": self.config.model,
            "prompt": text,
            "keep_alive": self.config.keep_alive,
        });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(format!("{status} server error for {url}"));
        }
        if !status.is_success() {
            return Err(format!("{status} for {url}"));
        }

        let body: OllamaEmbeddingsResponse =
            resp.json().map_err(|e| format!("malformed response: {e}"))?;
        let vector = body
            .embedding
            .filter(|v| !v.is_empty())
            .ok_or_else(|| "embeddings response missing 'embedding'".to_string())?;

        Ok(EmbeddingResult {
            vector,
            model: body.model.unwrap_or_else(|| self.config.model.clone()),
        })
    }
}

impl Embedder for OllamaEmbedder {
    fn model_tag(&self) -> String {
        self.config.model.clone()
    }

    fn embed(&self, text: &str) -> CoreResult<EmbeddingResult> {
        let attempts = self.config.max_retries.max(1);
        let mut last_err = String::new();

        for attempt in 0..attempts {
            match self.request_once(text) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    last_err = e;
                    if attempt + 1 >= attempts {
                        break;
                    }
                    let base_delay_s = 0.35 * f64::from(1u32 << attempt.min(16));
                    let jitter_s = rand::rng().random::<f64>() * 0.25;
                    tracing::debug!(
                        attempt,
                        error = %last_err,
                        "embedding request failed, retrying with backoff"
                    );
                    std::thread::sleep(std::time::Duration::from_secs_f64(base_delay_s + jitter_s));
                }
            }
        }

        Err(CoreError::Transient {
            source_name: "embedder".into(),
            message: last_err,
        })
    }
}

// ---------------------------------------------------------------------------
// Deterministic fake
// ---------------------------------------------------------------------------

/// Deterministic fake embedder for tests.
///
/// Each lowercase alphanumeric token contributes a unit pseudo-random vector
/// seeded from the token's SHA-256, so texts sharing tokens land near each
/// other in cosine space. A small shared anchor component keeps unrelated
/// texts weakly positive rather than centered on zero. Output is
/// L2-normalized. Same text, same vector, across processes.
pub struct FakeEmbedder {
    model: String,
    dim: usize,
}

/// Weight of the shared anchor component relative to one token. Unrelated
/// texts land at a small positive cosine rather than centered on zero.
const ANCHOR_WEIGHT: f32 = 1.0;

impl FakeEmbedder {
    /// Create a fake embedder with the given model tag and dimensionality.
    pub fn new(model: impl Into<String>, dim: usize) -> Self {
        Self { model: model.into(), dim: dim.max(8) }
    }

    fn seeded_unit_vector(&self, seed_text: &str) -> Vec<f32> {
        let mut hasher = Sha256::new();
        hasher.update(seed_text.as_bytes());
        let digest = hasher.finalize();
        let mut seed_bytes = [0u8; 8];
        seed_bytes.copy_from_slice(&digest[..8]);
        let mut rng = StdRng::seed_from_u64(u64::from_le_bytes(seed_bytes));

        let mut v: Vec<f32> = (0..self.dim).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-8);
        for x in &mut v {
            *x /= norm;
        }
        v
    }
}

impl Default for FakeEmbedder {
    fn default() -> Self {
        Self::new("fake-embed", 384)
    }
}

impl Embedder for FakeEmbedder {
    fn model_tag(&self) -> String {
        self.model.clone()
    }

    fn embed(&self, text: &str) -> CoreResult<EmbeddingResult> {
        let mut acc = self.seeded_unit_vector("\u{0}anchor");
        for x in &mut acc {
            *x *= ANCHOR_WEIGHT;
        }

        let lowered = text.to_lowercase();
        for token in lowered.split(|c: char| !c.is_ascii_alphanumeric() && c != '_') {
            if token.is_empty() {
                continue;
            }
            let tv = self.seeded_unit_vector(token);
            for (a, t) in acc.iter_mut().zip(tv.iter()) {
                *a += t;
            }
        }

        let norm = acc.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-8);
        for x in &mut acc {
            *x /= norm;
        }

        Ok(EmbeddingResult { vector: acc, model: self.model.clone() })
    }
}
