//! Configuration loading and validation.
//!
//! Two layers of configuration exist:
//!
//! - [`EngineConfig`] is process-wide and resolved with the following
//!   precedence (highest wins): environment variables (`CODRAG_*`), user
//!   config (`~/.config/codrag/config.toml`), compiled-in defaults.
//! - [`ProjectConfig`] is per-project, stored as a JSON object in the
//!   registry, and carries indexing scope, watcher tuning, and primer
//!   settings. Absent fields fall back to the repo policy or defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};

// ---------------------------------------------------------------------------
// Engine-wide configuration
// ---------------------------------------------------------------------------

/// Process-wide engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base data directory for standalone indexes and the registry.
    #[serde(default = "EngineConfig::default_data_dir")]
    pub data_dir: PathBuf,

    /// Embedding provider settings.
    #[serde(default)]
    pub embedding: EmbeddingProviderConfig,

    /// Default watcher tuning (overridable per project).
    #[serde(default)]
    pub watcher: WatcherTuning,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            embedding: EmbeddingProviderConfig::default(),
            watcher: WatcherTuning::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("codrag")
    }

    /// Load configuration from defaults, then user config, then environment.
    pub fn load() -> CoreResult<Self> {
        let mut config = Self::default();

        if let Some(user_config_dir) = dirs::config_dir() {
            let user_config_path = user_config_dir.join("codrag").join("config.toml");
            if user_config_path.exists() {
                config.merge_from_file(&user_config_path)?;
            }
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Path of the registry database under the data directory.
    pub fn registry_db_path(&self) -> PathBuf {
        self.data_dir.join("registry.db")
    }

    /// Merge values from a TOML config file (non-destructive overlay).
    fn merge_from_file(&mut self, path: &Path) -> CoreResult<()> {
        let content = std::fs::read_to_string(path)?;
        let overlay: toml::Value = toml::from_str(&content).map_err(|e| CoreError::Validation {
            message: format!("invalid TOML in {}: {e}", path.display()),
        })?;

        if let Some(v) = overlay.get("data_dir").and_then(|v| v.as_str()) {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(embedding) = overlay.get("embedding") {
            if let Ok(parsed) = embedding.clone().try_into::<EmbeddingProviderConfig>() {
                self.embedding = parsed;
            }
        }
        if let Some(watcher) = overlay.get("watcher") {
            if let Ok(parsed) = watcher.clone().try_into::<WatcherTuning>() {
                self.watcher = parsed;
            }
        }
        if let Some(logging) = overlay.get("logging") {
            if let Ok(parsed) = logging.clone().try_into::<LoggingConfig>() {
                self.logging = parsed;
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides (CODRAG_* prefix).
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("CODRAG_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("CODRAG_EMBED_URL") {
            self.embedding.base_url = url;
        }
        if let Ok(model) = std::env::var("CODRAG_EMBED_MODEL") {
            self.embedding.model = model;
        }
        if let Ok(level) = std::env::var("CODRAG_LOG_LEVEL") {
            self.logging.level = level;
        }
    }
}

/// Embedding provider settings (Ollama-style HTTP endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingProviderConfig {
    /// Base URL of the embedding API.
    #[serde(default = "EmbeddingProviderConfig::default_base_url")]
    pub base_url: String,

    /// Embedding model name.
    #[serde(default = "EmbeddingProviderConfig::default_model")]
    pub model: String,

    /// Per-request timeout in seconds.
    #[serde(default = "EmbeddingProviderConfig::default_timeout_s")]
    pub timeout_s: u64,

    /// Retry attempts for transient failures.
    #[serde(default = "EmbeddingProviderConfig::default_max_retries")]
    pub max_retries: u32,

    /// How long the provider should keep the model loaded between calls.
    #[serde(default = "EmbeddingProviderConfig::default_keep_alive")]
    pub keep_alive: String,
}

impl Default for EmbeddingProviderConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            model: Self::default_model(),
            timeout_s: Self::default_timeout_s(),
            max_retries: Self::default_max_retries(),
            keep_alive: Self::default_keep_alive(),
        }
    }
}

impl EmbeddingProviderConfig {
    fn default_base_url() -> String {
        "http://localhost:11434".into()
    }
    fn default_model() -> String {
        "nomic-embed-text".into()
    }
    fn default_timeout_s() -> u64 {
        60
    }
    fn default_max_retries() -> u32 {
        4
    }
    fn default_keep_alive() -> String {
        "10m".into()
    }
}

/// Watcher timing parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WatcherTuning {
    /// Quiet period after the last relevant event before a rebuild fires.
    #[serde(default = "WatcherTuning::default_debounce_ms")]
    pub debounce_ms: u64,

    /// Minimum gap between consecutive rebuild triggers.
    #[serde(default = "WatcherTuning::default_min_rebuild_gap_ms")]
    pub min_rebuild_gap_ms: u64,

    /// Poll interval while waiting for an in-flight build to finish.
    #[serde(default = "WatcherTuning::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for WatcherTuning {
    fn default() -> Self {
        Self {
            debounce_ms: Self::default_debounce_ms(),
            min_rebuild_gap_ms: Self::default_min_rebuild_gap_ms(),
            poll_interval_ms: Self::default_poll_interval_ms(),
        }
    }
}

impl WatcherTuning {
    fn default_debounce_ms() -> u64 {
        5000
    }
    fn default_min_rebuild_gap_ms() -> u64 {
        2000
    }
    fn default_poll_interval_ms() -> u64 {
        250
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "trace").
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Whether to output logs as JSON.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".into()
    }
}

// ---------------------------------------------------------------------------
// Per-project configuration
// ---------------------------------------------------------------------------

/// Default cap on the size of an indexable file.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 500_000;

/// Per-project configuration, stored as JSON in the registry.
///
/// Glob lists left empty fall back to the repo policy recommendations at
/// build time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Include globs; empty means "use the repo policy".
    #[serde(default)]
    pub include_globs: Vec<String>,

    /// Exclude globs; empty means "use the repo policy".
    #[serde(default)]
    pub exclude_globs: Vec<String>,

    /// Files larger than this are skipped (None = default).
    #[serde(default)]
    pub max_file_bytes: Option<u64>,

    /// Trace (structural graph) settings.
    #[serde(default)]
    pub trace: TraceConfig,

    /// Watcher tuning overrides for this project.
    #[serde(default)]
    pub watcher: Option<WatcherTuning>,

    /// Primer overrides for this project (None = use the repo policy).
    #[serde(default)]
    pub primer: Option<PrimerConfig>,
}

impl ProjectConfig {
    /// Effective max file size for this project.
    pub fn effective_max_file_bytes(&self) -> u64 {
        self.max_file_bytes.unwrap_or(DEFAULT_MAX_FILE_BYTES)
    }
}

/// Trace subsystem settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Whether trace builds and queries are enabled for the project.
    #[serde(default = "TraceConfig::default_enabled")]
    pub enabled: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
        }
    }
}

impl TraceConfig {
    fn default_enabled() -> bool {
        true
    }
}

/// Primer settings: opt-in documents that get a score boost or are prepended
/// to every assembled context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimerConfig {
    /// Whether primer boosting is active.
    #[serde(default = "PrimerConfig::default_enabled")]
    pub enabled: bool,

    /// File basenames treated as primers.
    #[serde(default = "PrimerConfig::default_filenames")]
    pub filenames: Vec<String>,

    /// Additive score boost for primer chunks, clamped to [0, 1].
    #[serde(default = "PrimerConfig::default_score_boost")]
    pub score_boost: f32,

    /// When true, primer chunks are prepended to every assembled context.
    #[serde(default)]
    pub always_include: bool,

    /// Character budget for prepended primer content.
    #[serde(default = "PrimerConfig::default_max_primer_chars")]
    pub max_primer_chars: usize,
}

impl Default for PrimerConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            filenames: Self::default_filenames(),
            score_boost: Self::default_score_boost(),
            always_include: false,
            max_primer_chars: Self::default_max_primer_chars(),
        }
    }
}

impl PrimerConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_filenames() -> Vec<String> {
        vec![
            "AGENTS.md".into(),
            "CODRAG_PRIMER.md".into(),
            "PROJECT_PRIMER.md".into(),
        ]
    }
    fn default_score_boost() -> f32 {
        0.25
    }
    fn default_max_primer_chars() -> usize {
        2000
    }

    /// Clamp out-of-range values into their valid domains.
    pub fn normalized(mut self) -> Self {
        self.score_boost = self.score_boost.clamp(0.0, 1.0);
        self.max_primer_chars = self.max_primer_chars.max(100);
        self.filenames.retain(|f| !f.trim().is_empty());
        if self.filenames.is_empty() {
            self.filenames = Self::default_filenames();
        }
        self
    }

    /// Returns true iff the basename of `source_path` is a primer filename.
    pub fn matches_path(&self, source_path: &str) -> bool {
        let basename = source_path.rsplit('/').next().unwrap_or(source_path);
        self.filenames.iter().any(|f| f == basename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_engine_config() {
        let config = EngineConfig::default();
        assert_eq!(config.embedding.model, "nomic-embed-text");
        assert_eq!(config.embedding.max_retries, 4);
        assert_eq!(config.watcher.debounce_ms, 5000);
        assert_eq!(config.watcher.min_rebuild_gap_ms, 2000);
    }

    #[test]
    fn test_project_config_defaults() {
        let config: ProjectConfig = serde_json::from_str("{}").expect("parse");
        assert!(config.include_globs.is_empty());
        assert!(config.trace.enabled);
        assert_eq!(config.effective_max_file_bytes(), DEFAULT_MAX_FILE_BYTES);
    }

    #[test]
    fn test_primer_defaults() {
        let primer = PrimerConfig::default();
        assert!(primer.enabled);
        assert!(primer.filenames.iter().any(|f| f == "AGENTS.md"));
        assert!((primer.score_boost - 0.25).abs() < f32::EPSILON);
        assert!(!primer.always_include);
        assert_eq!(primer.max_primer_chars, 2000);
    }

    #[test]
    fn test_primer_normalization_clamps() {
        let primer = PrimerConfig {
            score_boost: 3.0,
            max_primer_chars: 10,
            filenames: vec!["  ".into()],
            ..PrimerConfig::default()
        }
        .normalized();
        assert!((primer.score_boost - 1.0).abs() < f32::EPSILON);
        assert_eq!(primer.max_primer_chars, 100);
        assert!(!primer.filenames.is_empty());
    }

    #[test]
    fn test_primer_matches_basename() {
        let primer = PrimerConfig::default();
        assert!(primer.matches_path("AGENTS.md"));
        assert!(primer.matches_path("sub/dir/AGENTS.md"));
        assert!(!primer.matches_path("docs/OTHER.md"));
    }
}
