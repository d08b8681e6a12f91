//! Error types for codrag-core.
//!
//! Uses a hierarchical error enum so callers can pattern-match on the
//! condition that failed. Each variant corresponds to one error kind of the
//! engine contract; mapping to a wire envelope (if any) happens at the
//! boundary, not here.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for all codrag-core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    // ---- Caller errors (reported, never retried) ----
    /// Caller supplied an invalid argument (empty query, bad mode, bad range).
    #[error("validation error: {message}")]
    Validation {
        /// What was wrong with the input.
        message: String,
    },

    /// The addressed project does not exist in the registry.
    #[error("project not found: {project_id}")]
    ProjectNotFound {
        /// The id that failed to resolve.
        project_id: String,
    },

    /// A project with the same root path is already registered.
    #[error("project already exists for path: {path}")]
    ProjectAlreadyExists {
        /// The conflicting absolute root path.
        path: String,
    },

    // ---- Not ready (operation needs a committed index) ----
    /// The embedding index for the project has not been built or failed to load.
    #[error("index not built for project {project_id}; run a build first")]
    IndexNotBuilt {
        /// The project whose index is missing.
        project_id: String,
    },

    /// The trace index for the project has not been built or failed to load.
    #[error("trace not built for project {project_id}; run a trace build first")]
    TraceNotBuilt {
        /// The project whose trace is missing.
        project_id: String,
    },

    /// Trace support is disabled in the project configuration.
    #[error("trace is disabled for project {project_id}")]
    TraceDisabled {
        /// The project with trace disabled.
        project_id: String,
    },

    /// A trace node lookup missed.
    #[error("node not found: {node_id}")]
    NodeNotFound {
        /// The id that failed to resolve.
        node_id: String,
    },

    // ---- Conflict (caller may poll and retry later) ----
    /// A build is already running for the addressed project.
    #[error("build already running for project {project_id}")]
    BuildAlreadyRunning {
        /// The busy project.
        project_id: String,
    },

    /// A trace build is already running for the addressed project.
    #[error("trace build already running for project {project_id}")]
    TraceBuildAlreadyRunning {
        /// The busy project.
        project_id: String,
    },

    // ---- External / transient ----
    /// An external capability (embedding provider, FTS) failed after retries.
    #[error("transient failure in {source_name}: {message}")]
    Transient {
        /// Which capability failed.
        source_name: String,
        /// Human-readable cause, preserved from the underlying error.
        message: String,
    },

    // ---- Durability ----
    /// On-disk index state failed to parse or is internally inconsistent.
    /// Treated as "index not loaded"; a subsequent build regenerates cleanly.
    #[error("corrupt index state at {path}: {message}")]
    Corruption {
        /// The file or directory that failed.
        path: PathBuf,
        /// Diagnostic details.
        message: String,
    },

    /// A build failed. The previous committed index (if any) is unchanged.
    #[error("build failed: {message}")]
    Build {
        /// Human-readable failure description.
        message: String,
    },

    /// Refused to purge an index directory outside its allowed containment.
    #[error("refusing to purge index directory outside containment: {path}")]
    PurgeRefused {
        /// The directory that would have been removed.
        path: PathBuf,
    },

    // ---- Wrapped external errors ----
    /// SQLite error (registry or FTS).
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl CoreError {
    /// Shorthand for a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::Validation { message: message.into() }
    }
}

/// Convenience type alias for Results in codrag-core.
pub type CoreResult<T> = Result<T, CoreError>;
