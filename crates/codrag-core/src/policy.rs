//! Repo policy store.
//!
//! The profiler's recommendations are persisted as `repo_policy.json` inside
//! the index directory and reconciled with the live repo root on load: a
//! policy written for a different root is regenerated rather than trusted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::PrimerConfig;
use crate::error::CoreResult;
use crate::profile::{self, PathRole, RepoProfile};

/// Filename of the persisted policy inside an index directory.
pub const POLICY_FILENAME: &str = "repo_policy.json";

/// Current policy schema version.
pub const POLICY_VERSION: &str = "1.0";

/// Persisted per-repository indexing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoPolicy {
    /// Policy schema version.
    pub version: String,
    /// UTC ISO-8601 creation timestamp.
    pub created_at: String,
    /// Absolute repo root the policy was generated for.
    pub repo_root: String,
    /// Include globs for candidate enumeration.
    pub include_globs: Vec<String>,
    /// Exclude globs applied after inclusion.
    pub exclude_globs: Vec<String>,
    /// Role → score multipliers used by search.
    pub role_weights: BTreeMap<String, f64>,
    /// Primer configuration.
    pub primer: PrimerConfig,
    /// Profiler metadata: per-path role labels.
    pub path_roles: Vec<PathRole>,
    /// Profiler metadata: detected languages.
    pub detected_languages: Vec<String>,
    /// Profiler metadata: marker files present at the root.
    pub marker_files: Vec<String>,
}

impl RepoPolicy {
    /// Build a policy from a profile.
    pub fn from_profile(profile: RepoProfile, repo_root: &Path) -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            repo_root: repo_root.to_string_lossy().to_string(),
            include_globs: normalize_globs(profile.recommended.include_globs),
            exclude_globs: normalize_globs(profile.recommended.exclude_globs),
            role_weights: normalize_role_weights(profile.recommended.role_weights),
            primer: PrimerConfig::default(),
            path_roles: profile.path_roles,
            detected_languages: profile.detected_languages,
            marker_files: profile.marker_files,
        }
    }

    /// Normalize in-place after loading from disk: drop blank globs, fall
    /// back to default role weights when the map is empty, clamp primer
    /// values into their domains.
    fn normalized(mut self) -> Self {
        self.include_globs = normalize_globs(self.include_globs);
        self.exclude_globs = normalize_globs(self.exclude_globs);
        self.role_weights = normalize_role_weights(self.role_weights);
        self.primer = self.primer.normalized();
        self
    }
}

fn normalize_globs(globs: Vec<String>) -> Vec<String> {
    globs.into_iter().filter(|g| !g.trim().is_empty()).collect()
}

fn normalize_role_weights(weights: BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let filtered: BTreeMap<String, f64> = weights
        .into_iter()
        .filter(|(k, v)| !k.is_empty() && v.is_finite())
        .collect();
    if filtered.is_empty() {
        profile::default_role_weights()
    } else {
        filtered
    }
}

/// Path of the policy file for an index directory.
pub fn policy_path_for_index(index_dir: &Path) -> PathBuf {
    index_dir.join(POLICY_FILENAME)
}

/// Load a policy file, returning None when missing or unparseable.
pub fn load_repo_policy(path: &Path) -> Option<RepoPolicy> {
    let content = std::fs::read_to_string(path).ok()?;
    let policy: RepoPolicy = serde_json::from_str(&content).ok()?;
    Some(policy.normalized())
}

/// Write a policy file, creating parent directories as needed.
pub fn write_repo_policy(path: &Path, policy: &RepoPolicy) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(policy)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Ensure a valid policy exists for the index directory.
///
/// Reuses the existing file when it matches the live `repo_root`; otherwise
/// (or when `force` is set) profiles the repository and writes a fresh
/// policy.
pub fn ensure_repo_policy(index_dir: &Path, repo_root: &Path, force: bool) -> CoreResult<RepoPolicy> {
    let path = policy_path_for_index(index_dir);

    if !force {
        if let Some(existing) = load_repo_policy(&path) {
            if existing.repo_root == repo_root.to_string_lossy() {
                return Ok(existing);
            }
            tracing::info!(
                stored_root = %existing.repo_root,
                live_root = %repo_root.display(),
                "repo policy root mismatch, regenerating"
            );
        }
    }

    let profile = profile::profile_repo(repo_root, 4, 5000);
    let policy = RepoPolicy::from_profile(profile, repo_root);
    write_repo_policy(&path, &policy)?;
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_creates_and_reuses() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = dir.path().join("repo");
        let index = dir.path().join("index");
        std::fs::create_dir_all(&repo).expect("mkdir");
        std::fs::write(repo.join("main.py"), "def main(): pass\n").expect("write");

        let first = ensure_repo_policy(&index, &repo, false).expect("ensure");
        assert!(policy_path_for_index(&index).exists());
        assert!(first.include_globs.contains(&"**/*.py".to_string()));

        let second = ensure_repo_policy(&index, &repo, false).expect("ensure");
        assert_eq!(first.created_at, second.created_at);
    }

    #[test]
    fn test_root_mismatch_regenerates() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo_a = dir.path().join("a");
        let repo_b = dir.path().join("b");
        let index = dir.path().join("index");
        std::fs::create_dir_all(&repo_a).expect("mkdir");
        std::fs::create_dir_all(&repo_b).expect("mkdir");
        std::fs::write(repo_a.join("x.py"), "x").expect("write");
        std::fs::write(repo_b.join("y.go"), "y").expect("write");

        let a = ensure_repo_policy(&index, &repo_a, false).expect("ensure");
        assert_eq!(a.repo_root, repo_a.to_string_lossy());

        let b = ensure_repo_policy(&index, &repo_b, false).expect("ensure");
        assert_eq!(b.repo_root, repo_b.to_string_lossy());
        assert!(b.include_globs.contains(&"**/*.go".to_string()));
    }

    #[test]
    fn test_force_regenerates() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = dir.path().join("repo");
        let index = dir.path().join("index");
        std::fs::create_dir_all(&repo).expect("mkdir");
        std::fs::write(repo.join("x.py"), "x").expect("write");

        let first = ensure_repo_policy(&index, &repo, false).expect("ensure");
        std::fs::write(repo.join("y.rs"), "y").expect("write");
        let forced = ensure_repo_policy(&index, &repo, true).expect("ensure");
        assert!(forced.include_globs.contains(&"**/*.rs".to_string()));
        assert!(!first.include_globs.contains(&"**/*.rs".to_string()));
    }

    #[test]
    fn test_corrupt_policy_is_regenerated() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = dir.path().join("repo");
        let index = dir.path().join("index");
        std::fs::create_dir_all(&repo).expect("mkdir");
        std::fs::create_dir_all(&index).expect("mkdir");
        std::fs::write(repo.join("x.py"), "x").expect("write");
        std::fs::write(policy_path_for_index(&index), "{ not json").expect("write");

        let policy = ensure_repo_policy(&index, &repo, false).expect("ensure");
        assert_eq!(policy.version, POLICY_VERSION);
    }

    #[test]
    fn test_empty_role_weights_fall_back_to_defaults() {
        let weights = normalize_role_weights(BTreeMap::new());
        assert!((weights["code"] - 1.0).abs() < f64::EPSILON);
    }
}
