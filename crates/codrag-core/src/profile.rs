//! Deterministic repository profiler.
//!
//! A single bounded walk of the repo root produces include/exclude glob
//! recommendations, per-path role labels, and default role weights. The same
//! path-role classifier is reused at build time to assign a role to every
//! chunk, so profiling and indexing agree on what counts as code, docs, or
//! tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::Role;

/// Directory names never descended into during profiling.
const EXCLUDE_DIR_NAMES: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    "dist",
    "build",
    "target",
    ".next",
    ".cache",
    ".mypy_cache",
    ".ruff_cache",
];

const DOC_DIR_NAMES: &[&str] = &[
    "docs",
    "doc",
    "documentation",
    "design",
    "spec",
    "specs",
    "architecture",
    "arch",
    "adr",
    "adrs",
    "decisions",
    "decision",
    "rfc",
    "rfcs",
];

const TEST_DIR_NAMES: &[&str] = &["test", "tests", "__tests__", "testing"];

const CODE_DIR_NAMES: &[&str] = &[
    "src", "lib", "app", "apps", "packages", "pkg", "server", "client", "ui", "frontend",
    "backend", "cmd",
];

/// Marker files consulted for language detection.
const MARKER_FILES: &[&str] = &[
    "pyproject.toml",
    "requirements.txt",
    "setup.py",
    "package.json",
    "pnpm-lock.yaml",
    "yarn.lock",
    "go.mod",
    "Cargo.toml",
    "pom.xml",
    "build.gradle",
    "Makefile",
];

const CODE_EXTS: &[&str] = &[
    ".py", ".js", ".jsx", ".ts", ".tsx", ".go", ".rs", ".java", ".kt", ".kts", ".c", ".h",
    ".cc", ".cpp", ".hpp", ".cs",
];

const DOC_EXTS: &[&str] = &[".md", ".markdown", ".rst", ".txt"];

/// Default role → score multiplier map.
pub fn default_role_weights() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("code".to_string(), 1.0),
        ("tests".to_string(), 0.98),
        ("docs".to_string(), 0.95),
        ("other".to_string(), 0.9),
    ])
}

/// Classify a repo-relative path into a role.
///
/// Tests win over docs win over code win over other, matching the search
/// reweighting contract.
pub fn classify_rel_path(rel_path: &str) -> Role {
    let p = rel_path.replace('\\', "/").to_lowercase();
    let parts: Vec<&str> = p.split('/').filter(|s| !s.is_empty()).collect();

    if parts.iter().any(|part| TEST_DIR_NAMES.contains(part)) {
        return Role::Tests;
    }

    let ext = extension_of(&p);
    if DOC_EXTS.contains(&ext.as_str()) || parts.iter().any(|part| DOC_DIR_NAMES.contains(part)) {
        return Role::Docs;
    }

    if CODE_EXTS.contains(&ext.as_str()) || parts.iter().any(|part| CODE_DIR_NAMES.contains(part)) {
        return Role::Code;
    }

    Role::Other
}

/// Classify a top-level directory name, with a confidence score.
fn classify_dir_name(name: &str) -> (Role, f64) {
    let n = name.to_lowercase();
    let n = n.trim_matches('/');
    if DOC_DIR_NAMES.contains(&n) {
        return (Role::Docs, 0.9);
    }
    if TEST_DIR_NAMES.contains(&n) {
        return (Role::Tests, 0.9);
    }
    if CODE_DIR_NAMES.contains(&n) {
        return (Role::Code, 0.9);
    }
    (Role::Other, 0.5)
}

fn extension_of(path: &str) -> String {
    match path.rsplit('/').next().and_then(|base| base.rfind('.')) {
        Some(idx) if idx > 0 => {
            let base = path.rsplit('/').next().unwrap_or(path);
            base[idx..].to_string()
        }
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Profile output
// ---------------------------------------------------------------------------

/// A role label recommendation for a top-level path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRole {
    /// Glob covering the labeled subtree (e.g. `src/**`).
    pub path: String,
    /// Recommended role.
    pub role: Role,
    /// Heuristic confidence in [0, 1].
    pub confidence: f64,
}

/// Recommended indexing configuration derived from the profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecommendation {
    /// Language + documentation include globs.
    pub include_globs: Vec<String>,
    /// Fixed safety exclude set.
    pub exclude_globs: Vec<String>,
    /// Role → score multipliers.
    pub role_weights: BTreeMap<String, f64>,
}

/// Output of a repository profiling pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoProfile {
    /// Absolute repository root that was profiled.
    pub repo_root: String,
    /// Sorted top-level directory names.
    pub top_level_dirs: Vec<String>,
    /// Marker files present at the root.
    pub marker_files: Vec<String>,
    /// Extension → file count, capped at the most common 30.
    pub extension_counts: BTreeMap<String, usize>,
    /// Detected languages, sorted.
    pub detected_languages: Vec<String>,
    /// Per-top-level-dir role labels.
    pub path_roles: Vec<PathRole>,
    /// Recommended indexing configuration.
    pub recommended: ProfileRecommendation,
}

/// Deterministically profile a repository root.
///
/// The walk is bounded by `max_depth` and `max_files`, skips dot-directories
/// and the fixed exclusion set, and only reads directory entries (never file
/// contents).
pub fn profile_repo(repo_root: &Path, max_depth: usize, max_files: usize) -> RepoProfile {
    let mut top_level_dirs: Vec<String> = Vec::new();
    if let Ok(entries) = std::fs::read_dir(repo_root) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir && !name.starts_with('.') && !EXCLUDE_DIR_NAMES.contains(&name.as_str()) {
                top_level_dirs.push(name);
            }
        }
    }
    top_level_dirs.sort();

    let marker_files: Vec<String> = MARKER_FILES
        .iter()
        .filter(|name| repo_root.join(name).exists())
        .map(|s| s.to_string())
        .collect();

    let mut ext_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut seen = 0usize;
    walk_extensions(repo_root, repo_root, max_depth, max_files, &mut seen, &mut ext_counts);

    let has_marker = |m: &str| marker_files.iter().any(|f| f == m);
    let ext_count = |e: &str| ext_counts.get(e).copied().unwrap_or(0);

    let mut detected: Vec<String> = Vec::new();
    if has_marker("pyproject.toml") || has_marker("requirements.txt") || ext_count(".py") > 0 {
        detected.push("python".into());
    }
    if has_marker("package.json") || ext_count(".ts") > 0 || ext_count(".tsx") > 0 {
        detected.push("typescript".into());
    } else if ext_count(".js") > 0 || ext_count(".jsx") > 0 {
        detected.push("javascript".into());
    }
    if has_marker("go.mod") || ext_count(".go") > 0 {
        detected.push("go".into());
    }
    if has_marker("Cargo.toml") || ext_count(".rs") > 0 {
        detected.push("rust".into());
    }
    if has_marker("pom.xml") || has_marker("build.gradle") || ext_count(".java") > 0 {
        detected.push("java".into());
    }
    detected.sort();

    let mut include_globs: Vec<String> = Vec::new();
    if ext_count(".md") > 0 || repo_root.join("README.md").exists() || repo_root.join("docs").exists()
    {
        include_globs.push("**/*.md".into());
        include_globs.push("**/*.markdown".into());
    }
    if ext_count(".rst") > 0 {
        include_globs.push("**/*.rst".into());
    }
    for lang in &detected {
        match lang.as_str() {
            "python" => include_globs.push("**/*.py".into()),
            "typescript" => {
                include_globs.push("**/*.ts".into());
                include_globs.push("**/*.tsx".into());
            }
            "javascript" => {
                include_globs.push("**/*.js".into());
                include_globs.push("**/*.jsx".into());
            }
            "go" => include_globs.push("**/*.go".into()),
            "rust" => include_globs.push("**/*.rs".into()),
            "java" => {
                include_globs.push("**/*.java".into());
                include_globs.push("**/*.kt".into());
                include_globs.push("**/*.kts".into());
            }
            _ => {}
        }
    }
    include_globs.sort();
    include_globs.dedup();

    let exclude_globs: Vec<String> = vec![
        "**/.git/**".into(),
        "**/node_modules/**".into(),
        "**/__pycache__/**".into(),
        "**/.venv/**".into(),
        "**/venv/**".into(),
        "**/dist/**".into(),
        "**/build/**".into(),
        "**/target/**".into(),
        "**/.next/**".into(),
        "**/.cache/**".into(),
    ];

    let path_roles: Vec<PathRole> = top_level_dirs
        .iter()
        .map(|d| {
            let (role, confidence) = classify_dir_name(d);
            PathRole { path: format!("{d}/**"), role, confidence }
        })
        .collect();

    RepoProfile {
        repo_root: repo_root.to_string_lossy().to_string(),
        top_level_dirs,
        marker_files,
        extension_counts: cap_extension_counts(ext_counts, 30),
        detected_languages: detected,
        path_roles,
        recommended: ProfileRecommendation {
            include_globs,
            exclude_globs,
            role_weights: default_role_weights(),
        },
    }
}

fn walk_extensions(
    root: &Path,
    dir: &Path,
    max_depth: usize,
    max_files: usize,
    seen: &mut usize,
    counts: &mut BTreeMap<String, usize>,
) {
    if *seen >= max_files {
        return;
    }

    let depth = dir.strip_prefix(root).map(|p| p.components().count()).unwrap_or(0);

    let mut entries: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(rd) => rd.flatten().map(|e| e.path()).collect(),
        Err(_) => return,
    };
    entries.sort();

    for path in entries {
        if *seen >= max_files {
            return;
        }
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        if path.is_dir() {
            if name.starts_with('.') || EXCLUDE_DIR_NAMES.contains(&name.as_str()) {
                continue;
            }
            if depth + 1 < max_depth {
                walk_extensions(root, &path, max_depth, max_files, seen, counts);
            }
        } else {
            if name.starts_with('.') {
                continue;
            }
            *seen += 1;
            if let Some(idx) = name.rfind('.') {
                if idx > 0 {
                    let ext = name[idx..].to_lowercase();
                    *counts.entry(ext).or_insert(0) += 1;
                }
            }
        }
    }
}

fn cap_extension_counts(counts: BTreeMap<String, usize>, cap: usize) -> BTreeMap<String, usize> {
    if counts.len() <= cap {
        return counts;
    }
    let mut pairs: Vec<(String, usize)> = counts.into_iter().collect();
    pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    pairs.truncate(cap);
    pairs.into_iter().collect()
}
