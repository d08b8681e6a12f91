//! Centralized POSIX-relative glob matching.
//!
//! The chunk enumerator, the trace builder, the watcher, and the profiler all
//! decide file relevance through this one helper so that inclusion and
//! exclusion agree byte-for-byte across subsystems. Paths are matched as
//! repo-relative strings with forward slashes; backslashes are normalized at
//! ingestion.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Normalize a path string to POSIX separators.
pub fn to_posix(path: &str) -> String {
    path.replace('\\', "/")
}

/// A compiled include/exclude filter over repo-relative POSIX paths.
///
/// A path is relevant iff no exclude glob matches AND (the include set is
/// empty OR at least one include glob matches). Each pattern is tried against
/// the full relative path and against the basename, so `*.py` and `**/*.py`
/// behave alike.
#[derive(Debug)]
pub struct PathMatcher {
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl PathMatcher {
    /// Compile a matcher from glob pattern lists.
    ///
    /// Patterns that fail to compile are skipped with a warning; an empty
    /// include list means "include everything".
    pub fn new(include_globs: &[String], exclude_globs: &[String]) -> Self {
        let include = if include_globs.is_empty() {
            None
        } else {
            Some(compile_set(include_globs))
        };
        Self {
            include,
            exclude: compile_set(exclude_globs),
        }
    }

    /// Returns true iff the path passes the exclude set and the include set.
    pub fn is_relevant(&self, rel_posix: &str) -> bool {
        let basename = rel_posix.rsplit('/').next().unwrap_or(rel_posix);

        if self.exclude.is_match(rel_posix) || self.exclude.is_match(basename) {
            return false;
        }

        match &self.include {
            None => true,
            Some(set) => set.is_match(rel_posix) || set.is_match(basename),
        }
    }
}

fn compile_set(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let trimmed = pat.trim();
        if trimmed.is_empty() {
            continue;
        }
        match GlobBuilder::new(trimmed).literal_separator(true).build() {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => {
                tracing::warn!(pattern = %trimmed, error = %e, "skipping invalid glob pattern");
            }
        }
    }
    builder.build().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "glob set failed to compile, matching nothing");
        GlobSet::empty()
    })
}
