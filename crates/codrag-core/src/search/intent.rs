//! Query intent classification for role-aware reweighting.
//!
//! Queries are bucketed into {docs, tests, code, default} by exact token
//! match against fixed vocabularies. Tests win over docs win over code win
//! over default. Each bucket maps to a fixed table of per-role score
//! multipliers; the tables are part of the ranking contract.

use crate::types::Role;

/// Tokens signalling a tests-oriented query.
const TESTS_VOCAB: &[&str] = &[
    "test", "tests", "testing", "unittest", "pytest", "spec", "specs", "fixture", "fixtures",
    "mock", "mocks", "assert", "assertion", "coverage", "regression", "e2e",
];

/// Tokens signalling a docs-oriented query.
const DOCS_VOCAB: &[&str] = &[
    "docs", "doc", "documentation", "readme", "guide", "tutorial", "overview", "architecture",
    "design", "adr", "rfc", "changelog", "manual", "howto", "faq",
];

/// Tokens signalling a code-oriented query.
const CODE_VOCAB: &[&str] = &[
    "code", "function", "functions", "class", "classes", "method", "methods", "impl",
    "implementation", "struct", "module", "api", "refactor", "bug", "fix", "import",
    "signature", "compile",
];

/// Coarse classification of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Query is about documentation.
    Docs,
    /// Query is about tests.
    Tests,
    /// Query is about implementation code.
    Code,
    /// No vocabulary match; neutral weighting.
    Default,
}

impl Intent {
    /// Classify a query by token match. Tests > docs > code > default.
    pub fn classify(query: &str) -> Self {
        let lowered = query.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
            .collect();

        if tokens.iter().any(|t| TESTS_VOCAB.contains(t)) {
            return Intent::Tests;
        }
        if tokens.iter().any(|t| DOCS_VOCAB.contains(t)) {
            return Intent::Docs;
        }
        if tokens.iter().any(|t| CODE_VOCAB.contains(t)) {
            return Intent::Code;
        }
        Intent::Default
    }

    /// Score multiplier for a chunk role under this intent.
    pub fn role_multiplier(&self, role: Role) -> f32 {
        match self {
            Intent::Docs => match role {
                Role::Docs => 1.15,
                Role::Code => 0.98,
                Role::Tests => 0.98,
                Role::Other => 0.95,
            },
            Intent::Tests => match role {
                Role::Tests => 1.12,
                Role::Code => 1.00,
                Role::Docs => 0.95,
                Role::Other => 0.95,
            },
            Intent::Code => match role {
                Role::Code => 1.08,
                Role::Tests => 1.00,
                Role::Docs => 0.93,
                Role::Other => 0.90,
            },
            Intent::Default => 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_tests() {
        assert_eq!(Intent::classify("how do I test the cache"), Intent::Tests);
        assert_eq!(Intent::classify("pytest fixture for auth"), Intent::Tests);
    }

    #[test]
    fn test_classify_docs() {
        assert_eq!(Intent::classify("architecture overview"), Intent::Docs);
        assert_eq!(Intent::classify("where is the readme"), Intent::Docs);
    }

    #[test]
    fn test_classify_code() {
        assert_eq!(Intent::classify("function that parses headers"), Intent::Code);
        assert_eq!(Intent::classify("fix the import bug"), Intent::Code);
    }

    #[test]
    fn test_tests_wins_over_docs_wins_over_code() {
        assert_eq!(Intent::classify("test documentation code"), Intent::Tests);
        assert_eq!(Intent::classify("docs for this function"), Intent::Docs);
    }

    #[test]
    fn test_classify_default() {
        assert_eq!(Intent::classify("cache eviction"), Intent::Default);
        assert_eq!(Intent::classify(""), Intent::Default);
    }

    #[test]
    fn test_default_multipliers_are_neutral() {
        for role in [Role::Code, Role::Docs, Role::Tests, Role::Other] {
            assert!((Intent::Default.role_multiplier(role) - 1.0).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn test_intent_boosts_matching_role() {
        assert!(Intent::Docs.role_multiplier(Role::Docs) > 1.0);
        assert!(Intent::Tests.role_multiplier(Role::Tests) > 1.0);
        assert!(Intent::Code.role_multiplier(Role::Code) > 1.0);
        assert!(Intent::Code.role_multiplier(Role::Other) < 1.0);
    }
}
