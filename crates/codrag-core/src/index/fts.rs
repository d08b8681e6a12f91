//! SQLite FTS5 keyword facility.
//!
//! A single virtual table `fts(chunk_id UNINDEXED, content, source_path,
//! section)` provides BM25-ranked keyword lookup. Queries run on short-lived
//! read connections; the table is rebuilt wholesale during index builds.
//! Query syntax errors from user-supplied text are tolerated by returning no
//! rows.

use std::path::Path;

use rusqlite::Connection;

use crate::error::CoreResult;
use crate::types::ChunkRecord;

fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS fts USING fts5(
            chunk_id UNINDEXED,
            content,
            source_path,
            section
        )",
    )
}

/// Rebuild the keyword index at `path` from the full chunk set.
pub fn rebuild(path: &Path, chunks: &[ChunkRecord]) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut conn = Connection::open(path)?;
    ensure_schema(&conn)?;

    let tx = conn.transaction()?;
    tx.execute("DELETE FROM fts", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO fts(chunk_id, content, source_path, section) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for chunk in chunks {
            stmt.execute((&chunk.id, &chunk.content, &chunk.source_path, &chunk.section))?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Run a BM25-ranked keyword query, returning `(chunk_id, rank)` pairs with
/// lower rank meaning more relevant.
///
/// Missing index files and malformed query syntax both yield an empty result
/// rather than an error: keyword boosting is an enhancement, not a
/// dependency.
pub fn query(path: &Path, query_text: &str, limit: usize) -> Vec<(String, f64)> {
    if !path.exists() {
        return Vec::new();
    }

    let Ok(conn) = Connection::open(path) else {
        return Vec::new();
    };
    if ensure_schema(&conn).is_err() {
        return Vec::new();
    }

    let mut stmt = match conn
        .prepare("SELECT chunk_id, bm25(fts) AS rank FROM fts WHERE fts MATCH ?1 ORDER BY rank LIMIT ?2")
    {
        Ok(stmt) => stmt,
        Err(_) => return Vec::new(),
    };

    let rows = stmt.query_map((query_text, limit as i64), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
    });

    match rows {
        Ok(mapped) => mapped.filter_map(Result::ok).collect(),
        Err(e) => {
            tracing::debug!(error = %e, "FTS query failed, returning no rows");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, Span};

    fn chunk(id: &str, content: &str, source_path: &str) -> ChunkRecord {
        ChunkRecord {
            id: id.to_string(),
            source_path: source_path.to_string(),
            file_hash: "0".repeat(16),
            role: Role::Code,
            section: String::new(),
            span: Span { start_line: 1, end_line: 1 },
            content: content.to_string(),
        }
    }

    #[test]
    fn test_rebuild_and_query() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("fts.sqlite3");

        rebuild(
            &path,
            &[
                chunk("c1", "cache eviction policy LRU", "src/cache.rs"),
                chunk("c2", "bird watching in the park", "docs/birds.md"),
            ],
        )
        .expect("rebuild");

        let rows = query(&path, "cache", 10);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "c1");
    }

    #[test]
    fn test_rank_orders_by_relevance() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("fts.sqlite3");

        rebuild(
            &path,
            &[
                chunk("once", "the cache appears here once among many other words entirely", "a.rs"),
                chunk("many", "cache cache cache cache", "b.rs"),
            ],
        )
        .expect("rebuild");

        let rows = query(&path, "cache", 10);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "many");
        assert!(rows[0].1 <= rows[1].1);
    }

    #[test]
    fn test_rebuild_replaces_rows() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("fts.sqlite3");

        rebuild(&path, &[chunk("old", "stale content", "old.rs")]).expect("rebuild");
        rebuild(&path, &[chunk("new", "fresh content", "new.rs")]).expect("rebuild");

        assert!(query(&path, "stale", 10).is_empty());
        assert_eq!(query(&path, "fresh", 10).len(), 1);
    }

    #[test]
    fn test_missing_file_returns_no_rows() {
        let dir = tempfile::tempdir().expect("create temp dir");
        assert!(query(&dir.path().join("absent.sqlite3"), "anything", 10).is_empty());
    }

    #[test]
    fn test_bad_syntax_returns_no_rows() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("fts.sqlite3");
        rebuild(&path, &[chunk("c1", "content", "a.rs")]).expect("rebuild");

        // Unbalanced quote is an FTS5 syntax error.
        assert!(query(&path, "\"unbalanced", 10).is_empty());
    }
}
