//! Stable content-addressed identifiers.
//!
//! Every artifact the engine persists is addressed by a deterministic id so
//! that rebuilding unchanged content produces byte-identical output. Chunk
//! and file ids are SHA-256 prefixes; trace node and edge ids are readable
//! composites.

use sha2::{Digest, Sha256};

/// First `length` hex chars of the SHA-256 of `text`.
pub fn stable_sha256(text: &str, length: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..length.min(digest.len())].to_string()
}

/// Content hash for a file: first 16 hex of SHA-256 over the raw bytes.
pub fn stable_file_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Chunk id for a markdown chunk: SHA-256(source_path:section:ordinal)[0..16].
pub fn stable_markdown_chunk_id(source_path: &str, section: &str, ordinal: usize) -> String {
    stable_sha256(&format!("{source_path}:{section}:{ordinal}"), 16)
}

/// Chunk id for a code chunk: SHA-256(source_path:ordinal)[0..16].
pub fn stable_code_chunk_id(source_path: &str, ordinal: usize) -> String {
    stable_sha256(&format!("{source_path}:{ordinal}"), 16)
}

/// Trace node id for a file: `file:<repo-relative posix path>`.
pub fn stable_file_node_id(file_path: &str) -> String {
    format!("file:{file_path}")
}

/// Trace node id for a symbol: `sym:<qualname>@<path>:<start_line>`.
pub fn stable_symbol_node_id(qualname: &str, file_path: &str, start_line: u32) -> String {
    format!("sym:{qualname}@{file_path}:{start_line}")
}

/// Trace node id for an external module: `ext:<module_name>`.
pub fn stable_external_module_id(module_name: &str) -> String {
    format!("ext:{module_name}")
}

/// Trace edge id: `edge:<kind>:<source>:<target>[:<disambiguator>]`.
pub fn stable_edge_id(kind: &str, source: &str, target: &str, disambiguator: &str) -> String {
    if disambiguator.is_empty() {
        format!("edge:{kind}:{source}:{target}")
    } else {
        format!("edge:{kind}:{source}:{target}:{disambiguator}")
    }
}
