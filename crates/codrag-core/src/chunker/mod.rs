//! Chunking strategies: heading-based markdown chunking and size-based code
//! chunking.
//!
//! Markdown is split at ATX headings with a heading stack, small sections are
//! coalesced forward, and oversized sections are split at paragraph
//! boundaries. Code is split by a sliding character window with overlap.
//! Both emit deterministic chunk ids and 1-based inclusive line spans.

use crate::ids::{stable_code_chunk_id, stable_markdown_chunk_id};
use crate::types::Span;

/// Default maximum markdown chunk size in chars.
pub const MD_MAX_CHARS: usize = 1800;
/// Markdown sections below this size are coalesced into the next section.
pub const MD_MIN_CHARS: usize = 350;
/// Default maximum code chunk size in chars.
pub const CODE_MAX_CHARS: usize = 2000;
/// Overlap between consecutive code windows.
pub const CODE_OVERLAP_CHARS: usize = 200;

/// A chunk produced by one of the chunkers, prior to embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Deterministic chunk id.
    pub chunk_id: String,
    /// Chunk text, trimmed of leading/trailing whitespace.
    pub content: String,
    /// Repo-relative POSIX source path.
    pub source_path: String,
    /// Optional document name (markdown only).
    pub name: String,
    /// Heading chain joined by " > "; empty for code chunks.
    pub section: String,
    /// 1-based inclusive line span.
    pub span: Span,
    /// Position of this chunk within its file, contiguous from 0.
    pub ordinal: usize,
}

// ---------------------------------------------------------------------------
// Markdown
// ---------------------------------------------------------------------------

struct MdSection {
    headings: Vec<String>,
    text: String,
    start_line: u32,
    end_line: u32,
}

/// Parse an ATX heading line: 1-6 `#` followed by whitespace.
fn parse_heading(line: &str) -> Option<(usize, String)> {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    let mut chars = rest.chars();
    match chars.next() {
        Some(c) if c.is_whitespace() => Some((hashes, rest.trim().to_string())),
        _ => None,
    }
}

/// Iterate markdown sections delimited by ATX headings.
///
/// A heading of level L pops the heading stack down to depth L-1 and pushes
/// itself; each yielded section carries the heading chain active when its
/// body text began.
fn iter_markdown_sections(text: &str) -> Vec<MdSection> {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut sections = Vec::new();
    let mut headings: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_start: Option<u32> = None;
    let mut current_end: Option<u32> = None;

    for (i, line) in lines.iter().enumerate() {
        let line_no = i as u32 + 1;
        if let Some((level, title)) = parse_heading(line) {
            if !current.is_empty() {
                sections.push(MdSection {
                    headings: headings.clone(),
                    text: current.join("\n").trim().to_string(),
                    start_line: current_start.unwrap_or(1),
                    end_line: current_end.unwrap_or_else(|| (line_no - 1).max(1)),
                });
                current.clear();
                current_start = None;
                current_end = None;
            }

            while headings.len() >= level {
                headings.pop();
            }
            headings.push(title);
        } else {
            if current_start.is_none() {
                current_start = Some(line_no);
            }
            current_end = Some(line_no);
            current.push(line);
        }
    }

    if !current.is_empty() {
        sections.push(MdSection {
            headings,
            text: current.join("\n").trim().to_string(),
            start_line: current_start.unwrap_or(1),
            end_line: current_end.unwrap_or_else(|| (lines.len() as u32).max(1)),
        });
    }

    sections
}

/// Split text on runs of two or more newlines (paragraph boundaries).
fn split_paragraphs(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\n' {
            let mut j = i;
            while j < bytes.len() && bytes[j] == b'\n' {
                j += 1;
            }
            if j - i >= 2 {
                out.push(&text[start..i]);
                start = j;
            }
            i = j;
        } else {
            i += 1;
        }
    }
    out.push(&text[start..]);
    out
}

/// Largest char boundary at or below `index`.
fn char_floor(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Split long text at paragraph boundaries; paragraphs larger than
/// `max_chars` are hard-split at `max_chars` boundaries.
fn split_long_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.len() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;

    for para in split_paragraphs(text) {
        let para_len = para.len();
        if current_len + para_len + 2 > max_chars && !current.is_empty() {
            chunks.push(current.join("\n\n"));
            current.clear();
            current_len = 0;
        }

        if para_len > max_chars {
            if !current.is_empty() {
                chunks.push(current.join("\n\n"));
                current.clear();
                current_len = 0;
            }
            let mut i = 0;
            while i < para.len() {
                let end = char_floor(para, (i + max_chars).min(para.len()));
                chunks.push(para[i..end].to_string());
                i = end;
            }
        } else {
            current.push(para);
            current_len += para_len + 2;
        }
    }

    if !current.is_empty() {
        chunks.push(current.join("\n\n"));
    }

    chunks
}

/// Chunk markdown text by headings with size limits.
///
/// Sections below `min_chars` are buffered and joined to following sections
/// while the combined size stays within `max_chars`; on overflow the buffer
/// flushes as its own chunk with its original heading context. Sections above
/// `max_chars` are split at paragraph boundaries.
pub fn chunk_markdown(
    text: &str,
    source_path: &str,
    name: Option<&str>,
    max_chars: usize,
    min_chars: usize,
) -> Vec<Chunk> {
    let name = name.unwrap_or("");
    let mut parts: Vec<Chunk> = Vec::new();
    let mut ordinal = 0usize;

    let emit = |content: &str, section: &str, span: Span, parts: &mut Vec<Chunk>, ordinal: &mut usize| {
        let content = content.trim();
        if content.is_empty() {
            return;
        }
        let chunk_id = stable_markdown_chunk_id(source_path, section, *ordinal);
        parts.push(Chunk {
            chunk_id,
            content: content.to_string(),
            source_path: source_path.to_string(),
            name: name.to_string(),
            section: section.to_string(),
            span,
            ordinal: *ordinal,
        });
        *ordinal += 1;
    };

    let mut pending: Vec<String> = Vec::new();
    let mut pending_section = String::new();
    let mut pending_start: u32 = 1;
    let mut pending_end: u32 = 1;

    for sec in iter_markdown_sections(text) {
        if sec.text.is_empty() {
            continue;
        }

        let section_str = sec.headings.join(" > ");

        if !pending.is_empty() {
            let candidate_len: usize =
                pending.iter().map(String::len).sum::<usize>() + 2 * pending.len() + sec.text.len();
            if candidate_len <= max_chars {
                pending.push(sec.text);
                pending_section = section_str;
                pending_end = sec.end_line;
                continue;
            }

            let combined = pending.join("\n\n");
            emit(
                &combined,
                &pending_section,
                Span { start_line: pending_start, end_line: pending_end },
                &mut parts,
                &mut ordinal,
            );
            pending.clear();
        }

        if sec.text.len() < min_chars {
            pending_section = section_str;
            pending_start = sec.start_line;
            pending_end = sec.end_line;
            pending = vec![sec.text];
            continue;
        }

        let span = Span { start_line: sec.start_line, end_line: sec.end_line };
        if sec.text.len() <= max_chars {
            emit(&sec.text, &section_str, span, &mut parts, &mut ordinal);
            continue;
        }

        for part in split_long_text(&sec.text, max_chars) {
            emit(&part, &section_str, span, &mut parts, &mut ordinal);
        }
    }

    if !pending.is_empty() {
        let combined = pending.join("\n\n");
        emit(
            &combined,
            &pending_section,
            Span { start_line: pending_start, end_line: pending_end },
            &mut parts,
            &mut ordinal,
        );
    }

    parts
}

// ---------------------------------------------------------------------------
// Code
// ---------------------------------------------------------------------------

/// Chunk code text by a sliding character window with overlap.
///
/// Files at or below `max_chars` become a single whole-file chunk. Otherwise
/// the window advances by `max_chars - overlap_chars`; spans are computed
/// from newline counts, and a window ending exactly on a newline does not
/// count the line it opens.
pub fn chunk_code(
    text: &str,
    source_path: &str,
    max_chars: usize,
    overlap_chars: usize,
) -> Vec<Chunk> {
    if text.len() <= max_chars {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let end_line = (text.lines().count() as u32).max(1);
        return vec![Chunk {
            chunk_id: stable_code_chunk_id(source_path, 0),
            content: trimmed.to_string(),
            source_path: source_path.to_string(),
            name: String::new(),
            section: String::new(),
            span: Span { start_line: 1, end_line },
            ordinal: 0,
        }];
    }

    let step = max_chars.saturating_sub(overlap_chars).max(1);
    let bytes = text.as_bytes();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut ordinal = 0usize;

    while start < text.len() {
        let win_start = char_floor(text, start);
        let win_end = char_floor(text, (start + max_chars).min(text.len()));
        let window = &text[win_start..win_end];

        let start_line = count_newlines(&bytes[..win_start]) + 1;
        let mut end_line = count_newlines(&bytes[..win_end]) + 1;
        if win_end > 0 && bytes[win_end - 1] == b'\n' {
            end_line = end_line.saturating_sub(1);
        }
        let end_line = end_line.max(1);

        let trimmed = window.trim();
        if !trimmed.is_empty() {
            chunks.push(Chunk {
                chunk_id: stable_code_chunk_id(source_path, ordinal),
                content: trimmed.to_string(),
                source_path: source_path.to_string(),
                name: String::new(),
                section: String::new(),
                span: Span { start_line, end_line },
                ordinal,
            });
            ordinal += 1;
        }

        start += step;
    }

    chunks
}

fn count_newlines(bytes: &[u8]) -> u32 {
    bytes.iter().filter(|b| **b == b'\n').count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_heading() {
        assert_eq!(parse_heading("# Title"), Some((1, "Title".to_string())));
        assert_eq!(parse_heading("### Deep"), Some((3, "Deep".to_string())));
        assert_eq!(parse_heading("#NoSpace"), None);
        assert_eq!(parse_heading("####### Too deep"), None);
        assert_eq!(parse_heading("plain text"), None);
    }

    #[test]
    fn test_markdown_heading_stack() {
        let text = "# A\n\nalpha body\n\n## B\n\nbeta body\n\n# C\n\ngamma body\n";
        let big = "x".repeat(400);
        let text = text.replace("alpha body", &big).replace("beta body", &big).replace("gamma body", &big);

        let chunks = chunk_markdown(&text, "doc.md", None, MD_MAX_CHARS, MD_MIN_CHARS);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].section, "A");
        assert_eq!(chunks[1].section, "A > B");
        assert_eq!(chunks[2].section, "C");
    }

    #[test]
    fn test_markdown_small_sections_coalesce() {
        let text = "# A\n\nshort one\n\n# B\n\nshort two\n";
        let chunks = chunk_markdown(text, "doc.md", None, MD_MAX_CHARS, MD_MIN_CHARS);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains("short one"));
        assert!(chunks[0].content.contains("short two"));
    }

    #[test]
    fn test_markdown_pending_flushes_on_overflow() {
        let small = "tiny";
        let huge = "y".repeat(1900);
        let text = format!("# A\n\n{small}\n\n# B\n\n{huge}\n");
        let chunks = chunk_markdown(&text, "doc.md", None, MD_MAX_CHARS, MD_MIN_CHARS);
        // The tiny section cannot merge with the huge one: it flushes on its
        // own, then the huge section splits at the hard boundary.
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].content, "tiny");
        assert_eq!(chunks[0].section, "A");
    }

    #[test]
    fn test_markdown_long_section_splits_at_paragraphs() {
        let para = "z".repeat(900);
        let text = format!("# A\n\n{para}\n\n{para}\n\n{para}\n");
        let chunks = chunk_markdown(&text, "doc.md", None, MD_MAX_CHARS, MD_MIN_CHARS);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.content.len() <= MD_MAX_CHARS);
            assert_eq!(c.section, "A");
        }
    }

    #[test]
    fn test_markdown_ordinals_contiguous() {
        let para = "q".repeat(900);
        let text = format!("# A\n\n{para}\n\n{para}\n\n## B\n\n{para}\n");
        let chunks = chunk_markdown(&text, "doc.md", None, MD_MAX_CHARS, MD_MIN_CHARS);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal, i);
        }
        let mut ids: Vec<&str> = chunks.iter().map(|c| c.chunk_id.as_str()).collect();
        ids.dedup();
        assert_eq!(ids.len(), chunks.len());
    }

    #[test]
    fn test_markdown_spans_are_one_based() {
        let body = "b".repeat(400);
        let text = format!("# A\n{body}\n");
        let chunks = chunk_markdown(&text, "doc.md", None, MD_MAX_CHARS, MD_MIN_CHARS);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].span.start_line, 2);
        // The trailing newline yields a final empty line that extends the span.
        assert_eq!(chunks[0].span.end_line, 3);
    }

    #[test]
    fn test_code_single_chunk() {
        let text = "fn main() {\n    println!(\"hi\");\n}\n";
        let chunks = chunk_code(text, "src/main.rs", CODE_MAX_CHARS, CODE_OVERLAP_CHARS);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].span, Span { start_line: 1, end_line: 3 });
        assert_eq!(chunks[0].ordinal, 0);
        assert!(chunks[0].section.is_empty());
    }

    #[test]
    fn test_code_sliding_window() {
        let line = "let x = 1; // padding padding padding\n";
        let text = line.repeat(200); // ~7600 bytes
        let chunks = chunk_code(&text, "big.rs", CODE_MAX_CHARS, CODE_OVERLAP_CHARS);
        assert!(chunks.len() > 1);

        let step = CODE_MAX_CHARS - CODE_OVERLAP_CHARS;
        let expected = text.len().div_ceil(step);
        assert_eq!(chunks.len(), expected);

        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal, i);
            assert!(c.span.start_line >= 1);
            assert!(c.span.start_line <= c.span.end_line);
        }
        // Consecutive windows overlap.
        assert!(chunks[1].span.start_line <= chunks[0].span.end_line);
    }

    #[test]
    fn test_code_window_end_on_newline() {
        // A window whose end offset sits exactly after a newline must not
        // count the line that newline opens.
        let text = "a".repeat(1999) + "\n" + &"b".repeat(3000);
        let chunks = chunk_code(&text, "x.txt", CODE_MAX_CHARS, CODE_OVERLAP_CHARS);
        assert_eq!(chunks[0].span, Span { start_line: 1, end_line: 1 });
    }

    #[test]
    fn test_empty_inputs() {
        assert!(chunk_code("", "x.rs", CODE_MAX_CHARS, CODE_OVERLAP_CHARS).is_empty());
        assert!(chunk_code("   \n  ", "x.rs", CODE_MAX_CHARS, CODE_OVERLAP_CHARS).is_empty());
        assert!(chunk_markdown("", "x.md", None, MD_MAX_CHARS, MD_MIN_CHARS).is_empty());
    }

    #[test]
    fn test_split_paragraphs() {
        assert_eq!(split_paragraphs("a\n\nb"), vec!["a", "b"]);
        assert_eq!(split_paragraphs("a\n\n\n\nb"), vec!["a", "b"]);
        assert_eq!(split_paragraphs("a\nb"), vec!["a\nb"]);
    }
}
