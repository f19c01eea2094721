//! Splits Markdown into overlapping, header-aware chunks (spec.md §4.2).
//!
//! Deterministic: the same input and parameters always produce the same
//! ordered sequence of chunks, byte-for-byte.

use regex::Regex;
use std::sync::LazyLock;

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^(#{1,6})\s+(.+)$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub chunk_index: usize,
    pub section_title: Option<String>,
    pub content: String,
    pub token_count: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    pub chunk_size_chars: usize,
    pub chunk_overlap_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size_chars: 1200,
            chunk_overlap_chars: 150,
        }
    }
}

struct Section {
    title: Option<String>,
    body: String,
}

/// Splits `markdown` into header-delimited sections, then chunks. See
/// spec.md §4.2 for the algorithm this follows step by step.
pub fn chunk_markdown(markdown: &str, config: ChunkerConfig) -> Vec<Chunk> {
    let sections = split_into_sections(markdown);
    let mut pieces: Vec<(Option<String>, String)> = Vec::new();

    for section in sections {
        if section.body.chars().count() <= config.chunk_size_chars {
            pieces.push((section.title, section.body));
            continue;
        }
        for paragraph_piece in split_by_paragraph(&section.body, config) {
            pieces.push((section.title.clone(), paragraph_piece));
        }
    }

    pieces
        .into_iter()
        .filter(|(_, content)| !content.trim().is_empty())
        .enumerate()
        .map(|(idx, (title, content))| {
            let trimmed = content.trim().to_string();
            Chunk {
                chunk_index: idx,
                section_title: title,
                token_count: Some(estimate_tokens(&trimmed)),
                content: trimmed,
            }
        })
        .collect()
}

fn split_into_sections(markdown: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut last_end = 0;
    let mut current_title: Option<String> = None;
    let mut heading_starts: Vec<(usize, usize, String)> = Vec::new();

    for caps in HEADING_RE.captures_iter(markdown) {
        let m = caps.get(0).unwrap();
        let title = caps.get(2).unwrap().as_str().trim().to_string();
        heading_starts.push((m.start(), m.end(), title));
    }

    if heading_starts.is_empty() {
        sections.push(Section {
            title: None,
            body: markdown.to_string(),
        });
        return sections;
    }

    // Preamble before the first heading, if any.
    if heading_starts[0].0 > 0 {
        let preamble = &markdown[..heading_starts[0].0];
        if !preamble.trim().is_empty() {
            sections.push(Section {
                title: None,
                body: preamble.to_string(),
            });
        }
    }

    for (i, (_, heading_end, title)) in heading_starts.iter().enumerate() {
        let body_start = *heading_end;
        let body_end = heading_starts
            .get(i + 1)
            .map(|(start, _, _)| *start)
            .unwrap_or(markdown.len());
        let body = &markdown[body_start..body_end];
        current_title = Some(title.clone());
        sections.push(Section {
            title: current_title.clone(),
            body: format!("# {}\n{}", title, body),
        });
        last_end = body_end;
    }
    let _ = last_end;

    sections
}

/// Groups `body`'s paragraphs (split on blank lines) up to `chunk_size_chars`
/// per piece without breaking a paragraph in two; a paragraph that alone
/// exceeds the budget is handed to [`apply_overlap`] instead. Every boundary
/// this produces — between two paragraph groups, or between a group and the
/// windows of an oversized paragraph's own split — gets the same
/// `chunk_overlap_chars` prefix `apply_overlap` uses for its own internal
/// windows, so no cut this function makes is ever overlap-free (spec.md
/// §4.2 step 3).
fn split_by_paragraph(body: &str, config: ChunkerConfig) -> Vec<String> {
    enum RawPiece {
        Plain(String),
        Oversized(Vec<String>),
    }

    let paragraphs: Vec<&str> = body.split("\n\n").collect();
    let mut groups: Vec<RawPiece> = Vec::new();
    let mut current = String::new();

    for para in paragraphs {
        if para.chars().count() > config.chunk_size_chars {
            if !current.is_empty() {
                groups.push(RawPiece::Plain(std::mem::take(&mut current)));
            }
            groups.push(RawPiece::Oversized(apply_overlap(para, config)));
            continue;
        }
        if current.chars().count() + para.chars().count() + 2 > config.chunk_size_chars && !current.is_empty() {
            groups.push(RawPiece::Plain(std::mem::take(&mut current)));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(para);
    }
    if !current.is_empty() {
        groups.push(RawPiece::Plain(current));
    }

    let mut out: Vec<String> = Vec::new();
    for group in groups {
        match group {
            RawPiece::Plain(text) => {
                out.push(prefix_with_boundary_overlap(&out, text, config.chunk_overlap_chars));
            }
            RawPiece::Oversized(windows) => {
                for (i, window) in windows.into_iter().enumerate() {
                    if i == 0 {
                        out.push(prefix_with_boundary_overlap(&out, window, config.chunk_overlap_chars));
                    } else {
                        out.push(window);
                    }
                }
            }
        }
    }
    out
}

/// Prepends the last `overlap` characters already emitted onto `text`, so a
/// new paragraph group or oversized-paragraph split shares boundary text
/// with whatever piece preceded it, the same way consecutive windows inside
/// a single [`apply_overlap`] call already do. The very first piece in the
/// body (`out` empty) needs no prefix — there is nothing before it to share.
fn prefix_with_boundary_overlap(out: &[String], text: String, overlap: usize) -> String {
    match out.last() {
        Some(prev) if overlap > 0 => {
            let tail: String = prev.chars().rev().take(overlap).collect::<Vec<_>>().into_iter().rev().collect();
            format!("{tail}{text}")
        }
        _ => text,
    }
}

/// Splits one over-budget piece of text into overlapping windows: each
/// successive window begins `chunk_overlap_chars` before the end of its
/// predecessor, except the first (spec.md §4.2 step 3).
fn apply_overlap(content: &str, config: ChunkerConfig) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    if chars.len() <= config.chunk_size_chars {
        return vec![content.to_string()];
    }

    let mut out = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + config.chunk_size_chars).min(chars.len());
        out.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start = end.saturating_sub(config.chunk_overlap_chars).max(start + 1);
    }
    out
}

fn estimate_tokens(content: &str) -> usize {
    (content.chars().count() / 4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_identical_input() {
        let md = "# Title\nSome body text that is short.";
        let a = chunk_markdown(md, ChunkerConfig::default());
        let b = chunk_markdown(md, ChunkerConfig::default());
        assert_eq!(a, b);
    }

    #[test]
    fn empty_chunks_are_stripped() {
        let md = "# A\n\n# B\ncontent";
        let chunks = chunk_markdown(md, ChunkerConfig::default());
        assert!(chunks.iter().all(|c| !c.content.trim().is_empty()));
    }

    #[test]
    fn chunk_index_is_dense() {
        let md = "# A\nfirst\n\n# B\nsecond\n\n# C\nthird";
        let chunks = chunk_markdown(md, ChunkerConfig::default());
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
        }
    }

    #[test]
    fn section_titles_carried_into_chunks() {
        let md = "# Alpha\nBeta gamma delta.";
        let chunks = chunk_markdown(md, ChunkerConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].section_title.as_deref(), Some("Alpha"));
    }

    #[test]
    fn long_section_is_subdivided_with_overlap() {
        let body = "word ".repeat(1000);
        let md = format!("# Big\n{}", body);
        let config = ChunkerConfig {
            chunk_size_chars: 200,
            chunk_overlap_chars: 20,
        };
        let chunks = chunk_markdown(&md, config);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.content.chars().count() <= config.chunk_size_chars + 10);
        }
    }

    #[test]
    fn overlap_windows_share_boundary_text() {
        let body: String = ('a'..='z').cycle().take(900).collect();
        let config = ChunkerConfig {
            chunk_size_chars: 200,
            chunk_overlap_chars: 20,
        };
        let chunks = chunk_markdown(&body, config);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let prev_tail: String = pair[0].content.chars().rev().take(20).collect::<Vec<_>>().into_iter().rev().collect();
            assert!(pair[1].content.starts_with(&prev_tail));
        }
    }

    /// Four under-budget paragraphs, none individually oversized, that each
    /// land in their own paragraph group once joined (600 + 600 + 2 > 1200)
    /// — the grouped-chunk boundary this chunker used to leave overlap-free.
    #[test]
    fn grouped_paragraph_boundaries_share_overlap_text() {
        let paragraphs: Vec<String> = ('1'..='4').map(|c| c.to_string().repeat(600)).collect();
        let body = paragraphs.join("\n\n");
        let config = ChunkerConfig {
            chunk_size_chars: 1200,
            chunk_overlap_chars: 150,
        };
        let chunks = chunk_markdown(&body, config);
        assert_eq!(chunks.len(), 4);
        for pair in chunks.windows(2) {
            let prev_tail: String = pair[0].content.chars().rev().take(150).collect::<Vec<_>>().into_iter().rev().collect();
            assert!(pair[1].content.starts_with(&prev_tail), "expected {:?} to start with {:?}", pair[1].content, prev_tail);
        }
    }
}
