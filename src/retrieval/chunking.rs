//! Semantic-aware text chunking for knowledge ingestion.
//!
//! Markdown headings delineate sections, FAQ material stays whole (pipe
//! tables split row-by-row, `Q:`/`A:` blocks kept as one unit), and long
//! bodies are windowed with overlap.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::shared::utils::{estimate_token_count, CHARS_PER_TOKEN};

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub min_chunk_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            overlap_tokens: 64,
            min_chunk_tokens: 16,
        }
    }
}

impl ChunkingConfig {
    fn max_chars(&self) -> usize {
        self.max_tokens * CHARS_PER_TOKEN
    }

    fn overlap_chars(&self) -> usize {
        self.overlap_tokens * CHARS_PER_TOKEN
    }

    fn min_chars(&self) -> usize {
        self.min_chunk_tokens * CHARS_PER_TOKEN
    }
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: Uuid,
    pub content: String,
    pub index: usize,
    pub metadata: HashMap<String, String>,
}

impl Chunk {
    pub fn token_count(&self) -> usize {
        estimate_token_count(&self.content)
    }
}

fn heading_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?m)^#{1,6}\s+.+$").unwrap())
}

fn faq_table_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?im)^\s*\|\s*question\s*\|\s*answer\s*\|").unwrap())
}

fn table_row_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?m)^\s*\|.*\|\s*$").unwrap())
}

/// Split markdown into semantically coherent chunks.
pub fn chunk_markdown(
    text: &str,
    config: &ChunkingConfig,
    base_metadata: &HashMap<String, String>,
) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    for (heading, body) in iter_sections(text) {
        let mut section_metadata = base_metadata.clone();
        if let Some(ref heading) = heading {
            let clean = heading.trim_start_matches('#').trim();
            section_metadata.insert("section".to_string(), clean.to_string());
        }

        if faq_table_pattern().is_match(&body) {
            append_faq_table_chunks(&body, &section_metadata, &mut chunks);
        } else {
            append_body_chunks(&body, config, &section_metadata, &mut chunks);
        }
    }

    for (index, chunk) in chunks.iter_mut().enumerate() {
        chunk.index = index;
        chunk
            .metadata
            .insert("chunk_index".to_string(), index.to_string());
    }
    chunks
}

/// Plain text chunker used for non-markdown formats.
pub fn chunk_plain(
    text: &str,
    config: &ChunkingConfig,
    base_metadata: &HashMap<String, String>,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    append_body_chunks(text, config, base_metadata, &mut chunks);
    for (index, chunk) in chunks.iter_mut().enumerate() {
        chunk.index = index;
        chunk
            .metadata
            .insert("chunk_index".to_string(), index.to_string());
    }
    chunks
}

fn iter_sections(text: &str) -> Vec<(Option<String>, String)> {
    let matches: Vec<_> = heading_pattern().find_iter(text).collect();
    if matches.is_empty() {
        return vec![(None, text.to_string())];
    }

    let mut sections = Vec::new();
    let first_start = matches[0].start();
    if first_start > 0 {
        let intro = text[..first_start].trim();
        if !intro.is_empty() {
            sections.push((None, intro.to_string()));
        }
    }

    for (i, m) in matches.iter().enumerate() {
        let heading = m.as_str().to_string();
        let start = m.end();
        let end = matches
            .get(i + 1)
            .map(|next| next.start())
            .unwrap_or(text.len());
        sections.push((Some(heading), text[start..end].trim().to_string()));
    }
    sections
}

fn append_body_chunks(
    body: &str,
    config: &ChunkingConfig,
    metadata: &HashMap<String, String>,
    out: &mut Vec<Chunk>,
) {
    let paragraphs: Vec<&str> = body
        .split("\n\n")
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();
    if paragraphs.is_empty() {
        return;
    }

    // Q:/A: blocks are treated as FAQ units regardless of surrounding prose.
    let mut assembled: Vec<(String, bool)> = Vec::new();
    let mut current = String::new();
    for paragraph in paragraphs {
        if is_faq_block(paragraph) {
            if !current.is_empty() {
                assembled.push((std::mem::take(&mut current), false));
            }
            assembled.push((paragraph.to_string(), true));
            continue;
        }
        let candidate = if current.is_empty() {
            paragraph.to_string()
        } else {
            format!("{}\n\n{}", current, paragraph)
        };
        if candidate.len() <= config.max_chars() {
            current = candidate;
        } else {
            if !current.is_empty() {
                assembled.push((std::mem::take(&mut current), false));
            }
            current = paragraph.to_string();
        }
    }
    if !current.is_empty() {
        assembled.push((current, false));
    }

    for (segment, is_faq) in assembled {
        if is_faq {
            let mut faq_metadata = metadata.clone();
            faq_metadata.insert("format".to_string(), "faq".to_string());
            out.push(Chunk {
                id: Uuid::new_v4(),
                content: segment,
                index: 0,
                metadata: faq_metadata,
            });
        } else {
            split_segment(&segment, config, metadata, out);
        }
    }
}

fn is_faq_block(paragraph: &str) -> bool {
    let mut has_question = false;
    let mut has_answer = false;
    for line in paragraph.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("Q:") || trimmed.starts_with("q:") {
            has_question = true;
        }
        if trimmed.starts_with("A:") || trimmed.starts_with("a:") {
            has_answer = true;
        }
    }
    has_question && has_answer
}

fn append_faq_table_chunks(body: &str, metadata: &HashMap<String, String>, out: &mut Vec<Chunk>) {
    for row in table_row_pattern().find_iter(body) {
        let row = row.as_str().trim();
        let lowered = row.trim_matches('|').to_lowercase();
        let condensed: String = lowered.chars().filter(|c| *c != '-' && *c != '|').collect();
        if condensed.trim().is_empty() || lowered.trim_start().starts_with("question") {
            continue;
        }
        let cells: Vec<&str> = row
            .trim_matches('|')
            .split('|')
            .map(|c| c.trim())
            .collect();
        if cells.len() >= 2 {
            let mut faq_metadata = metadata.clone();
            faq_metadata.insert("format".to_string(), "faq".to_string());
            out.push(Chunk {
                id: Uuid::new_v4(),
                content: format!("Q: {}\nA: {}", cells[0], cells[1]),
                index: 0,
                metadata: faq_metadata,
            });
        }
    }
}

fn split_segment(
    segment: &str,
    config: &ChunkingConfig,
    metadata: &HashMap<String, String>,
    out: &mut Vec<Chunk>,
) {
    let max_chars = config.max_chars();
    if segment.len() <= max_chars || segment.len() <= config.min_chars() {
        out.push(Chunk {
            id: Uuid::new_v4(),
            content: segment.trim().to_string(),
            index: 0,
            metadata: metadata.clone(),
        });
        return;
    }

    let overlap = config.overlap_chars().min(max_chars.saturating_sub(1));
    let chars: Vec<char> = segment.chars().collect();
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + max_chars).min(chars.len());
        let window: String = chars[start..end].iter().collect();
        let trimmed = window.trim();
        if !trimmed.is_empty() {
            out.push(Chunk {
                id: Uuid::new_v4(),
                content: trimmed.to_string(),
                index: 0,
                metadata: metadata.clone(),
            });
        }
        if end == chars.len() {
            break;
        }
        start = end - overlap;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> Vec<Chunk> {
        chunk_markdown(text, &ChunkingConfig::default(), &HashMap::new())
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk("").is_empty());
        assert!(chunk("   \n\n  ").is_empty());
    }

    #[test]
    fn headings_become_section_metadata() {
        let chunks = chunk("# Shipping\n\nWe ship worldwide within 3 days.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.get("section").unwrap(), "Shipping");
    }

    #[test]
    fn faq_blocks_stay_whole() {
        let chunks = chunk("# FAQ\n\nQ: reset?\nA: press hold 5s.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.get("format").unwrap(), "faq");
        assert!(chunks[0].content.contains("press hold 5s."));
    }

    #[test]
    fn faq_tables_split_per_row() {
        let text = "# Help\n\n| Question | Answer |\n|---|---|\n| How do I reset? | Hold 5s |\n| Warranty? | Two years |\n";
        let chunks = chunk(text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].content.starts_with("Q: How do I reset?"));
        assert!(chunks[1].content.contains("Two years"));
    }

    #[test]
    fn long_bodies_window_with_overlap() {
        let config = ChunkingConfig {
            max_tokens: 25,
            overlap_tokens: 5,
            min_chunk_tokens: 4,
        };
        let body = "word ".repeat(200);
        let chunks = chunk_plain(&body, &config, &HashMap::new());
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.content.len() <= config.max_chars());
        }
        // Consecutive windows must share overlap text.
        let first_tail: String = chunks[0]
            .content
            .chars()
            .rev()
            .take(10)
            .collect::<String>()
            .chars()
            .rev()
            .collect();
        assert!(chunks[1].content.starts_with(first_tail.trim_start()));
    }

    #[test]
    fn chunk_indexes_are_sequential() {
        let text = "# A\n\nfirst\n\n# B\n\nsecond";
        let chunks = chunk(text);
        let indexes: Vec<usize> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indexes, (0..chunks.len()).collect::<Vec<_>>());
    }
}
