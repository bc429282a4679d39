//! Line-aware text chunking with overlap.
//!
//! Chunk sizes are measured in approximate tokens (`CHARS_PER_TOKEN` characters
//! each). Lines longer than a whole chunk are split into segments; every other
//! boundary falls between lines so spans map back onto the source file.

use sha2::{Digest, Sha256};

/// Characters per token used to turn token budgets into character budgets.
pub const CHARS_PER_TOKEN: usize = 4;

/// Smallest chunk we will ever produce, in characters.
const MIN_CHUNK_CHARS: usize = 32;

/// A chunk of text with its 1-based inclusive line span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub hash: String,
}

/// Hex SHA-256 of a string.
pub fn hash_text(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Split `content` into chunks of at most `tokens` tokens, consecutive chunks
/// sharing roughly `overlap` tokens of trailing lines.
pub fn chunk_markdown(content: &str, tokens: usize, overlap: usize) -> Vec<Chunk> {
    if content.is_empty() {
        return Vec::new();
    }

    let max_chars = MIN_CHUNK_CHARS.max(tokens * CHARS_PER_TOKEN);
    let overlap_chars = (overlap * CHARS_PER_TOKEN).min(max_chars.saturating_sub(1));

    let mut chunks = Vec::new();
    // (segment, 1-based line number, size in chars including the joining newline)
    let mut current: Vec<(&str, usize, usize)> = Vec::new();
    let mut current_chars = 0usize;
    // Leading entries of `current` that were carried over from the previous chunk.
    let mut carried = 0usize;

    for (idx, line) in content.split('\n').enumerate() {
        let line_no = idx + 1;
        for segment in split_segments(line, max_chars) {
            let size = segment.chars().count() + 1;
            if current_chars + size > max_chars {
                if current.len() > carried {
                    chunks.push(flush(&current));
                    current_chars = carry_overlap(&mut current, overlap_chars);
                    carried = current.len();
                }
                // Overlap alone leaves no room: never emit an overlap-only chunk.
                if current_chars + size > max_chars {
                    current.clear();
                    current_chars = 0;
                    carried = 0;
                }
            }
            current.push((segment, line_no, size));
            current_chars += size;
        }
    }

    if current.len() > carried {
        chunks.push(flush(&current));
    }
    chunks
}

/// Split one line into pieces of at most `max_chars` characters.
fn split_segments(line: &str, max_chars: usize) -> Vec<&str> {
    if line.is_empty() {
        return vec![line];
    }
    let mut segments = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (idx, _) in line.char_indices() {
        if count == max_chars {
            segments.push(&line[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    segments.push(&line[start..]);
    segments
}

fn flush(current: &[(&str, usize, usize)]) -> Chunk {
    let text = current
        .iter()
        .map(|(segment, ..)| *segment)
        .collect::<Vec<_>>()
        .join("\n");
    Chunk {
        start_line: current.first().map_or(1, |c| c.1),
        end_line: current.last().map_or(1, |c| c.1),
        hash: hash_text(&text),
        text,
    }
}

/// Keep trailing segments worth at least `overlap_chars`; returns the kept size.
fn carry_overlap(current: &mut Vec<(&str, usize, usize)>, overlap_chars: usize) -> usize {
    if overlap_chars == 0 {
        current.clear();
        return 0;
    }
    let mut acc = 0;
    let mut keep_from = current.len();
    while keep_from > 0 && acc < overlap_chars {
        keep_from -= 1;
        acc += current[keep_from].2;
    }
    current.drain(..keep_from);
    acc
}
