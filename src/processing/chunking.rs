//! Token-window chunking for ingested documents.
//!
//! Tokens are whitespace-delimited words. Every strategy produces chunks whose token ranges
//! tile the document: each chunk starts at or before the end of the previous one, so dropping
//! the repeated prefix of every chunk reconstructs the original token stream.
//!
//! - `whitespace`: a fixed window of `chunk_size` tokens stepping by `chunk_size - overlap`.
//! - `structured`: lines are accumulated whole; a chunk is flushed before the line that would
//!   overflow it, and the last `overlap` tokens seed the next chunk.
//! - `adaptive`: paragraphs and Markdown headings are the units. Headings close the running
//!   chunk without carrying overlap, so chunks stay inside one section unless the section
//!   itself is larger than `chunk_size`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::types::{Chunk, ChunkMetadata, ChunkingError};

/// Chunking algorithm selected for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    /// Uniform sliding window over the flat token stream.
    #[default]
    Whitespace,
    /// Line-aware accumulation.
    Structured,
    /// Paragraph and heading aware accumulation.
    Adaptive,
}

impl ChunkingStrategy {
    /// Stable lowercase name of the strategy.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Whitespace => "whitespace",
            Self::Structured => "structured",
            Self::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for ChunkingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkingStrategy {
    type Err = ChunkingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "whitespace" => Ok(Self::Whitespace),
            "structured" => Ok(Self::Structured),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(ChunkingError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Fully resolved chunking parameters for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOptions {
    /// Maximum tokens per chunk.
    pub chunk_size: usize,
    /// Tokens repeated at the start of the next chunk.
    pub overlap: usize,
    /// Algorithm used to place chunk boundaries.
    pub strategy: ChunkingStrategy,
}

impl ChunkOptions {
    /// Reject configurations that cannot make progress.
    pub fn validate(&self) -> Result<(), ChunkingError> {
        if self.chunk_size == 0 {
            return Err(ChunkingError::InvalidChunkSize);
        }
        if self.overlap >= self.chunk_size {
            return Err(ChunkingError::OverlapTooLarge {
                overlap: self.overlap,
                chunk_size: self.chunk_size,
            });
        }
        Ok(())
    }
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            overlap: 64,
            strategy: ChunkingStrategy::Whitespace,
        }
    }
}

/// Split `text` into chunks for `document_id`.
///
/// Pure and deterministic. Returns an empty list for empty or whitespace-only text and fails
/// only when `options` is invalid.
pub fn chunk(
    document_id: &str,
    text: &str,
    options: &ChunkOptions,
) -> Result<Vec<Chunk>, ChunkingError> {
    options.validate()?;

    let lines = tokenize_lines(text);
    let tokens: Vec<&str> = lines.iter().flat_map(|line| line.tokens.iter().copied()).collect();
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    let mut window = Window::new(document_id, &tokens, options);
    match options.strategy {
        ChunkingStrategy::Whitespace => window.push_unit(0, tokens.len()),
        ChunkingStrategy::Structured => {
            for line in lines.iter().filter(|line| !line.is_blank()) {
                window.push_unit(line.start, line.end());
            }
        }
        ChunkingStrategy::Adaptive => {
            for segment in segment_sections(&lines) {
                match segment {
                    Segment::Heading { start, end } => {
                        window.flush(false);
                        window.push_unit(start, end);
                        if window.len() >= options.chunk_size {
                            window.flush(true);
                        }
                    }
                    Segment::Paragraph { lines: para } => window.push_paragraph(&para),
                }
            }
        }
    }
    window.flush(false);

    let chunks = window.finish();
    tracing::trace!(
        document_id,
        strategy = %options.strategy,
        tokens = tokens.len(),
        chunks = chunks.len(),
        "Chunked document"
    );
    Ok(chunks)
}

struct Line<'a> {
    start: usize,
    tokens: Vec<&'a str>,
    heading: bool,
}

impl Line<'_> {
    fn end(&self) -> usize {
        self.start + self.tokens.len()
    }

    fn is_blank(&self) -> bool {
        self.tokens.is_empty()
    }
}

fn tokenize_lines(text: &str) -> Vec<Line<'_>> {
    let mut offset = 0;
    text.lines()
        .map(|raw| {
            let tokens: Vec<&str> = raw.split_whitespace().collect();
            let line = Line {
                start: offset,
                heading: is_heading(raw),
                tokens,
            };
            offset = line.end();
            line
        })
        .collect()
}

/// Markdown ATX heading: one or more `#` followed by whitespace.
fn is_heading(line: &str) -> bool {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    hashes > 0
        && trimmed[hashes..]
            .chars()
            .next()
            .is_some_and(char::is_whitespace)
}

enum Segment {
    Heading { start: usize, end: usize },
    Paragraph { lines: Vec<(usize, usize)> },
}

fn segment_sections(lines: &[Line<'_>]) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut paragraph: Vec<(usize, usize)> = Vec::new();

    for line in lines {
        if line.is_blank() || line.heading {
            if !paragraph.is_empty() {
                segments.push(Segment::Paragraph {
                    lines: std::mem::take(&mut paragraph),
                });
            }
            if line.heading && !line.is_blank() {
                segments.push(Segment::Heading {
                    start: line.start,
                    end: line.end(),
                });
            }
            continue;
        }
        paragraph.push((line.start, line.end()));
    }
    if !paragraph.is_empty() {
        segments.push(Segment::Paragraph { lines: paragraph });
    }
    segments
}

/// Running accumulator over a contiguous token range `[start, end)`.
///
/// Units are always pushed in document order, so a unit starts exactly at `end`.
struct Window<'a> {
    document_id: &'a str,
    tokens: &'a [&'a str],
    chunk_size: usize,
    overlap: usize,
    start: usize,
    end: usize,
    emitted_end: usize,
    chunks: Vec<Chunk>,
}

impl<'a> Window<'a> {
    fn new(document_id: &'a str, tokens: &'a [&'a str], options: &ChunkOptions) -> Self {
        Self {
            document_id,
            tokens,
            chunk_size: options.chunk_size,
            overlap: options.overlap,
            start: 0,
            end: 0,
            emitted_end: 0,
            chunks: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.end - self.start
    }

    fn has_pending(&self) -> bool {
        self.end > self.emitted_end
    }

    fn push_unit(&mut self, unit_start: usize, unit_end: usize) {
        debug_assert_eq!(unit_start, self.end);
        let unit_len = unit_end - unit_start;
        if self.len() + unit_len <= self.chunk_size {
            self.end = unit_end;
            return;
        }

        if self.has_pending() && self.len() > self.overlap {
            self.flush(true);
        }
        if self.len() + unit_len <= self.chunk_size {
            self.end = unit_end;
            return;
        }

        // Slide a fixed window from the pending start across the unit.
        let step = self.chunk_size - self.overlap;
        let mut window_start = self.start;
        while window_start + self.chunk_size < unit_end {
            self.emit(window_start, window_start + self.chunk_size);
            window_start += step;
        }
        self.start = window_start;
        self.end = unit_end;
    }

    fn push_paragraph(&mut self, lines: &[(usize, usize)]) {
        let (Some(&(para_start, _)), Some(&(_, para_end))) = (lines.first(), lines.last()) else {
            return;
        };
        let para_len = para_end - para_start;
        if self.len() + para_len <= self.chunk_size {
            self.end = para_end;
            return;
        }
        if self.has_pending() && self.len() > self.overlap {
            self.flush(true);
        }
        if self.len() + para_len <= self.chunk_size {
            self.end = para_end;
            return;
        }
        for &(start, end) in lines {
            self.push_unit(start, end);
        }
    }

    /// Emit pending tokens, then either keep the trailing overlap or start empty.
    fn flush(&mut self, carry_overlap: bool) {
        if self.has_pending() {
            self.emit(self.start, self.end);
        }
        self.start = if carry_overlap {
            self.end - self.overlap.min(self.len())
        } else {
            self.end
        };
    }

    fn emit(&mut self, start: usize, end: usize) {
        let chunk_index = self.chunks.len();
        self.chunks.push(Chunk {
            id: format!("{}-{}", self.document_id, chunk_index),
            text: self.tokens[start..end].join(" "),
            metadata: ChunkMetadata {
                chunk_index,
                start_token: start,
                end_token: end,
            },
        });
        self.emitted_end = end;
    }

    fn finish(self) -> Vec<Chunk> {
        self.chunks
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn options(chunk_size: usize, overlap: usize, strategy: ChunkingStrategy) -> ChunkOptions {
        ChunkOptions {
            chunk_size,
            overlap,
            strategy,
        }
    }

    fn numbered_words(count: usize) -> String {
        (0..count)
            .map(|i| format!("w{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn assert_tiles(text: &str, chunks: &[Chunk]) {
        let original: Vec<&str> = text.split_whitespace().collect();
        let mut rebuilt: Vec<String> = Vec::new();
        let mut covered = 0;
        for (expected_index, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.metadata.chunk_index, expected_index);
            assert!(chunk.metadata.start_token <= covered, "gap before {}", chunk.id);
            let words: Vec<&str> = chunk.text.split_whitespace().collect();
            assert_eq!(
                words.len(),
                chunk.metadata.end_token - chunk.metadata.start_token
            );
            let fresh = covered - chunk.metadata.start_token;
            rebuilt.extend(words[fresh..].iter().map(|w| w.to_string()));
            covered = chunk.metadata.end_token;
        }
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn whitespace_window_matches_documented_offsets() {
        let text = numbered_words(100);
        let chunks = chunk("doc", &text, &options(30, 10, ChunkingStrategy::Whitespace)).unwrap();

        let starts: Vec<usize> = chunks.iter().map(|c| c.metadata.start_token).collect();
        assert_eq!(starts, vec![0, 20, 40, 60, 80]);
        assert_eq!(chunks.last().unwrap().metadata.end_token, 100);
        assert_eq!(chunks[0].id, "doc-0");
        assert_eq!(chunks[4].id, "doc-4");
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].metadata.end_token - pair[1].metadata.start_token, 10);
        }
        assert_tiles(&text, &chunks);
    }

    #[test]
    fn whitespace_short_document_is_single_chunk() {
        let chunks = chunk("doc", "one two three", &options(30, 10, ChunkingStrategy::Whitespace))
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "one two three");
    }

    #[test]
    fn empty_and_blank_text_produce_no_chunks() {
        for strategy in [
            ChunkingStrategy::Whitespace,
            ChunkingStrategy::Structured,
            ChunkingStrategy::Adaptive,
        ] {
            assert!(chunk("doc", "", &options(4, 1, strategy)).unwrap().is_empty());
            assert!(chunk("doc", "  \n\t \n", &options(4, 1, strategy)).unwrap().is_empty());
        }
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let zero = chunk("doc", "a b", &options(0, 0, ChunkingStrategy::Whitespace)).unwrap_err();
        assert!(matches!(zero, ChunkingError::InvalidChunkSize));

        let overlap = chunk("doc", "a b", &options(4, 4, ChunkingStrategy::Structured)).unwrap_err();
        assert!(matches!(
            overlap,
            ChunkingError::OverlapTooLarge {
                overlap: 4,
                chunk_size: 4
            }
        ));
    }

    #[test]
    fn oversized_token_is_kept_as_its_own_chunk() {
        let long = "x".repeat(5_000);
        let text = format!("a {long} b");
        let chunks = chunk("doc", &text, &options(1, 0, ChunkingStrategy::Whitespace)).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].text, long);
    }

    #[test]
    fn structured_flushes_before_overflowing_line() {
        let text = "a b c\nd e f\ng h";
        let chunks = chunk("doc", text, &options(6, 1, ChunkingStrategy::Structured)).unwrap();

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["a b c d e f", "f g h"]);
        assert_tiles(text, &chunks);
    }

    #[test]
    fn structured_splits_lines_longer_than_chunk_size() {
        let text = format!("head\n{}\ntail", numbered_words(12));
        let chunks = chunk("doc", &text, &options(5, 2, ChunkingStrategy::Structured)).unwrap();
        assert!(chunks.iter().all(|c| c.metadata.end_token - c.metadata.start_token <= 5));
        assert_tiles(&text, &chunks);
    }

    #[test]
    fn short_pending_line_is_carried_into_a_long_one() {
        let text = "a\nb c d e f\ng h";
        let chunks = chunk("doc", text, &options(5, 4, ChunkingStrategy::Structured)).unwrap();

        let ranges: Vec<(usize, usize)> = chunks
            .iter()
            .map(|c| (c.metadata.start_token, c.metadata.end_token))
            .collect();
        assert_eq!(ranges, vec![(0, 5), (1, 6), (2, 7), (3, 8)]);
        assert_tiles(text, &chunks);
    }

    fn lines_of_words(line_lengths: &[usize]) -> String {
        let mut next = 0;
        line_lengths
            .iter()
            .map(|&len| {
                let line = (next..next + len)
                    .map(|i| format!("w{i}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                next += len;
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    proptest! {
        #[test]
        fn consecutive_chunks_share_exactly_the_overlap(
            line_lengths in prop::collection::vec(1usize..12, 1..20),
            chunk_size in 1usize..16,
            overlap_seed in 0usize..16,
            structured in any::<bool>(),
        ) {
            let overlap = overlap_seed % chunk_size;
            let strategy = if structured {
                ChunkingStrategy::Structured
            } else {
                ChunkingStrategy::Whitespace
            };
            let text = lines_of_words(&line_lengths);
            let chunks = chunk("doc", &text, &options(chunk_size, overlap, strategy)).unwrap();

            prop_assert!(!chunks.is_empty());
            for c in &chunks {
                prop_assert!(c.metadata.end_token - c.metadata.start_token <= chunk_size);
            }
            for pair in chunks.windows(2) {
                prop_assert_eq!(pair[0].metadata.end_token - pair[1].metadata.start_token, overlap);
            }
            assert_tiles(&text, &chunks);
        }
    }

    #[test]
    fn adaptive_keeps_sections_apart() {
        let text = "# Intro\nalpha beta\n\n# Usage\ngamma delta";
        let chunks = chunk("doc", text, &options(10, 2, ChunkingStrategy::Adaptive)).unwrap();

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["# Intro alpha beta", "# Usage gamma delta"]);
        assert_tiles(text, &chunks);
    }

    #[test]
    fn adaptive_applies_overlap_inside_large_sections() {
        let body = (0..4)
            .map(|p| numbered_words(6).replace('w', &format!("p{p}w")))
            .collect::<Vec<_>>()
            .join("\n\n");
        let text = format!("## Big section\n{body}\n# Next\nshort text");
        let chunks = chunk("doc", &text, &options(8, 2, ChunkingStrategy::Adaptive)).unwrap();

        assert!(chunks.iter().any(|c| c.text.starts_with("# Next")));
        assert!(chunks.iter().all(|c| c.metadata.end_token - c.metadata.start_token <= 8));
        assert_tiles(&text, &chunks);
    }

    #[test]
    fn adaptive_flushes_heading_that_fills_a_chunk() {
        let text = "# one two three four\nbody words here";
        let chunks = chunk("doc", text, &options(4, 1, ChunkingStrategy::Adaptive)).unwrap();
        assert_eq!(chunks[0].text, "# one two three");
        assert_tiles(text, &chunks);
    }

    #[test]
    fn every_strategy_tiles_mixed_documents() {
        let text = "# Title\nfirst line of text here\nsecond line\n\n\
                    a paragraph that keeps going for quite a few words indeed\n\
                    ## Sub\n\nlast words";
        for strategy in [
            ChunkingStrategy::Whitespace,
            ChunkingStrategy::Structured,
            ChunkingStrategy::Adaptive,
        ] {
            for (size, overlap) in [(1, 0), (3, 1), (4, 3), (7, 2), (50, 5)] {
                let chunks = chunk("doc", text, &options(size, overlap, strategy)).unwrap();
                assert!(!chunks.is_empty());
                assert_tiles(text, &chunks);
            }
        }
    }

    #[test]
    fn strategy_parses_from_configuration_strings() {
        assert_eq!(
            "Adaptive".parse::<ChunkingStrategy>().unwrap(),
            ChunkingStrategy::Adaptive
        );
        assert!(matches!(
            "semantic".parse::<ChunkingStrategy>(),
            Err(ChunkingError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn heading_detection_requires_whitespace_after_hashes() {
        assert!(is_heading("## Setup"));
        assert!(is_heading("   # Indented"));
        assert!(!is_heading("#hashtag"));
        assert!(!is_heading("plain"));
    }
}
