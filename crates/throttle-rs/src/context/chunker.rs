//! Token-bounded document splitting.
//!
//! [`TextChunker`] slices text on the model tokenizer's span boundaries so
//! every excerpt fits a fixed token window. Consecutive excerpts may share
//! `overlap` tokens; the shared tokens are read twice by whatever consumes
//! the excerpts, so [`ChunkedDocument::total_token_length`] counts them
//! once more per excerpt and each excerpt's percentage is relative to that
//! total.
//!
//! Every window becomes an excerpt, including windows that hold only
//! whitespace, so the fresh texts always tile the document and the
//! percentages always cover it. Consumers skip [`Excerpt::is_blank`] ones.

use crate::error::ChunkError;
use crate::model::Tokenizer;
use std::sync::Arc;
use tracing::debug;

/// Window settings for [`TextChunker`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkerConfig {
    /// Maximum tokens per excerpt before the buffer fraction is applied.
    pub chunk_size: usize,
    /// Tokens repeated at the head of each excerpt after the first.
    pub overlap: usize,
    /// Scales `chunk_size` down to leave headroom.
    pub buffer_fraction: f64,
}

impl ChunkerConfig {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            overlap: 0,
            buffer_fraction: 1.0,
        }
    }

    pub fn with_overlap(mut self, overlap: usize) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_buffer_fraction(mut self, fraction: f64) -> Self {
        self.buffer_fraction = fraction;
        self
    }

    /// `floor(chunk_size * buffer_fraction)`.
    pub fn effective_chunk_size(&self) -> usize {
        (self.chunk_size as f64 * self.buffer_fraction).floor().max(0.0) as usize
    }
}

/// One slice of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Excerpt {
    pub text: String,
    pub token_length: usize,
    /// `round(token_length / total_token_length * 100)`.
    pub percentage_of_document: u32,
    /// Index of the first token in the whole document.
    pub token_offset: usize,
    /// Leading tokens shared with the previous excerpt.
    pub overlap_tokens: usize,
    /// Byte offset in `text` where the non-overlapping part begins.
    fresh_start: usize,
}

impl Excerpt {
    /// The part of this excerpt not already covered by the previous one.
    pub fn fresh_text(&self) -> &str {
        self.text.get(self.fresh_start..).unwrap_or_default()
    }

    /// Whitespace only; nothing worth sending to a model.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Result of [`TextChunker::split`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkedDocument {
    /// Document tokens plus `overlap` for every excerpt.
    pub total_token_length: usize,
    pub excerpts: Vec<Excerpt>,
}

impl ChunkedDocument {
    pub fn len(&self) -> usize {
        self.excerpts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.excerpts.is_empty()
    }
}

/// Splits text into overlapping, token-bounded excerpts.
#[derive(Clone)]
pub struct TextChunker {
    config: ChunkerConfig,
    window: usize,
    tokenizer: Arc<dyn Tokenizer>,
}

impl TextChunker {
    pub fn new(config: ChunkerConfig, tokenizer: Arc<dyn Tokenizer>) -> Result<Self, ChunkError> {
        let window = config.effective_chunk_size();
        if window == 0 {
            return Err(ChunkError::EmptyChunk(config.chunk_size));
        }
        if config.overlap >= window {
            return Err(ChunkError::InvalidOverlap {
                overlap: config.overlap,
                chunk_size: window,
            });
        }
        Ok(Self {
            config,
            window,
            tokenizer,
        })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Maximum tokens in any excerpt.
    pub fn window(&self) -> usize {
        self.window
    }

    pub fn split(&self, text: &str) -> ChunkedDocument {
        let spans = self.tokenizer.encode(text);
        let overlap = self.config.overlap;
        let step = self.window - overlap;

        // (first token, end token, overlap tokens)
        let mut windows = Vec::new();
        let mut start = 0;
        while start < spans.len() {
            let end = (start + self.window).min(spans.len());
            let shared = if start == 0 { 0 } else { overlap };
            windows.push((start, end, shared));
            if end == spans.len() {
                break;
            }
            start += step;
        }

        let mut excerpts: Vec<Excerpt> = windows
            .into_iter()
            .filter_map(|(first, end, shared)| {
                let byte_start = spans[first].start;
                let piece = text.get(byte_start..spans[end - 1].end)?;
                Some(Excerpt {
                    text: piece.to_string(),
                    token_length: end - first,
                    percentage_of_document: 0,
                    token_offset: first,
                    overlap_tokens: shared,
                    fresh_start: spans[first + shared].start - byte_start,
                })
            })
            .collect();

        if excerpts.is_empty() {
            debug!("No tokens to split; using the whole text");
            return ChunkedDocument {
                total_token_length: spans.len(),
                excerpts: vec![Excerpt {
                    text: text.to_string(),
                    token_length: spans.len(),
                    percentage_of_document: 100,
                    token_offset: 0,
                    overlap_tokens: 0,
                    fresh_start: 0,
                }],
            };
        }

        let total = spans.len() + overlap * excerpts.len();
        for excerpt in &mut excerpts {
            excerpt.percentage_of_document =
                (excerpt.token_length as f64 / total as f64 * 100.0).round() as u32;
        }
        debug!(
            "Split {} tokens into {} excerpt(s) of <= {} tokens (overlap {overlap})",
            spans.len(),
            excerpts.len(),
            self.window
        );

        ChunkedDocument {
            total_token_length: total,
            excerpts,
        }
    }
}

impl std::fmt::Debug for TextChunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextChunker")
            .field("config", &self.config)
            .field("window", &self.window)
            .field("tokenizer", &self.tokenizer.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HeuristicTokenizer;

    const TEXT: &str = "The quick brown fox jumps over the lazy dog. \
        Pack my box with five dozen liquor jugs.\n\
        How vexingly quick daft zebras jump!";

    fn chunker(size: usize, overlap: usize) -> TextChunker {
        TextChunker::new(
            ChunkerConfig::new(size).with_overlap(overlap),
            Arc::new(HeuristicTokenizer::default()),
        )
        .unwrap()
    }

    #[test]
    fn fresh_text_reconstructs_document() {
        for (size, overlap) in [(4, 0), (5, 2), (8, 3), (1000, 10)] {
            let doc = chunker(size, overlap).split(TEXT);
            let joined: String = doc.excerpts.iter().map(Excerpt::fresh_text).collect();
            assert_eq!(joined, TEXT, "size={size} overlap={overlap}");
        }
    }

    #[test]
    fn excerpts_respect_window() {
        let tokenizer = HeuristicTokenizer::default();
        for excerpt in chunker(6, 2).split(TEXT).excerpts {
            assert!(excerpt.token_length <= 6);
            assert_eq!(tokenizer.count_tokens(&excerpt.text), excerpt.token_length);
        }
    }

    #[test]
    fn overlap_is_shared_between_neighbours() {
        let doc = chunker(6, 2).split(TEXT);
        assert!(doc.len() > 2);
        assert_eq!(doc.excerpts[0].overlap_tokens, 0);
        for pair in doc.excerpts.windows(2) {
            assert_eq!(pair[1].token_offset, pair[0].token_offset + 4);
            assert_eq!(pair[1].overlap_tokens, 2);
            let shared = pair[1].text.strip_suffix(pair[1].fresh_text()).unwrap();
            assert!(pair[0].text.ends_with(shared));
        }
    }

    #[test]
    fn total_counts_overlap_per_excerpt() {
        let tokens = HeuristicTokenizer::default().count_tokens(TEXT);
        let doc = chunker(6, 2).split(TEXT);
        assert_eq!(doc.total_token_length, tokens + 2 * doc.len());
    }

    #[test]
    fn percentages_sum_to_about_100() {
        for (size, overlap) in [(5, 0), (7, 1), (10, 3)] {
            let doc = chunker(size, overlap).split(TEXT);
            let sum: u32 = doc.excerpts.iter().map(|e| e.percentage_of_document).sum();
            let count = doc.len() as u32;
            // One overlap's share is never read by any excerpt.
            let deficit = (overlap as u32 * 100).div_ceil(doc.total_token_length as u32);
            assert!(sum <= 100 + count, "sum={sum} size={size}");
            assert!(sum + deficit + count >= 100, "sum={sum} size={size}");
        }
    }

    #[test]
    fn short_text_is_one_excerpt() {
        let doc = chunker(1000, 0).split("hello world");
        assert_eq!(doc.len(), 1);
        assert_eq!(doc.excerpts[0].text, "hello world");
        assert_eq!(doc.excerpts[0].percentage_of_document, 100);
    }

    #[test]
    fn whitespace_run_longer_than_window_is_kept() {
        let text = format!("alpha{}omega", "\n".repeat(12));
        let doc = chunker(4, 0).split(&text);

        let joined: String = doc.excerpts.iter().map(Excerpt::fresh_text).collect();
        assert_eq!(joined, text);
        assert!(doc.excerpts.iter().all(|e| e.token_length <= 4));
        let tokens = HeuristicTokenizer::default().count_tokens(&text);
        assert_eq!(doc.total_token_length, tokens);
        assert!(doc.excerpts.iter().any(Excerpt::is_blank));
        assert!(!doc.excerpts[0].is_blank());
        assert!(!doc.excerpts[doc.len() - 1].is_blank());

        let sum: u32 = doc.excerpts.iter().map(|e| e.percentage_of_document).sum();
        assert!((99..=101).contains(&sum), "sum={sum}");
    }

    #[test]
    fn blank_text_falls_back_to_whole_text() {
        let doc = chunker(10, 0).split("   \n  ");
        assert_eq!(doc.len(), 1);
        assert_eq!(doc.excerpts[0].text, "   \n  ");

        let empty = chunker(10, 0).split("");
        assert_eq!(empty.len(), 1);
        assert_eq!(empty.total_token_length, 0);
    }

    #[test]
    fn buffer_fraction_shrinks_window() {
        let c = TextChunker::new(
            ChunkerConfig::new(10).with_buffer_fraction(0.5),
            Arc::new(HeuristicTokenizer::default()),
        )
        .unwrap();
        assert_eq!(c.window(), 5);
    }

    #[test]
    fn rejects_bad_windows() {
        let tok: Arc<dyn Tokenizer> = Arc::new(HeuristicTokenizer::default());
        assert_eq!(
            TextChunker::new(ChunkerConfig::new(0), tok.clone()).unwrap_err(),
            ChunkError::EmptyChunk(0)
        );
        assert_eq!(
            TextChunker::new(ChunkerConfig::new(4).with_overlap(4), tok).unwrap_err(),
            ChunkError::InvalidOverlap {
                overlap: 4,
                chunk_size: 4
            }
        );
    }
}
