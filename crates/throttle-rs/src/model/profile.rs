//! Per-model settings: context size, pricing, rate limits and tokenizer.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use tiktoken_rs::{CoreBPE, cl100k_base};

/// Default characters per token (conservative estimate for English text).
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

// ── Tokenizer ──────────────────────────────────────────────────────

/// Token counting capability for one model family.
///
/// `encode` returns contiguous, non-overlapping byte spans that together cover
/// the whole input. The chunker slices documents on these boundaries, so
/// joining the spans must reproduce the text exactly.
pub trait Tokenizer: Send + Sync {
    /// Byte spans of each token in `text`.
    fn encode(&self, text: &str) -> Vec<Range<usize>>;

    /// Number of tokens in `text`.
    fn count_tokens(&self, text: &str) -> usize {
        self.encode(text).len()
    }

    /// Short name for logs.
    fn name(&self) -> &str;
}

/// Dependency-free tokenizer approximating BPE piece boundaries.
///
/// Words (with one leading space attached) become tokens, split into pieces
/// of at most `ceil(chars_per_token)` characters. Newlines and punctuation
/// are single tokens; other whitespace runs collapse into one token.
#[derive(Debug, Clone)]
pub struct HeuristicTokenizer {
    max_piece_chars: usize,
}

impl HeuristicTokenizer {
    pub fn new(chars_per_token: f64) -> Self {
        let max_piece_chars = if chars_per_token.is_finite() && chars_per_token >= 1.0 {
            chars_per_token.ceil() as usize
        } else {
            1
        };
        Self { max_piece_chars }
    }

    /// Push the pieces of the word starting at `from` (which may be the
    /// attached leading space). Returns the index of the first char after it.
    fn push_word(
        &self,
        chars: &[(usize, char)],
        from: usize,
        text_len: usize,
        spans: &mut Vec<Range<usize>>,
    ) -> usize {
        let word_start = if is_word_char(chars[from].1) {
            from
        } else {
            from + 1
        };
        let mut end = word_start;
        while end < chars.len() && is_word_char(chars[end].1) {
            end += 1;
        }

        let mut piece_start = from;
        let mut cursor = word_start;
        while cursor < end {
            let piece_end = (cursor + self.max_piece_chars).min(end);
            spans.push(chars[piece_start].0..byte_at(chars, piece_end, text_len));
            piece_start = piece_end;
            cursor = piece_end;
        }
        end
    }
}

impl Default for HeuristicTokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl Tokenizer for HeuristicTokenizer {
    fn encode(&self, text: &str) -> Vec<Range<usize>> {
        let chars: Vec<(usize, char)> = text.char_indices().collect();
        let mut spans = Vec::with_capacity(chars.len() / 3 + 1);
        let mut i = 0;

        while i < chars.len() {
            let (start, c) = chars[i];
            if c == '\n' {
                spans.push(start..byte_at(&chars, i + 1, text.len()));
                i += 1;
            } else if c.is_whitespace() {
                let mut j = i;
                while j < chars.len() && chars[j].1.is_whitespace() && chars[j].1 != '\n' {
                    j += 1;
                }
                let before_word = chars.get(j).is_some_and(|&(_, n)| is_word_char(n));
                if before_word {
                    // The last space belongs to the following word.
                    if j - i > 1 {
                        spans.push(start..chars[j - 1].0);
                    }
                    i = self.push_word(&chars, j - 1, text.len(), &mut spans);
                } else {
                    spans.push(start..byte_at(&chars, j, text.len()));
                    i = j;
                }
            } else if is_word_char(c) {
                i = self.push_word(&chars, i, text.len(), &mut spans);
            } else {
                spans.push(start..byte_at(&chars, i + 1, text.len()));
                i += 1;
            }
        }
        spans
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

/// BPE tokenizer backed by tiktoken's `cl100k_base` encoding.
///
/// Spans come from the decoded pieces of each token. Text whose pieces do
/// not tile it exactly (a token splitting a multibyte character) is handed to
/// the heuristic tokenizer instead, so spans always stay on char boundaries.
#[derive(Clone)]
pub struct TiktokenTokenizer {
    bpe: Arc<CoreBPE>,
    fallback: HeuristicTokenizer,
}

impl TiktokenTokenizer {
    pub fn new() -> Result<Self, String> {
        let bpe = cl100k_base().map_err(|e| format!("failed to load cl100k_base: {e}"))?;
        Ok(Self {
            bpe: Arc::new(bpe),
            fallback: HeuristicTokenizer::default(),
        })
    }

    fn token_spans(&self, text: &str) -> Option<Vec<Range<usize>>> {
        let pieces = self.bpe.split_by_token(text, false).ok()?;
        let mut spans = Vec::with_capacity(pieces.len());
        let mut start = 0;
        for piece in &pieces {
            let end = start + piece.len();
            if text.get(start..end) != Some(piece.as_str()) {
                return None;
            }
            spans.push(start..end);
            start = end;
        }
        (start == text.len()).then_some(spans)
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn encode(&self, text: &str) -> Vec<Range<usize>> {
        self.token_spans(text).unwrap_or_else(|| self.fallback.encode(text))
    }

    fn name(&self) -> &str {
        "cl100k_base"
    }
}

impl fmt::Debug for TiktokenTokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TiktokenTokenizer").finish_non_exhaustive()
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn byte_at(chars: &[(usize, char)], idx: usize, text_len: usize) -> usize {
    chars.get(idx).map_or(text_len, |&(b, _)| b)
}

// ── Pricing ────────────────────────────────────────────────────────

/// Per-token prices in USD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub tx_per_token: f64,
    pub rx_per_token: f64,
}

impl ModelPricing {
    pub fn per_million(input: f64, output: f64) -> Self {
        Self {
            tx_per_token: input / 1_000_000.0,
            rx_per_token: output / 1_000_000.0,
        }
    }

    pub fn cost(&self, tokens_sent: usize, tokens_received: usize) -> f64 {
        tokens_sent as f64 * self.tx_per_token + tokens_received as f64 * self.rx_per_token
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self::per_million(3.0, 15.0)
    }
}

#[derive(Clone, Copy)]
enum Match {
    Any,
    All,
}

/// Approximate USD per 1M tokens, matched in order against the model name.
const PRICING_TABLE: &[(&[&str], Match, f64, f64)] = &[
    (&["opus"], Match::All, 15.0, 75.0),
    (&["sonnet"], Match::All, 3.0, 15.0),
    (&["haiku"], Match::All, 0.25, 1.25),
    (&["4o-mini"], Match::All, 0.15, 0.60),
    (&["gpt-4o", "gpt-4"], Match::Any, 2.50, 10.0),
    (&["gpt-3.5"], Match::All, 0.50, 1.50),
    (&["gemini", "flash"], Match::All, 0.075, 0.30),
    (&["gemini"], Match::All, 1.25, 5.0),
    (&["deepseek"], Match::All, 0.27, 1.10),
];

/// Look up approximate pricing for a model when the config omits prices.
///
/// Matches on the segment after the last `/` so org prefixes like
/// `"my-org/custom-sonnet-finetune"` do not skew the lookup.
pub fn pricing_for_model(model: &str) -> ModelPricing {
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();

    if name.starts_with("o1") || name.starts_with("o3") {
        return ModelPricing::per_million(15.0, 60.0);
    }
    for (keywords, mode, input, output) in PRICING_TABLE {
        let hit = match mode {
            Match::Any => keywords.iter().any(|k| name.contains(k)),
            Match::All => keywords.iter().all(|k| name.contains(k)),
        };
        if hit {
            return ModelPricing::per_million(*input, *output);
        }
    }
    ModelPricing::default()
}

// ── ModelProfile ───────────────────────────────────────────────────

/// Immutable settings for one model identifier.
///
/// Built once by the [`ModelRegistry`](super::ModelRegistry) and shared via
/// `Arc` by every prompt targeting the model.
#[derive(Clone)]
pub struct ModelProfile {
    id: String,
    max_context_tokens: usize,
    pricing: ModelPricing,
    requests_per_minute: u64,
    tokens_per_minute: u64,
    tokenizer: Arc<dyn Tokenizer>,
}

impl ModelProfile {
    pub fn new(
        id: impl Into<String>,
        max_context_tokens: usize,
        pricing: ModelPricing,
        requests_per_minute: u64,
        tokens_per_minute: u64,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        Self {
            id: id.into(),
            max_context_tokens,
            pricing,
            requests_per_minute,
            tokens_per_minute,
            tokenizer,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn max_context_tokens(&self) -> usize {
        self.max_context_tokens
    }

    pub fn pricing(&self) -> ModelPricing {
        self.pricing
    }

    pub fn requests_per_minute(&self) -> u64 {
        self.requests_per_minute
    }

    pub fn tokens_per_minute(&self) -> u64 {
        self.tokens_per_minute
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.tokenizer.count_tokens(text)
    }

    /// `sent × tx price + received × rx price`.
    pub fn cost(&self, tokens_sent: usize, tokens_received: usize) -> f64 {
        self.pricing.cost(tokens_sent, tokens_received)
    }
}

impl fmt::Debug for ModelProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelProfile")
            .field("id", &self.id)
            .field("max_context_tokens", &self.max_context_tokens)
            .field("pricing", &self.pricing)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("tokens_per_minute", &self.tokens_per_minute)
            .field("tokenizer", &self.tokenizer.name())
            .finish()
    }
}
