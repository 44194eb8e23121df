//! Token budgeting and semantic splitting for oversize passages.
//!
//! Extractors first cut documents along their natural units (lines, paragraphs, slides, rows).
//! Units that exceed the passage token budget are split here with `semchunk-rs`, which prefers
//! paragraph, sentence, and word boundaries before resorting to character cuts.
//!
//! Token counting prefers `tiktoken-rs` encodings (`cl100k_base`, `o200k_base`, or a model name
//! known to tiktoken). The special name `whitespace` selects a whitespace counter, which is also
//! the fallback when an encoding cannot be loaded.

use anyhow::Error as TokenizerError;
use semchunk_rs::Chunker;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tiktoken_rs::{
    CoreBPE, cl100k_base, get_bpe_from_model, o200k_base, p50k_base, p50k_edit, r50k_base,
};

/// Shared token counting function.
pub type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

static COUNTERS: OnceLock<Mutex<HashMap<String, TokenCounter>>> = OnceLock::new();

/// Build (or reuse) the token counter for `tokenizer`.
///
/// Loading a BPE table is expensive, so counters are cached per tokenizer name for the life of
/// the process.
pub fn build_token_counter(tokenizer: &str) -> TokenCounter {
    let name = tokenizer.trim();
    let name = if name.is_empty() { "cl100k_base" } else { name };
    if name.eq_ignore_ascii_case("whitespace") {
        return whitespace_token_counter();
    }

    let cache = COUNTERS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = match cache.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(counter) = guard.get(name) {
        return counter.clone();
    }

    let counter = match resolve_encoding(name) {
        Ok(encoding) => {
            let encoding = Arc::new(encoding);
            Arc::new(move |segment: &str| encoding.encode_ordinary(segment).len()) as TokenCounter
        }
        Err(error) => {
            tracing::warn!(
                tokenizer = name,
                error = %error,
                "Tokenizer unavailable; falling back to whitespace counter"
            );
            whitespace_token_counter()
        }
    };
    guard.insert(name.to_string(), counter.clone());
    counter
}

fn resolve_encoding(name: &str) -> Result<CoreBPE, TokenizerError> {
    if let Some(candidate) = encoding_from_name(name) {
        return candidate;
    }
    get_bpe_from_model(name)
}

fn encoding_from_name(name: &str) -> Option<Result<CoreBPE, TokenizerError>> {
    match name {
        "cl100k_base" => Some(cl100k_base()),
        "o200k_base" => Some(o200k_base()),
        "p50k_base" => Some(p50k_base()),
        "p50k_edit" => Some(p50k_edit()),
        "r50k_base" | "gpt2" => Some(r50k_base()),
        _ => None,
    }
}

/// Counter that treats every whitespace-separated word as one token.
pub fn whitespace_token_counter() -> TokenCounter {
    Arc::new(|segment: &str| {
        let tokens = segment.split_whitespace().count();
        if tokens == 0 && !segment.is_empty() {
            1
        } else {
            tokens
        }
    })
}

/// Token budget applied to every passage.
#[derive(Clone)]
pub struct TokenBudget {
    max_tokens: usize,
    counter: TokenCounter,
}

impl TokenBudget {
    /// Budget of `max_tokens` (at least one) measured with `counter`.
    pub fn new(max_tokens: usize, counter: TokenCounter) -> Self {
        Self {
            max_tokens: max_tokens.max(1),
            counter,
        }
    }

    /// Maximum tokens per passage.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Tokens in `text`.
    pub fn count(&self, text: &str) -> usize {
        self.counter.as_ref()(text)
    }

    /// Whether `text` fits in one passage.
    pub fn fits(&self, text: &str) -> bool {
        self.count(text) <= self.max_tokens
    }

    /// Split `text` into pieces that each fit the budget, in order.
    ///
    /// Text that already fits is returned unchanged as the only piece.
    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with_offsets(text)
            .into_iter()
            .map(|piece| piece.text)
            .collect()
    }

    /// Like [`TokenBudget::split`], also reporting each piece's char range within `text`.
    pub fn split_with_offsets(&self, text: &str) -> Vec<Piece> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        if self.fits(text) {
            return vec![Piece {
                text: text.to_string(),
                char_start: 0,
                char_end: text.chars().count(),
            }];
        }

        let counter = self.counter.clone();
        let chunker = Chunker::new(
            self.max_tokens,
            Box::new(move |segment: &str| counter.as_ref()(segment)),
        );
        locate_pieces(text, chunker.chunk(text))
    }
}

/// Piece of a split unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    /// Piece text.
    pub text: String,
    /// Inclusive char offset within the split unit.
    pub char_start: usize,
    /// Exclusive char offset within the split unit.
    pub char_end: usize,
}

fn locate_pieces(text: &str, pieces: Vec<String>) -> Vec<Piece> {
    let mut located = Vec::with_capacity(pieces.len());
    let mut byte_cursor = 0;
    let mut char_cursor = 0;
    for piece in pieces {
        let piece_chars = piece.chars().count();
        match text[byte_cursor..].find(piece.as_str()) {
            Some(relative) => {
                let byte_start = byte_cursor + relative;
                let char_start = char_cursor + text[byte_cursor..byte_start].chars().count();
                byte_cursor = byte_start + piece.len();
                char_cursor = char_start + piece_chars;
                located.push(Piece {
                    text: piece,
                    char_start,
                    char_end: char_cursor,
                });
            }
            None => {
                located.push(Piece {
                    text: piece,
                    char_start: char_cursor,
                    char_end: char_cursor + piece_chars,
                });
                char_cursor += piece_chars;
            }
        }
    }
    located
}
