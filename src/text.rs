//! Text normalization shared by extraction, embedding, and highlight matching.
//!
//! Extraction stores passages as whitespace-collapsed text. The highlight matcher additionally
//! applies compatibility decomposition and strips invisible characters so that passage text and
//! live rendered content compare equal despite reflow, ligatures, or soft hyphens; it keeps an
//! offset map so a match can be reported in live-content coordinates.

use unicode_normalization::UnicodeNormalization;

/// Collapse every whitespace run to a single space and trim both ends.
pub fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Characters removed before matching: soft hyphens, zero-width marks, and byte-order marks.
pub fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{00AD}' | '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}'
    )
}

/// Number of Unicode scalar values in `text`.
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Text normalized for matching, with a map back to the source it was derived from.
#[derive(Debug, Clone)]
pub struct MatchText {
    text: String,
    /// Byte offset in `text` of every normalized char.
    byte_starts: Vec<usize>,
    /// Source char range `[start, end)` each normalized char came from.
    source_spans: Vec<(usize, usize)>,
}

impl MatchText {
    /// Normalize `source`: compatibility-decompose each char, drop invisible characters, and
    /// collapse whitespace runs (leading and trailing whitespace is dropped).
    pub fn new(source: &str) -> Self {
        let mut text = String::with_capacity(source.len());
        let mut byte_starts = Vec::with_capacity(source.len());
        let mut source_spans = Vec::with_capacity(source.len());
        let mut pending_space: Option<usize> = None;

        for (index, original) in source.chars().enumerate() {
            if is_invisible(original) {
                continue;
            }
            for c in std::iter::once(original).nfkd() {
                if is_invisible(c) {
                    continue;
                }
                if c.is_whitespace() {
                    if !text.is_empty() && pending_space.is_none() {
                        pending_space = Some(index);
                    }
                    continue;
                }
                if let Some(space_index) = pending_space.take() {
                    byte_starts.push(text.len());
                    source_spans.push((space_index, space_index + 1));
                    text.push(' ');
                }
                byte_starts.push(text.len());
                source_spans.push((index, index + 1));
                text.push(c);
            }
        }

        Self {
            text,
            byte_starts,
            source_spans,
        }
    }

    /// Normalized text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether nothing survived normalization.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Find `needle` (already normalized) and return the matching source char range.
    pub fn find_source_range(&self, needle: &str) -> Option<(usize, usize)> {
        if needle.is_empty() {
            return None;
        }
        let byte_start = self.text.find(needle)?;
        let byte_end = byte_start + needle.len();
        let first = self.byte_starts.binary_search(&byte_start).ok()?;
        let last = match self.byte_starts.binary_search(&byte_end) {
            Ok(index) => index - 1,
            Err(_) => self.byte_starts.len() - 1,
        };
        let start = self.source_spans.get(first)?.0;
        let end = self.source_spans.get(last)?.1;
        Some((start, end))
    }
}
