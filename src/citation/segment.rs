//! Sentence segmentation of generated answers, fed incrementally.
//!
//! Boundaries are `. ! ?` followed by whitespace, the full-width terminals `。！？；` (no
//! whitespace needed), and line breaks. Inline `[n]` markers are lifted out of the text as
//! citation proposals and stay attached to the sentence they follow, also when they appear right
//! after its terminal.

use crate::text::collapse_whitespace;

const SPACED_TERMINALS: &[char] = &['.', '!', '?'];
const FULL_WIDTH_TERMINALS: &[char] = &['。', '！', '？', '；'];
/// Longest text buffered while deciding whether `[` opens a marker.
const MAX_MARKER_CHARS: usize = 8;

/// A finished sentence with its proposals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSegment {
    /// Whitespace-collapsed sentence text without markers.
    pub text: String,
    /// 1-based indexes into the retrieved passages, in order of appearance, deduplicated.
    pub proposals: Vec<u32>,
    /// Whether the sentence was closed by a line break.
    pub line_break: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Open,
    /// A terminal was seen; the sentence closes at the next visible character.
    Pending {
        needs_space: bool,
        spaced: bool,
    },
}

/// Incremental segmenter; tokens may split sentences and markers anywhere.
#[derive(Debug)]
pub struct Segmenter {
    current: String,
    proposals: Vec<u32>,
    marker: Option<String>,
    boundary: Boundary,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Segmenter {
    /// Start with an empty sentence.
    pub fn new() -> Self {
        Self {
            current: String::new(),
            proposals: Vec::new(),
            marker: None,
            boundary: Boundary::Open,
        }
    }

    /// Feed a chunk of generated text and return the sentences it completed.
    pub fn push(&mut self, token: &str) -> Vec<RawSegment> {
        let mut finished = Vec::new();
        for c in token.chars() {
            self.push_char(c, &mut finished);
        }
        finished
    }

    /// Flush whatever is buffered as the last sentence.
    pub fn finish(&mut self) -> Option<RawSegment> {
        let mut finished = Vec::new();
        if let Some(marker) = self.marker.take() {
            self.literal(&marker, &mut finished);
        }
        self.close(false, &mut finished);
        finished.pop()
    }

    fn push_char(&mut self, c: char, finished: &mut Vec<RawSegment>) {
        if let Some(marker) = self.marker.as_mut() {
            marker.push(c);
            if c == ']' {
                let marker = self.marker.take().unwrap_or_default();
                match parse_marker(&marker) {
                    Some(index) => {
                        let kept = self.current.trim_end().len();
                        self.current.truncate(kept);
                        if !self.proposals.contains(&index) {
                            self.proposals.push(index);
                        }
                    }
                    None => self.literal(&marker, finished),
                }
            } else if marker.chars().count() > MAX_MARKER_CHARS || c == '[' || c == '\n' {
                let marker = self.marker.take().unwrap_or_default();
                self.literal(&marker, finished);
            }
            return;
        }
        if c == '[' {
            self.marker = Some(String::from('['));
            return;
        }
        self.literal_char(c, finished);
    }

    fn literal(&mut self, text: &str, finished: &mut Vec<RawSegment>) {
        for c in text.chars() {
            self.literal_char(c, finished);
        }
    }

    fn literal_char(&mut self, c: char, finished: &mut Vec<RawSegment>) {
        if c == '\n' {
            self.close(true, finished);
            return;
        }
        if let Boundary::Pending { needs_space, spaced } = self.boundary {
            if c.is_whitespace() {
                self.boundary = Boundary::Pending {
                    needs_space,
                    spaced: true,
                };
                self.current.push(c);
                return;
            }
            if needs_space && !spaced {
                // "3.14" or "e.g." style: the terminal was inside a word.
                self.boundary = Boundary::Open;
            } else {
                self.close(false, finished);
            }
        }

        self.current.push(c);
        if SPACED_TERMINALS.contains(&c) {
            self.boundary = Boundary::Pending {
                needs_space: true,
                spaced: false,
            };
        } else if FULL_WIDTH_TERMINALS.contains(&c) {
            self.boundary = Boundary::Pending {
                needs_space: false,
                spaced: false,
            };
        }
    }

    fn close(&mut self, line_break: bool, finished: &mut Vec<RawSegment>) {
        let text = collapse_whitespace(&std::mem::take(&mut self.current));
        let proposals = std::mem::take(&mut self.proposals);
        self.boundary = Boundary::Open;
        if text.is_empty() {
            if !proposals.is_empty() {
                tracing::debug!(?proposals, "Dropped citation markers without sentence text");
            }
            if line_break {
                if let Some(last) = finished.last_mut() {
                    last.line_break = true;
                }
            }
            return;
        }
        finished.push(RawSegment {
            text,
            proposals,
            line_break,
        });
    }
}

/// `[n]` with `n >= 1`.
fn parse_marker(marker: &str) -> Option<u32> {
    let inner = marker.strip_prefix('[')?.strip_suffix(']')?;
    if inner.is_empty() || !inner.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    inner.parse::<u32>().ok().filter(|index| *index >= 1)
}

/// Segment a complete answer.
pub fn segment_text(text: &str) -> Vec<RawSegment> {
    let mut segmenter = Segmenter::new();
    let mut segments = segmenter.push(text);
    segments.extend(segmenter.finish());
    segments
}
