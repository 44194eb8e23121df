//! Plain text and Markdown.
//!
//! Both formats are reduced to a list of blocks. The normalized copy of the document is every
//! block whitespace-collapsed and joined with a blank line; passage offsets are char offsets into
//! that copy.

use super::DraftSet;
use super::chunking::TokenBudget;
use crate::model::LocationMetadata;
use crate::text::collapse_whitespace;
use pulldown_cmark::{Event, Options, Parser, Tag};

/// Separator between blocks in the normalized copy.
pub(crate) const BLOCK_SEPARATOR: &str = "\n\n";

pub(super) fn extract_plain(bytes: &[u8], budget: &TokenBudget) -> DraftSet {
    let text = String::from_utf8_lossy(bytes);
    blocks_to_drafts(plain_blocks(&text), budget, text_location)
}

pub(super) fn extract_markdown(bytes: &[u8], budget: &TokenBudget) -> DraftSet {
    let text = String::from_utf8_lossy(bytes);
    blocks_to_drafts(markdown_blocks(&text), budget, text_location)
}

fn text_location(start: usize, end: usize) -> LocationMetadata {
    LocationMetadata::Text {
        char_offset_start: start,
        char_offset_end: end,
    }
}

/// Paragraphs separated by blank lines.
pub(crate) fn plain_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// Block-level elements of a Markdown document with inline markup stripped.
pub(crate) fn markdown_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    let flush = |current: &mut String, blocks: &mut Vec<String>| {
        let block = collapse_whitespace(current);
        if !block.is_empty() {
            blocks.push(block);
        }
        current.clear();
    };

    for event in Parser::new_ext(text, Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH) {
        match event {
            Event::Start(Tag::Paragraph)
            | Event::Start(Tag::Heading(..))
            | Event::Start(Tag::CodeBlock(_))
            | Event::Start(Tag::Item)
            | Event::Start(Tag::List(_))
            | Event::Start(Tag::TableHead)
            | Event::Start(Tag::TableRow) => flush(&mut current, &mut blocks),
            Event::End(Tag::Paragraph)
            | Event::End(Tag::Heading(..))
            | Event::End(Tag::CodeBlock(_))
            | Event::End(Tag::Item)
            | Event::End(Tag::TableHead)
            | Event::End(Tag::TableRow) => flush(&mut current, &mut blocks),
            Event::Start(Tag::TableCell) => {
                if !current.trim().is_empty() {
                    current.push_str(" | ");
                }
            }
            Event::Text(value) | Event::Code(value) => current.push_str(&value),
            Event::SoftBreak | Event::HardBreak => current.push(' '),
            _ => {}
        }
    }
    flush(&mut current, &mut blocks);
    blocks
}

/// Turn blocks into passages located by char offsets in the normalized copy.
pub(crate) fn blocks_to_drafts(
    blocks: Vec<String>,
    budget: &TokenBudget,
    location: fn(usize, usize) -> LocationMetadata,
) -> DraftSet {
    let mut set = DraftSet::default();
    let mut offset = 0usize;
    let separator_chars = BLOCK_SEPARATOR.chars().count();
    let mut first = true;

    for block in blocks {
        let block = collapse_whitespace(&block);
        if block.is_empty() {
            continue;
        }
        if !first {
            offset += separator_chars;
        }
        first = false;

        for piece in budget.split_with_offsets(&block) {
            set.push(
                piece.text,
                location(offset + piece.char_start, offset + piece.char_end),
            );
        }
        offset += block.chars().count();
    }
    set
}

/// Normalized copy of blocks, matching the offsets produced by [`blocks_to_drafts`].
pub(crate) fn normalized_copy(blocks: &[String]) -> String {
    blocks
        .iter()
        .map(|block| collapse_whitespace(block))
        .filter(|block| !block.is_empty())
        .collect::<Vec<_>>()
        .join(BLOCK_SEPARATOR)
}
