//! Layout analysis over the positioned lines of every page.
//!
//! - Running headers and footers (lines repeated in the top or bottom tenth of more than 60% of
//!   pages) are dropped for documents of at least three pages.
//! - Lines are put in reading order: top to bottom, and on two-column pages the left column
//!   before the right one. Lines spanning the gutter, such as titles, separate column bands.
//! - Lines noticeably larger than the median font size are headings; a heading always opens a
//!   new passage so it stays with the text it introduces.
//! - Lines are packed into passages up to the token budget, closing early at a sentence end once
//!   half the budget is used. Passages never cross a page and carry the boxes of their lines.

use super::super::Draft;
use super::super::chunking::TokenBudget;
use super::content::{Line, PageText};
use crate::model::{LocationMetadata, PageSize, Rect};
use std::collections::{HashMap, HashSet};

const MARGIN_BAND: f32 = 0.1;
const REPEAT_RATIO: f32 = 0.6;
const MIN_PAGES_FOR_REPEATS: usize = 3;
const HEADING_RATIO: f32 = 1.3;
/// Horizontal band, as fractions of the page width, searched for a column gutter.
const GUTTER_BAND: (f32, f32) = (0.3, 0.7);
const MIN_COLUMN_LINES: usize = 2;
const SENTENCE_TERMINALS: &[char] = &['.', '!', '?', '。', '！', '？', '；'];

pub(super) fn assemble(mut pages: Vec<PageText>, budget: &TokenBudget) -> Vec<Draft> {
    strip_running_margins(&mut pages);
    for page in &mut pages {
        let size = page.size;
        reading_order(&mut page.lines, size);
    }
    let median = median_font_size(&pages);

    let mut drafts = Vec::new();
    for page in &pages {
        let mut passage = PassageBuilder::new(page.page, page.size);
        for line in &page.lines {
            let heading = median > 0.0 && line.font_size > median * HEADING_RATIO;
            if heading {
                passage.flush(&mut drafts);
            }

            let mut joined = join_lines(&passage.text, &line.text);
            if !passage.text.is_empty() && !budget.fits(&joined) {
                passage.flush(&mut drafts);
                joined = line.text.clone();
            }
            if !budget.fits(&joined) {
                for piece in budget.split(&line.text) {
                    passage.text = piece;
                    passage.boxes.push(line.rect);
                    passage.flush(&mut drafts);
                }
                continue;
            }

            passage.text = joined;
            passage.boxes.push(line.rect);
            if !heading
                && budget.count(&passage.text) * 2 >= budget.max_tokens()
                && passage.text.ends_with(SENTENCE_TERMINALS)
            {
                passage.flush(&mut drafts);
            }
        }
        passage.flush(&mut drafts);
    }
    drafts
}

struct PassageBuilder {
    page: u32,
    size: PageSize,
    text: String,
    boxes: Vec<Rect>,
}

impl PassageBuilder {
    fn new(page: u32, size: PageSize) -> Self {
        Self {
            page,
            size,
            text: String::new(),
            boxes: Vec::new(),
        }
    }

    fn flush(&mut self, drafts: &mut Vec<Draft>) {
        let text = std::mem::take(&mut self.text);
        let boxes = std::mem::take(&mut self.boxes);
        if text.trim().is_empty() {
            return;
        }
        drafts.push(Draft {
            text,
            location: LocationMetadata::Pdf {
                page: self.page,
                page_size: self.size,
                bounding_boxes: boxes,
            },
        });
    }
}

/// Join a line to the passage so far, undoing end-of-line hyphenation.
fn join_lines(previous: &str, next: &str) -> String {
    if previous.is_empty() {
        return next.to_string();
    }
    if let Some(stem) = previous.strip_suffix('-') {
        let stem_ends_in_letter = stem.chars().next_back().is_some_and(char::is_alphabetic);
        let next_starts_lowercase = next.chars().next().is_some_and(char::is_lowercase);
        if stem_ends_in_letter && next_starts_lowercase {
            return format!("{stem}{next}");
        }
    }
    format!("{previous} {next}")
}

fn in_margin(line: &Line, size: PageSize) -> bool {
    if size.height <= 0.0 {
        return false;
    }
    line.rect.y < size.height * MARGIN_BAND
        || line.rect.y + line.rect.h > size.height * (1.0 - MARGIN_BAND)
}

/// Page numbers and dates vary between repeats, so digits are masked.
fn margin_key(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii_digit() { '#' } else { c })
        .collect::<String>()
        .to_lowercase()
}

fn strip_running_margins(pages: &mut [PageText]) {
    if pages.len() < MIN_PAGES_FOR_REPEATS {
        return;
    }

    let mut counts: HashMap<String, usize> = HashMap::new();
    for page in pages.iter() {
        let keys: HashSet<String> = page
            .lines
            .iter()
            .filter(|line| in_margin(line, page.size))
            .map(|line| margin_key(&line.text))
            .collect();
        for key in keys {
            *counts.entry(key).or_default() += 1;
        }
    }

    let threshold = pages.len() as f32 * REPEAT_RATIO;
    let repeated: HashSet<String> = counts
        .into_iter()
        .filter(|(_, count)| *count as f32 > threshold)
        .map(|(key, _)| key)
        .collect();
    if repeated.is_empty() {
        return;
    }

    tracing::debug!(repeated = repeated.len(), "Dropping running headers and footers");
    for page in pages.iter_mut() {
        let size = page.size;
        page.lines
            .retain(|line| !(in_margin(line, size) && repeated.contains(&margin_key(&line.text))));
    }
}

fn reading_order(lines: &mut [Line], size: PageSize) {
    lines.sort_by(|a, b| a.rect.y.total_cmp(&b.rect.y).then(a.rect.x.total_cmp(&b.rect.x)));
    let Some(gutter) = find_gutter(lines, size) else {
        return;
    };

    let mut start = 0;
    while start < lines.len() {
        if crosses(&lines[start], gutter) {
            start += 1;
            continue;
        }
        let mut end = start;
        while end < lines.len() && !crosses(&lines[end], gutter) {
            end += 1;
        }
        lines[start..end].sort_by(|a, b| {
            (a.rect.x >= gutter)
                .cmp(&(b.rect.x >= gutter))
                .then(a.rect.y.total_cmp(&b.rect.y))
                .then(a.rect.x.total_cmp(&b.rect.x))
        });
        start = end;
    }
}

fn crosses(line: &Line, gutter: f32) -> bool {
    line.rect.x < gutter && line.rect.x + line.rect.w > gutter
}

/// Vertical line in the middle of the page that separates two columns of text, if any.
///
/// Single-column text runs across the middle, so a gutter needs lines entirely on both sides and
/// fewer crossing lines than column lines.
fn find_gutter(lines: &[Line], size: PageSize) -> Option<f32> {
    if size.width <= 0.0 {
        return None;
    }
    let low = size.width * GUTTER_BAND.0;
    let high = size.width * GUTTER_BAND.1;
    let mut candidates: Vec<f32> = lines
        .iter()
        .flat_map(|line| [line.rect.x, line.rect.x + line.rect.w])
        .filter(|x| (low..=high).contains(x))
        .collect();
    candidates.push(size.width / 2.0);
    candidates.sort_by(f32::total_cmp);

    candidates.into_iter().find(|&gutter| {
        let (mut left, mut right, mut crossing) = (0, 0, 0);
        for line in lines {
            if crosses(line, gutter) {
                crossing += 1;
            } else if line.rect.x >= gutter {
                right += 1;
            } else {
                left += 1;
            }
        }
        left >= MIN_COLUMN_LINES && right >= MIN_COLUMN_LINES && crossing * 2 < left + right
    })
}

fn median_font_size(pages: &[PageText]) -> f32 {
    let mut sizes: Vec<f32> = pages
        .iter()
        .flat_map(|page| page.lines.iter().map(|line| line.font_size))
        .collect();
    if sizes.is_empty() {
        return 0.0;
    }
    sizes.sort_by(f32::total_cmp);
    sizes[sizes.len() / 2]
}
