//! PDF documents.
//!
//! Text is positioned by interpreting each page's content stream ([`content`]), then the
//! positioned lines of all pages go through layout analysis ([`layout`]) which removes running
//! headers and footers and assembles passages that carry their line boxes.

mod content;
mod layout;

use super::chunking::TokenBudget;
use super::{DraftSet, ExtractionError, ExtractionWarning};
use lopdf::{Document, ObjectId};
use rayon::prelude::*;

/// How far into the file the `%PDF-` marker may appear.
const HEADER_SEARCH_WINDOW: usize = 1024;

pub(super) fn extract(bytes: &[u8], budget: &TokenBudget) -> Result<DraftSet, ExtractionError> {
    if !looks_like_pdf(bytes) {
        return Err(ExtractionError::UnsupportedDocument(
            "not a PDF file".to_string(),
        ));
    }
    let document = Document::load_mem(bytes)
        .map_err(|err| ExtractionError::CorruptDocument(format!("unreadable PDF: {err}")))?;
    if document.trailer.get(b"Encrypt").is_ok() {
        return Err(ExtractionError::UnsupportedDocument(
            "encrypted PDF".to_string(),
        ));
    }

    let pages: Vec<(u32, ObjectId)> = document.get_pages().into_iter().collect();
    if pages.is_empty() {
        return Err(ExtractionError::CorruptDocument(
            "PDF has no pages".to_string(),
        ));
    }

    let results: Vec<Result<content::PageText, ExtractionWarning>> = pages
        .par_iter()
        .map(|(number, id)| content::page_text(&document, *number, *id))
        .collect();

    let mut set = DraftSet::default();
    let mut page_texts = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(page) => page_texts.push(page),
            Err(warning) => set.warn(warning),
        }
    }

    tracing::debug!(
        pages = pages.len(),
        decoded = page_texts.len(),
        "Interpreted PDF content streams"
    );
    set.drafts = layout::assemble(page_texts, budget);
    Ok(set)
}

fn looks_like_pdf(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(HEADER_SEARCH_WINDOW)];
    window.windows(5).any(|candidate| candidate == b"%PDF-")
}
