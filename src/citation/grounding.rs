//! Groundedness scoring of an answer segment against a passage.
//!
//! Groundedness is the larger of two signals:
//!
//! - lexical support: share of the segment's content terms that also occur in the passage, with
//!   accents and case folded; runs of CJK script are compared as character bigrams since they
//!   carry no word separators;
//! - semantic similarity: cosine between the segment embedding and the stored passage embedding,
//!   which is what lets an answer in one language cite a passage in another.

use crate::embedding::{cosine_similarity, fold_terms, is_cjk};
use std::collections::HashSet;

/// Terms shorter than this (outside CJK) are function words in most alphabetic scripts.
const MIN_TERM_CHARS: usize = 3;

/// Terms used for lexical comparison.
pub fn content_terms(text: &str) -> HashSet<String> {
    let mut terms = HashSet::new();
    for term in fold_terms(text) {
        let chars: Vec<char> = term.chars().collect();
        if chars.iter().all(|c| is_cjk(*c)) {
            if chars.len() == 1 {
                terms.insert(term);
            } else {
                terms.extend(chars.windows(2).map(|pair| pair.iter().collect::<String>()));
            }
        } else if chars.len() >= MIN_TERM_CHARS || chars.iter().all(|c| c.is_numeric()) {
            terms.insert(term);
        }
    }
    terms
}

/// Fraction of the segment's content terms found in the passage terms.
pub fn lexical_support(segment: &HashSet<String>, passage: &HashSet<String>) -> f32 {
    if segment.is_empty() {
        return 0.0;
    }
    let shared = segment.intersection(passage).count();
    shared as f32 / segment.len() as f32
}

/// Combined score in `[0, 1]`.
pub fn groundedness(
    segment_terms: &HashSet<String>,
    passage_terms: &HashSet<String>,
    segment_embedding: &[f32],
    passage_embedding: &[f32],
) -> f32 {
    let lexical = lexical_support(segment_terms, passage_terms);
    let semantic = cosine_similarity(segment_embedding, passage_embedding).max(0.0);
    lexical.max(semantic).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_terms_drop_short_words_and_bigram_cjk() {
        let terms = content_terms("The cat is on a Mat, 42 times in 7 days: 光合作用");
        for expected in ["the", "cat", "mat", "42", "7", "times", "days", "光合", "合作", "作用"] {
            assert!(terms.contains(expected), "missing {expected}");
        }
        assert!(!terms.contains("is"));
        assert!(!terms.contains("on"));
        assert!(!terms.contains("in"));
    }

    #[test]
    fn lexical_support_is_fraction_of_segment_terms() {
        let segment = content_terms("Chlorophyll absorbs red light");
        let passage = content_terms("Chlorophyll pigments absorb red and blue light.");
        // chlorophyll, red, light of {chlorophyll, absorbs, red, light}
        assert!((lexical_support(&segment, &passage) - 0.75).abs() < 1e-6);
        assert_eq!(lexical_support(&HashSet::new(), &passage), 0.0);
    }

    #[test]
    fn groundedness_takes_the_stronger_signal() {
        let segment = content_terms("unrelated words entirely");
        let passage = content_terms("Chlorophyll absorbs light");
        let score = groundedness(&segment, &passage, &[1.0, 0.0], &[0.8, 0.6]);
        assert!((score - 0.8).abs() < 1e-6);
        let negative = groundedness(&segment, &passage, &[1.0, 0.0], &[-1.0, 0.0]);
        assert_eq!(negative, 0.0);
    }
}
