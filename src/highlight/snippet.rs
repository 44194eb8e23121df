//! Shrinking-window snippet matching.

use crate::text::MatchText;
use std::time::{Duration, Instant};

/// Effort limits of one match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchBudget {
    /// Fewest words a window may shrink to (capped at the passage's word count).
    pub min_words: usize,
    /// Maximum number of windows tried.
    pub max_attempts: usize,
    /// Wall-clock limit.
    pub time_budget: Duration,
}

/// Result of a snippet search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnippetMatch {
    /// Window found; offsets are chars in the live content.
    Found {
        /// Inclusive start.
        start: usize,
        /// Exclusive end.
        end: usize,
        /// Words in the matched window.
        words: usize,
    },
    /// Every window down to the floor was tried without success.
    NotFound {
        /// Windows tried.
        attempts: usize,
    },
    /// Attempt or time budget ran out first.
    Exhausted {
        /// Windows tried.
        attempts: usize,
    },
}

struct Search<'a> {
    haystack: &'a MatchText,
    budget: MatchBudget,
    started: Instant,
    attempts: usize,
}

enum Step {
    Hit(usize, usize),
    Miss,
    OutOfBudget,
}

impl Search<'_> {
    fn attempt(&mut self, window: &[&str]) -> Step {
        if self.attempts >= self.budget.max_attempts || self.started.elapsed() > self.budget.time_budget
        {
            return Step::OutOfBudget;
        }
        self.attempts += 1;
        match self.haystack.find_source_range(&window.join(" ")) {
            Some((start, end)) => Step::Hit(start, end),
            None => Step::Miss,
        }
    }
}

/// Locate `passage` inside `live`, shrinking the window when the full text is not found.
///
/// Windows are tried in this order: the whole passage, then trailing words dropped one at a time
/// down to the floor, then leading words dropped one at a time down to the floor.
pub fn find_snippet(passage: &str, live: &str, budget: MatchBudget) -> SnippetMatch {
    let haystack = MatchText::new(live);
    let needle = MatchText::new(passage);
    let words: Vec<&str> = needle.as_str().split(' ').filter(|word| !word.is_empty()).collect();
    if words.is_empty() || haystack.is_empty() {
        return SnippetMatch::NotFound { attempts: 0 };
    }

    let floor = budget.min_words.clamp(1, words.len());
    let mut search = Search {
        haystack: &haystack,
        budget,
        started: Instant::now(),
        attempts: 0,
    };

    let trailing = (floor..=words.len()).rev().map(|end| (0, end));
    let leading = (1..=words.len() - floor).map(|start| (start, words.len()));
    for (start, end) in trailing.chain(leading) {
        match search.attempt(&words[start..end]) {
            Step::Hit(from, to) => {
                return SnippetMatch::Found {
                    start: from,
                    end: to,
                    words: end - start,
                };
            }
            Step::Miss => {}
            Step::OutOfBudget => {
                return SnippetMatch::Exhausted {
                    attempts: search.attempts,
                };
            }
        }
    }
    SnippetMatch::NotFound {
        attempts: search.attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn budget(min_words: usize) -> MatchBudget {
        MatchBudget {
            min_words,
            max_attempts: 256,
            time_budget: Duration::from_millis(500),
        }
    }

    fn slice(text: &str, start: usize, end: usize) -> String {
        text.chars().skip(start).take(end - start).collect()
    }

    #[test]
    fn matches_despite_reflow() {
        let live = "Header\n\nThe  mitochondria\n   is the powerhouse\tof the cell.\n";
        match find_snippet("The mitochondria is the powerhouse of the cell.", live, budget(8)) {
            SnippetMatch::Found { start, end, words } => {
                assert_eq!(words, 8);
                assert_eq!(
                    slice(live, start, end),
                    "The  mitochondria\n   is the powerhouse\tof the cell."
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn drops_trailing_words_when_the_end_changed() {
        let passage = "one two three four five six seven eight nine ten";
        let live = "one two three four five six seven eight NINE TEN";
        match find_snippet(passage, live, budget(8)) {
            SnippetMatch::Found { start, end, words } => {
                assert_eq!(words, 8);
                assert_eq!(slice(live, start, end), "one two three four five six seven eight");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn drops_leading_words_when_the_start_changed() {
        let passage = "zero one two three four five six seven eight nine";
        let live = "ZERO one two three four five six seven eight nine";
        match find_snippet(passage, live, budget(8)) {
            SnippetMatch::Found { start, end, words } => {
                assert_eq!(words, 9);
                assert_eq!(
                    slice(live, start, end),
                    "one two three four five six seven eight nine"
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn floor_stops_the_search() {
        let passage = "alpha beta gamma delta epsilon zeta eta theta iota";
        let live = "alpha beta gamma delta epsilon zeta eta THETA iota but ALPHA later";
        // The first seven words would match but the floor is eight.
        assert!(matches!(
            find_snippet(passage, live, budget(8)),
            SnippetMatch::NotFound { .. }
        ));
    }

    #[test]
    fn short_passages_cap_the_floor() {
        let live = "Revenue | 42\nCosts | 17";
        match find_snippet("Costs | 17", live, budget(8)) {
            SnippetMatch::Found { start, end, .. } => assert_eq!(slice(live, start, end), "Costs | 17"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn attempt_budget_is_enforced() {
        let passage = "a b c d e f g h i j k l";
        let live = "nothing in common";
        let limited = MatchBudget {
            min_words: 1,
            max_attempts: 3,
            time_budget: Duration::from_secs(1),
        };
        assert_eq!(
            find_snippet(passage, live, limited),
            SnippetMatch::Exhausted { attempts: 3 }
        );
    }

    proptest! {
        #[test]
        fn stored_text_is_found_in_its_own_reflowed_rendering(
            words in prop::collection::vec("[a-zA-Zéü]{1,8}", 1..20),
            gaps in prop::collection::vec(prop::sample::select(vec![" ", "  ", "\n", "\t ", " \u{00AD}"]), 20),
        ) {
            let stored = words.join(" ");
            let mut live = String::from("Prefix text.\n");
            for (index, word) in words.iter().enumerate() {
                if index > 0 {
                    live.push_str(gaps[index]);
                }
                live.push_str(word);
            }
            live.push_str("\nSuffix.");

            match find_snippet(&stored, &live, budget(8)) {
                SnippetMatch::Found { start, end, words: matched } => {
                    prop_assert_eq!(matched, words.len());
                    let found = slice(&live, start, end);
                    let found_text = MatchText::new(&found);
                    let stored_text = MatchText::new(&stored);
                    prop_assert_eq!(found_text.as_str(), stored_text.as_str());
                }
                other => prop_assert!(false, "no match: {:?}", other),
            }
        }
    }
}
