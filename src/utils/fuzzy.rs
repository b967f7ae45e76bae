//! Fuzzy matching utilities
//!
//! Snaps loosely recognized names (views, record kinds) onto the closest
//! known value.

use strsim::normalized_levenshtein;

/// Result of a fuzzy match with the matched value and score
#[derive(Debug, Clone, PartialEq)]
pub struct FuzzyMatch {
    pub value: String,
    pub score: f64,
}

/// Lower-case, drop articles and filler words, collapse spaces
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .filter(|w| !matches!(*w, "the" | "a" | "an" | "my" | "page" | "screen" | "view" | "tab"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Score two strings, ignoring spacing ("time sheet" vs "timesheet")
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize_text(a).replace(' ', "");
    let b = normalize_text(b).replace(' ', "");
    normalized_levenshtein(&a, &b)
}

/// Find matches in a list of candidates
///
/// Returns up to `n` matches with scores at or above `cutoff`, best first
pub fn find_matches(search_term: &str, candidates: &[String], n: usize, cutoff: f64) -> Vec<FuzzyMatch> {
    let mut matches: Vec<FuzzyMatch> = candidates
        .iter()
        .map(|candidate| FuzzyMatch {
            value: candidate.clone(),
            score: similarity(search_term, candidate),
        })
        .filter(|m| m.score >= cutoff)
        .collect();

    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    matches.truncate(n);
    matches
}

/// Find the best match above a minimum score
///
/// Returns None if no match meets the cutoff
pub fn find_best_match(search_term: &str, candidates: &[String], cutoff: f64) -> Option<FuzzyMatch> {
    find_matches(search_term, candidates, 1, cutoff).into_iter().next()
}
