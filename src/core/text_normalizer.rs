//! Text Normalization
//!
//! Fixes common recognition errors before pattern matching. Case is kept so
//! names and titles survive into entities.

use regex::Regex;
use std::collections::HashMap;
use tracing::warn;

/// Conversational openers stripped from the front of a command
const FILLER_PREFIXES: [&str; 10] = [
    "um", "uh", "erm", "ok", "okay", "hey", "so", "please", "yes", "well",
];

/// Normalizes spoken text to fix common recognition errors
pub struct TextNormalizer {
    /// Word-bounded, case-insensitive corrections from config
    corrections: Vec<(Regex, String)>,
    /// Number word mappings
    number_words: HashMap<&'static str, u32>,
}

impl TextNormalizer {
    /// Create a new text normalizer
    pub fn new(corrections: &HashMap<String, String>) -> Self {
        // Longest first so "in voice" wins over "in"
        let mut pairs: Vec<(&String, &String)> = corrections.iter().collect();
        pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

        let corrections = pairs
            .into_iter()
            .filter_map(|(from, to)| {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(from.trim()));
                match Regex::new(&pattern) {
                    Ok(re) => Some((re, to.clone())),
                    Err(e) => {
                        warn!("⚠️ Skipping correction '{}': {}", from, e);
                        None
                    }
                }
            })
            .collect();

        let number_words = [
            ("one", 1),
            ("two", 2),
            ("three", 3),
            ("four", 4),
            ("five", 5),
            ("six", 6),
            ("seven", 7),
            ("eight", 8),
            ("nine", 9),
            ("ten", 10),
            ("eleven", 11),
            ("twelve", 12),
            ("thirteen", 13),
            ("fourteen", 14),
            ("fifteen", 15),
            ("sixteen", 16),
            ("seventeen", 17),
            ("eighteen", 18),
            ("nineteen", 19),
            ("twenty", 20),
        ]
        .into_iter()
        .collect();

        Self {
            corrections,
            number_words,
        }
    }

    /// Normalize text with corrections and filler stripping
    pub fn normalize(&self, text: &str) -> String {
        let mut result = text.trim().to_string();

        for (pattern, replacement) in &self.corrections {
            result = pattern
                .replace_all(&result, regex::NoExpand(replacement))
                .into_owned();
        }

        // Trailing punctuation from dictation-style recognizers
        let mut result = result
            .trim_end_matches(|c: char| matches!(c, '.' | '!' | '?' | ','))
            .to_string();

        // Strip conversational prefixes recursively
        loop {
            let lower = result.to_lowercase();
            let stripped = FILLER_PREFIXES.iter().find_map(|prefix| {
                let rest = lower.strip_prefix(*prefix)?;
                if rest.is_empty() || rest.starts_with([' ', ',']) {
                    Some(prefix.len())
                } else {
                    None
                }
            });
            match stripped.and_then(|len| result.get(len..)) {
                Some(rest) => {
                    result = rest
                        .trim_start_matches(|c: char| c == ',' || c.is_whitespace())
                        .to_string();
                }
                None => break,
            }
        }

        // Final cleanup of repeated whitespace
        result.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Parse a spoken number (1-99) from text
    pub fn parse_number(&self, text: &str) -> Option<u32> {
        let text_lower = text.trim().to_lowercase();

        // Try direct number
        if let Ok(num) = text_lower.parse::<u32>() {
            if num > 0 && num <= 99 {
                return Some(num);
            }
        }

        // Try word
        if let Some(&num) = self.number_words.get(text_lower.as_str()) {
            return Some(num);
        }

        match text_lower.as_str() {
            "a" | "an" => Some(1),
            _ => None,
        }
    }
}
