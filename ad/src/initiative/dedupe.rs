//! Duplicate initiative guard
//!
//! Titles are compared case- and punctuation-insensitively: exact normalised
//! match, or Jaccard-over-words at or above the threshold.

use std::collections::HashSet;

/// Word-overlap ratio at which two titles count as the same initiative
pub const JACCARD_THRESHOLD: f64 = 0.8;

/// Lowercase, strip punctuation, collapse whitespace
pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Jaccard similarity over word sets of the normalised titles
pub fn jaccard(a: &str, b: &str) -> f64 {
    let words_a: HashSet<&str> = a.split_whitespace().collect();
    let words_b: HashSet<&str> = b.split_whitespace().collect();
    if words_a.is_empty() && words_b.is_empty() {
        return 1.0;
    }
    let intersection = words_a.intersection(&words_b).count() as f64;
    let union = words_a.union(&words_b).count() as f64;
    intersection / union
}

/// Whether `title` duplicates any existing title
pub fn is_duplicate(title: &str, existing: &[String]) -> bool {
    let normalized = normalize_title(title);
    existing.iter().any(|other| {
        let other = normalize_title(other);
        other == normalized || jaccard(&normalized, &other) >= JACCARD_THRESHOLD
    })
}
