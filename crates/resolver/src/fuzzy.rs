//! Weighted-ratio fuzzy string scoring on the 0–100 scale.
//!
//! Composed from `strsim` primitives: plain edit-distance ratio, a
//! token-sorted variant for word-order noise, and a Jaro-Winkler term that
//! rewards shared prefixes when one form is a truncation of the other.

use strsim::{jaro_winkler, normalized_levenshtein};

pub const PERFECT: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct FuzzyMatch {
    pub candidate: String,
    pub score: f64,
}

fn sorted_tokens(text: &str) -> String {
    let mut tokens: Vec<&str> = text.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Best-of composite ratio between two strings, case-insensitive.
pub fn weighted_ratio(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a == b {
        return PERFECT;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let plain = normalized_levenshtein(&a, &b) * 100.0;
    let token_sort = normalized_levenshtein(&sorted_tokens(&a), &sorted_tokens(&b)) * 100.0 * 0.95;
    let prefixy = jaro_winkler(&a, &b) * 100.0 * 0.90;

    plain.max(token_sort).max(prefixy)
}

/// All candidates scoring at least `cutoff`, best first, capped at `limit`.
pub fn extract_top<'a>(
    query: &str,
    choices: impl IntoIterator<Item = &'a str>,
    cutoff: f64,
    limit: usize,
) -> Vec<FuzzyMatch> {
    let mut matches: Vec<FuzzyMatch> = choices
        .into_iter()
        .filter_map(|candidate| {
            let score = weighted_ratio(query, candidate);
            (score >= cutoff).then(|| FuzzyMatch {
                candidate: candidate.to_string(),
                score,
            })
        })
        .collect();
    matches.sort_by(|x, y| y.score.partial_cmp(&x.score).unwrap_or(std::cmp::Ordering::Equal));
    matches.truncate(limit);
    matches
}

/// Best single candidate at or above `cutoff`.
pub fn extract_one<'a>(
    query: &str,
    choices: impl IntoIterator<Item = &'a str>,
    cutoff: f64,
) -> Option<FuzzyMatch> {
    extract_top(query, choices, cutoff, 1).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_are_perfect() {
        assert_eq!(weighted_ratio("Chloe", "chloe"), PERFECT);
    }

    #[test]
    fn truncations_score_high() {
        assert!(weighted_ratio("Chlo", "Chloe") >= 85.0);
        assert!(weighted_ratio("Bri", "Brianna") >= 70.0);
    }

    #[test]
    fn unrelated_names_score_low() {
        assert!(weighted_ratio("Elena", "IronWorks") < 50.0);
    }

    #[test]
    fn token_order_is_forgiven() {
        assert!(weighted_ratio("Martinez Professor", "Professor Martinez") >= 90.0);
    }

    #[test]
    fn extract_top_respects_cutoff_and_order() {
        let choices = ["chloe", "chad", "ironworks"];
        let matches = extract_top("chlo", choices, 60.0, 10);
        assert!(!matches.is_empty());
        assert_eq!(matches[0].candidate, "chloe");
        assert!(matches.iter().all(|m| m.score >= 60.0));
        assert!(matches.iter().all(|m| m.candidate != "ironworks"));
    }

    #[test]
    fn extract_one_returns_none_below_cutoff() {
        assert!(extract_one("zzz", ["chloe"], 85.0).is_none());
    }
}
