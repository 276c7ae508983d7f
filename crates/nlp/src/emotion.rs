//! Local lexicon emotion classifier.
//!
//! Keyword scan over seven labels with a small negation window. This is
//! intentionally a rough signal; it only feeds the daily mood checkpoints,
//! which need a dominant label per message and nothing more.

const NEGATIONS: &[&str] = &["not", "no", "never", "without", "hardly"];

const LEXICON: &[(&str, &[&str])] = &[
    (
        "joy",
        &[
            "happy", "great", "love", "loved", "excited", "amazing", "awesome", "fun", "glad",
            "wonderful", "fantastic", "proud", "enjoyed", "laughed", "celebrate", "yay",
        ],
    ),
    (
        "sadness",
        &[
            "sad", "miss", "missing", "cried", "crying", "lonely", "heartbroken", "down", "blue",
            "grief", "lost", "hurt", "disappointed", "gloomy",
        ],
    ),
    (
        "anger",
        &[
            "angry", "mad", "furious", "annoyed", "annoying", "hate", "hated", "rage", "pissed",
            "frustrated", "frustrating", "irritated",
        ],
    ),
    (
        "fear",
        &[
            "afraid", "scared", "worried", "anxious", "nervous", "terrified", "panic", "dread",
            "stressed", "stressing", "overwhelmed",
        ],
    ),
    (
        "surprise",
        &[
            "surprised", "shocked", "unexpected", "suddenly", "unbelievable", "whoa", "wow",
            "stunned",
        ],
    ),
    (
        "disgust",
        &["disgusting", "gross", "nasty", "awful", "terrible", "horrible", "revolting"],
    ),
];

#[derive(Debug, Clone, PartialEq)]
pub struct EmotionScore {
    pub label: String,
    pub score: f32,
}

/// Score every label for `text`. Empty input yields an empty list; text with
/// no lexicon hits yields a single dominant "neutral".
pub fn analyze_emotion(text: &str) -> Vec<EmotionScore> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let mut counts = vec![0f32; LEXICON.len()];
    for (i, word) in words.iter().enumerate() {
        // A negated emotion word stops counting toward its label.
        let negated = (i > 0 && NEGATIONS.contains(&words[i - 1]))
            || (i > 1 && NEGATIONS.contains(&words[i - 2]));
        if negated {
            continue;
        }

        for (slot, (_, keywords)) in LEXICON.iter().enumerate() {
            if keywords.contains(word) {
                counts[slot] += 1.0;
            }
        }
    }

    let total: f32 = counts.iter().sum();
    if total == 0.0 {
        return vec![EmotionScore {
            label: "neutral".to_string(),
            score: 1.0,
        }];
    }

    let mut scores: Vec<EmotionScore> = LEXICON
        .iter()
        .zip(counts)
        .filter(|(_, count)| *count > 0.0)
        .map(|((label, _), count)| EmotionScore {
            label: label.to_string(),
            score: count / total,
        })
        .collect();
    scores.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scores
}

/// The single strongest label, if any.
pub fn dominant_emotion(text: &str) -> Option<String> {
    analyze_emotion(text).into_iter().next().map(|s| s.label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joyful_text_scores_joy() {
        assert_eq!(
            dominant_emotion("Had an amazing time, so happy we went!").as_deref(),
            Some("joy")
        );
    }

    #[test]
    fn anxious_text_scores_fear() {
        assert_eq!(
            dominant_emotion("I'm really worried and stressed about finals").as_deref(),
            Some("fear")
        );
    }

    #[test]
    fn plain_text_is_neutral() {
        assert_eq!(
            dominant_emotion("Met Priya at IronWorks today").as_deref(),
            Some("neutral")
        );
    }

    #[test]
    fn empty_text_yields_nothing() {
        assert!(analyze_emotion("   ").is_empty());
        assert!(dominant_emotion("").is_none());
    }

    #[test]
    fn negation_suppresses_the_label() {
        // "not worried" should not register fear.
        let scores = analyze_emotion("I'm not worried at all");
        assert_eq!(scores[0].label, "neutral");
    }

    #[test]
    fn scores_are_a_distribution() {
        let scores = analyze_emotion("happy but also worried and worried again");
        let total: f32 = scores.iter().map(|s| s.score).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert_eq!(scores[0].label, "fear");
    }
}
