//! Per-message NLP: LLM-backed mention extraction plus local emotion
//! classification.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use vestige_llm::{call_typed, LlmService};

pub mod emotion;
pub use emotion::{analyze_emotion, dominant_emotion, EmotionScore};

/// One extracted mention: a text span, its semantic type, and the topic it
/// was filed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub name: String,
    pub entity_type: String,
    pub topic: String,
}

#[derive(Debug, Deserialize)]
struct MentionItem {
    name: String,
    /// Lowercase semantic type.
    label: String,
    #[serde(default)]
    topic: String,
}

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    entities: Vec<MentionItem>,
}

pub struct NlpPipeline {
    llm: Arc<dyn LlmService>,
}

impl NlpPipeline {
    pub fn new(llm: Arc<dyn LlmService>) -> Self {
        Self { llm }
    }

    /// Named-entity extraction over one message. Empty input short-circuits
    /// without an LLM call. A failed or malformed completion yields an empty
    /// list; the batch layer decides whether that matters.
    pub async fn extract_mentions(
        &self,
        user_name: &str,
        topics: &[String],
        text: &str,
    ) -> Vec<Mention> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let system = vestige_prompt::ner_prompt(user_name, topics);
        let Some(response) = call_typed::<ExtractionResponse>(self.llm.as_ref(), &system, text).await
        else {
            return Vec::new();
        };

        let mentions: Vec<Mention> = response
            .entities
            .into_iter()
            .filter(|item| !item.name.trim().is_empty())
            .map(|item| Mention {
                name: item.name,
                entity_type: item.label.to_lowercase(),
                topic: if item.topic.is_empty() {
                    "General".to_string()
                } else {
                    item.topic
                },
            })
            .collect();

        debug!(count = mentions.len(), "mentions extracted");
        mentions
    }

    /// Local emotion classification; no LLM involved.
    pub fn analyze_emotion(&self, text: &str) -> Vec<EmotionScore> {
        emotion::analyze_emotion(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vestige_llm::fake::FakeLlm;

    fn topics() -> Vec<String> {
        vec!["General".to_string()]
    }

    #[tokio::test]
    async fn extracts_typed_mentions() {
        let llm = Arc::new(FakeLlm::new());
        llm.push_structured(Some(json!({
            "entities": [
                {"name": "Priya", "label": "Person", "topic": "Fitness"},
                {"name": "IronWorks", "label": "organization", "topic": ""}
            ]
        })));

        let pipe = NlpPipeline::new(llm);
        let mentions = pipe.extract_mentions("Yinka", &topics(), "Met Priya at IronWorks").await;

        assert_eq!(mentions.len(), 2);
        assert_eq!(mentions[0].name, "Priya");
        assert_eq!(mentions[0].entity_type, "person");
        assert_eq!(mentions[0].topic, "Fitness");
        assert_eq!(mentions[1].topic, "General");
    }

    #[tokio::test]
    async fn empty_text_skips_the_llm() {
        let llm = Arc::new(FakeLlm::new());
        let pipe = NlpPipeline::new(llm.clone());

        let mentions = pipe.extract_mentions("Yinka", &topics(), "   ").await;
        assert!(mentions.is_empty());
        assert_eq!(
            llm.structured_calls.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn malformed_response_yields_no_mentions() {
        let llm = Arc::new(FakeLlm::new());
        llm.push_structured(None);

        let pipe = NlpPipeline::new(llm);
        let mentions = pipe.extract_mentions("Yinka", &topics(), "hello world").await;
        assert!(mentions.is_empty());
    }
}
