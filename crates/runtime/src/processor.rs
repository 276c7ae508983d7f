//! The five-stage extraction pipeline for one batch of messages.
//!
//! Mention extraction → known-entity lookup → two-phase disambiguation →
//! verdict resolution → two-phase relationship extraction. The processor
//! never touches the buffer or the streams; the ingest context owns the
//! batch mutex, draining, and publication.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use vestige_llm::{call_typed, LlmService};
use vestige_nlp::{Mention, NlpPipeline};
use vestige_queue::{keys, Queue};
use vestige_resolver::EntityResolver;

use crate::{messages_text, MessageData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Verdict {
    #[serde(rename = "EXISTING")]
    Existing,
    #[serde(rename = "NEW_GROUP")]
    NewGroup,
    #[serde(rename = "NEW_SINGLE")]
    NewSingle,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolutionEntry {
    pub verdict: Verdict,
    /// Every text span that refers to this entity.
    pub mentions: Vec<String>,
    pub entity_type: String,
    #[serde(default)]
    pub canonical_name: Option<String>,
    #[serde(default)]
    pub topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisambiguationResult {
    #[serde(default)]
    pub entries: Vec<ResolutionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityPair {
    pub entity_a: String,
    pub entity_b: String,
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageConnections {
    pub message_id: i64,
    #[serde(default)]
    pub entity_pairs: Vec<EntityPair>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionExtraction {
    #[serde(default)]
    pub message_results: Vec<MessageConnections>,
}

/// One entity as the batch resolved it.
#[derive(Debug, Clone)]
pub struct ResolvedEntity {
    pub id: i64,
    pub canonical_name: String,
    pub entity_type: String,
    pub topic: String,
    pub mentions: Vec<String>,
    pub is_new: bool,
}

#[derive(Debug, Default)]
pub struct BatchResult {
    pub registry: Vec<ResolvedEntity>,
    pub new_entity_ids: HashSet<i64>,
    pub alias_updated_ids: HashSet<i64>,
    pub extraction: Option<ConnectionExtraction>,
    pub emotions: Vec<String>,
    pub success: bool,
    pub error: Option<String>,
}

impl BatchResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn entity_ids(&self) -> Vec<i64> {
        self.registry.iter().map(|e| e.id).collect()
    }
}

pub struct BatchProcessor {
    llm: Arc<dyn LlmService>,
    resolver: Arc<EntityResolver>,
    nlp: Arc<NlpPipeline>,
    queue: Arc<dyn Queue>,
    user_name: String,
    topics: Vec<String>,
}

impl BatchProcessor {
    pub fn new(
        llm: Arc<dyn LlmService>,
        resolver: Arc<EntityResolver>,
        nlp: Arc<NlpPipeline>,
        queue: Arc<dyn Queue>,
        user_name: impl Into<String>,
        topics: Vec<String>,
    ) -> Self {
        Self {
            llm,
            resolver,
            nlp,
            queue,
            user_name: user_name.into(),
            topics,
        }
    }

    async fn next_entity_id(&self) -> anyhow::Result<i64> {
        Ok(self.queue.incr(keys::NEXT_ENT_ID).await?)
    }

    /// Run the full pipeline over one batch. The caller holds the batch
    /// mutex and owns publication and dead-lettering.
    pub async fn run(&self, messages: &[MessageData]) -> BatchResult {
        if messages.is_empty() {
            return BatchResult {
                success: true,
                ..Default::default()
            };
        }

        let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
        debug!(count = messages.len(), ?ids, "processing batch");

        let (mentions, emotions) = self.extract_mentions(messages).await;
        if mentions.is_empty() {
            info!("no mentions found in batch, skipping LLM stages");
            return BatchResult {
                emotions,
                success: true,
                ..Default::default()
            };
        }

        let known = self.known_entities(&mentions);

        let disambiguation = match self.disambiguate(&mentions, messages, &known).await {
            Some(result) if !result.entries.is_empty() => result,
            _ => return BatchResult::failed("disambiguation returned no entries"),
        };

        let mut result = BatchResult {
            emotions,
            success: true,
            ..Default::default()
        };
        if let Err(err) = self.resolve_verdicts(disambiguation, &mut result).await {
            return BatchResult::failed(format!("verdict resolution failed: {err}"));
        }

        // The user entity joins the candidate set so self-relationships can
        // form, but it is never re-registered.
        if let Some(user_id) = self.resolver.get_id(&self.user_name) {
            if !result.registry.iter().any(|e| e.id == user_id) {
                if let Some(profile) = self.resolver.profile(user_id) {
                    result.registry.push(ResolvedEntity {
                        id: user_id,
                        canonical_name: profile.canonical_name,
                        entity_type: profile.entity_type,
                        topic: profile.topic,
                        mentions: profile.aliases,
                        is_new: false,
                    });
                }
            }
        }

        match self.extract_connections(&result.registry, messages).await {
            Some(extraction) => result.extraction = Some(extraction),
            None => return BatchResult::failed("relationship extraction returned no result"),
        }

        result
    }

    /// Stage 1: per-message NER plus local emotion classification,
    /// deduplicated across the batch by mention name.
    async fn extract_mentions(&self, messages: &[MessageData]) -> (Vec<Mention>, Vec<String>) {
        let mention_futures = messages
            .iter()
            .map(|m| self.nlp.extract_mentions(&self.user_name, &self.topics, &m.message));
        let all_mentions = futures::future::join_all(mention_futures).await;

        // Emotion classification is CPU work; keep it off the event loop.
        let emotion_handles: Vec<_> = messages
            .iter()
            .map(|m| {
                let text = m.message.clone();
                tokio::task::spawn_blocking(move || vestige_nlp::dominant_emotion(&text))
            })
            .collect();

        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for mention in all_mentions.into_iter().flatten() {
            if seen.insert(mention.name.clone()) {
                unique.push(mention);
            }
        }

        let mut emotions = Vec::new();
        for handle in emotion_handles {
            if let Ok(Some(label)) = handle.await {
                emotions.push(label);
            }
        }

        (unique, emotions)
    }

    /// Stage 2: exact-then-fuzzy lookup of each mention against the
    /// resolver, collecting matched profiles as known entities.
    fn known_entities(&self, mentions: &[Mention]) -> Vec<serde_json::Value> {
        let mut matched_ids = HashSet::new();
        for mention in mentions {
            let id = self
                .resolver
                .get_id(&mention.name)
                .or_else(|| {
                    self.resolver
                        .resolve_to_canonical(&mention.name)
                        .and_then(|canonical| self.resolver.get_id(&canonical))
                });
            if let Some(id) = id {
                matched_ids.insert(id);
            }
        }

        matched_ids
            .into_iter()
            .filter_map(|id| self.resolver.profile(id))
            .map(|profile| {
                json!({
                    "canonical_name": profile.canonical_name,
                    "type": profile.entity_type,
                    "aliases": profile.aliases,
                    "summary": profile.summary,
                })
            })
            .collect()
    }

    /// Stage 3: two-phase disambiguation — reasoning, then structuring.
    async fn disambiguate(
        &self,
        mentions: &[Mention],
        messages: &[MessageData],
        known: &[serde_json::Value],
    ) -> Option<DisambiguationResult> {
        let mentions_fmt: Vec<serde_json::Value> = mentions
            .iter()
            .map(|m| json!({"name": m.name, "type": m.entity_type, "topic": m.topic}))
            .collect();

        let text = messages_text(messages);
        let system = vestige_prompt::disambiguation_reasoning_prompt(&self.user_name, &text);
        let user = json!({
            "mentions": mentions_fmt,
            "known_entities": known,
        })
        .to_string();

        let reasoning = self.llm.call_reasoning(&system, &user).await?;
        if !reasoning.contains("<resolution>") {
            warn!("no <resolution> block in disambiguation reasoning output");
        }

        let formatter_system = vestige_prompt::disambiguation_formatter_prompt();
        let formatter_user = json!({
            "mentions": mentions_fmt,
            "reasoning_output": reasoning,
        })
        .to_string();

        call_typed::<DisambiguationResult>(self.llm.as_ref(), &formatter_system, &formatter_user)
            .await
    }

    /// Stage 4: apply each verdict against the resolver, allocating ids for
    /// anything genuinely new and demoting stale EXISTING claims.
    async fn resolve_verdicts(
        &self,
        disambiguation: DisambiguationResult,
        result: &mut BatchResult,
    ) -> anyhow::Result<()> {
        for entry in disambiguation.entries {
            if entry.mentions.is_empty() {
                warn!("skipping resolution entry with no mentions");
                continue;
            }
            // The user never enters through disambiguation.
            if entry
                .canonical_name
                .as_deref()
                .map(|c| c.eq_ignore_ascii_case(&self.user_name))
                .unwrap_or(false)
                && entry.verdict != Verdict::Existing
            {
                continue;
            }

            let topic = if entry.topic.is_empty() {
                "General".to_string()
            } else {
                entry.topic.clone()
            };

            match entry.verdict {
                Verdict::Existing => {
                    let canonical = entry
                        .canonical_name
                        .clone()
                        .unwrap_or_else(|| entry.mentions[0].clone());

                    match self.resolver.validate_existing(&canonical, &entry.mentions) {
                        Some((id, aliases_added)) => {
                            if aliases_added {
                                result.alias_updated_ids.insert(id);
                            }
                            let profile = self.resolver.profile(id);
                            result.registry.push(ResolvedEntity {
                                id,
                                canonical_name: profile
                                    .as_ref()
                                    .map(|p| p.canonical_name.clone())
                                    .unwrap_or(canonical),
                                entity_type: profile
                                    .map(|p| p.entity_type)
                                    .unwrap_or_else(|| entry.entity_type.clone()),
                                topic,
                                mentions: entry.mentions,
                                is_new: false,
                            });
                        }
                        None => {
                            warn!(canonical, "EXISTING verdict for unknown entity, demoting to NEW");
                            let canonical = entry.mentions[0].clone();
                            let id = self.next_entity_id().await?;
                            self.resolver.register_entity(
                                id,
                                &canonical,
                                &entry.mentions,
                                &entry.entity_type,
                                &topic,
                            );
                            result.new_entity_ids.insert(id);
                            result.registry.push(ResolvedEntity {
                                id,
                                canonical_name: canonical,
                                entity_type: entry.entity_type,
                                topic,
                                mentions: entry.mentions,
                                is_new: true,
                            });
                        }
                    }
                }
                Verdict::NewGroup | Verdict::NewSingle => {
                    let canonical = if entry.verdict == Verdict::NewGroup {
                        // Longest mention wins; ties go to the most complete form.
                        entry
                            .mentions
                            .iter()
                            .max_by_key(|m| (m.len(), m.as_str()))
                            .unwrap()
                            .clone()
                    } else {
                        entry.mentions[0].clone()
                    };

                    let id = self.next_entity_id().await?;
                    self.resolver.register_entity(
                        id,
                        &canonical,
                        &entry.mentions,
                        &entry.entity_type,
                        &topic,
                    );
                    result.new_entity_ids.insert(id);
                    result.registry.push(ResolvedEntity {
                        id,
                        canonical_name: canonical,
                        entity_type: entry.entity_type,
                        topic,
                        mentions: entry.mentions,
                        is_new: true,
                    });
                }
            }
        }
        Ok(())
    }

    /// Stage 5: two-phase relationship extraction over the resolved
    /// candidates.
    async fn extract_connections(
        &self,
        registry: &[ResolvedEntity],
        messages: &[MessageData],
    ) -> Option<ConnectionExtraction> {
        let candidates: Vec<serde_json::Value> = registry
            .iter()
            .map(|e| {
                json!({
                    "name": e.canonical_name,
                    "type": e.entity_type,
                    "mentions": e.mentions,
                })
            })
            .collect();

        let text = messages_text(messages);
        let system = vestige_prompt::connection_reasoning_prompt(&self.user_name, &text);
        let user = json!({
            "candidate_entities": candidates,
            "messages": messages.iter().map(|m| json!({"message_id": m.id, "text": m.message})).collect::<Vec<_>>(),
        })
        .to_string();

        let reasoning = self.llm.call_reasoning(&system, &user).await?;
        if !reasoning.contains("<connections>") {
            warn!("no <connections> block in relationship reasoning output");
        }

        let formatter_system = vestige_prompt::connection_formatter_prompt();
        call_typed::<ConnectionExtraction>(self.llm.as_ref(), &formatter_system, &reasoning).await
    }
}
