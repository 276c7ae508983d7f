//! The read-only tool surface the agent dispatches against.
//!
//! Every name-taking tool resolves its input to canonical form (exact,
//! then fuzzy) before querying the store, and evidence message ids are
//! hydrated into full message records on the way out.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use vestige_graph::{GraphStore, TopicEntity};
use vestige_queue::{keys, Queue};
use vestige_resolver::EntityResolver;

const SEARCH_WINDOW: usize = 75;
const CONTEXT_TURNS: i64 = 2;

pub struct Tools {
    user_name: String,
    store: Arc<dyn GraphStore>,
    resolver: Arc<EntityResolver>,
    queue: Arc<dyn Queue>,
}

impl Tools {
    pub fn new(
        user_name: impl Into<String>,
        store: Arc<dyn GraphStore>,
        resolver: Arc<EntityResolver>,
        queue: Arc<dyn Queue>,
    ) -> Self {
        Self {
            user_name: user_name.into(),
            store,
            resolver,
            queue,
        }
    }

    fn resolve_entity_name(&self, input: &str) -> Option<String> {
        self.resolver.resolve_to_canonical(input)
    }

    /// Turn evidence message ids into full message records.
    async fn hydrate_evidence(&self, evidence_ids: &[String]) -> Vec<Value> {
        if evidence_ids.is_empty() {
            return Vec::new();
        }
        let content_key = keys::message_content(&self.user_name);
        let raw = self
            .queue
            .hmget(&content_key, &evidence_ids.to_vec())
            .await
            .unwrap_or_default();

        evidence_ids
            .iter()
            .zip(raw)
            .filter_map(|(id, payload)| {
                let parsed: Value = serde_json::from_str(&payload?).ok()?;
                Some(json!({
                    "id": id,
                    "message": parsed.get("message").cloned().unwrap_or(Value::Null),
                    "timestamp": parsed.get("timestamp").cloned().unwrap_or(Value::Null),
                }))
            })
            .collect()
    }

    /// A short window of surrounding turns for one matched message.
    async fn surrounding_context(&self, msg_key: &str) -> Vec<Value> {
        let recent_key = keys::recent_messages(&self.user_name);
        let mut ids = self
            .queue
            .zrevrange(&recent_key, 0, SEARCH_WINDOW as i64 - 1)
            .await
            .unwrap_or_default();
        ids.reverse();

        let Some(target) = ids.iter().position(|id| id == msg_key) else {
            return Vec::new();
        };
        let start = target.saturating_sub(CONTEXT_TURNS as usize);
        let end = (target + CONTEXT_TURNS as usize + 1).min(ids.len());
        let window: Vec<String> = ids[start..end]
            .iter()
            .filter(|id| id.as_str() != msg_key)
            .cloned()
            .collect();

        self.hydrate_evidence(&window).await
    }

    /// Lexical search over the recent message window. Score is the fraction
    /// of query tokens present in the message.
    pub async fn search_messages(&self, query: &str, limit: usize) -> Vec<Value> {
        let tokens: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if tokens.is_empty() {
            return Vec::new();
        }

        let recent_key = keys::recent_messages(&self.user_name);
        let ids = self
            .queue
            .zrevrange(&recent_key, 0, SEARCH_WINDOW as i64 - 1)
            .await
            .unwrap_or_default();
        let contents = self
            .queue
            .hmget(&keys::message_content(&self.user_name), &ids)
            .await
            .unwrap_or_default();

        let mut scored: Vec<(String, Value, f64)> = Vec::new();
        for (id, payload) in ids.iter().zip(contents) {
            let Some(payload) = payload else { continue };
            let Ok(parsed) = serde_json::from_str::<Value>(&payload) else {
                continue;
            };
            let Some(message) = parsed.get("message").and_then(Value::as_str) else {
                continue;
            };
            let haystack = message.to_lowercase();
            let hits = tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
            if hits == 0 {
                continue;
            }
            let score = hits as f64 / tokens.len() as f64;
            scored.push((id.clone(), parsed, score));
        }
        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        let mut out = Vec::new();
        for (id, parsed, score) in scored {
            let context = self.surrounding_context(&id).await;
            out.push(json!({
                "id": id,
                "role": "user",
                "message": parsed.get("message").cloned().unwrap_or(Value::Null),
                "timestamp": parsed.get("timestamp").cloned().unwrap_or(Value::Null),
                "score": score,
                "context": context,
            }));
        }
        out
    }

    pub async fn search_entities(&self, query: &str) -> Vec<Value> {
        self.store
            .search_entity(query, 5)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|hit| serde_json::to_value(hit).unwrap_or(Value::Null))
            .collect()
    }

    pub async fn get_profile(&self, entity_name: &str) -> Option<Value> {
        let canonical = self.resolve_entity_name(entity_name)?;

        // Prefer the resolver's in-memory view; fall back to the store.
        if let Some(id) = self.resolver.get_id(&canonical) {
            if let Some(profile) = self.resolver.profile(id) {
                return serde_json::to_value(profile).ok();
            }
        }
        self.store
            .get_entity_profile(&canonical)
            .await
            .ok()
            .flatten()
            .and_then(|profile| serde_json::to_value(profile).ok())
    }

    pub async fn get_connections(&self, entity_name: &str, active_only: bool) -> Vec<Value> {
        let Some(canonical) = self.resolve_entity_name(entity_name) else {
            return Vec::new();
        };
        let connections = self
            .store
            .get_related_entities(&[canonical], active_only)
            .await
            .unwrap_or_default();

        let mut out = Vec::new();
        for connection in connections {
            let evidence = self.hydrate_evidence(&connection.evidence_ids).await;
            out.push(json!({
                "source": connection.source,
                "target": connection.target,
                "target_summary": connection.target_summary,
                "connection_strength": connection.connection_strength,
                "evidence": evidence,
                "confidence": connection.confidence,
                "last_seen": connection.last_seen,
            }));
        }
        out
    }

    pub async fn get_recent_activity(&self, entity_name: &str, hours: i64) -> Vec<Value> {
        let Some(canonical) = self.resolve_entity_name(entity_name) else {
            return Vec::new();
        };
        let activity = self
            .store
            .get_recent_activity(&canonical, hours)
            .await
            .unwrap_or_default();

        let mut out = Vec::new();
        for item in activity {
            let evidence = self.hydrate_evidence(&item.evidence_ids).await;
            out.push(json!({
                "entity": item.entity,
                "evidence": evidence,
                "time": item.time,
            }));
        }
        out
    }

    /// Shortest active path; when a path exists only through inactive
    /// topics, say so without exposing it.
    pub async fn find_path(&self, entity_a: &str, entity_b: &str) -> Vec<Value> {
        let (Some(a), Some(b)) = (
            self.resolve_entity_name(entity_a),
            self.resolve_entity_name(entity_b),
        ) else {
            return Vec::new();
        };

        let path = self.store.find_path(&a, &b, true, 4).await.unwrap_or_default();
        if !path.is_empty() {
            let mut out = Vec::new();
            for step in path {
                let evidence = self.hydrate_evidence(&step.evidence_refs).await;
                out.push(json!({
                    "step": step.step,
                    "entity_a": step.entity_a,
                    "entity_b": step.entity_b,
                    "evidence": evidence,
                }));
            }
            return out;
        }

        let full = self.store.find_path(&a, &b, false, 4).await.unwrap_or_default();
        if !full.is_empty() {
            debug!(a = %a, b = %b, "path hidden behind inactive topics");
            return vec![json!({
                "hidden": true,
                "message": "Connection exists through inactive topics",
            })];
        }
        Vec::new()
    }

    pub async fn get_hot_topic_context(
        &self,
        hot_topics: &[String],
    ) -> HashMap<String, Vec<TopicEntity>> {
        if hot_topics.is_empty() {
            return HashMap::new();
        }
        self.store
            .get_hot_topic_context(hot_topics)
            .await
            .unwrap_or_default()
    }
}

/// OpenAI-style function schemas for the closed tool set.
pub fn tool_schemas() -> Value {
    json!([
        {
            "type": "function",
            "function": {
                "name": "search_messages",
                "description": "Search past user messages. Use when looking for what the user said about a topic.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Keywords or phrase to search for"},
                        "limit": {"type": "integer", "description": "Max results (default 5)"}
                    },
                    "required": ["query"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "search_entities",
                "description": "Search for entities by name or alias. Use when you need a person/place/thing but aren't sure of the exact name.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Name or partial name to search"}
                    },
                    "required": ["query"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "get_profile",
                "description": "Get the full profile for a specific entity. Use when you know the name and need complete information.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "entity_name": {"type": "string", "description": "Canonical name of the entity"}
                    },
                    "required": ["entity_name"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "get_connections",
                "description": "Find all entities connected to a given entity. Use for relationships or 'who knows who'.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "entity_name": {"type": "string", "description": "Entity to find connections for"},
                        "active_only": {"type": "boolean", "description": "Exclude inactive topics (default true)"}
                    },
                    "required": ["entity_name"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "get_activity",
                "description": "Get recent interactions involving an entity. Use for 'what happened with X recently'.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "entity_name": {"type": "string", "description": "Entity to check activity for"},
                        "hours": {"type": "integer", "description": "How far back to look (default 24, 168 for a week)"}
                    },
                    "required": ["entity_name"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "find_path",
                "description": "Find the shortest connection path between two entities. Use for 'how is X connected to Y'. Requires both entities known.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "entity_a": {"type": "string", "description": "First entity name"},
                        "entity_b": {"type": "string", "description": "Second entity name"}
                    },
                    "required": ["entity_a", "entity_b"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "finish",
                "description": "Deliver the final answer. Requires evidence already gathered.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "response": {"type": "string", "description": "The final answer for the user"}
                    },
                    "required": ["response"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "request_clarification",
                "description": "Ask the user to clarify when the query cannot be answered from the graph.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "question": {"type": "string", "description": "The clarifying question"}
                    },
                    "required": ["question"]
                }
            }
        }
    ])
}
