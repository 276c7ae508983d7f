//! The typed operation set the core consumes. Every operation is atomic on
//! its inputs; implementations handle their own concurrency.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::records::{EntityRecord, RelationshipRecord};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph store error: {0}")]
    Store(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicStatus {
    Active,
    Hot,
    Inactive,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntitySummary {
    pub id: i64,
    pub name: String,
    pub summary: String,
    #[serde(rename = "type")]
    pub entity_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityProfileView {
    pub id: i64,
    pub canonical_name: String,
    pub aliases: Vec<String>,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub summary: String,
    pub last_mentioned: i64,
    pub last_updated: i64,
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionView {
    pub source: String,
    pub target: String,
    pub target_summary: String,
    pub connection_strength: i64,
    pub evidence_ids: Vec<String>,
    pub confidence: f64,
    pub last_seen: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityView {
    pub entity: String,
    pub evidence_ids: Vec<String>,
    pub time: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathStep {
    pub step: usize,
    pub entity_a: String,
    pub entity_b: String,
    pub evidence_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicEntity {
    pub name: String,
    pub summary: String,
}

/// Everything the resolver needs to rebuild its state in one pass.
#[derive(Debug, Clone)]
pub struct HydratedEntity {
    pub id: i64,
    pub canonical_name: String,
    pub aliases: Vec<String>,
    pub entity_type: String,
    pub topic: Option<String>,
    pub summary: String,
    pub embedding: Vec<f32>,
    pub last_profiled_msg_id: i64,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Upsert entities (merge by id, union aliases, max confidence, bump
    /// last_mentioned/last_updated, maintain the topic edge) and upsert
    /// relationships (merge by canonical pair, increment weight, union
    /// message ids, max confidence, bump last_seen).
    async fn write_batch(
        &self,
        entities: &[EntityRecord],
        relationships: &[RelationshipRecord],
        is_user_message: bool,
    ) -> Result<(), GraphError>;

    /// Profile-only update; never touches relationships.
    async fn update_entity_profile(
        &self,
        id: i64,
        canonical_name: &str,
        summary: &str,
        embedding: &[f32],
        last_msg_id: i64,
        topic: &str,
    ) -> Result<(), GraphError>;

    /// Fold `secondary_id` into `primary_id` in a single transaction and
    /// delete the secondary. Returns false when either entity is missing.
    async fn merge_entities(
        &self,
        primary_id: i64,
        secondary_id: i64,
        merged_summary: &str,
    ) -> Result<bool, GraphError>;

    async fn search_entity(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<EntitySummary>, GraphError>;

    async fn get_entity_profile(
        &self,
        name: &str,
    ) -> Result<Option<EntityProfileView>, GraphError>;

    async fn get_related_entities(
        &self,
        names: &[String],
        active_only: bool,
    ) -> Result<Vec<ConnectionView>, GraphError>;

    /// Edges touching `name` whose last_seen falls inside the window.
    /// `last_seen` is millisecond epoch; the cutoff is `now - hours * 3_600_000`.
    async fn get_recent_activity(
        &self,
        name: &str,
        hours: i64,
    ) -> Result<Vec<ActivityView>, GraphError>;

    /// Shortest path between two canonical names, bounded at `max_depth`
    /// hops, with per-edge evidence ids. Empty when no path exists.
    async fn find_path(
        &self,
        start_name: &str,
        end_name: &str,
        active_only: bool,
        max_depth: usize,
    ) -> Result<Vec<PathStep>, GraphError>;

    /// Up to three most-recently-mentioned entities per hot topic.
    async fn get_hot_topic_context(
        &self,
        topics: &[String],
    ) -> Result<HashMap<String, Vec<TopicEntity>>, GraphError>;

    async fn get_all_entities_for_hydration(&self) -> Result<Vec<HydratedEntity>, GraphError>;

    async fn set_topic_status(&self, name: &str, status: TopicStatus) -> Result<(), GraphError>;

    /// Write a DailyMood checkpoint linked to the user entity.
    async fn log_mood_checkpoint(
        &self,
        user_name: &str,
        primary: &str,
        primary_count: usize,
        secondary: &str,
        secondary_count: usize,
        message_count: usize,
    ) -> Result<(), GraphError>;

    /// Delete entities whose type is missing; returns how many went.
    async fn cleanup_null_entities(&self) -> Result<usize, GraphError>;

    /// Highest entity id in the graph, for counter sync at startup.
    async fn max_entity_id(&self) -> Result<i64, GraphError>;
}
