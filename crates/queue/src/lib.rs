//! Durable message-plumbing interface.
//!
//! The core never talks to a broker directly — everything goes through the
//! [`Queue`] trait: the per-user message buffer, the structure/profile
//! streams the graph builder consumes, dead-letter lists, counters, and the
//! short-TTL flags jobs coordinate through. [`MemoryQueue`] implements the
//! whole surface in-process for tests and single-node wiring.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
pub use memory::MemoryQueue;

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),
    #[error("no such consumer group '{group}' on stream '{stream}'")]
    GroupMissing { stream: String, group: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One entry delivered from a stream read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub stream: String,
    pub id: String,
    pub payload: String,
}

#[async_trait]
pub trait Queue: Send + Sync {
    // ── lists ────────────────────────────────────────────────────────────

    async fn rpush(&self, key: &str, value: &str) -> Result<usize>;
    async fn lpop(&self, key: &str) -> Result<Option<String>>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    async fn llen(&self, key: &str) -> Result<usize>;
    /// Atomically remove and return up to `count` items from the front.
    async fn pop_batch(&self, key: &str, count: usize) -> Result<Vec<String>>;

    // ── key/value ────────────────────────────────────────────────────────

    async fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Set with a time-to-live; the key vanishes once the TTL elapses.
    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Increment an integer key, creating it at 1.
    async fn incr(&self, key: &str) -> Result<i64>;

    // ── sets ─────────────────────────────────────────────────────────────

    /// Returns true when the member was newly added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;
    async fn scard(&self, key: &str) -> Result<usize>;
    /// Remove and return every member.
    async fn spop_all(&self, key: &str) -> Result<Vec<String>>;

    // ── sorted sets ──────────────────────────────────────────────────────

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    /// Members from highest to lowest score, `start..=stop` by rank.
    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    /// Keep only the `keep` highest-scored members.
    async fn ztrim_to(&self, key: &str, keep: usize) -> Result<()>;

    // ── hashes ───────────────────────────────────────────────────────────

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>>;

    // ── streams ──────────────────────────────────────────────────────────

    /// Append a payload; returns the assigned stream id.
    async fn xadd(&self, stream: &str, payload: &str) -> Result<String>;
    /// Create the consumer group if it does not exist (idempotent).
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;
    /// Read up to `count` new entries for `group` across `streams`, blocking
    /// up to `block` when nothing is available. Delivered entries stay
    /// pending until [`Queue::ack`].
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;
}

/// Key construction for the whole topology, in one place.
pub mod keys {
    pub const STREAM_STRUCTURE: &str = "stream:structure";
    pub const STREAM_PROFILE: &str = "stream:profile";
    pub const STREAM_BUILDER_DEAD: &str = "stream:builder_dead_letters";
    pub const BUILDER_GROUP: &str = "group:graph_builders";

    pub const NEXT_MSG_ID: &str = "global:next_msg_id";
    pub const NEXT_ENT_ID: &str = "global:next_ent_id";
    pub const JOB_WARNING: &str = "system:active_job_warning";
    pub const MAINTENANCE_LOCK: &str = "system:maintenance_lock";

    pub fn buffer(user: &str) -> String {
        format!("buffer:{user}")
    }

    pub fn dlq(user: &str) -> String {
        format!("dlq:{user}")
    }

    pub fn parked(user: &str) -> String {
        format!("dlq:parked:{user}")
    }

    pub fn emotions(user: &str) -> String {
        format!("emotions:{user}")
    }

    pub fn dirty_entities(user: &str) -> String {
        format!("dirty_entities:{user}")
    }

    pub fn recent_messages(user: &str) -> String {
        format!("recent_messages:{user}")
    }

    pub fn message_content(user: &str) -> String {
        format!("message_content:{user}")
    }

    pub fn merge_proposals(user: &str) -> String {
        format!("merge_proposals:{user}")
    }

    pub fn last_activity(user: &str) -> String {
        format!("last_activity:{user}")
    }

    pub fn pending(user: &str, job: &str) -> String {
        format!("pending:{user}:{job}")
    }

    pub fn merge_ran(user: &str) -> String {
        format!("merge_ran:{user}")
    }

    pub fn profile_complete(user: &str) -> String {
        format!("profile_complete:{user}")
    }

    pub fn user_profile_ran(user: &str) -> String {
        format!("user_profile_ran:{user}")
    }
}
