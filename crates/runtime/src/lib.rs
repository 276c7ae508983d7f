//! Ingest runtime: the user-scoped buffer, the five-stage batch pipeline,
//! publication to the structure/profile streams, and graceful shutdown.

mod context;
mod processor;

pub use context::IngestContext;
pub use processor::{
    BatchProcessor, BatchResult, ConnectionExtraction, DisambiguationResult, EntityPair,
    MessageConnections, ResolutionEntry, ResolvedEntity, Verdict,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One raw user message as buffered and replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageData {
    pub id: i64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageData {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// A dead-lettered batch: the error class plus the preserved messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub timestamp: f64,
    pub error: String,
    pub batch_size: usize,
    pub messages: Vec<MessageData>,
}

/// Render messages the way every reasoning prompt expects them.
pub(crate) fn messages_text(messages: &[MessageData]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: \"{}\"", m.id, m.message))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Human relative-time annotation for profile observations.
pub(crate) fn relative_time(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let delta = (now - then).num_seconds().max(0);
    if delta < 3600 {
        let mins = delta / 60;
        if mins > 1 {
            format!("{mins}m ago")
        } else {
            "just now".to_string()
        }
    } else if delta < 86_400 {
        format!("{}h ago", delta / 3600)
    } else {
        format!("{}d ago", delta / 86_400)
    }
}
