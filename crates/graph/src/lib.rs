//! Typed graph persistence.
//!
//! The core consumes the graph through [`GraphStore`]; nothing else in the
//! workspace knows how edges are stored. [`MemoryGraph`] implements the full
//! contract in-process, and [`GraphBuilder`] is the consumer that applies
//! stream records to whatever store is wired in.

mod builder;
mod memory;
mod records;
mod store;

pub use builder::GraphBuilder;
pub use memory::MemoryGraph;
pub use records::{BatchRecord, EntityRecord, RecordKind, RelationshipRecord};
pub use store::{
    ActivityView, ConnectionView, EntityProfileView, EntitySummary, GraphError, GraphStore,
    HydratedEntity, PathStep, TopicEntity, TopicStatus,
};

/// Current wall clock as millisecond epoch — the unit every graph timestamp
/// uses.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Render a message id in its wire form.
pub fn msg_key(id: i64) -> String {
    format!("msg_{id}")
}
