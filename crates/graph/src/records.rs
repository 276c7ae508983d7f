//! Wire records published to the structure and profile streams.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordKind {
    UserMessage,
    ProfileUpdate,
    SystemEntity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: i64,
    pub canonical_name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub confidence: f64,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub topic: String,
    /// Empty for newly-created entities; the profile job fills it later.
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub last_profiled_msg_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipRecord {
    /// Alphabetically first canonical name.
    pub entity_a: String,
    /// Alphabetically second canonical name.
    pub entity_b: String,
    /// Evidence message in `msg_<int>` form.
    pub message_id: String,
    pub confidence: f64,
}

impl RelationshipRecord {
    /// Build a canonicalized pair: (A,B) and (B,A) collapse to one edge.
    pub fn new(a: &str, b: &str, message_id: i64, confidence: f64) -> Self {
        let (entity_a, entity_b) = if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };
        Self {
            entity_a,
            entity_b,
            message_id: crate::msg_key(message_id),
            confidence,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub message_id: i64,
    #[serde(rename = "type")]
    pub kind: RecordKind,
    #[serde(default)]
    pub entities: Vec<EntityRecord>,
    #[serde(default)]
    pub relationships: Vec<RelationshipRecord>,
}

impl BatchRecord {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relationship_pair_is_sorted() {
        let rel = RelationshipRecord::new("Priya", "IronWorks", 7, 0.9);
        assert_eq!(rel.entity_a, "IronWorks");
        assert_eq!(rel.entity_b, "Priya");
        assert_eq!(rel.message_id, "msg_7");
    }

    #[test]
    fn record_round_trips_with_kind_tag() {
        let record = BatchRecord {
            message_id: 3,
            kind: RecordKind::UserMessage,
            entities: vec![EntityRecord {
                id: 1,
                canonical_name: "Chloe".into(),
                entity_type: "person".into(),
                confidence: 1.0,
                aliases: vec!["Chlo".into()],
                summary: String::new(),
                topic: "General".into(),
                embedding: vec![],
                last_profiled_msg_id: 0,
            }],
            relationships: vec![RelationshipRecord::new("Chloe", "User", 3, 0.9)],
        };

        let json = record.to_json().unwrap();
        assert!(json.contains("\"USER_MESSAGE\""));
        assert!(json.contains("\"type\":\"person\""));

        let back = BatchRecord::from_json(&json).unwrap();
        assert_eq!(back.message_id, 3);
        assert_eq!(back.entities[0].canonical_name, "Chloe");
        assert_eq!(back.relationships[0].entity_a, "Chloe");
    }
}
