//! Per-query agent context: accumulators, budgets, and the observability
//! trace.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use vestige_graph::TopicEntity;

/// One prior conversation turn shown back to the model.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

/// Accumulators grow monotonically across tool calls within one query.
#[derive(Debug, Default)]
pub struct AgentContext {
    pub user_query: String,
    pub trace_id: String,
    pub call_count: usize,
    pub attempt_count: usize,
    pub consecutive_rejections: usize,
    pub current_step: usize,
    pub history: Vec<Turn>,
    pub hot_topic_context: HashMap<String, Vec<TopicEntity>>,
    pub retrieved_messages: Vec<Value>,
    pub entity_profiles: Vec<Value>,
    pub graph_results: Vec<Value>,
    pub tools_used: Vec<String>,
}

impl AgentContext {
    pub fn new(user_query: impl Into<String>) -> Self {
        Self {
            user_query: user_query.into(),
            trace_id: Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }
}

/// One tool attempt, validated or not.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub step: usize,
    pub state: String,
    pub tool: String,
    pub args: Value,
    pub resolved_args: Value,
    pub result_summary: String,
    pub result_count: usize,
    pub duration_ms: f64,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueryTrace {
    pub trace_id: String,
    pub user_query: String,
    pub started_at: DateTime<Utc>,
    pub entries: Vec<TraceEntry>,
}

impl QueryTrace {
    pub fn new(trace_id: impl Into<String>, user_query: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            user_query: user_query.into(),
            started_at: Utc::now(),
            entries: Vec::new(),
        }
    }
}

/// Final outcome of an agent run.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunResult {
    Complete {
        response: String,
        tools_used: Vec<String>,
        state: String,
        messages: Vec<Value>,
        profiles: Vec<Value>,
        graph: Vec<Value>,
    },
    ClarificationNeeded {
        question: String,
        tools_used: Vec<String>,
        state: String,
    },
}

impl RunResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, RunResult::Complete { .. })
    }
}
