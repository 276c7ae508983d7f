//! Query state machine.
//!
//! States and transitions are pure data; the machine layers call budgets,
//! duplicate-call suppression, and evidence checks on top. Every proposed
//! tool is validated here before anything executes.

use std::collections::HashSet;

use serde_json::Value;

use crate::context::AgentContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    Start,
    Exploring,
    Grounded,
    Clarify,
    Complete,
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Clarify | AgentState::Complete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Start => "start",
            AgentState::Exploring => "exploring",
            AgentState::Grounded => "grounded",
            AgentState::Clarify => "clarify",
            AgentState::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    SearchMessages,
    SearchEntities,
    GetProfile,
    GetConnections,
    GetActivity,
    FindPath,
    Finish,
    RequestClarification,
}

impl ToolName {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "search_messages" => Some(Self::SearchMessages),
            "search_entities" => Some(Self::SearchEntities),
            "get_profile" => Some(Self::GetProfile),
            "get_connections" => Some(Self::GetConnections),
            "get_activity" => Some(Self::GetActivity),
            "find_path" => Some(Self::FindPath),
            "finish" => Some(Self::Finish),
            "request_clarification" => Some(Self::RequestClarification),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SearchMessages => "search_messages",
            Self::SearchEntities => "search_entities",
            Self::GetProfile => "get_profile",
            Self::GetConnections => "get_connections",
            Self::GetActivity => "get_activity",
            Self::FindPath => "find_path",
            Self::Finish => "finish",
            Self::RequestClarification => "request_clarification",
        }
    }
}

use AgentState::*;
use ToolName::*;

/// The full transition table. Anything not listed is rejected.
const TRANSITIONS: &[(AgentState, ToolName, AgentState)] = &[
    (Start, SearchMessages, Exploring),
    (Exploring, SearchMessages, Exploring),
    (Grounded, SearchMessages, Grounded),
    (Start, SearchEntities, Exploring),
    (Exploring, SearchEntities, Exploring),
    (Grounded, SearchEntities, Grounded),
    (Exploring, GetProfile, Exploring),
    (Grounded, GetProfile, Grounded),
    (Exploring, GetConnections, Exploring),
    (Grounded, GetConnections, Grounded),
    (Exploring, GetActivity, Exploring),
    (Grounded, GetActivity, Grounded),
    (Grounded, FindPath, Grounded),
    (Exploring, Finish, Complete),
    (Grounded, Finish, Complete),
    (Start, RequestClarification, Clarify),
    (Exploring, RequestClarification, Clarify),
    (Grounded, RequestClarification, Clarify),
];

pub fn transition(state: AgentState, tool: ToolName) -> Option<AgentState> {
    TRANSITIONS
        .iter()
        .find(|(from, t, _)| *from == state && *t == tool)
        .map(|(_, _, to)| *to)
}

pub struct StateMachine {
    state: AgentState,
    previous_calls: HashSet<(ToolName, String)>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: AgentState::Start,
            previous_calls: HashSet::new(),
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn can_finish(ctx: &AgentContext) -> bool {
        !ctx.entity_profiles.is_empty()
            || !ctx.retrieved_messages.is_empty()
            || !ctx.graph_results.is_empty()
    }

    /// Validate a proposed call against budget, history, evidence, and the
    /// transition table. Returns the rejection reason on failure.
    pub fn validate(
        &self,
        tool: ToolName,
        args: &Value,
        ctx: &AgentContext,
        max_calls: usize,
    ) -> Result<(), String> {
        if tool == ToolName::RequestClarification {
            return match transition(self.state, tool) {
                Some(_) => Ok(()),
                None => Err(format!("cannot clarify from {}", self.state.as_str())),
            };
        }

        if ctx.call_count >= max_calls {
            return Err("call limit reached".to_string());
        }

        let signature = (tool, vestige_llm::canonical_args(args));
        if self.previous_calls.contains(&signature) {
            return Err(format!(
                "already called {} with these args; the result is in accumulated context — use it or try a different tool",
                tool.as_str()
            ));
        }

        if tool == ToolName::Finish && !Self::can_finish(ctx) {
            return Err("no evidence gathered".to_string());
        }

        match transition(self.state, tool) {
            Some(_) => Ok(()),
            None => Err(format!(
                "cannot {} from {}",
                tool.as_str(),
                self.state.as_str()
            )),
        }
    }

    pub fn record_call(&mut self, tool: ToolName, args: &Value, ctx: &mut AgentContext) {
        self.previous_calls
            .insert((tool, vestige_llm::canonical_args(args)));
        ctx.call_count += 1;
        ctx.tools_used.push(tool.as_str().to_string());
    }

    /// Drive the state along the table for an accepted tool.
    pub fn apply(&mut self, tool: ToolName) {
        if let Some(next) = transition(self.state, tool) {
            self.state = next;
        }
    }

    /// Internal advance: exploring becomes grounded once a profile plus
    /// some graph or message evidence has accumulated.
    pub fn try_advance(&mut self, ctx: &AgentContext) {
        if self.state == AgentState::Exploring
            && !ctx.entity_profiles.is_empty()
            && (!ctx.graph_results.is_empty() || !ctx.retrieved_messages.is_empty())
        {
            self.state = AgentState::Grounded;
        }
    }
}
