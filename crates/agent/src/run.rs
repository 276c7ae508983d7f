//! The agent dispatch loop.
//!
//! Builds a fresh tool surface per query, asks the agent model for exactly
//! one tool per turn, validates it against the state machine and budgets,
//! executes, accumulates evidence, and terminates with a complete answer or
//! a clarification — degrading to partial answers when budgets run out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use vestige_config::AgentConfig;
use vestige_graph::GraphStore;
use vestige_llm::{arg_i64, arg_str, LlmService, ToolInvocation};
use vestige_queue::{keys, Queue};
use vestige_resolver::EntityResolver;

use crate::context::{AgentContext, QueryTrace, RunResult, TraceEntry, Turn};
use crate::machine::{StateMachine, ToolName};
use crate::tools::{tool_schemas, Tools};

const NO_GRAPH_YET: &str = "I don't know much about your world yet. Tell me about the people, places, and things in your life and I'll start remembering.";

pub struct AgentRunner {
    user_name: String,
    persona: String,
    hot_topics: Vec<String>,
    llm: Arc<dyn LlmService>,
    store: Arc<dyn GraphStore>,
    resolver: Arc<EntityResolver>,
    queue: Arc<dyn Queue>,
    cfg: AgentConfig,
}

impl AgentRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_name: impl Into<String>,
        persona: impl Into<String>,
        hot_topics: Vec<String>,
        llm: Arc<dyn LlmService>,
        store: Arc<dyn GraphStore>,
        resolver: Arc<EntityResolver>,
        queue: Arc<dyn Queue>,
        cfg: AgentConfig,
    ) -> Self {
        Self {
            user_name: user_name.into(),
            persona: persona.into(),
            hot_topics,
            llm,
            store,
            resolver,
            queue,
            cfg,
        }
    }

    /// Answer one query, bounded end-to-end by the configured timeout.
    pub async fn run(&self, query: &str, history: Vec<Turn>) -> RunResult {
        let budget = Duration::from_secs(self.cfg.query_timeout_secs);
        match tokio::time::timeout(budget, self.run_inner(query, history)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(query, "agent query timed out");
                RunResult::ClarificationNeeded {
                    question: "That took longer than I expected. Could you ask again, maybe more specifically?".to_string(),
                    tools_used: Vec::new(),
                    state: "start".to_string(),
                }
            }
        }
    }

    async fn run_inner(&self, query: &str, history: Vec<Turn>) -> RunResult {
        // A maintenance notice, when present, prefixes whatever we answer.
        let warning = self
            .queue
            .get(keys::JOB_WARNING)
            .await
            .ok()
            .flatten()
            .map(|w| format!("{w}\n\n---\n\n"))
            .unwrap_or_default();

        let mut ctx = AgentContext::new(query);
        ctx.history = history;
        let mut trace = QueryTrace::new(ctx.trace_id.clone(), query);
        let mut machine = StateMachine::new();
        let tools = Tools::new(
            self.user_name.clone(),
            self.store.clone(),
            self.resolver.clone(),
            self.queue.clone(),
        );

        // A graph that only knows the user has nothing to answer from.
        if self.resolver.entity_count() <= 1 {
            return RunResult::Complete {
                response: NO_GRAPH_YET.to_string(),
                tools_used: Vec::new(),
                state: machine.state().as_str().to_string(),
                messages: Vec::new(),
                profiles: Vec::new(),
                graph: Vec::new(),
            };
        }

        if !self.hot_topics.is_empty() {
            ctx.hot_topic_context = tools.get_hot_topic_context(&self.hot_topics).await;
        }

        let schemas = tool_schemas();
        let mut last_results: Option<Vec<Value>> = None;

        while !machine.state().is_terminal() {
            ctx.attempt_count += 1;
            if ctx.attempt_count >= self.cfg.max_attempts {
                return RunResult::ClarificationNeeded {
                    question: "I'm having trouble processing this. Could you rephrase your question?".to_string(),
                    tools_used: ctx.tools_used,
                    state: machine.state().as_str().to_string(),
                };
            }

            if ctx.call_count >= self.cfg.max_calls {
                return self.budget_exhausted(warning, ctx, &machine);
            }

            ctx.current_step += 1;
            let step_start = Instant::now();

            let system = vestige_prompt::agent_system_prompt(
                &self.user_name,
                &chrono::Utc::now().format("%Y-%m-%d %H:%M UTC").to_string(),
                &self.persona,
            );
            let user = build_user_message(&ctx, machine.state().as_str(), self.cfg.max_calls, last_results.as_deref());

            let Some(response) = self.llm.call_with_tools(&system, &user, &schemas).await else {
                last_results = Some(vec![json!({
                    "tool": "model",
                    "error": "the model returned nothing; choose a tool",
                })]);
                continue;
            };

            if response.tool_calls.is_empty() {
                last_results = Some(vec![json!({
                    "tool": "model",
                    "error": "exactly one tool must be chosen",
                })]);
                continue;
            }

            // Terminal tools short-circuit when they arrive alone.
            if let Some(call) = response.single_call() {
                match ToolName::parse(&call.name) {
                    Some(ToolName::Finish) => {
                        match machine.validate(ToolName::Finish, &call.arguments, &ctx, self.cfg.max_calls) {
                            Ok(()) => {
                                machine.record_call(ToolName::Finish, &call.arguments, &mut ctx);
                                machine.apply(ToolName::Finish);
                                self.log_trace(&trace);
                                return RunResult::Complete {
                                    response: format!("{warning}{}", arg_str(call, "response")),
                                    tools_used: ctx.tools_used,
                                    state: machine.state().as_str().to_string(),
                                    messages: ctx.retrieved_messages,
                                    profiles: ctx.entity_profiles,
                                    graph: ctx.graph_results,
                                };
                            }
                            Err(reason) => {
                                last_results =
                                    Some(vec![json!({"tool": "finish", "error": reason})]);
                                continue;
                            }
                        }
                    }
                    Some(ToolName::RequestClarification) => {
                        match machine.validate(
                            ToolName::RequestClarification,
                            &call.arguments,
                            &ctx,
                            self.cfg.max_calls,
                        ) {
                            Ok(()) => {
                                machine.apply(ToolName::RequestClarification);
                                self.log_trace(&trace);
                                return RunResult::ClarificationNeeded {
                                    question: format!("{warning}{}", arg_str(call, "question")),
                                    tools_used: ctx.tools_used,
                                    state: machine.state().as_str().to_string(),
                                };
                            }
                            Err(reason) => {
                                last_results = Some(vec![
                                    json!({"tool": "request_clarification", "error": reason}),
                                ]);
                                continue;
                            }
                        }
                    }
                    _ => {}
                }
            }

            let mut results = Vec::new();
            let mut any_success = false;
            for call in &response.tool_calls {
                let Some(tool) = ToolName::parse(&call.name) else {
                    results.push(json!({"tool": call.name, "error": "unknown tool"}));
                    ctx.consecutive_rejections += 1;
                    continue;
                };
                if matches!(tool, ToolName::Finish | ToolName::RequestClarification) {
                    // Terminal tools mixed into a multi-call batch are ignored.
                    continue;
                }

                match machine.validate(tool, &call.arguments, &ctx, self.cfg.max_calls) {
                    Err(reason) => {
                        trace.entries.push(TraceEntry {
                            step: ctx.current_step,
                            state: machine.state().as_str().to_string(),
                            tool: tool.as_str().to_string(),
                            args: call.arguments.clone(),
                            resolved_args: Value::Null,
                            result_summary: format!("Validation failed: {reason}"),
                            result_count: 0,
                            duration_ms: step_start.elapsed().as_secs_f64() * 1000.0,
                            error: Some(reason.clone()),
                        });
                        results.push(json!({"tool": tool.as_str(), "error": reason}));
                        ctx.consecutive_rejections += 1;
                        if ctx.consecutive_rejections >= self.cfg.max_consecutive_rejections {
                            break;
                        }
                    }
                    Ok(()) => {
                        let data = self.dispatch(&tools, tool, call).await;
                        let (summary, count) = summarize_result(tool, &data);
                        trace.entries.push(TraceEntry {
                            step: ctx.current_step,
                            state: machine.state().as_str().to_string(),
                            tool: tool.as_str().to_string(),
                            args: call.arguments.clone(),
                            resolved_args: call.arguments.clone(),
                            result_summary: summary,
                            result_count: count,
                            duration_ms: step_start.elapsed().as_secs_f64() * 1000.0,
                            error: None,
                        });

                        machine.record_call(tool, &call.arguments, &mut ctx);
                        ctx.consecutive_rejections = 0;
                        any_success = true;
                        machine.apply(tool);
                        update_accumulators(&mut ctx, tool, &data);
                        results.push(json!({"tool": tool.as_str(), "result": {"data": data}}));
                    }
                }
            }

            if ctx.consecutive_rejections >= self.cfg.max_consecutive_rejections && !any_success {
                self.log_trace(&trace);
                return if StateMachine::can_finish(&ctx) {
                    RunResult::Complete {
                        response: format!(
                            "{warning}I found some information but had trouble completing the search."
                        ),
                        tools_used: ctx.tools_used,
                        state: machine.state().as_str().to_string(),
                        messages: ctx.retrieved_messages,
                        profiles: ctx.entity_profiles,
                        graph: ctx.graph_results,
                    }
                } else {
                    RunResult::ClarificationNeeded {
                        question: "I'm having trouble with that search. Could you rephrase or be more specific?".to_string(),
                        tools_used: ctx.tools_used,
                        state: machine.state().as_str().to_string(),
                    }
                };
            }

            last_results = Some(results);
            machine.try_advance(&ctx);
        }

        // A terminal state reached without an explicit finish/clarify is a
        // state error; never surface a raw failure.
        self.log_trace(&trace);
        RunResult::Complete {
            response: format!("{warning}I encountered a state error and could not finish."),
            tools_used: ctx.tools_used,
            state: machine.state().as_str().to_string(),
            messages: ctx.retrieved_messages,
            profiles: ctx.entity_profiles,
            graph: ctx.graph_results,
        }
    }

    /// Out of calls: partial answer when evidence exists, clarification
    /// otherwise.
    fn budget_exhausted(
        &self,
        warning: String,
        ctx: AgentContext,
        machine: &StateMachine,
    ) -> RunResult {
        if StateMachine::can_finish(&ctx) {
            let mut response =
                String::from("Here's what I found, though I couldn't fully answer your question:\n");
            let names: Vec<String> = ctx
                .entity_profiles
                .iter()
                .filter_map(|p| {
                    p.get("canonical_name")
                        .or_else(|| p.get("name"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .collect();
            if !names.is_empty() {
                response.push_str(&format!("- Found profiles: {}\n", names.join(", ")));
            }
            if !ctx.retrieved_messages.is_empty() {
                response.push_str(&format!(
                    "- Found {} related messages\n",
                    ctx.retrieved_messages.len()
                ));
            }

            RunResult::Complete {
                response: format!("{warning}{response}"),
                tools_used: ctx.tools_used,
                state: machine.state().as_str().to_string(),
                messages: ctx.retrieved_messages,
                profiles: ctx.entity_profiles,
                graph: ctx.graph_results,
            }
        } else {
            RunResult::ClarificationNeeded {
                question: "I couldn't find relevant information. Could you rephrase or be more specific?".to_string(),
                tools_used: ctx.tools_used,
                state: machine.state().as_str().to_string(),
            }
        }
    }

    async fn dispatch(&self, tools: &Tools, tool: ToolName, call: &ToolInvocation) -> Value {
        match tool {
            ToolName::SearchMessages => {
                let query = arg_str(call, "query");
                let limit = arg_i64(call, "limit", 5).max(1) as usize;
                Value::Array(tools.search_messages(&query, limit).await)
            }
            ToolName::SearchEntities => {
                Value::Array(tools.search_entities(&arg_str(call, "query")).await)
            }
            ToolName::GetProfile => tools
                .get_profile(&arg_str(call, "entity_name"))
                .await
                .unwrap_or(Value::Null),
            ToolName::GetConnections => {
                let active_only = call
                    .arguments
                    .get("active_only")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                Value::Array(
                    tools
                        .get_connections(&arg_str(call, "entity_name"), active_only)
                        .await,
                )
            }
            ToolName::GetActivity => {
                let hours = arg_i64(call, "hours", self.cfg.activity_hours);
                Value::Array(
                    tools
                        .get_recent_activity(&arg_str(call, "entity_name"), hours)
                        .await,
                )
            }
            ToolName::FindPath => Value::Array(
                tools
                    .find_path(&arg_str(call, "entity_a"), &arg_str(call, "entity_b"))
                    .await,
            ),
            ToolName::Finish | ToolName::RequestClarification => Value::Null,
        }
    }

    fn log_trace(&self, trace: &QueryTrace) {
        info!(
            trace_id = %trace.trace_id,
            steps = trace.entries.len(),
            "query trace completed"
        );
        for entry in &trace.entries {
            debug!(
                step = entry.step,
                tool = %entry.tool,
                summary = %entry.result_summary,
                duration_ms = entry.duration_ms,
                "trace step"
            );
        }
    }
}

/// Render the per-turn user message: query, state, remaining budget, last
/// results, and truncated accumulators.
fn build_user_message(
    ctx: &AgentContext,
    state: &str,
    max_calls: usize,
    last_results: Option<&[Value]>,
) -> String {
    let mut msg = String::new();

    if !ctx.history.is_empty() {
        msg.push_str("**Recent conversation:**\n");
        let start = ctx.history.len().saturating_sub(4);
        for turn in &ctx.history[start..] {
            msg.push_str(&format!("{}: {}\n", turn.role, turn.content));
        }
        msg.push('\n');
    }

    msg.push_str(&format!("**Query:** {}\n", ctx.user_query));
    msg.push_str(&format!("**State:** {state}\n"));
    msg.push_str(&format!(
        "**Calls remaining:** {}\n",
        max_calls.saturating_sub(ctx.call_count)
    ));

    if let Some(results) = last_results {
        msg.push_str("\n**Last tool result(s):**\n");
        for result in results {
            let tool = result
                .get("tool")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            if let Some(error) = result.get("error").and_then(Value::as_str) {
                msg.push_str(&format!("- `{tool}`: Error - {error}\n"));
            } else {
                let data = result
                    .get("result")
                    .and_then(|r| r.get("data"))
                    .cloned()
                    .unwrap_or(Value::Null);
                let empty = data.is_null()
                    || data.as_array().map(Vec::is_empty).unwrap_or(false);
                if empty {
                    msg.push_str(&format!("- `{tool}`: No results found\n"));
                } else {
                    let rendered = data.to_string();
                    let clipped: String = rendered.chars().take(500).collect();
                    msg.push_str(&format!("- `{tool}`: {clipped}\n"));
                }
            }
        }
    }

    if !ctx.hot_topic_context.is_empty() {
        if let Ok(rendered) = serde_json::to_string(&ctx.hot_topic_context) {
            msg.push_str(&format!("\n**Hot topic context (pre-fetched):**\n{rendered}\n"));
        }
    }
    if !ctx.entity_profiles.is_empty() {
        msg.push_str(&format!(
            "\n**Accumulated profiles ({}):**\n{}\n",
            ctx.entity_profiles.len(),
            truncated_json(&ctx.entity_profiles)
        ));
    }
    if !ctx.graph_results.is_empty() {
        msg.push_str(&format!(
            "\n**Accumulated graph results ({}):**\n{}\n",
            ctx.graph_results.len(),
            truncated_json(&ctx.graph_results)
        ));
    }
    if !ctx.retrieved_messages.is_empty() {
        msg.push_str(&format!(
            "\n**Accumulated messages ({}):**\n{}\n",
            ctx.retrieved_messages.len(),
            truncated_json(&ctx.retrieved_messages)
        ));
    }

    msg
}

fn truncated_json(values: &[Value]) -> String {
    let rendered = serde_json::to_string(values).unwrap_or_default();
    if rendered.chars().count() > 4000 {
        let clipped: String = rendered.chars().take(4000).collect();
        format!("{clipped}…")
    } else {
        rendered
    }
}

fn update_accumulators(ctx: &mut AgentContext, tool: ToolName, data: &Value) {
    match tool {
        ToolName::SearchMessages => {
            if let Some(items) = data.as_array() {
                ctx.retrieved_messages.extend(items.iter().cloned());
            }
        }
        ToolName::SearchEntities => {
            if let Some(items) = data.as_array() {
                ctx.entity_profiles.extend(items.iter().cloned());
            }
        }
        ToolName::GetProfile => {
            if !data.is_null() {
                ctx.entity_profiles.push(data.clone());
            }
        }
        ToolName::GetConnections | ToolName::GetActivity | ToolName::FindPath => {
            if let Some(items) = data.as_array() {
                ctx.graph_results.extend(items.iter().cloned());
            }
        }
        ToolName::Finish | ToolName::RequestClarification => {}
    }
}

fn summarize_result(tool: ToolName, data: &Value) -> (String, usize) {
    match tool {
        ToolName::GetProfile => {
            if data.is_null() {
                ("Not found".to_string(), 0)
            } else {
                let name = data
                    .get("canonical_name")
                    .or_else(|| data.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let entity_type = data
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                (format!("Found: {name} ({entity_type})"), 1)
            }
        }
        ToolName::FindPath => {
            let count = data.as_array().map(Vec::len).unwrap_or(0);
            if count == 0 {
                ("No path".to_string(), 0)
            } else {
                (format!("Path found: {count} hops"), count)
            }
        }
        _ => {
            let count = data.as_array().map(Vec::len).unwrap_or(0);
            (format!("Found {count} results"), count)
        }
    }
}
