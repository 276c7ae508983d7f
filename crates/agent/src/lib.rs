//! Conversational agent over the knowledge graph: a state-machine-driven
//! tool dispatcher with call budgets, duplicate suppression, and graceful
//! partial answers.

mod context;
mod machine;
mod run;
mod tools;

pub use context::{AgentContext, QueryTrace, RunResult, TraceEntry, Turn};
pub use machine::{transition, AgentState, StateMachine, ToolName};
pub use run::AgentRunner;
pub use tools::{tool_schemas, Tools};
