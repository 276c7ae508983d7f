//! Single-process wiring: in-memory queue and graph, the real LLM client,
//! ingest + builder + scheduler + agent, and a line-oriented shell.
//!
//! Plain lines are ingested as messages; `/ask <question>` queries the
//! agent; `/quit` drains and exits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vestige_agent::{AgentRunner, RunResult, Turn};
use vestige_config::AppConfig;
use vestige_graph::{GraphBuilder, GraphStore, MemoryGraph};
use vestige_jobs::{
    DlqReplayJob, MergeDetectionJob, MoodCheckpointJob, ProfileRefinementJob, Scheduler,
};
use vestige_llm::{LlmService, OpenRouterClient};
use vestige_nlp::NlpPipeline;
use vestige_queue::{MemoryQueue, Queue};
use vestige_resolver::{EntityResolver, HashEmbedder};
use vestige_runtime::IngestContext;

#[derive(Parser, Debug)]
#[command(name = "vestige", about = "Personal knowledge-graph memory layer")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "vestige.toml")]
    config: PathBuf,

    /// Override the configured user name.
    #[arg(long)]
    user: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let mut cfg = AppConfig::load_from(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    if let Some(user) = args.user {
        cfg.user.user_name = user;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.telemetry.log_level.clone())),
        )
        .init();

    let api_key = std::env::var(&cfg.llm.api_key_env)
        .with_context(|| format!("{} must be set", cfg.llm.api_key_env))?;

    let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new());
    let store: Arc<dyn GraphStore> = Arc::new(MemoryGraph::new());
    let llm: Arc<dyn LlmService> = Arc::new(OpenRouterClient::new(
        cfg.llm.base_url.clone(),
        api_key,
        cfg.llm.structured_model.clone(),
        cfg.llm.reasoning_model.clone(),
        cfg.llm.agent_model.clone(),
        cfg.llm.max_retries,
        Duration::from_secs(cfg.llm.request_timeout_secs),
    ));
    let resolver = Arc::new(EntityResolver::new(
        Arc::new(HashEmbedder::new(cfg.resolver.embedding_dim)),
        cfg.resolver.clone(),
    ));
    let nlp = Arc::new(NlpPipeline::new(llm.clone()));

    let ctx = IngestContext::bootstrap(
        cfg.clone(),
        queue.clone(),
        store.clone(),
        llm.clone(),
        resolver.clone(),
        nlp,
    )
    .await?;

    let builder = Arc::new(GraphBuilder::new(queue.clone(), store.clone()));
    let builder_task = {
        let builder = builder.clone();
        tokio::spawn(async move {
            if let Err(err) = builder.run().await {
                error!(error = %err, "graph builder exited");
            }
        })
    };

    let scheduler = Scheduler::new(
        cfg.user.user_name.clone(),
        queue.clone(),
        Duration::from_secs(cfg.scheduler.check_interval_secs),
    )
    .register(Arc::new(MergeDetectionJob::new(
        resolver.clone(),
        store.clone(),
        llm.clone(),
        ctx.batch_lock(),
        cfg.scheduler.clone(),
    )))
    .register(Arc::new(ProfileRefinementJob::new(
        llm.clone(),
        resolver.clone(),
        store.clone(),
        cfg.scheduler.clone(),
        cfg.pipeline.clone(),
    )))
    .register(Arc::new(MoodCheckpointJob::new(
        store.clone(),
        cfg.scheduler.mood_volume_threshold,
    )))
    .register(Arc::new(DlqReplayJob::new(
        cfg.scheduler.dlq_replay_interval_secs as f64,
        cfg.scheduler.dlq_batch_size,
    )));
    scheduler.start().await;

    let agent = AgentRunner::new(
        cfg.user.user_name.clone(),
        cfg.user.persona.clone(),
        cfg.user.hot_topics.clone(),
        llm,
        store,
        resolver,
        queue,
        cfg.agent.clone(),
    );

    info!(user = %cfg.user.user_name, "vestige ready — type a message, /ask <question>, or /quit");

    let mut history: Vec<Turn> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "/quit" {
            break;
        }

        if let Some(question) = line.strip_prefix("/ask ") {
            scheduler.record_activity().await;
            let result = agent.run(question, history.clone()).await;
            let reply = match result {
                RunResult::Complete { response, .. } => response,
                RunResult::ClarificationNeeded { question, .. } => question,
            };
            println!("{reply}");
            history.push(Turn {
                role: "user".to_string(),
                content: question.to_string(),
            });
            history.push(Turn {
                role: "assistant".to_string(),
                content: reply,
            });
            continue;
        }

        scheduler.record_activity().await;
        match ctx.add_message(line).await {
            Ok(id) => info!(message_id = id, "buffered"),
            Err(err) => error!(error = %err, "failed to buffer message"),
        }
    }

    info!("shutting down");
    ctx.shutdown().await?;
    scheduler.stop().await;
    builder.stop();
    let _ = tokio::time::timeout(Duration::from_secs(5), builder_task).await;
    Ok(())
}
