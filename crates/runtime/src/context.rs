//! Per-user ingest orchestration.
//!
//! Owns the buffer, the batch mutex, the timeout task, publication to the
//! structure/profile streams, dead-lettering, and the fire-and-forget
//! profile side-tasks. The extraction stages themselves live in
//! [`crate::BatchProcessor`].

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::Utc;
use regex::RegexBuilder;
use serde_json::json;
use tokio::sync::{Mutex as TokioMutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vestige_config::AppConfig;
use vestige_graph::{BatchRecord, EntityRecord, GraphStore, RecordKind, RelationshipRecord};
use vestige_llm::LlmService;
use vestige_nlp::NlpPipeline;
use vestige_queue::{keys, Queue};
use vestige_resolver::EntityResolver;

use crate::processor::{BatchProcessor, BatchResult, ResolvedEntity};
use crate::{messages_text, relative_time, DlqEntry, MessageData};

/// Aliases seeded onto the user's root entity.
const USER_SELF_ALIASES: &[&str] = &["Me", "I", "Myself", "USER"];

/// Cheaply cloneable handle over the shared ingest state.
#[derive(Clone)]
pub struct IngestContext {
    core: Arc<IngestCore>,
}

struct IngestCore {
    user_name: String,
    queue: Arc<dyn Queue>,
    store: Arc<dyn GraphStore>,
    llm: Arc<dyn LlmService>,
    resolver: Arc<EntityResolver>,
    processor: BatchProcessor,
    cfg: AppConfig,

    /// Held across the whole pipeline for one batch; shared with the merge
    /// job so consolidation can exclude batch processing.
    batch_lock: Arc<TokioMutex<()>>,
    profile_sem: Arc<Semaphore>,
    background: StdMutex<Vec<JoinHandle<()>>>,
    batch_timer: StdMutex<Option<JoinHandle<()>>>,
    drain_task: StdMutex<Option<JoinHandle<()>>>,
}

impl IngestContext {
    /// Wire the ingest path and perform startup work: hydrate the resolver
    /// (failure here is fatal), sync the id counters, and seed the user
    /// entity if this is a fresh graph.
    pub async fn bootstrap(
        cfg: AppConfig,
        queue: Arc<dyn Queue>,
        store: Arc<dyn GraphStore>,
        llm: Arc<dyn LlmService>,
        resolver: Arc<EntityResolver>,
        nlp: Arc<NlpPipeline>,
    ) -> Result<Self> {
        resolver
            .hydrate(store.as_ref())
            .await
            .context("entity resolver hydration failed; refusing to start")?;

        // Counters must never fall behind ids already in the graph.
        let max_id = store.max_entity_id().await?;
        let current = queue
            .get(keys::NEXT_ENT_ID)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        if current < max_id {
            queue.set(keys::NEXT_ENT_ID, &max_id.to_string()).await?;
        }

        let user_name = cfg.user.user_name.clone();
        let processor = BatchProcessor::new(
            llm.clone(),
            resolver.clone(),
            nlp,
            queue.clone(),
            user_name.clone(),
            cfg.user.active_topics.clone(),
        );

        let core = Arc::new(IngestCore {
            user_name,
            queue,
            store,
            llm,
            resolver,
            processor,
            profile_sem: Arc::new(Semaphore::new(cfg.pipeline.profile_concurrency)),
            cfg,
            batch_lock: Arc::new(TokioMutex::new(())),
            background: StdMutex::new(Vec::new()),
            batch_timer: StdMutex::new(None),
            drain_task: StdMutex::new(None),
        });

        core.ensure_user_entity().await?;
        Ok(Self { core })
    }

    pub fn batch_lock(&self) -> Arc<TokioMutex<()>> {
        self.core.batch_lock.clone()
    }

    pub fn resolver(&self) -> Arc<EntityResolver> {
        self.core.resolver.clone()
    }

    /// Accept one raw message: assign its id, index it, buffer it, and kick
    /// batch processing when the buffer fills (or arm the timeout when this
    /// is the first entry).
    pub async fn add_message(&self, text: &str) -> Result<i64> {
        IngestCore::add_message(&self.core, text).await
    }

    /// Run one batch end-to-end. Public for interfaces that drive draining
    /// themselves; normal flow goes through the internal drain loop.
    pub async fn process_batch(&self) -> Result<()> {
        IngestCore::process_batch(&self.core).await
    }

    /// Start the drain loop unless one is already running.
    pub fn trigger_drain(&self) {
        IngestCore::trigger_drain(&self.core);
    }

    /// Cooperative shutdown: stop the timer, drain the buffer to empty, then
    /// wait for in-flight profile tasks up to the grace window.
    pub async fn shutdown(&self) -> Result<()> {
        IngestCore::shutdown(&self.core).await
    }

    /// Canonical text of the last `count` messages, oldest first.
    pub async fn recent_context(&self, count: usize) -> Result<Vec<String>> {
        self.core.recent_context(count).await
    }

    /// Full pipeline text rendering, exposed for job prompts.
    pub fn render_messages(messages: &[MessageData]) -> String {
        messages_text(messages)
    }
}

impl IngestCore {
    async fn ensure_user_entity(&self) -> Result<()> {
        if self.resolver.get_id(&self.user_name).is_some() {
            info!(user = %self.user_name, "user entity recognized");
            return Ok(());
        }

        info!(user = %self.user_name, "creating user root entity");
        let id = self.queue.incr(keys::NEXT_ENT_ID).await?;
        let aliases: Vec<String> = USER_SELF_ALIASES.iter().map(|s| s.to_string()).collect();
        self.resolver
            .register_entity(id, &self.user_name, &aliases, "person", "Meta");

        let summary = format!("The primary user named {}", self.user_name);
        let embedding = self
            .resolver
            .update_profile_summary(id, &summary)
            .unwrap_or_default();

        let record = BatchRecord {
            message_id: 0,
            kind: RecordKind::SystemEntity,
            entities: vec![EntityRecord {
                id,
                canonical_name: self.user_name.clone(),
                entity_type: "person".to_string(),
                confidence: 1.0,
                aliases,
                summary,
                topic: "Meta".to_string(),
                embedding,
                last_profiled_msg_id: 0,
            }],
            relationships: vec![],
        };
        self.queue
            .xadd(keys::STREAM_STRUCTURE, &record.to_json()?)
            .await?;
        Ok(())
    }

    async fn add_message(this: &Arc<Self>, text: &str) -> Result<i64> {
        let id = this.queue.incr(keys::NEXT_MSG_ID).await?;
        let msg = MessageData {
            id,
            message: text.trim().to_string(),
            timestamp: Utc::now(),
        };

        let content_key = keys::message_content(&this.user_name);
        let recent_key = keys::recent_messages(&this.user_name);
        let payload = json!({
            "message": msg.message,
            "timestamp": msg.timestamp.to_rfc3339(),
        })
        .to_string();
        this.queue
            .hset(&content_key, &vestige_graph::msg_key(id), &payload)
            .await?;
        this.queue
            .zadd(
                &recent_key,
                &vestige_graph::msg_key(id),
                msg.timestamp.timestamp_millis() as f64,
            )
            .await?;
        this.queue
            .ztrim_to(&recent_key, this.cfg.pipeline.recent_window)
            .await?;
        this.queue
            .set(
                &keys::last_activity(&this.user_name),
                &msg.timestamp.to_rfc3339(),
            )
            .await?;

        let buffer_key = keys::buffer(&this.user_name);
        this.queue.rpush(&buffer_key, &msg.to_json()?).await?;
        let buffered = this.queue.llen(&buffer_key).await?;

        if buffered >= this.cfg.pipeline.batch_size {
            this.cancel_batch_timer();
            Self::trigger_drain(this);
        } else if buffered == 1 {
            Self::arm_batch_timer(this);
        }

        Ok(id)
    }

    fn cancel_batch_timer(&self) {
        if let Some(handle) = self.batch_timer.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn arm_batch_timer(this: &Arc<Self>) {
        let core = this.clone();
        let timeout = Duration::from_secs(this.cfg.pipeline.batch_timeout_secs);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let buffer_key = keys::buffer(&core.user_name);
            if core.queue.llen(&buffer_key).await.unwrap_or(0) > 0 {
                info!("batch timeout reached");
                Self::trigger_drain(&core);
            }
        });
        *this.batch_timer.lock().unwrap() = Some(handle);
    }

    fn trigger_drain(this: &Arc<Self>) {
        let mut slot = this.drain_task.lock().unwrap();
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let core = this.clone();
        *slot = Some(tokio::spawn(async move {
            let buffer_key = keys::buffer(&core.user_name);
            loop {
                match core.queue.llen(&buffer_key).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                if let Err(err) = Self::process_batch(&core).await {
                    error!(error = %err, "batch processing failed");
                    break;
                }
            }
        }));
    }

    /// One batch under the batch mutex: refresh the resolver, pop up to
    /// batch_size messages, run the pipeline, publish or dead-letter, then
    /// schedule profile side-tasks.
    async fn process_batch(this: &Arc<Self>) -> Result<()> {
        let _guard = this.batch_lock.lock().await;

        // Late-arriving profile updates must be visible to this batch.
        this.resolver.hydrate(this.store.as_ref()).await?;

        let buffer_key = keys::buffer(&this.user_name);
        let raw = this
            .queue
            .pop_batch(&buffer_key, this.cfg.pipeline.batch_size)
            .await?;
        if raw.is_empty() {
            return Ok(());
        }

        let mut messages: Vec<MessageData> = raw
            .iter()
            .filter_map(|item| match MessageData::from_json(item) {
                Ok(msg) => Some(msg),
                Err(err) => {
                    warn!(error = %err, "dropping unparseable buffered message");
                    None
                }
            })
            .collect();
        if messages.is_empty() {
            return Ok(());
        }
        messages.sort_by_key(|m| m.id);
        let max_msg_id = messages.last().map(|m| m.id).unwrap_or(0);

        info!(count = messages.len(), max_msg_id, "processing batch");

        let result = this.processor.run(&messages).await;
        if !result.success {
            let error = result
                .error
                .unwrap_or_else(|| "unknown batch failure".to_string());
            this.move_to_dead_letter(&messages, &error).await;
            return Ok(());
        }

        for emotion in &result.emotions {
            this.queue
                .rpush(&keys::emotions(&this.user_name), emotion)
                .await?;
        }

        // An empty registry means the batch had nothing worth recording.
        if result.registry.is_empty() {
            return Ok(());
        }

        if let Err(err) = this.publish(&messages, &result).await {
            this.move_to_dead_letter(&messages, &format!("publish failed: {err}"))
                .await;
            return Ok(());
        }

        let dirty_key = keys::dirty_entities(&this.user_name);
        for entity in &result.registry {
            this.queue.sadd(&dirty_key, &entity.id.to_string()).await?;
        }

        Self::schedule_profiles(this, &result, max_msg_id);

        info!(
            entities = result.registry.len(),
            messages = messages.len(),
            "batch complete"
        );
        Ok(())
    }

    /// Emit one structure-stream record per message, ids ascending, each
    /// carrying the batch's full entity list and that message's
    /// relationships with canonical-name drift corrected.
    async fn publish(&self, messages: &[MessageData], result: &BatchResult) -> Result<()> {
        let mut entity_records = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut canonical_by_key = std::collections::HashMap::new();

        for entity in &result.registry {
            canonical_by_key.insert(
                entity.canonical_name.to_lowercase(),
                entity.canonical_name.clone(),
            );
            for mention in &entity.mentions {
                canonical_by_key
                    .entry(mention.to_lowercase())
                    .or_insert_with(|| entity.canonical_name.clone());
            }

            if seen.insert(entity.id) {
                entity_records.push(EntityRecord {
                    id: entity.id,
                    canonical_name: entity.canonical_name.clone(),
                    entity_type: entity.entity_type.clone(),
                    confidence: 1.0,
                    aliases: entity
                        .mentions
                        .iter()
                        .filter(|m| !m.eq_ignore_ascii_case(&entity.canonical_name))
                        .cloned()
                        .collect(),
                    summary: String::new(),
                    topic: entity.topic.clone(),
                    // New entities publish without an embedding; the
                    // profile job fills it in later.
                    embedding: vec![],
                    last_profiled_msg_id: 0,
                });
            }
        }

        let extraction = result.extraction.as_ref();
        for msg in messages {
            let pairs = extraction
                .map(|e| {
                    e.message_results
                        .iter()
                        .filter(|r| r.message_id == msg.id)
                        .flat_map(|r| r.entity_pairs.iter())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            let mut relationships = Vec::new();
            for pair in pairs {
                let a = canonical_by_key.get(&pair.entity_a.to_lowercase());
                let b = canonical_by_key.get(&pair.entity_b.to_lowercase());
                match (a, b) {
                    (Some(a), Some(b)) if a != b => {
                        relationships.push(RelationshipRecord::new(a, b, msg.id, pair.confidence));
                    }
                    _ => {
                        warn!(
                            entity_a = %pair.entity_a,
                            entity_b = %pair.entity_b,
                            message_id = msg.id,
                            "skipping orphan relationship"
                        );
                    }
                }
            }

            let record = BatchRecord {
                message_id: msg.id,
                kind: RecordKind::UserMessage,
                entities: entity_records.clone(),
                relationships,
            };
            self.queue
                .xadd(keys::STREAM_STRUCTURE, &record.to_json()?)
                .await?;
        }

        Ok(())
    }

    async fn move_to_dead_letter(&self, messages: &[MessageData], error: &str) {
        let entry = DlqEntry {
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
            error: error.to_string(),
            batch_size: messages.len(),
            messages: messages.to_vec(),
        };
        let dlq_key = keys::dlq(&self.user_name);
        match serde_json::to_string(&entry) {
            Ok(rendered) => match self.queue.rpush(&dlq_key, &rendered).await {
                Ok(_) => warn!(key = %dlq_key, error, "failed batch stored in DLQ"),
                Err(err) => error!(error = %err, "DLQ storage failed; batch lost"),
            },
            Err(err) => error!(error = %err, "DLQ entry serialization failed"),
        }
    }

    /// Fire-and-forget profile refreshes for entities that are new or whose
    /// profile checkpoint has fallen behind by the profile interval.
    fn schedule_profiles(this: &Arc<Self>, result: &BatchResult, max_msg_id: i64) {
        for entity in &result.registry {
            let last_profiled = this
                .resolver
                .profile(entity.id)
                .map(|p| p.last_profiled_msg_id)
                .unwrap_or(0);
            let gap = max_msg_id - last_profiled;

            if entity.is_new || gap >= this.cfg.pipeline.profile_interval {
                debug!(
                    entity = %entity.canonical_name,
                    id = entity.id,
                    is_new = entity.is_new,
                    gap,
                    "scheduling profile update"
                );
                Self::spawn_profile_task(this, entity.clone(), max_msg_id);
            }
        }
    }

    fn spawn_profile_task(this: &Arc<Self>, entity: ResolvedEntity, checkpoint: i64) {
        let core = this.clone();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = core.profile_sem.clone().acquire_owned().await else {
                return;
            };
            if let Err(err) = core.run_profile_update(&entity, checkpoint).await {
                warn!(entity = entity.id, error = %err, "profile update failed");
            }
        });

        let mut background = this.background.lock().unwrap();
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    /// One profile refresh: recent-window fetch, alias-bounded filtering,
    /// reasoning call, embedding swap, profile-stream emission.
    async fn run_profile_update(&self, entity: &ResolvedEntity, checkpoint: i64) -> Result<()> {
        let recent_key = keys::recent_messages(&self.user_name);
        let content_key = keys::message_content(&self.user_name);

        let recent_ids = self
            .queue
            .zrevrange(&recent_key, 0, self.cfg.pipeline.recent_window as i64 - 1)
            .await?;
        if recent_ids.is_empty() {
            return Ok(());
        }
        let contents = self.queue.hmget(&content_key, &recent_ids).await?;

        let now = Utc::now();
        let mut window: Vec<(String, String)> = Vec::new();
        for raw in contents.into_iter().flatten() {
            let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&raw) else {
                continue;
            };
            let Some(message) = parsed.get("message").and_then(|v| v.as_str()) else {
                continue;
            };
            let then = parsed
                .get("timestamp")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or(now);
            window.push((
                format!("({}) {}", relative_time(now, then), message),
                message.to_string(),
            ));
        }

        let aliases = self.resolver.aliases_for(entity.id);
        if aliases.is_empty() {
            return Ok(());
        }

        // Only observations that literally mention one of the aliases count.
        let alternation = aliases
            .iter()
            .map(|a| regex::escape(a))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = RegexBuilder::new(&format!(r"\b({alternation})\b"))
            .case_insensitive(true)
            .build()
            .context("alias pattern build failed")?;

        let observations: Vec<&str> = window
            .iter()
            .filter(|(_, raw)| pattern.is_match(raw))
            .map(|(annotated, _)| annotated.as_str())
            .collect();
        if observations.is_empty() {
            return Ok(());
        }

        let existing_summary = self
            .resolver
            .profile(entity.id)
            .map(|p| p.summary)
            .unwrap_or_default();
        let system = vestige_prompt::profile_update_prompt(&self.user_name);
        let user = json!({
            "entity_name": entity.canonical_name,
            "entity_type": entity.entity_type,
            "existing_summary": existing_summary,
            "new_observations": observations.join("\n"),
            "known_aliases": aliases,
        })
        .to_string();

        let Some(new_summary) = self.llm.call_reasoning(&system, &user).await else {
            return Ok(());
        };
        let new_summary = new_summary.trim().to_string();
        if new_summary.is_empty() || new_summary == existing_summary {
            return Ok(());
        }

        // Embedding is CPU work; hand it to the blocking pool.
        let resolver = self.resolver.clone();
        let entity_id = entity.id;
        let summary_for_embed = new_summary.clone();
        let embedding = tokio::task::spawn_blocking(move || {
            resolver.update_profile_summary(entity_id, &summary_for_embed)
        })
        .await?;
        let Some(embedding) = embedding else {
            return Ok(());
        };

        let topic = self
            .resolver
            .profile(entity.id)
            .map(|p| p.topic)
            .unwrap_or_else(|| "General".to_string());
        let record = BatchRecord {
            message_id: checkpoint,
            kind: RecordKind::ProfileUpdate,
            entities: vec![EntityRecord {
                id: entity.id,
                canonical_name: entity.canonical_name.clone(),
                entity_type: entity.entity_type.clone(),
                confidence: 1.0,
                aliases: vec![],
                summary: new_summary,
                topic,
                embedding,
                last_profiled_msg_id: checkpoint,
            }],
            relationships: vec![],
        };
        self.queue
            .xadd(keys::STREAM_PROFILE, &record.to_json()?)
            .await?;
        info!(entity = entity.id, checkpoint, "profile update published");
        Ok(())
    }

    async fn shutdown(this: &Arc<Self>) -> Result<()> {
        info!("ingest shutdown: draining buffer");
        this.cancel_batch_timer();

        let buffer_key = keys::buffer(&this.user_name);
        while this.queue.llen(&buffer_key).await? > 0 {
            Self::process_batch(this).await?;
        }

        if let Some(handle) = this.drain_task.lock().unwrap().take() {
            handle.abort();
        }

        let handles: Vec<JoinHandle<()>> = this.background.lock().unwrap().drain(..).collect();
        if !handles.is_empty() {
            info!(tasks = handles.len(), "waiting for background profile tasks");
            let grace = Duration::from_secs(this.cfg.pipeline.shutdown_grace_secs);
            if tokio::time::timeout(grace, futures::future::join_all(handles))
                .await
                .is_err()
            {
                warn!("background tasks did not finish within the grace window");
            }
        }

        info!("ingest shutdown complete");
        Ok(())
    }

    async fn recent_context(&self, count: usize) -> Result<Vec<String>> {
        let recent_key = keys::recent_messages(&self.user_name);
        let content_key = keys::message_content(&self.user_name);
        let mut ids = self
            .queue
            .zrevrange(&recent_key, 0, count as i64 - 1)
            .await?;
        ids.reverse();
        let contents = self.queue.hmget(&content_key, &ids).await?;
        Ok(contents
            .into_iter()
            .flatten()
            .filter_map(|raw| {
                serde_json::from_str::<serde_json::Value>(&raw)
                    .ok()?
                    .get("message")?
                    .as_str()
                    .map(str::to_string)
            })
            .collect())
    }
}
