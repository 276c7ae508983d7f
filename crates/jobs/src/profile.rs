//! Profile refinement over dirty entities.
//!
//! The batch pipeline marks every touched entity dirty; this job drains the
//! set when volume builds up or the user goes idle, rereads the recent
//! message window, and rewrites summaries through the reasoning model. The
//! user's own profile refines on a longer idle window.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use regex::RegexBuilder;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use vestige_config::{PipelineConfig, SchedulerConfig};
use vestige_graph::GraphStore;
use vestige_llm::LlmService;
use vestige_queue::keys;
use vestige_resolver::EntityResolver;

use crate::{clear_maintenance_notice, set_maintenance_notice, Job, JobContext, JobResult};

const PROFILE_WARNING: &str = "Deepening profiles. I am reading back through recent conversations to update entity details.";

struct ProfileUpdate {
    id: i64,
    canonical_name: String,
    summary: String,
    topic: String,
    embedding: Vec<f32>,
}

pub struct ProfileRefinementJob {
    llm: Arc<dyn LlmService>,
    resolver: Arc<EntityResolver>,
    store: Arc<dyn GraphStore>,
    cfg: SchedulerConfig,
    pipeline: PipelineConfig,
}

impl ProfileRefinementJob {
    pub fn new(
        llm: Arc<dyn LlmService>,
        resolver: Arc<EntityResolver>,
        store: Arc<dyn GraphStore>,
        cfg: SchedulerConfig,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            llm,
            resolver,
            store,
            cfg,
            pipeline,
        }
    }

    /// Fetch the recent window as (relative-time annotated, raw) pairs.
    async fn recent_window(&self, ctx: &JobContext, count: usize) -> Vec<(String, String)> {
        let recent_key = keys::recent_messages(&ctx.user_name);
        let content_key = keys::message_content(&ctx.user_name);

        let ids = match ctx.queue.zrevrange(&recent_key, 0, count as i64 - 1).await {
            Ok(ids) if !ids.is_empty() => ids,
            _ => return Vec::new(),
        };
        let Ok(contents) = ctx.queue.hmget(&content_key, &ids).await else {
            return Vec::new();
        };

        let now = Utc::now();
        contents
            .into_iter()
            .flatten()
            .filter_map(|raw| {
                let parsed: serde_json::Value = serde_json::from_str(&raw).ok()?;
                let message = parsed.get("message")?.as_str()?.to_string();
                let then = parsed
                    .get("timestamp")
                    .and_then(|v| v.as_str())
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or(now);

                let delta = (now - then).num_seconds().max(0);
                let relative = if delta < 3600 {
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
                };
                Some((format!("({relative}) {message}"), message))
            })
            .collect()
    }

    async fn current_msg_id(&self, ctx: &JobContext) -> i64 {
        ctx.queue
            .get(keys::NEXT_MSG_ID)
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// One entity refresh: alias-filtered observations, reasoning call,
    /// embedding swap in the resolver.
    async fn refine_single(
        &self,
        ctx: &JobContext,
        entity_id: i64,
        window: &[(String, String)],
    ) -> Option<ProfileUpdate> {
        let profile = self.resolver.profile(entity_id)?;
        let aliases = profile.aliases.clone();
        if aliases.is_empty() {
            return None;
        }

        let alternation = aliases
            .iter()
            .map(|a| regex::escape(a))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = RegexBuilder::new(&format!(r"\b({alternation})\b"))
            .case_insensitive(true)
            .build()
            .ok()?;

        let observations: Vec<&str> = window
            .iter()
            .filter(|(_, raw)| pattern.is_match(raw))
            .map(|(annotated, _)| annotated.as_str())
            .collect();
        if observations.is_empty() {
            return None;
        }

        let system = vestige_prompt::profile_update_prompt(&ctx.user_name);
        let user = json!({
            "entity_name": profile.canonical_name,
            "entity_type": profile.entity_type,
            "existing_summary": profile.summary,
            "new_observations": observations.join("\n"),
            "known_aliases": aliases,
        })
        .to_string();

        let new_summary = self.llm.call_reasoning(&system, &user).await?;
        let new_summary = new_summary.trim().to_string();
        if new_summary.is_empty() || new_summary == profile.summary {
            return None;
        }

        let resolver = self.resolver.clone();
        let summary_for_embed = new_summary.clone();
        let embedding = tokio::task::spawn_blocking(move || {
            resolver.update_profile_summary(entity_id, &summary_for_embed)
        })
        .await
        .ok()??;

        info!(entity = %profile.canonical_name, id = entity_id, "profile refined");
        Some(ProfileUpdate {
            id: entity_id,
            canonical_name: profile.canonical_name,
            summary: new_summary,
            topic: profile.topic,
            embedding,
        })
    }

    async fn refine_entities(
        &self,
        ctx: &JobContext,
        entity_ids: &[i64],
        window: &[(String, String)],
    ) -> Vec<ProfileUpdate> {
        let semaphore = Arc::new(Semaphore::new(5));
        let futures = entity_ids.iter().map(|&id| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.ok()?;
                self.refine_single(ctx, id, window).await
            }
        });
        join_all(futures).await.into_iter().flatten().collect()
    }

    /// Refine the user entity on the longer window, at most once per flag
    /// TTL, when the session is deep-idle or heavily dirty.
    async fn maybe_refine_user(&self, ctx: &JobContext, dirty_count: usize) -> bool {
        let ran_key = keys::user_profile_ran(&ctx.user_name);
        if ctx.queue.get(&ran_key).await.ok().flatten().is_some() {
            return false;
        }
        if dirty_count < self.cfg.profile_volume_threshold
            && ctx.idle_seconds < self.cfg.user_profile_idle_secs
        {
            return false;
        }

        let Some(user_id) = self.resolver.get_id(&ctx.user_name) else {
            warn!(user = %ctx.user_name, "user entity not found in resolver");
            return false;
        };
        let Some(profile) = self.resolver.profile(user_id) else {
            return false;
        };

        let window = self.recent_window(ctx, self.cfg.user_msg_window).await;
        if window.is_empty() {
            return false;
        }

        // Every recent message is an observation about the user.
        let observations: Vec<&str> = window.iter().map(|(a, _)| a.as_str()).collect();
        let system = vestige_prompt::profile_update_prompt(&ctx.user_name);
        let user = json!({
            "entity_name": ctx.user_name,
            "entity_type": "person",
            "existing_summary": profile.summary,
            "new_observations": observations.join("\n"),
            "known_aliases": profile.aliases,
        })
        .to_string();

        let refined = match self.llm.call_reasoning(&system, &user).await {
            Some(summary) if !summary.trim().is_empty() && summary.trim() != profile.summary => {
                let new_summary = summary.trim().to_string();
                let resolver = self.resolver.clone();
                let for_embed = new_summary.clone();
                let embedding = tokio::task::spawn_blocking(move || {
                    resolver.update_profile_summary(user_id, &for_embed)
                })
                .await
                .ok()
                .flatten();

                if let Some(embedding) = embedding {
                    let checkpoint = self.current_msg_id(ctx).await;
                    let write = self
                        .store
                        .update_entity_profile(
                            user_id,
                            &ctx.user_name,
                            &new_summary,
                            &embedding,
                            checkpoint,
                            &profile.topic,
                        )
                        .await;
                    if let Err(err) = write {
                        warn!(error = %err, "user profile write failed");
                        false
                    } else {
                        info!(user = %ctx.user_name, "user profile refined");
                        true
                    }
                } else {
                    false
                }
            }
            _ => false,
        };

        let _ = ctx
            .queue
            .setex(&ran_key, std::time::Duration::from_secs(300), "true")
            .await;
        refined
    }
}

#[async_trait]
impl Job for ProfileRefinementJob {
    fn name(&self) -> &'static str {
        "profile_refinement"
    }

    async fn should_run(&self, ctx: &JobContext) -> bool {
        let count = ctx
            .queue
            .scard(&keys::dirty_entities(&ctx.user_name))
            .await
            .unwrap_or(0);

        if count >= self.cfg.profile_volume_threshold {
            return true;
        }
        count > 0 && ctx.idle_seconds >= self.cfg.profile_idle_secs
    }

    async fn execute(&self, ctx: &JobContext) -> JobResult {
        set_maintenance_notice(
            ctx.queue.as_ref(),
            PROFILE_WARNING,
            std::time::Duration::from_secs(self.cfg.maintenance_lock_ttl_secs),
        )
        .await;

        let dirty_key = keys::dirty_entities(&ctx.user_name);
        let raw_ids = ctx.queue.spop_all(&dirty_key).await.unwrap_or_default();
        let dirty_count = raw_ids.len();

        let user_id = self.resolver.get_id(&ctx.user_name);
        let entity_ids: Vec<i64> = raw_ids
            .iter()
            .filter_map(|s| s.parse::<i64>().ok())
            .filter(|id| Some(*id) != user_id)
            .collect();

        let mut updates = Vec::new();
        if !entity_ids.is_empty() {
            let window = self.recent_window(ctx, self.pipeline.recent_window).await;
            if window.is_empty() {
                // Nothing to read against; put the work back.
                for id in &entity_ids {
                    let _ = ctx.queue.sadd(&dirty_key, &id.to_string()).await;
                }
                clear_maintenance_notice(ctx.queue.as_ref()).await;
                return JobResult::fail("No context messages found");
            }

            updates = self.refine_entities(ctx, &entity_ids, &window).await;

            let checkpoint = self.current_msg_id(ctx).await;
            for update in &updates {
                if let Err(err) = self
                    .store
                    .update_entity_profile(
                        update.id,
                        &update.canonical_name,
                        &update.summary,
                        &update.embedding,
                        checkpoint,
                        &update.topic,
                    )
                    .await
                {
                    warn!(entity = update.id, error = %err, "profile write failed");
                }
            }
        }

        let user_refined = self.maybe_refine_user(ctx, dirty_count).await;

        let mut parts = Vec::new();
        if !updates.is_empty() {
            parts.push(format!("Refined {} profiles", updates.len()));
        }
        if user_refined {
            parts.push(format!("refined {}", ctx.user_name));
        }
        let summary = if parts.is_empty() {
            "No profiles to update".to_string()
        } else {
            parts.join(", ")
        };

        // Signal merge detection that fresh summaries exist.
        let _ = ctx
            .queue
            .setex(
                &keys::profile_complete(&ctx.user_name),
                std::time::Duration::from_secs(300),
                &Utc::now().timestamp().to_string(),
            )
            .await;

        clear_maintenance_notice(ctx.queue.as_ref()).await;
        JobResult::ok(summary)
    }
}
