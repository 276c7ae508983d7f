//! Duplicate-entity consolidation.
//!
//! Runs once per session, gated on profile refinement having produced fresh
//! summaries. Holds the maintenance lock and the batch mutex for the whole
//! pass so no batch writes interleave with merges.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex as TokioMutex;
use tracing::{error, info, warn};

use vestige_config::SchedulerConfig;
use vestige_graph::GraphStore;
use vestige_llm::LlmService;
use vestige_queue::keys;
use vestige_resolver::{EntityResolver, MergeCandidate};

use crate::{clear_maintenance_notice, set_maintenance_notice, Job, JobContext, JobResult};

const MERGE_WARNING: &str = "Memory consolidation in progress. I am merging duplicate entities; answers about these people may be briefly inconsistent.";
const STORE_RETRIES: u32 = 2;

pub struct MergeDetectionJob {
    resolver: Arc<EntityResolver>,
    store: Arc<dyn GraphStore>,
    llm: Arc<dyn LlmService>,
    batch_lock: Arc<TokioMutex<()>>,
    cfg: SchedulerConfig,
}

impl MergeDetectionJob {
    pub fn new(
        resolver: Arc<EntityResolver>,
        store: Arc<dyn GraphStore>,
        llm: Arc<dyn LlmService>,
        batch_lock: Arc<TokioMutex<()>>,
        cfg: SchedulerConfig,
    ) -> Self {
        Self {
            resolver,
            store,
            llm,
            batch_lock,
            cfg,
        }
    }

    /// Candidate pairs from the resolver, minus any pair that already
    /// shares a direct edge in the graph.
    async fn candidates(&self) -> Vec<MergeCandidate> {
        let raw = self.resolver.detect_merge_candidates(&HashSet::new());
        let mut out = Vec::new();

        for candidate in raw {
            let related = self
                .store
                .get_related_entities(
                    &[candidate.primary.canonical_name.clone()],
                    false,
                )
                .await
                .unwrap_or_default();
            let directly_related = related
                .iter()
                .any(|c| c.target == candidate.secondary.canonical_name);
            if !directly_related {
                out.push(candidate);
            }
        }
        out
    }

    async fn judge(&self, ctx: &JobContext, candidate: &MergeCandidate) -> Option<f64> {
        let system = vestige_prompt::merge_judgment_prompt(&ctx.user_name);
        let user = json!({
            "entity_a": {
                "name": candidate.primary.canonical_name,
                "type": candidate.primary.entity_type,
                "aliases": candidate.primary.aliases,
                "summary": candidate.primary.summary,
            },
            "entity_b": {
                "name": candidate.secondary.canonical_name,
                "type": candidate.secondary.entity_type,
                "aliases": candidate.secondary.aliases,
                "summary": candidate.secondary.summary,
            },
        })
        .to_string();

        let response = self.llm.call_reasoning(&system, &user).await?;
        match response.trim().parse::<f64>() {
            Ok(score) => Some(score),
            Err(_) => {
                warn!(
                    primary = candidate.primary_id,
                    secondary = candidate.secondary_id,
                    response = %response.trim(),
                    "unparseable merge judgment"
                );
                None
            }
        }
    }

    async fn merged_summary(&self, ctx: &JobContext, candidate: &MergeCandidate) -> String {
        let a = candidate.primary.summary.clone();
        let b = candidate.secondary.summary.clone();
        if a.is_empty() {
            return b;
        }
        if b.is_empty() {
            return a;
        }

        let mut aliases: Vec<String> = candidate.primary.aliases.clone();
        for alias in &candidate.secondary.aliases {
            if !aliases.iter().any(|x| x.eq_ignore_ascii_case(alias)) {
                aliases.push(alias.clone());
            }
        }

        let system = vestige_prompt::summary_merge_prompt(&ctx.user_name);
        let user = json!({
            "entity_name": candidate.primary.canonical_name,
            "entity_type": candidate.primary.entity_type,
            "all_aliases": aliases,
            "summary_a": a,
            "summary_b": b,
        })
        .to_string();

        match self.llm.call_reasoning(&system, &user).await {
            Some(result) if result.starts_with("MERGE_CONFLICT") => {
                warn!(
                    entity = %candidate.primary.canonical_name,
                    "summary merge reported a conflict, concatenating"
                );
                format!("{a} {b}")
            }
            Some(result) => result,
            None => format!("{a} {b}"),
        }
    }

    /// Merge in the store with bounded retries, then sync the resolver.
    async fn execute_merge(&self, candidate: &MergeCandidate, summary: &str) -> bool {
        for attempt in 1..=STORE_RETRIES {
            match self
                .store
                .merge_entities(candidate.primary_id, candidate.secondary_id, summary)
                .await
            {
                Ok(true) => {
                    info!(
                        primary = candidate.primary_id,
                        secondary = candidate.secondary_id,
                        "merged entities"
                    );
                    self.resolver
                        .remap_after_merge(candidate.primary_id, candidate.secondary_id);
                    return true;
                }
                Ok(false) => {
                    warn!(
                        attempt,
                        primary = candidate.primary_id,
                        secondary = candidate.secondary_id,
                        "store declined merge"
                    );
                }
                Err(err) => {
                    error!(
                        attempt,
                        primary = candidate.primary_id,
                        secondary = candidate.secondary_id,
                        error = %err,
                        "merge attempt failed"
                    );
                }
            }
            if attempt < STORE_RETRIES {
                tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
            }
        }
        false
    }

    async fn store_review_proposals(
        &self,
        ctx: &JobContext,
        proposals: &[(MergeCandidate, f64)],
        merged_ids: &HashSet<i64>,
    ) -> usize {
        let key = keys::merge_proposals(&ctx.user_name);
        let mut stored = 0;

        for (candidate, score) in proposals {
            if merged_ids.contains(&candidate.primary_id)
                || merged_ids.contains(&candidate.secondary_id)
            {
                continue;
            }
            let proposal = json!({
                "primary_id": candidate.primary_id,
                "secondary_id": candidate.secondary_id,
                "primary_name": candidate.primary.canonical_name,
                "secondary_name": candidate.secondary.canonical_name,
                "llm_score": score,
                "created_at": Utc::now().to_rfc3339(),
                "status": "pending",
            })
            .to_string();
            if ctx.queue.rpush(&key, &proposal).await.is_ok() {
                stored += 1;
            }
        }
        stored
    }
}

#[async_trait]
impl Job for MergeDetectionJob {
    fn name(&self) -> &'static str {
        "merge_detection"
    }

    async fn should_run(&self, ctx: &JobContext) -> bool {
        // Once per session, and only after profile refinement has produced
        // summaries worth comparing.
        let ran = ctx
            .queue
            .get(&keys::merge_ran(&ctx.user_name))
            .await
            .ok()
            .flatten();
        if ran.is_some() {
            return false;
        }

        ctx.queue
            .get(&keys::profile_complete(&ctx.user_name))
            .await
            .ok()
            .flatten()
            .is_some()
    }

    async fn execute(&self, ctx: &JobContext) -> JobResult {
        let lock_ttl = Duration::from_secs(self.cfg.maintenance_lock_ttl_secs);
        set_maintenance_notice(ctx.queue.as_ref(), MERGE_WARNING, lock_ttl).await;
        if let Err(err) = ctx.queue.setex(keys::MAINTENANCE_LOCK, lock_ttl, "true").await {
            warn!(error = %err, "failed to set maintenance lock");
        }

        let result = {
            // Consolidation excludes batch processing for its whole run.
            let _guard = self.batch_lock.lock().await;
            info!("batch lock acquired for merge detection");

            let _ = ctx
                .queue
                .set(&keys::merge_ran(&ctx.user_name), "true")
                .await;

            let candidates = self.candidates().await;
            if candidates.is_empty() {
                JobResult::ok("No merge candidates found")
            } else {
                let mut auto = Vec::new();
                let mut review = Vec::new();
                for candidate in candidates {
                    let Some(score) = self.judge(ctx, &candidate).await else {
                        continue;
                    };
                    if score >= self.cfg.merge_auto_threshold {
                        auto.push((candidate, score));
                    } else if score >= self.cfg.merge_review_floor {
                        review.push((candidate, score));
                    } else {
                        info!(
                            primary = candidate.primary_id,
                            secondary = candidate.secondary_id,
                            score,
                            "merge candidate rejected"
                        );
                    }
                }
                info!(auto = auto.len(), review = review.len(), "merge split");

                let mut merged_ids: HashSet<i64> = HashSet::new();
                let mut successful = 0;
                let mut failed = 0;

                for (candidate, _) in &auto {
                    if merged_ids.contains(&candidate.primary_id)
                        || merged_ids.contains(&candidate.secondary_id)
                    {
                        continue;
                    }
                    let summary = self.merged_summary(ctx, candidate).await;
                    if self.execute_merge(candidate, &summary).await {
                        merged_ids.insert(candidate.secondary_id);
                        successful += 1;
                    } else {
                        failed += 1;
                    }
                }

                let stored = self.store_review_proposals(ctx, &review, &merged_ids).await;
                JobResult::ok(format!(
                    "{successful} merged, {failed} failed, {stored} queued for review"
                ))
            }
        };

        let _ = ctx.queue.delete(keys::MAINTENANCE_LOCK).await;
        clear_maintenance_notice(ctx.queue.as_ref()).await;
        info!("maintenance complete, write path resumed");
        result
    }

    async fn on_shutdown(&self, ctx: &JobContext) {
        // Next session picks the work back up.
        let _ = ctx
            .queue
            .set(&keys::pending(&ctx.user_name, self.name()), "true")
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vestige_config::ResolverConfig;
    use vestige_graph::{EntityRecord, MemoryGraph, RelationshipRecord};
    use vestige_llm::fake::FakeLlm;
    use vestige_queue::{MemoryQueue, Queue};
    use vestige_resolver::HashEmbedder;

    async fn harness() -> (
        Arc<FakeLlm>,
        Arc<MemoryGraph>,
        Arc<EntityResolver>,
        MergeDetectionJob,
        JobContext,
    ) {
        let llm = Arc::new(FakeLlm::new());
        let store = Arc::new(MemoryGraph::new());
        let resolver = Arc::new(EntityResolver::new(
            Arc::new(HashEmbedder::new(64)),
            ResolverConfig::default(),
        ));
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new());

        let job = MergeDetectionJob::new(
            resolver.clone(),
            store.clone() as Arc<dyn GraphStore>,
            llm.clone() as Arc<dyn LlmService>,
            Arc::new(TokioMutex::new(())),
            SchedulerConfig::default(),
        );
        let ctx = JobContext {
            user_name: "Yinka".to_string(),
            queue,
            idle_seconds: 1000.0,
            last_run: None,
        };
        (llm, store, resolver, job, ctx)
    }

    fn person(id: i64, name: &str, summary: &str) -> EntityRecord {
        EntityRecord {
            id,
            canonical_name: name.to_string(),
            entity_type: "person".to_string(),
            confidence: 1.0,
            aliases: vec![],
            summary: summary.to_string(),
            topic: "General".to_string(),
            embedding: vec![],
            last_profiled_msg_id: 0,
        }
    }

    #[tokio::test]
    async fn gate_requires_profile_complete_and_once_per_session() {
        let (_llm, _store, _resolver, job, ctx) = harness().await;
        assert!(!job.should_run(&ctx).await);

        ctx.queue
            .setex(
                &keys::profile_complete("Yinka"),
                Duration::from_secs(300),
                "1",
            )
            .await
            .unwrap();
        assert!(job.should_run(&ctx).await);

        ctx.queue
            .set(&keys::merge_ran("Yinka"), "true")
            .await
            .unwrap();
        assert!(!job.should_run(&ctx).await);
    }

    #[tokio::test]
    async fn high_score_merges_and_remaps_the_resolver() {
        let (llm, store, resolver, job, ctx) = harness().await;

        let summary = "Teaches databases at the university";
        store
            .write_batch(
                &[
                    person(1, "Professor Martinez", summary),
                    person(2, "Prof Martinez", summary),
                ],
                &[],
                true,
            )
            .await
            .unwrap();
        resolver.hydrate(store.as_ref()).await.unwrap();

        // Judgment, then summary synthesis.
        llm.push_reasoning(Some("0.97"));
        llm.push_reasoning(Some("Professor Martinez, also called Prof Martinez, teaches databases."));

        let result = job.execute(&ctx).await;
        assert!(result.success);
        assert!(result.summary.starts_with("1 merged"));

        assert!(store.get_entity_profile("Prof Martinez").await.unwrap().is_none());
        let merged = store
            .get_entity_profile("Professor Martinez")
            .await
            .unwrap()
            .unwrap();
        assert!(merged.aliases.contains(&"Prof Martinez".to_string()));
        assert_eq!(resolver.get_id("Prof Martinez"), Some(1));
        assert!(resolver.profile(2).is_none());

        // Lock and notice are released.
        assert!(ctx.queue.get(keys::MAINTENANCE_LOCK).await.unwrap().is_none());
        assert!(ctx.queue.get(keys::JOB_WARNING).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mid_score_queues_for_review_instead_of_merging() {
        let (llm, store, resolver, job, ctx) = harness().await;

        let summary = "A Marcus from the gym";
        store
            .write_batch(
                &[person(1, "Marcus", summary), person(2, "Marcus Lee", summary)],
                &[],
                true,
            )
            .await
            .unwrap();
        resolver.hydrate(store.as_ref()).await.unwrap();

        llm.push_reasoning(Some("0.72"));

        let result = job.execute(&ctx).await;
        assert!(result.success);

        // Nothing merged; one proposal parked for review.
        assert!(store.get_entity_profile("Marcus Lee").await.unwrap().is_some());
        let proposals = ctx
            .queue
            .lrange(&keys::merge_proposals("Yinka"), 0, -1)
            .await
            .unwrap();
        assert_eq!(proposals.len(), 1);
        assert!(proposals[0].contains("\"llm_score\":0.72"));
    }

    #[tokio::test]
    async fn directly_related_pairs_are_never_candidates() {
        let (llm, store, resolver, job, ctx) = harness().await;

        let summary = "Shares a name and a summary";
        store
            .write_batch(
                &[person(1, "Sam", summary), person(2, "Samuel", summary)],
                &[RelationshipRecord::new("Sam", "Samuel", 1, 0.9)],
                true,
            )
            .await
            .unwrap();
        resolver.hydrate(store.as_ref()).await.unwrap();

        let result = job.execute(&ctx).await;
        assert!(result.success);
        assert_eq!(result.summary, "No merge candidates found");
        assert_eq!(
            llm.reasoning_calls.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }
}
