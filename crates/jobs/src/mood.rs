//! Daily mood checkpointing from the emotion queue.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use vestige_graph::GraphStore;
use vestige_queue::keys;

use crate::{Job, JobContext, JobResult};

pub struct MoodCheckpointJob {
    store: Arc<dyn GraphStore>,
    volume_threshold: usize,
}

impl MoodCheckpointJob {
    pub fn new(store: Arc<dyn GraphStore>, volume_threshold: usize) -> Self {
        Self {
            store,
            volume_threshold,
        }
    }

    /// Tally the two most common labels; "neutral" backfills a missing
    /// secondary.
    fn tally(emotions: &[String]) -> (String, usize, String, usize) {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for emotion in emotions {
            *counts.entry(emotion.as_str()).or_default() += 1;
        }

        let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

        let (primary, primary_count) = ranked
            .first()
            .map(|(l, c)| (l.to_string(), *c))
            .unwrap_or_else(|| ("neutral".to_string(), 0));
        let (secondary, secondary_count) = ranked
            .get(1)
            .map(|(l, c)| (l.to_string(), *c))
            .unwrap_or_else(|| ("neutral".to_string(), 0));
        (primary, primary_count, secondary, secondary_count)
    }

    async fn write_checkpoint(&self, ctx: &JobContext, emotions: Vec<String>) -> JobResult {
        if emotions.is_empty() {
            return JobResult::ok("No emotions to log");
        }

        let (primary, primary_count, secondary, secondary_count) = Self::tally(&emotions);
        match self
            .store
            .log_mood_checkpoint(
                &ctx.user_name,
                &primary,
                primary_count,
                &secondary,
                secondary_count,
                emotions.len(),
            )
            .await
        {
            Ok(()) => JobResult::ok(format!("Logged checkpoint: {} emotions", emotions.len())),
            Err(err) => JobResult::fail(format!("mood checkpoint write failed: {err}")),
        }
    }

    /// Drain everything regardless of threshold. Called at shutdown.
    pub async fn flush(&self, ctx: &JobContext) -> JobResult {
        let emotions_key = keys::emotions(&ctx.user_name);
        let remaining = ctx
            .queue
            .lrange(&emotions_key, 0, -1)
            .await
            .unwrap_or_default();
        if remaining.is_empty() {
            return JobResult::ok("Nothing to flush");
        }
        let _ = ctx.queue.delete(&emotions_key).await;
        let result = self.write_checkpoint(ctx, remaining).await;
        JobResult {
            summary: result.summary.replace("Logged checkpoint", "Flushed"),
            ..result
        }
    }
}

#[async_trait]
impl Job for MoodCheckpointJob {
    fn name(&self) -> &'static str {
        "mood_checkpoint"
    }

    async fn should_run(&self, ctx: &JobContext) -> bool {
        ctx.queue
            .llen(&keys::emotions(&ctx.user_name))
            .await
            .unwrap_or(0)
            >= self.volume_threshold
    }

    async fn execute(&self, ctx: &JobContext) -> JobResult {
        let emotions = ctx
            .queue
            .pop_batch(&keys::emotions(&ctx.user_name), self.volume_threshold)
            .await
            .unwrap_or_default();
        self.write_checkpoint(ctx, emotions).await
    }

    async fn on_shutdown(&self, ctx: &JobContext) {
        let result = self.flush(ctx).await;
        if result.summary != "Nothing to flush" {
            info!(summary = %result.summary, "mood shutdown flush");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vestige_graph::MemoryGraph;
    use vestige_queue::{MemoryQueue, Queue};

    fn rig() -> (Arc<MemoryGraph>, MoodCheckpointJob, JobContext) {
        let store = Arc::new(MemoryGraph::new());
        let job = MoodCheckpointJob::new(store.clone() as Arc<dyn GraphStore>, 5);
        let ctx = JobContext {
            user_name: "Yinka".to_string(),
            queue: Arc::new(MemoryQueue::new()),
            idle_seconds: 0.0,
            last_run: None,
        };
        (store, job, ctx)
    }

    #[tokio::test]
    async fn fires_only_at_volume() {
        let (_store, job, ctx) = rig();
        let key = keys::emotions("Yinka");
        for _ in 0..4 {
            ctx.queue.rpush(&key, "joy").await.unwrap();
        }
        assert!(!job.should_run(&ctx).await);
        ctx.queue.rpush(&key, "fear").await.unwrap();
        assert!(job.should_run(&ctx).await);
    }

    #[tokio::test]
    async fn checkpoint_tallies_top_two_labels() {
        let (store, job, ctx) = rig();
        let key = keys::emotions("Yinka");
        for label in ["joy", "joy", "joy", "fear", "fear"] {
            ctx.queue.rpush(&key, label).await.unwrap();
        }

        let result = job.execute(&ctx).await;
        assert!(result.success);

        let moods = store.moods();
        assert_eq!(moods.len(), 1);
        assert_eq!(moods[0].primary_emotion, "joy");
        assert_eq!(moods[0].primary_count, 3);
        assert_eq!(moods[0].secondary_emotion, "fear");
        assert_eq!(moods[0].secondary_count, 2);
        assert_eq!(moods[0].total_messages, 5);
    }

    #[tokio::test]
    async fn single_label_falls_back_to_neutral_secondary() {
        let (store, job, ctx) = rig();
        let key = keys::emotions("Yinka");
        for _ in 0..5 {
            ctx.queue.rpush(&key, "sadness").await.unwrap();
        }
        job.execute(&ctx).await;

        let moods = store.moods();
        assert_eq!(moods[0].secondary_emotion, "neutral");
        assert_eq!(moods[0].secondary_count, 0);
    }

    #[tokio::test]
    async fn shutdown_flushes_below_threshold() {
        let (store, job, ctx) = rig();
        let key = keys::emotions("Yinka");
        ctx.queue.rpush(&key, "joy").await.unwrap();
        ctx.queue.rpush(&key, "anger").await.unwrap();

        job.on_shutdown(&ctx).await;
        assert_eq!(store.moods().len(), 1);
        assert_eq!(store.moods()[0].total_messages, 2);
        assert_eq!(ctx.queue.llen(&key).await.unwrap(), 0);

        // Flushing an empty queue is a no-op.
        let result = job.flush(&ctx).await;
        assert_eq!(result.summary, "Nothing to flush");
    }
}
