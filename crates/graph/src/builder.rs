//! Stream consumer that applies batch records to the graph.
//!
//! Reads the structure and profile streams with a named consumer group,
//! applies each record transactionally, and always acks — a record that
//! cannot be applied is copied to the builder dead-letter stream first so
//! nothing is ever lost or redelivered forever.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, warn};

use vestige_queue::{keys, Queue, QueueError, StreamEntry};

use crate::records::{BatchRecord, RecordKind};
use crate::store::GraphStore;

const READ_COUNT: usize = 10;
const READ_BLOCK: Duration = Duration::from_secs(1);

pub struct GraphBuilder {
    queue: Arc<dyn Queue>,
    store: Arc<dyn GraphStore>,
    consumer: String,
    running: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl GraphBuilder {
    pub fn new(queue: Arc<dyn Queue>, store: Arc<dyn GraphStore>) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
        Self {
            queue,
            store,
            consumer: format!("builder-{host}-{}", std::process::id()),
            running: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn ensure_groups(&self) -> Result<(), QueueError> {
        self.queue
            .ensure_group(keys::STREAM_STRUCTURE, keys::BUILDER_GROUP)
            .await?;
        self.queue
            .ensure_group(keys::STREAM_PROFILE, keys::BUILDER_GROUP)
            .await?;
        Ok(())
    }

    /// Run until [`GraphBuilder::stop`] is called. Connection problems back
    /// off and retry; a lost consumer group is recreated in place.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.ensure_groups().await?;
        self.running.store(true, Ordering::SeqCst);
        info!(consumer = %self.consumer, "graph builder listening");

        let streams = vec![
            keys::STREAM_STRUCTURE.to_string(),
            keys::STREAM_PROFILE.to_string(),
        ];

        while self.running.load(Ordering::SeqCst) {
            let entries = match self
                .queue
                .read_group(
                    keys::BUILDER_GROUP,
                    &self.consumer,
                    &streams,
                    READ_COUNT,
                    READ_BLOCK,
                )
                .await
            {
                Ok(entries) => entries,
                Err(QueueError::GroupMissing { .. }) => {
                    warn!("consumer group lost, recreating");
                    self.ensure_groups().await?;
                    continue;
                }
                Err(err) => {
                    error!(error = %err, "stream read failed, backing off");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            for entry in entries {
                self.process_entry(&entry).await;
            }
        }

        let swept = self.store.cleanup_null_entities().await.unwrap_or(0);
        if swept > 0 {
            info!(deleted = swept, "final null-type cleanup");
        }
        info!(
            processed = self.processed(),
            failed = self.failed(),
            "graph builder stopped"
        );
        Ok(())
    }

    /// Drain whatever is currently available, without blocking.
    /// Test and single-shot wiring hook.
    pub async fn drain_available(&self) -> anyhow::Result<usize> {
        self.ensure_groups().await?;
        let streams = vec![
            keys::STREAM_STRUCTURE.to_string(),
            keys::STREAM_PROFILE.to_string(),
        ];
        let mut total = 0;
        loop {
            let entries = self
                .queue
                .read_group(
                    keys::BUILDER_GROUP,
                    &self.consumer,
                    &streams,
                    READ_COUNT,
                    Duration::from_millis(10),
                )
                .await?;
            if entries.is_empty() {
                return Ok(total);
            }
            for entry in entries {
                self.process_entry(&entry).await;
                total += 1;
            }
        }
    }

    async fn process_entry(&self, entry: &StreamEntry) {
        match self.apply(entry).await {
            Ok(()) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                error!(id = %entry.id, error = %err, "record failed, dead-lettering");
                let dead = json!({
                    "original_id": entry.id,
                    "stream": entry.stream,
                    "data": entry.payload,
                })
                .to_string();
                if let Err(dlq_err) = self.queue.xadd(keys::STREAM_BUILDER_DEAD, &dead).await {
                    error!(error = %dlq_err, "failed to move record to dead letters");
                }
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        // Never leave an entry unacked, success or failure.
        if let Err(err) = self
            .queue
            .ack(&entry.stream, keys::BUILDER_GROUP, &entry.id)
            .await
        {
            error!(id = %entry.id, error = %err, "ack failed");
        }
    }

    async fn apply(&self, entry: &StreamEntry) -> anyhow::Result<()> {
        let record = BatchRecord::from_json(&entry.payload)?;
        debug!(kind = ?record.kind, message_id = record.message_id, "applying record");

        match record.kind {
            RecordKind::UserMessage => {
                self.store
                    .write_batch(&record.entities, &record.relationships, true)
                    .await?;
                // Untyped strays are cheap to sweep while we're here.
                let _ = self.store.cleanup_null_entities().await;
            }
            RecordKind::ProfileUpdate => {
                for entity in &record.entities {
                    if entity.id == 0 {
                        warn!("skipping profile update with no entity id");
                        continue;
                    }
                    self.store
                        .update_entity_profile(
                            entity.id,
                            &entity.canonical_name,
                            &entity.summary,
                            &entity.embedding,
                            entity.last_profiled_msg_id,
                            &entity.topic,
                        )
                        .await?;
                }
            }
            RecordKind::SystemEntity => {
                self.store.write_batch(&record.entities, &[], false).await?;
            }
        }
        Ok(())
    }
}
