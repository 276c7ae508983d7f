//! Dead-letter replay.
//!
//! Transient failures (network blips, timeouts) put their messages back in
//! the buffer; anything else is parked for manual review so a poisoned
//! batch can never loop forever. Corrupt JSON always parks.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use vestige_queue::keys;

use crate::{Job, JobContext, JobResult};

/// Substrings identifying errors worth retrying.
const TRANSIENT_ERRORS: &[&str] = &[
    "ConnectionError",
    "TimeoutError",
    "Service Unavailable",
    "Connection refused",
    "connection error",
    "timed out",
    "timeout",
];

pub struct DlqReplayJob {
    interval_secs: f64,
    batch_size: usize,
}

impl DlqReplayJob {
    pub fn new(interval_secs: f64, batch_size: usize) -> Self {
        Self {
            interval_secs,
            batch_size,
        }
    }

    fn is_transient(error: &str) -> bool {
        TRANSIENT_ERRORS.iter().any(|t| error.contains(t))
    }
}

#[async_trait]
impl Job for DlqReplayJob {
    fn name(&self) -> &'static str {
        "dlq_auto_replay"
    }

    async fn should_run(&self, ctx: &JobContext) -> bool {
        match ctx.last_run {
            None => true,
            Some(last) => (Utc::now() - last).num_milliseconds() as f64 / 1000.0 >= self.interval_secs,
        }
    }

    async fn execute(&self, ctx: &JobContext) -> JobResult {
        let dlq_key = keys::dlq(&ctx.user_name);
        let park_key = keys::parked(&ctx.user_name);
        let buffer_key = keys::buffer(&ctx.user_name);

        let queue_len = ctx.queue.llen(&dlq_key).await.unwrap_or(0);
        if queue_len == 0 {
            return JobResult::ok("DLQ empty");
        }

        let mut processed = 0;
        let mut retried = 0;
        let mut parked = 0;

        for _ in 0..queue_len.min(self.batch_size) {
            let Ok(Some(raw)) = ctx.queue.lpop(&dlq_key).await else {
                break;
            };
            processed += 1;

            let entry: serde_json::Value = match serde_json::from_str(&raw) {
                Ok(value) => value,
                Err(err) => {
                    warn!(error = %err, "corrupt DLQ item, parking");
                    let _ = ctx.queue.rpush(&park_key, &raw).await;
                    parked += 1;
                    continue;
                }
            };

            let error_msg = entry
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            if Self::is_transient(&error_msg) {
                let messages = entry
                    .get("messages")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                for message in messages {
                    let _ = ctx.queue.rpush(&buffer_key, &message.to_string()).await;
                }
                retried += 1;
                info!(error = %error_msg, "transient DLQ item requeued");
            } else {
                let mut parked_entry = entry;
                if let Some(obj) = parked_entry.as_object_mut() {
                    obj.insert(
                        "parked_at".to_string(),
                        serde_json::json!(Utc::now().timestamp_millis() as f64 / 1000.0),
                    );
                }
                let _ = ctx.queue.rpush(&park_key, &parked_entry.to_string()).await;
                parked += 1;
                warn!(error = %error_msg, "fatal DLQ item parked");
            }
        }

        JobResult::ok(format!(
            "Processed {processed}: {retried} retried, {parked} parked"
        ))
    }
}
