use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub user_name: String,
    /// Topics the user currently cares about; seeds extraction and filtering.
    pub active_topics: Vec<String>,
    /// Topics pre-fetched into the agent context on every query.
    pub hot_topics: Vec<String>,
    /// Optional persona override for the agent voice.
    pub persona: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            user_name: "User".to_string(),
            active_topics: vec!["General".to_string()],
            hot_topics: Vec::new(),
            persona: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions base URL.
    pub base_url: String,
    /// Environment variable holding the API key (never stored in the file).
    pub api_key_env: String,
    pub structured_model: String,
    pub reasoning_model: String,
    pub agent_model: String,
    /// Retries for structured parsing before giving up.
    pub max_retries: u32,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            structured_model: "google/gemini-2.5-flash".to_string(),
            reasoning_model: "google/gemini-3-flash-preview".to_string(),
            agent_model: "anthropic/claude-sonnet-4.5".to_string(),
            max_retries: 2,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Messages drained per batch.
    pub batch_size: usize,
    /// Seconds after the first buffered message before a partial batch runs.
    pub batch_timeout_secs: u64,
    /// Message-id gap that triggers a per-entity profile refresh.
    pub profile_interval: i64,
    /// Concurrent fire-and-forget profile tasks.
    pub profile_concurrency: usize,
    /// Size of the recent-message window kept for profiling and tools.
    pub recent_window: usize,
    /// Seconds to wait for in-flight profile tasks at shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_timeout_secs: 60,
            profile_interval: 15,
            profile_concurrency: 5,
            recent_window: 75,
            shutdown_grace_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub embedding_dim: usize,
    /// Candidates pulled from the vector index per resolve.
    pub top_k: usize,
    /// Weighted-ratio floor (0-100) for fuzzy candidates inside resolve.
    pub fuzzy_cutoff: f64,
    /// Weighted-ratio floor for direct canonical lookups (tools, known-entity stage).
    pub lookup_cutoff: f64,
    /// Normalized score at or above which a candidate is returned as resolved.
    pub resolved_threshold: f64,
    /// Normalized score above which candidates count toward an ambiguous verdict.
    pub ambiguous_threshold: f64,
    /// Embedding cosine similarity floor for merge candidacy.
    pub merge_similarity: f32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 384,
            top_k: 10,
            fuzzy_cutoff: 80.0,
            lookup_cutoff: 85.0,
            resolved_threshold: 0.90,
            ambiguous_threshold: 0.65,
            merge_similarity: 0.85,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub check_interval_secs: u64,
    /// LLM score at or above which duplicate entities merge automatically.
    pub merge_auto_threshold: f64,
    /// LLM score floor below which merge candidates are discarded outright.
    pub merge_review_floor: f64,
    pub maintenance_lock_ttl_secs: u64,
    pub dlq_replay_interval_secs: u64,
    pub dlq_batch_size: usize,
    pub mood_volume_threshold: usize,
    pub profile_volume_threshold: usize,
    pub profile_idle_secs: f64,
    pub user_profile_idle_secs: f64,
    pub user_msg_window: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            merge_auto_threshold: 0.93,
            merge_review_floor: 0.65,
            maintenance_lock_ttl_secs: 600,
            dlq_replay_interval_secs: 300,
            dlq_batch_size: 50,
            mood_volume_threshold: 5,
            profile_volume_threshold: 5,
            profile_idle_secs: 300.0,
            user_profile_idle_secs: 600.0,
            user_msg_window: 45,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_calls: usize,
    pub max_attempts: usize,
    pub max_consecutive_rejections: usize,
    pub query_timeout_secs: u64,
    /// Default lookback window for the activity tool, in hours.
    pub activity_hours: i64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_calls: 5,
            max_attempts: 10,
            max_consecutive_rejections: 3,
            query_timeout_secs: 60,
            activity_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub user: UserConfig,
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    pub resolver: ResolverConfig,
    pub scheduler: SchedulerConfig,
    pub agent: AgentConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_pipeline_constants() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.pipeline.batch_size, 5);
        assert_eq!(cfg.pipeline.batch_timeout_secs, 60);
        assert_eq!(cfg.pipeline.profile_interval, 15);
        assert_eq!(cfg.resolver.embedding_dim, 384);
        assert!((cfg.scheduler.merge_auto_threshold - 0.93).abs() < f64::EPSILON);
        assert!((cfg.scheduler.merge_review_floor - 0.65).abs() < f64::EPSILON);
        assert_eq!(cfg.agent.max_calls, 5);
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vestige.toml");

        let mut cfg = AppConfig::default();
        cfg.user.user_name = "Yinka".to_string();
        cfg.user.active_topics = vec!["Fitness".into(), "School".into()];
        cfg.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.user.user_name, "Yinka");
        assert_eq!(loaded.user.active_topics.len(), 2);
        assert_eq!(loaded.pipeline.batch_size, 5);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = AppConfig::load_from("/nonexistent/vestige.toml").unwrap();
        assert_eq!(cfg.user.user_name, "User");
    }

    #[test]
    fn partial_toml_fills_missing_sections() {
        let cfg: AppConfig = toml::from_str("[user]\nuser_name = \"Ada\"\n").unwrap();
        assert_eq!(cfg.user.user_name, "Ada");
        assert_eq!(cfg.pipeline.batch_size, 5);
        assert_eq!(cfg.llm.max_retries, 2);
    }
}
