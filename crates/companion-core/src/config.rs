//! ============================================================================
//! Memory Configuration - Thresholds, limits and service settings
//! ============================================================================
//! Defaults match the tuned values of the companion; every field can be
//! overridden through `COMPANION_*` environment variables.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

/// Default OpenAI-compatible endpoint (Groq)
pub const DEFAULT_API_BASE: &str = "https://api.groq.com/openai/v1";

/// Top-level configuration for the memory subsystem
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Store file; None resolves through COMPANION_DB_PATH or ~/.companion
    pub db_path: Option<PathBuf>,
    pub retrieval: RetrievalConfig,
    pub ingestion: IngestionConfig,
    pub dedup: DedupConfig,
    pub maintenance: MaintenanceConfig,
    pub service: ServiceConfig,
}

/// How many records of each kind a retrieval may return
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub summary_limit: usize,
    pub insight_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            summary_limit: 5,
            insight_limit: 8,
        }
    }
}

/// Ingestion thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Summaries and insights below this importance are never written
    pub min_importance: f32,
    /// Profile facts below this confidence are never written
    pub min_confidence: f32,
    /// Exchanges below this importance produce no insight
    pub insight_min_importance: f32,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            min_importance: 0.2,
            min_confidence: 0.2,
            insight_min_importance: 0.4,
        }
    }
}

/// Write-time near-duplicate detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Token Jaccard similarity at or above which two texts are the same record
    pub near_duplicate_threshold: f32,
    /// Only records created within this many days are scanned
    pub window_days: i64,
    /// Upper bound on records scanned per insert
    pub scan_limit: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            near_duplicate_threshold: 0.9,
            window_days: 7,
            scan_limit: 200,
        }
    }
}

/// Aging, consolidation and cleanup policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Run after this many ingestions that wrote something
    pub every_n_ingestions: u32,
    /// Run whenever summaries + insights reach this count
    pub size_threshold: usize,
    /// Run at least this often
    pub interval_hours: i64,
    /// Importance multiplier per idle day
    pub decay_per_day: f64,
    /// Records touched within this many days are not decayed
    pub grace_days: i64,
    /// Token Jaccard similarity at or above which records are consolidated
    pub consolidation_threshold: f32,
    /// Records below this importance are cleanup candidates
    pub cleanup_floor: f32,
    /// ... once they are at least this old
    pub cleanup_min_age_days: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            every_n_ingestions: 10,
            size_threshold: 500,
            interval_hours: 24,
            decay_per_day: 0.98,
            grace_days: 7,
            consolidation_threshold: 0.75,
            cleanup_floor: 0.05,
            cleanup_min_age_days: 30,
        }
    }
}

/// External completion / speech service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub api_base: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Model for conversation replies
    pub chat_model: String,
    /// Model for memory analysis (importance, facts, summaries)
    pub memory_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    /// Replies kept in the session history
    pub history_turns: usize,
    #[serde(skip_serializing)]
    pub speech_key: Option<String>,
    pub speech_region: String,
    pub speech_voice: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            chat_model: "deepseek-r1-distill-llama-70b".to_string(),
            memory_model: "llama-3.1-8b-instant".to_string(),
            temperature: 0.8,
            max_tokens: 1024,
            timeout_secs: 30,
            history_turns: 10,
            speech_key: None,
            speech_region: "eastus".to_string(),
            speech_voice: "en-US-Phoebe:DragonHDLatestNeural".to_string(),
        }
    }
}

impl MemoryConfig {
    /// Defaults overlaid with COMPANION_* environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("COMPANION_DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }

        env_parse("COMPANION_SUMMARY_LIMIT", &mut config.retrieval.summary_limit);
        env_parse("COMPANION_INSIGHT_LIMIT", &mut config.retrieval.insight_limit);

        env_parse("COMPANION_MIN_IMPORTANCE", &mut config.ingestion.min_importance);
        env_parse("COMPANION_MIN_CONFIDENCE", &mut config.ingestion.min_confidence);

        env_parse("COMPANION_DEDUP_THRESHOLD", &mut config.dedup.near_duplicate_threshold);
        env_parse("COMPANION_DEDUP_WINDOW_DAYS", &mut config.dedup.window_days);

        let m = &mut config.maintenance;
        env_parse("COMPANION_MAINTENANCE_EVERY", &mut m.every_n_ingestions);
        env_parse("COMPANION_MAINTENANCE_SIZE", &mut m.size_threshold);
        env_parse("COMPANION_DECAY_PER_DAY", &mut m.decay_per_day);
        env_parse("COMPANION_CLEANUP_FLOOR", &mut m.cleanup_floor);
        env_parse("COMPANION_CLEANUP_MIN_AGE_DAYS", &mut m.cleanup_min_age_days);

        let s = &mut config.service;
        if let Ok(base) = std::env::var("COMPANION_API_BASE") {
            s.api_base = base;
        }
        s.api_key = non_empty_env("COMPANION_API_KEY").or_else(|| non_empty_env("GROQ_API_KEY"));
        if let Ok(model) = std::env::var("COMPANION_CHAT_MODEL") {
            s.chat_model = model;
        }
        if let Ok(model) = std::env::var("COMPANION_MEMORY_MODEL") {
            s.memory_model = model;
        }
        env_parse("COMPANION_TEMPERATURE", &mut s.temperature);
        env_parse("COMPANION_MAX_TOKENS", &mut s.max_tokens);
        env_parse("COMPANION_TIMEOUT_SECS", &mut s.timeout_secs);
        s.speech_key = non_empty_env("AZURE_SPEECH_KEY");
        if let Ok(region) = std::env::var("AZURE_SPEECH_REGION") {
            s.speech_region = region;
        }
        if let Ok(voice) = std::env::var("COMPANION_VOICE") {
            s.speech_voice = voice;
        }

        config
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!("Ignoring invalid value for {}: {:?}", name, raw),
        }
    }
}
