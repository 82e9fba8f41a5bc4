//! ============================================================================
//! Memory Module - Persistent conversation memory for the companion
//! ============================================================================
//! Keyword-ranked retrieval over a local record store, with ingestion and
//! maintenance keeping it small and current.
//!
//! ## Architecture
//! ```text
//! User Message → Keywords → Ranked Summaries / Insights + Profile
//!                                      ↓
//!                     [Persona Prompt] + [Background Context]
//!                                      ↓
//!                              Completion Service
//!                                      ↓
//!              Extract Facts / Summary / Insight → Record Store
//!                                      ↓
//!                      Maintenance (decay, consolidate, cleanup)
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use companion_core::memory::MemoryManager;
//! use companion_core::MemoryConfig;
//!
//! let manager = MemoryManager::open_heuristic(&MemoryConfig::from_env())?;
//!
//! let bundle = manager.build_context("any tips for my garden?");
//! let prompt = bundle.format_for_prompt();
//! // ... once the model answered
//! manager.record_hits(&bundle);
//!
//! manager.record_exchange("I grow tomatoes", "Nice, which variety?").await;
//! ```
//! ============================================================================

pub mod analyzer;
mod ingest;
pub mod keywords;
mod maintenance;
mod manager;
mod retrieval;
mod types;

// Re-export public types
pub use analyzer::{
    CandidateFact, CandidateInsight, ExchangeAnalyzer, FactExtractor, HeuristicAnalyzer,
    InsightCategory, ModelAnalyzer,
};
pub use ingest::IngestionPipeline;
pub use maintenance::{MaintenancePolicy, MaintenanceReport};
pub use manager::MemoryManager;
pub use retrieval::{rank, relevance, Relevance, RelevanceEngine};
pub use types::{ConversationTurn, Exchange, IngestReport, MemoryBundle, Role};
