//! ============================================================================
//! COMPANION-CORE: The Companion's Memory
//! ============================================================================
//! This crate handles everything the companion remembers about its user:
//! - Record store for profile facts, summaries and insights (redb)
//! - Keyword relevance ranking of memory for each turn
//! - Ingestion of finished exchanges, rule-based or model-backed
//! - Maintenance: aging, consolidation and cleanup
//! - Completion / speech service clients and the per-turn session
//! ============================================================================

pub mod config;
pub mod db;
pub mod error;
pub mod memory;
pub mod services;
pub mod session;

// Re-export main types for convenience
pub use config::MemoryConfig;
pub use db::{MemoryDb, MemoryExport, MemoryRecord, ProfileFact, RecordId, RecordKind};
pub use error::{ScoringFailure, ServiceError, StorageError};
pub use memory::{MemoryBundle, MemoryManager};
pub use session::{build_system_prompt, ConversationSession, TurnOutcome};
