//! ============================================================================
//! Memory Manager - Orchestrates memory storage and retrieval
//! ============================================================================
//! High-level API used by the conversation session and the memory viewer.
//! Owns the store handle and wires retrieval, ingestion and maintenance
//! around it. Per-turn calls degrade instead of failing the conversation.
//! ============================================================================

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::analyzer::{ExchangeAnalyzer, FactExtractor, HeuristicAnalyzer};
use super::ingest::IngestionPipeline;
use super::maintenance::{MaintenancePolicy, MaintenanceReport};
use super::retrieval::RelevanceEngine;
use super::types::{IngestReport, MemoryBundle};
use crate::config::MemoryConfig;
use crate::db::{DbStats, MemoryDb, MemoryExport, RecordKind};
use crate::error::StorageError;

/// Memory manager combining store, retrieval, ingestion and maintenance
pub struct MemoryManager {
    store: Arc<MemoryDb>,
    engine: RelevanceEngine,
    pipeline: IngestionPipeline,
    maintenance: Arc<MaintenancePolicy>,
}

impl MemoryManager {
    /// Wire a manager around an already-open store
    pub fn new(
        store: Arc<MemoryDb>,
        extractor: Arc<dyn FactExtractor>,
        analyzer: Arc<dyn ExchangeAnalyzer>,
        config: &MemoryConfig,
    ) -> Self {
        let maintenance = Arc::new(MaintenancePolicy::new(
            store.clone(),
            config.maintenance.clone(),
        ));
        let engine = RelevanceEngine::new(store.clone(), config.retrieval.clone());
        let pipeline = IngestionPipeline::new(
            store.clone(),
            extractor,
            analyzer,
            config.ingestion.clone(),
        )
        .with_maintenance(maintenance.clone());

        Self {
            store,
            engine,
            pipeline,
            maintenance,
        }
    }

    /// Open the configured store and wire a manager around it
    pub fn open(
        config: &MemoryConfig,
        extractor: Arc<dyn FactExtractor>,
        analyzer: Arc<dyn ExchangeAnalyzer>,
    ) -> Result<Self, StorageError> {
        let store = MemoryDb::open(config.db_path.as_deref())?.with_dedup(config.dedup.clone());

        Ok(Self::new(Arc::new(store), extractor, analyzer, config))
    }

    /// Open with rule-based analysis only (no model calls)
    pub fn open_heuristic(config: &MemoryConfig) -> Result<Self, StorageError> {
        let analyzer = Arc::new(HeuristicAnalyzer);
        Self::open(config, analyzer.clone(), analyzer)
    }

    /// Read-only retrieval for the current message
    pub fn retrieve(&self, current_message: &str) -> Result<MemoryBundle, StorageError> {
        self.engine.retrieve(current_message)
    }

    /// Memory to inject for this turn; a storage failure yields an empty
    /// bundle. Read-only: call `record_hits` once the bundle was used.
    pub fn build_context(&self, current_message: &str) -> MemoryBundle {
        match self.engine.retrieve(current_message) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!("Memory retrieval failed, continuing without memory: {}", e);
                MemoryBundle::default()
            }
        }
    }

    /// Note that the bundle's records were injected into a prompt that got
    /// an answer. Failures are logged only.
    pub fn record_hits(&self, bundle: &MemoryBundle) {
        let now = chrono::Utc::now().timestamp();
        let summary_ids: Vec<_> = bundle.summaries.iter().map(|r| r.id).collect();
        let insight_ids: Vec<_> = bundle.insights.iter().map(|r| r.id).collect();
        let hits = self
            .store
            .record_hits(RecordKind::Summary, &summary_ids, now)
            .and_then(|n| {
                self.store
                    .record_hits(RecordKind::Insight, &insight_ids, now)
                    .map(|m| n + m)
            });
        match hits {
            Ok(n) => debug!("Recorded {} retrieval hits", n),
            Err(e) => warn!("Failed to record retrieval hits: {}", e),
        }
    }

    /// Ingest a completed exchange. None if the store failed.
    pub async fn record_exchange(&self, user_message: &str, ai_response: &str) -> Option<IngestReport> {
        match self.pipeline.process(user_message, ai_response).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Failed to store memory for exchange: {}", e);
                None
            }
        }
    }

    /// Run maintenance if due
    pub fn maybe_maintain(&self) -> Result<Option<MaintenanceReport>, StorageError> {
        self.maintenance.maybe_run()
    }

    /// Run maintenance now
    pub fn maintain(&self) -> Result<MaintenanceReport, StorageError> {
        self.maintenance.run()
    }

    pub fn export_all(&self) -> Result<MemoryExport, StorageError> {
        self.store.export_all()
    }

    /// Forget everything
    pub fn clear_all(&self) -> Result<(), StorageError> {
        self.store.clear_all()?;
        info!("Cleared all memory");
        Ok(())
    }

    pub fn import(&self, export: &MemoryExport) -> Result<usize, StorageError> {
        self.store.import(export)
    }

    pub fn stats(&self) -> Result<DbStats, StorageError> {
        self.store.stats()
    }

    pub fn maintenance(&self) -> &MaintenancePolicy {
        &self.maintenance
    }

    /// Get reference to the store (for advanced operations)
    pub fn store(&self) -> &Arc<MemoryDb> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, MemoryManager) {
        let dir = TempDir::new().unwrap();
        let config = MemoryConfig {
            db_path: Some(dir.path().join("memory.redb")),
            ..MemoryConfig::default()
        };
        let manager = MemoryManager::open_heuristic(&config).unwrap();
        (dir, manager)
    }

    #[tokio::test]
    async fn test_exchange_then_context() {
        let (_dir, manager) = manager();

        let report = manager
            .record_exchange("my favorite color is purple", "Purple suits you!")
            .await
            .unwrap();
        assert_eq!(report.facts_written, 1);

        let bundle = manager.build_context("what color should I paint my room?");
        assert_eq!(bundle.profile.get("favorite_color").map(String::as_str), Some("purple"));
        assert_eq!(bundle.summaries.len(), 1);
        manager.record_hits(&bundle);

        let summary = manager
            .store()
            .get(RecordKind::Summary, bundle.summaries[0].id)
            .unwrap()
            .unwrap();
        assert_eq!(summary.retrieval_count, 1);
        assert!(summary.last_retrieved_at.is_some());
    }

    #[tokio::test]
    async fn test_context_building_does_not_record_hits() {
        let (_dir, manager) = manager();
        manager
            .record_exchange("I love baking bread on sundays", "Nice!")
            .await
            .unwrap();

        let bundle = manager.retrieve("bread").unwrap();
        manager.build_context("bread");
        let record = manager
            .store()
            .get(RecordKind::Summary, bundle.summaries[0].id)
            .unwrap()
            .unwrap();
        assert_eq!(record.retrieval_count, 0);
    }

    #[tokio::test]
    async fn test_export_clear_import() {
        let (_dir, manager) = manager();
        manager
            .record_exchange("I live in Porto and I want to learn surfing this summer", "Great!")
            .await
            .unwrap();

        let export = manager.export_all().unwrap();
        assert!(!export.profile.is_empty());
        assert!(!export.summaries.is_empty());

        manager.clear_all().unwrap();
        let stats = manager.stats().unwrap();
        assert_eq!(stats.profile_facts + stats.summaries + stats.insights, 0);
        assert!(manager.build_context("surfing").is_empty());

        let written = manager.import(&export).unwrap();
        assert_eq!(
            written,
            export.profile.len() + export.summaries.len() + export.insights.len()
        );
        assert_eq!(
            manager.store().get_profile_fact("location").unwrap().unwrap().value,
            "Porto"
        );
    }

    #[tokio::test]
    async fn test_first_exchange_runs_maintenance() {
        let (_dir, manager) = manager();
        assert!(manager.stats().unwrap().last_maintenance_at.is_none());

        manager
            .record_exchange("my favorite season is autumn", "Cozy!")
            .await
            .unwrap();
        assert!(manager.stats().unwrap().last_maintenance_at.is_some());
        assert!(manager.maybe_maintain().unwrap().is_none());
    }
}
