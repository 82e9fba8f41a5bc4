//! ============================================================================
//! Ingestion Pipeline - Decides what a finished exchange leaves behind
//! ============================================================================
//! For each completed user / companion exchange:
//! 1. Extract candidate profile facts; keep those with enough confidence
//! 2. Score the exchange; below the floor nothing else is written
//! 3. Write a summary, and an insight when the exchange matters enough
//! 4. Poke the maintenance policy
//!
//! Scoring failures are logged and count as importance 0. Only store
//! failures reach the caller.
//! ============================================================================

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::analyzer::{ExchangeAnalyzer, FactExtractor};
use super::maintenance::MaintenancePolicy;
use super::types::{Exchange, IngestReport};
use crate::config::IngestionConfig;
use crate::db::{clamp_unit, MemoryDb, RecordKind};
use crate::error::StorageError;

pub struct IngestionPipeline {
    store: Arc<MemoryDb>,
    extractor: Arc<dyn FactExtractor>,
    analyzer: Arc<dyn ExchangeAnalyzer>,
    config: IngestionConfig,
    maintenance: Option<Arc<MaintenancePolicy>>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<MemoryDb>,
        extractor: Arc<dyn FactExtractor>,
        analyzer: Arc<dyn ExchangeAnalyzer>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            analyzer,
            config,
            maintenance: None,
        }
    }

    /// Trigger maintenance checks after writes
    pub fn with_maintenance(mut self, maintenance: Arc<MaintenancePolicy>) -> Self {
        self.maintenance = Some(maintenance);
        self
    }

    /// Ingest one completed exchange
    pub async fn process(&self, user_message: &str, ai_response: &str) -> Result<IngestReport, StorageError> {
        self.process_at(user_message, ai_response, chrono::Utc::now().timestamp())
            .await
    }

    pub async fn process_at(
        &self,
        user_message: &str,
        ai_response: &str,
        now: i64,
    ) -> Result<IngestReport, StorageError> {
        let exchange = Exchange {
            user_message,
            ai_response,
        };
        let mut report = IngestReport::default();

        // Profile facts are gated on their own confidence
        let facts = match self.extractor.extract(&exchange).await {
            Ok(facts) => facts,
            Err(e) => {
                warn!("Fact extraction failed: {}", e);
                Vec::new()
            }
        };
        for fact in facts {
            if fact.key.is_empty() || fact.value.trim().is_empty() {
                continue;
            }
            if clamp_unit(fact.confidence) < self.config.min_confidence {
                debug!("Dropping low-confidence fact {} ({:.2})", fact.key, fact.confidence);
                continue;
            }
            self.store
                .upsert_profile_fact_at(&fact.key, &fact.value, fact.confidence, now)?;
            report.facts_written += 1;
        }

        let importance = match self.analyzer.importance(&exchange).await {
            Ok(score) => clamp_unit(score),
            Err(e) => {
                warn!("Importance scoring failed, treating as 0: {}", e);
                0.0
            }
        };
        debug!("Exchange importance: {:.2}", importance);

        if importance >= self.config.min_importance {
            match self.analyzer.summarize(&exchange, importance).await {
                Ok(Some(summary)) if !summary.trim().is_empty() => {
                    self.store
                        .insert_or_merge_at(RecordKind::Summary, &summary, importance, &[], now)?;
                    report.summaries_written += 1;
                }
                Ok(_) => {}
                Err(e) => warn!("Summary generation failed: {}", e),
            }
        }

        if importance >= self.config.insight_min_importance.max(self.config.min_importance) {
            match self.analyzer.insight(&exchange, importance).await {
                Ok(Some(insight)) if !insight.text.trim().is_empty() => {
                    let tags = vec![insight.category.as_str().to_string()];
                    self.store
                        .insert_or_merge_at(RecordKind::Insight, &insight.text, importance, &tags, now)?;
                    report.insights_written += 1;
                }
                Ok(_) => {}
                Err(e) => warn!("Insight generation failed: {}", e),
            }
        }

        if report.total() > 0 {
            info!(
                "Ingested exchange: {} facts, {} summaries, {} insights",
                report.facts_written, report.summaries_written, report.insights_written
            );
            self.poke_maintenance(now);
        } else {
            debug!("Exchange left nothing to remember");
        }

        Ok(report)
    }

    fn poke_maintenance(&self, now: i64) {
        let Some(maintenance) = &self.maintenance else {
            return;
        };
        maintenance.note_ingestion();
        // A failed pass is retried on the next trigger
        if let Err(e) = maintenance.maybe_run_at(now) {
            warn!("Maintenance failed: {}", e);
        }
    }
}
