//! ============================================================================
//! Relevance Engine - Picks the memory injected into each turn
//! ============================================================================
//! Scores every summary / insight against the keywords of the current
//! message and returns the top N of each kind. When nothing overlaps, falls
//! back to the most important (then most recent) records so the prompt
//! always carries some personality context.
//!
//! Retrieval is read-only and deterministic for a fixed store and message.
//! ============================================================================

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use super::keywords::{extract_keywords, fold_apostrophes};
use super::types::MemoryBundle;
use crate::config::RetrievalConfig;
use crate::db::{MemoryDb, MemoryRecord, RecordKind};
use crate::error::StorageError;

/// Query-time match of one record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Relevance {
    /// Keywords found in the record text
    pub matched: usize,
    /// Overlap fraction weighted by importance, in [0, 1]
    pub score: f32,
}

/// Score a record against a keyword set.
///
/// `score = matched / |keywords| * (0.5 + 0.5 * importance)`, so importance
/// only reorders records with overlap and a record whose importance
/// collapsed to zero still ranks on overlap.
pub fn relevance(record: &MemoryRecord, keywords: &BTreeSet<String>) -> Relevance {
    if keywords.is_empty() {
        return Relevance { matched: 0, score: 0.0 };
    }

    // Keywords are apostrophe-free, so the text must be too
    let text = fold_apostrophes(&record.text).to_lowercase();
    let matched = keywords.iter().filter(|k| text.contains(k.as_str())).count();
    let overlap = matched as f32 / keywords.len() as f32;
    let weight = 0.5 + 0.5 * record.importance.clamp(0.0, 1.0);

    Relevance {
        matched,
        score: (overlap * weight).clamp(0.0, 1.0),
    }
}

fn newest_first(a: &MemoryRecord, b: &MemoryRecord) -> Ordering {
    b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id))
}

/// Rank records for a keyword set and keep the top `limit`
pub fn rank(records: Vec<MemoryRecord>, keywords: &BTreeSet<String>, limit: usize) -> Vec<MemoryRecord> {
    let mut scored: Vec<(Relevance, MemoryRecord)> = records
        .into_iter()
        .map(|record| (relevance(&record, keywords), record))
        .collect();

    if scored.iter().all(|(rel, _)| rel.matched == 0) {
        // Fallback: most important, then most recent
        scored.sort_by(|(_, a), (_, b)| {
            b.importance
                .total_cmp(&a.importance)
                .then_with(|| newest_first(a, b))
        });
    } else {
        scored.sort_by(|(ra, a), (rb, b)| {
            rb.score
                .total_cmp(&ra.score)
                .then_with(|| newest_first(a, b))
        });
    }

    scored.into_iter().take(limit).map(|(_, record)| record).collect()
}

/// Read-only retrieval over the record store
pub struct RelevanceEngine {
    store: Arc<MemoryDb>,
    config: RetrievalConfig,
}

impl RelevanceEngine {
    pub fn new(store: Arc<MemoryDb>, config: RetrievalConfig) -> Self {
        Self { store, config }
    }

    /// Select the memory bundle for the current message
    pub fn retrieve(&self, current_message: &str) -> Result<MemoryBundle, StorageError> {
        let keywords = extract_keywords(current_message);
        debug!("Retrieving memory for {} keywords: {:?}", keywords.len(), keywords);

        let profile = self.store.all_profile_facts()?;
        let summaries = rank(
            self.store.all(RecordKind::Summary)?,
            &keywords,
            self.config.summary_limit,
        );
        let insights = rank(
            self.store.all(RecordKind::Insight)?,
            &keywords,
            self.config.insight_limit,
        );

        debug!(
            "Selected {} profile facts, {} summaries, {} insights",
            profile.len(),
            summaries.len(),
            insights.len()
        );

        Ok(MemoryBundle {
            profile,
            summaries,
            insights,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine() -> (TempDir, Arc<MemoryDb>, RelevanceEngine) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryDb::open(Some(&dir.path().join("m.redb"))).unwrap());
        let engine = RelevanceEngine::new(store.clone(), RetrievalConfig::default());
        (dir, store, engine)
    }

    fn add(store: &MemoryDb, kind: RecordKind, text: &str, importance: f32, at: i64) {
        store.insert_or_merge_at(kind, text, importance, &[], at).unwrap();
    }

    #[test]
    fn test_keyword_match_outranks_importance() {
        let (_dir, store, engine) = engine();
        add(&store, RecordKind::Summary, "User planned a hiking trip to Patagonia", 0.3, 100);
        add(&store, RecordKind::Summary, "User got a promotion at the bakery", 0.9, 200);

        let bundle = engine.retrieve("any tips for hiking boots?").unwrap();
        assert_eq!(bundle.summaries[0].text, "User planned a hiking trip to Patagonia");
        // Zero-score records still fill the remaining slots
        assert_eq!(bundle.summaries.len(), 2);
    }

    #[test]
    fn test_importance_weights_equal_overlap() {
        let (_dir, store, engine) = engine();
        add(&store, RecordKind::Insight, "User enjoys cooking pasta", 0.3, 100);
        add(&store, RecordKind::Insight, "User is proud of their cooking", 0.9, 50);

        let bundle = engine.retrieve("cooking tonight").unwrap();
        assert_eq!(bundle.insights[0].text, "User is proud of their cooking");
    }

    #[test]
    fn test_ties_prefer_recent() {
        let (_dir, store, engine) = engine();
        add(&store, RecordKind::Summary, "Talked about guitar strings", 0.5, 100);
        add(&store, RecordKind::Summary, "Talked about guitar amps", 0.5, 300);

        let bundle = engine.retrieve("guitar").unwrap();
        assert_eq!(bundle.summaries[0].text, "Talked about guitar amps");
    }

    #[test]
    fn test_fallback_for_unrelated_message() {
        let (_dir, store, engine) = engine();
        add(&store, RecordKind::Summary, "User adopted a rescue greyhound", 0.9, 100);
        add(&store, RecordKind::Summary, "User finished a marathon", 0.8, 200);
        add(&store, RecordKind::Summary, "User started learning Rust", 0.8, 300);

        let bundle = engine.retrieve("what's the weather").unwrap();
        let texts: Vec<_> = bundle.summaries.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "User adopted a rescue greyhound",
                "User started learning Rust",
                "User finished a marathon",
            ]
        );
    }

    #[test]
    fn test_limits_and_profile() {
        let (_dir, store, engine) = engine();
        store.upsert_profile_fact("name", "Ada", 0.9).unwrap();
        for i in 0..12 {
            add(&store, RecordKind::Summary, &format!("summary topic number {}", i), 0.5, i);
            add(&store, RecordKind::Insight, &format!("insight about theme {}", i), 0.5, i);
        }

        let bundle = engine.retrieve("hello").unwrap();
        assert_eq!(bundle.summaries.len(), 5);
        assert_eq!(bundle.insights.len(), 8);
        assert_eq!(bundle.profile.get("name").map(String::as_str), Some("Ada"));
    }

    #[test]
    fn test_retrieval_is_deterministic() {
        let (_dir, store, engine) = engine();
        for i in 0..10 {
            add(&store, RecordKind::Summary, &format!("conversation about music genre {}", i), 0.5, 100);
        }

        let first = engine.retrieve("music recommendations").unwrap();
        let second = engine.retrieve("music recommendations").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_store() {
        let (_dir, _store, engine) = engine();
        let bundle = engine.retrieve("anything").unwrap();
        assert!(bundle.is_empty());
    }

    #[test]
    fn test_relevance_bounds() {
        let record = MemoryRecord {
            id: crate::db::RecordId(1),
            kind: RecordKind::Summary,
            text: "Coffee and croissants in Paris".into(),
            importance: 1.0,
            relevance_decay: 1.0,
            content_hash: String::new(),
            created_at: 0,
            updated_at: 0,
            last_retrieved_at: None,
            retrieval_count: 0,
            merge_count: 0,
            tags: vec![],
        };
        let keywords = extract_keywords("coffee in Paris");
        let rel = relevance(&record, &keywords);
        assert_eq!(rel.matched, 2);
        assert!((rel.score - 1.0).abs() < 1e-6);

        let rel = relevance(&record, &BTreeSet::new());
        assert_eq!(rel.score, 0.0);
    }

    #[test]
    fn test_contractions_match() {
        let (_dir, store, engine) = engine();
        add(&store, RecordKind::Summary, "User can't sleep before exams", 0.3, 100);
        add(&store, RecordKind::Summary, "User bought a new bike", 0.9, 200);

        // The contraction is the only keyword, so a miss would fall back to the bike
        for message in ["cant", "can’t!"] {
            let bundle = engine.retrieve(message).unwrap();
            assert_eq!(bundle.summaries[0].text, "User can't sleep before exams");
        }
    }
}
