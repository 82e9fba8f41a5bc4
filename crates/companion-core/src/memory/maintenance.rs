//! ============================================================================
//! Maintenance Policy - Keeps the record store bounded and useful
//! ============================================================================
//! One pass runs three steps over summaries and insights, in order:
//!
//! 1. Aging: importance *= decay_per_day ^ idle_days, where idle time
//!    starts `grace_days` after a record was last written or retrieved and
//!    is never counted twice across passes.
//! 2. Consolidation: same-kind records with token similarity at or above
//!    the threshold fold into the more important one.
//! 3. Cleanup: records under the importance floor and older than the
//!    minimum age are deleted.
//!
//! `maybe_run` is cheap to call after every ingestion; it only does work
//! when a trigger fires and never overlaps another pass.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tracing::{debug, info};

use super::keywords::{jaccard, token_set};
use crate::config::MaintenanceConfig;
use crate::db::{MemoryDb, MemoryRecord, RecordId, RecordKind, LAST_DECAY, LAST_MAINTENANCE, SECONDS_PER_DAY};
use crate::error::StorageError;

/// What one maintenance pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub decayed: usize,
    pub consolidated: usize,
    pub deleted: usize,
}

impl MaintenanceReport {
    pub fn is_noop(&self) -> bool {
        self.decayed == 0 && self.consolidated == 0 && self.deleted == 0
    }
}

pub struct MaintenancePolicy {
    store: Arc<MemoryDb>,
    config: MaintenanceConfig,
    /// Ingestions that wrote something since the last pass
    ingestions: AtomicU32,
    running: Mutex<()>,
}

impl MaintenancePolicy {
    pub fn new(store: Arc<MemoryDb>, config: MaintenanceConfig) -> Self {
        Self {
            store,
            config,
            ingestions: AtomicU32::new(0),
            running: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// Count an ingestion that wrote at least one row
    pub fn note_ingestion(&self) {
        self.ingestions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pending_ingestions(&self) -> u32 {
        self.ingestions.load(Ordering::Relaxed)
    }

    /// Run a pass if a trigger fired. Returns None when nothing ran,
    /// including when another pass is already in progress.
    pub fn maybe_run(&self) -> Result<Option<MaintenanceReport>, StorageError> {
        self.maybe_run_at(chrono::Utc::now().timestamp())
    }

    pub fn maybe_run_at(&self, now: i64) -> Result<Option<MaintenanceReport>, StorageError> {
        let _guard = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!("Maintenance already running, skipping");
                return Ok(None);
            }
        };

        if !self.is_due(now)? {
            return Ok(None);
        }

        self.run_locked(now).map(Some)
    }

    /// Run a full pass unconditionally
    pub fn run(&self) -> Result<MaintenanceReport, StorageError> {
        self.run_at(chrono::Utc::now().timestamp())
    }

    pub fn run_at(&self, now: i64) -> Result<MaintenanceReport, StorageError> {
        let _guard = self.lock();
        self.run_locked(now)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_due(&self, now: i64) -> Result<bool, StorageError> {
        let pending = self.pending_ingestions();

        let last_run = match self.store.meta(LAST_MAINTENANCE)? {
            Some(at) => at,
            None => {
                debug!("Maintenance has never run");
                return Ok(true);
            }
        };

        if now - last_run >= self.config.interval_hours * 3600 {
            debug!("Maintenance interval elapsed");
            return Ok(true);
        }

        if self.config.every_n_ingestions > 0 && pending >= self.config.every_n_ingestions {
            debug!("Maintenance due after {} ingestions", pending);
            return Ok(true);
        }

        if pending > 0 {
            let size = self.store.count(RecordKind::Summary)? + self.store.count(RecordKind::Insight)?;
            if size >= self.config.size_threshold as u64 {
                debug!("Maintenance due at store size {}", size);
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn run_locked(&self, now: i64) -> Result<MaintenanceReport, StorageError> {
        let mut report = MaintenanceReport::default();
        let last_decay = self.store.meta(LAST_DECAY)?;

        for kind in RecordKind::ALL {
            report.decayed += self.decay(kind, last_decay, now)?;
            report.consolidated += self.consolidate(kind)?;
            report.deleted += self.cleanup(kind, now)?;
        }

        self.store.set_meta(LAST_DECAY, now)?;
        self.store.set_meta(LAST_MAINTENANCE, now)?;
        self.ingestions.store(0, Ordering::Relaxed);

        info!(
            "Maintenance: {} decayed, {} consolidated, {} deleted",
            report.decayed, report.consolidated, report.deleted
        );
        Ok(report)
    }

    fn decay(&self, kind: RecordKind, last_decay: Option<i64>, now: i64) -> Result<usize, StorageError> {
        let snapshot = self.store.all(kind)?;
        self.decay_records(kind, &snapshot, last_decay, now)
    }

    /// Decay the listed records. The factor is computed from each record as
    /// it stands in the write transaction, so a write that landed after the
    /// snapshot is aged from its own activity time.
    fn decay_records(
        &self,
        kind: RecordKind,
        snapshot: &[MemoryRecord],
        last_decay: Option<i64>,
        now: i64,
    ) -> Result<usize, StorageError> {
        let grace = self.config.grace_days * SECONDS_PER_DAY;
        let per_day = self.config.decay_per_day.clamp(0.0, 1.0);
        let ids: Vec<RecordId> = snapshot.iter().map(|r| r.id).collect();

        self.store.apply_decay(kind, &ids, |record| {
            let idle_from = record.last_active() + grace;
            let start = last_decay.map_or(idle_from, |at| at.max(idle_from));
            let elapsed = now - start;
            if elapsed <= 0 {
                return None;
            }
            let days = elapsed as f64 / SECONDS_PER_DAY as f64;
            Some(per_day.powf(days) as f32)
        })
    }

    fn consolidate(&self, kind: RecordKind) -> Result<usize, StorageError> {
        let mut slots: Vec<Option<(MemoryRecord, HashSet<String>)>> = self
            .store
            .all(kind)?
            .into_iter()
            .map(|record| {
                let tokens = token_set(&record.text);
                Some((record, tokens))
            })
            .collect();

        let mut merged = 0;
        for i in 0..slots.len() {
            for j in (i + 1)..slots.len() {
                let (Some((a, a_tokens)), Some((b, b_tokens))) = (&slots[i], &slots[j]) else {
                    continue;
                };
                if jaccard(a_tokens, b_tokens) < self.config.consolidation_threshold {
                    continue;
                }

                let (keep, gone, keep_id, gone_id) = if outranks(a, b) {
                    (i, j, a.id, b.id)
                } else {
                    (j, i, b.id, a.id)
                };

                if !self.store.merge_records(kind, keep_id, gone_id)? {
                    continue;
                }
                merged += 1;

                if let Some((absorbed, _)) = slots[gone].take() {
                    if let Some((survivor, _)) = slots[keep].as_mut() {
                        survivor.absorb(&absorbed);
                    }
                }
                if gone == i {
                    break;
                }
            }
        }

        Ok(merged)
    }

    fn cleanup(&self, kind: RecordKind, now: i64) -> Result<usize, StorageError> {
        let snapshot = self.store.all(kind)?;
        self.cleanup_records(kind, &snapshot, now)
    }

    /// Delete faded records from the snapshot. The floor and age checks run
    /// again on the stored record, so one reinforced since the snapshot stays.
    fn cleanup_records(&self, kind: RecordKind, snapshot: &[MemoryRecord], now: i64) -> Result<usize, StorageError> {
        let min_age = self.config.cleanup_min_age_days * SECONDS_PER_DAY;
        let floor = self.config.cleanup_floor;
        let faded = |record: &MemoryRecord| record.importance < floor && now - record.created_at >= min_age;
        let mut deleted = 0;

        for record in snapshot.iter().filter(|r| faded(*r)) {
            if self.store.delete_where(kind, record.id, faded)? {
                debug!("Deleted decayed {} {}", kind, record.id);
                deleted += 1;
            }
        }

        Ok(deleted)
    }
}

/// Higher importance wins; on a tie the newer record survives
fn outranks(a: &MemoryRecord, b: &MemoryRecord) -> bool {
    match a.importance.total_cmp(&b.importance) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => (a.created_at, a.id) > (b.created_at, b.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DAY: i64 = SECONDS_PER_DAY;
    const NOW: i64 = 1_760_000_000;

    fn policy(config: MaintenanceConfig) -> (TempDir, Arc<MemoryDb>, MaintenancePolicy) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryDb::open(Some(&dir.path().join("m.redb"))).unwrap());
        let policy = MaintenancePolicy::new(store.clone(), config);
        (dir, store, policy)
    }

    fn add(store: &MemoryDb, kind: RecordKind, text: &str, importance: f32, at: i64) -> RecordId {
        store
            .insert_or_merge_at(kind, text, importance, &[], at)
            .unwrap()
            .id()
    }

    #[test]
    fn test_consolidates_near_duplicates_across_days() {
        let (_dir, store, policy) = policy(MaintenanceConfig::default());
        add(&store, RecordKind::Summary, "User talked about their trip to Japan in spring", 0.6, NOW - 20 * DAY);
        add(&store, RecordKind::Summary, "User talked about their trip to Japan in the spring", 0.8, NOW);
        // Too far apart for the write-time dedup window
        assert_eq!(store.count(RecordKind::Summary).unwrap(), 2);

        let report = policy.run_at(NOW).unwrap();
        assert_eq!(report.consolidated, 1);

        let remaining = store.all(RecordKind::Summary).unwrap();
        assert_eq!(remaining.len(), 1);
        assert!((remaining[0].importance - 0.8).abs() < 1e-6);
        assert_eq!(remaining[0].merge_count, 1);
    }

    #[test]
    fn test_consolidation_keeps_kinds_apart() {
        let (_dir, store, policy) = policy(MaintenanceConfig::default());
        add(&store, RecordKind::Summary, "User enjoys baking sourdough bread", 0.5, NOW);
        add(&store, RecordKind::Insight, "User enjoys baking sourdough bread", 0.5, NOW);

        policy.run_at(NOW).unwrap();
        assert_eq!(store.count(RecordKind::Summary).unwrap(), 1);
        assert_eq!(store.count(RecordKind::Insight).unwrap(), 1);
    }

    #[test]
    fn test_chain_consolidation() {
        let config = MaintenanceConfig {
            grace_days: 365,
            ..MaintenanceConfig::default()
        };
        let (_dir, store, policy) = policy(config);
        add(&store, RecordKind::Insight, "User likes hiking in the mountains on weekends", 0.4, NOW - 40 * DAY);
        add(&store, RecordKind::Insight, "User likes hiking in the mountains every weekends", 0.9, NOW - 20 * DAY);
        add(&store, RecordKind::Insight, "User likes hiking in the mountains every weekend", 0.5, NOW);
        add(&store, RecordKind::Insight, "User plays chess competitively", 0.5, NOW);

        policy.run_at(NOW).unwrap();
        let remaining = store.all(RecordKind::Insight).unwrap();
        assert_eq!(remaining.len(), 2);
        let hiking = remaining.iter().find(|r| r.text.contains("hiking")).unwrap();
        assert!((hiking.importance - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_cleanup_removes_old_faded_records() {
        let (_dir, store, policy) = policy(MaintenanceConfig::default());
        let old = add(&store, RecordKind::Summary, "User mentioned a forgotten errand", 0.5, NOW - 60 * DAY);
        store.update_importance(RecordKind::Summary, old, 0.04).unwrap();
        // Faded but too young to delete
        let young = add(&store, RecordKind::Summary, "User asked about a recipe", 0.5, NOW - 2 * DAY);
        store.update_importance(RecordKind::Summary, young, 0.01).unwrap();

        let report = policy.maybe_run_at(NOW).unwrap().unwrap();
        assert_eq!(report.deleted, 1);

        let ids: Vec<_> = store.all(RecordKind::Summary).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![young]);
    }

    #[test]
    fn test_aging_is_idempotent_and_nonnegative() {
        let (_dir, store, policy) = policy(MaintenanceConfig::default());
        let idle = add(&store, RecordKind::Summary, "User described their old apartment", 0.8, NOW - 37 * DAY);
        let fresh = add(&store, RecordKind::Summary, "User started a new painting", 0.8, NOW - DAY);

        let first = policy.run_at(NOW).unwrap();
        assert_eq!(first.decayed, 1);

        let idle_record = store.get(RecordKind::Summary, idle).unwrap().unwrap();
        // 30 idle days past the grace period
        let expected = 0.8 * 0.98f32.powi(30);
        assert!((idle_record.importance - expected).abs() < 1e-4);
        assert!(idle_record.relevance_decay < 1.0);
        assert!(idle_record.importance > 0.0);
        assert_eq!(idle_record.created_at, NOW - 37 * DAY);

        let fresh_record = store.get(RecordKind::Summary, fresh).unwrap().unwrap();
        assert_eq!(fresh_record.importance, 0.8);

        let second = policy.run_at(NOW).unwrap();
        assert!(second.is_noop());
        let again = store.get(RecordKind::Summary, idle).unwrap().unwrap();
        assert_eq!(again.importance, idle_record.importance);
    }

    #[test]
    fn test_decay_does_not_double_count() {
        let (_dir, store, policy) = policy(MaintenanceConfig::default());
        let id = add(&store, RecordKind::Insight, "User is an early riser", 1.0, NOW - 17 * DAY);

        policy.run_at(NOW - 5 * DAY).unwrap();
        policy.run_at(NOW).unwrap();

        // 10 idle days total, split over two passes
        let record = store.get(RecordKind::Insight, id).unwrap().unwrap();
        assert!((record.importance - 0.98f32.powi(10)).abs() < 1e-4);
    }

    #[test]
    fn test_retrieval_hit_defers_decay() {
        let (_dir, store, policy) = policy(MaintenanceConfig::default());
        let id = add(&store, RecordKind::Summary, "User loves jazz records", 0.6, NOW - 60 * DAY);
        store.record_hits(RecordKind::Summary, &[id], NOW - DAY).unwrap();

        let report = policy.run_at(NOW).unwrap();
        assert_eq!(report.decayed, 0);
        assert_eq!(store.get(RecordKind::Summary, id).unwrap().unwrap().importance, 0.6);
    }

    #[test]
    fn test_triggers() {
        let config = MaintenanceConfig {
            every_n_ingestions: 3,
            size_threshold: 1000,
            interval_hours: 24,
            ..MaintenanceConfig::default()
        };
        let (_dir, _store, policy) = policy(config);

        // First call always runs
        assert!(policy.maybe_run_at(NOW).unwrap().is_some());
        // Nothing new since
        assert!(policy.maybe_run_at(NOW + 60).unwrap().is_none());

        policy.note_ingestion();
        policy.note_ingestion();
        assert!(policy.maybe_run_at(NOW + 120).unwrap().is_none());
        policy.note_ingestion();
        assert!(policy.maybe_run_at(NOW + 180).unwrap().is_some());
        assert_eq!(policy.pending_ingestions(), 0);

        // Interval trigger
        assert!(policy.maybe_run_at(NOW + 180 + 24 * 3600).unwrap().is_some());
    }

    #[test]
    fn test_size_trigger() {
        let config = MaintenanceConfig {
            every_n_ingestions: 100,
            size_threshold: 2,
            ..MaintenanceConfig::default()
        };
        let (_dir, store, policy) = policy(config);
        policy.run_at(NOW).unwrap();

        add(&store, RecordKind::Summary, "User visited the aquarium", 0.5, NOW);
        add(&store, RecordKind::Insight, "User is fascinated by octopuses", 0.5, NOW);
        assert!(policy.maybe_run_at(NOW + 10).unwrap().is_none());

        policy.note_ingestion();
        assert!(policy.maybe_run_at(NOW + 20).unwrap().is_some());
    }

    #[test]
    fn test_cleanup_keeps_record_reinforced_after_snapshot() {
        let (_dir, store, policy) = policy(MaintenanceConfig::default());
        let text = "User mentioned a forgotten errand";
        let id = add(&store, RecordKind::Summary, text, 0.5, NOW - 60 * DAY);
        store.update_importance(RecordKind::Summary, id, 0.04).unwrap();

        let snapshot = store.all(RecordKind::Summary).unwrap();
        let merged = store.insert_or_merge_at(RecordKind::Summary, text, 0.7, &[], NOW).unwrap();
        assert_eq!(merged.id(), id);

        assert_eq!(policy.cleanup_records(RecordKind::Summary, &snapshot, NOW).unwrap(), 0);
        assert_eq!(store.get(RecordKind::Summary, id).unwrap().unwrap().importance, 0.7);
    }

    #[test]
    fn test_decay_uses_activity_after_snapshot() {
        let (_dir, store, policy) = policy(MaintenanceConfig::default());
        let text = "User talked about an old road trip";
        let id = add(&store, RecordKind::Summary, text, 0.5, NOW - 60 * DAY);

        let snapshot = store.all(RecordKind::Summary).unwrap();
        store.insert_or_merge_at(RecordKind::Summary, text, 0.7, &[], NOW).unwrap();

        assert_eq!(policy.decay_records(RecordKind::Summary, &snapshot, None, NOW).unwrap(), 0);
        assert_eq!(store.get(RecordKind::Summary, id).unwrap().unwrap().importance, 0.7);
    }

    #[test]
    fn test_concurrent_call_is_noop() {
        let (_dir, _store, policy) = policy(MaintenanceConfig::default());
        let _held = policy.lock();
        assert!(policy.maybe_run_at(NOW).unwrap().is_none());
    }

    #[test]
    fn test_maintenance_timestamp_recorded() {
        let (_dir, store, policy) = policy(MaintenanceConfig::default());
        policy.run_at(NOW).unwrap();
        assert_eq!(store.stats().unwrap().last_maintenance_at, Some(NOW));
    }
}
