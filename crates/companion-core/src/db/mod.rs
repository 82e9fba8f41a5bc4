// ============================================================================
// MemoryDb — Record Store (redb)
// ============================================================================
// Persistent local storage for profile facts, conversation summaries and
// insights. One file per installation.
// Default path: ~/.companion/memory.redb (override via COMPANION_DB_PATH)
//
// Every public write is a single redb write transaction, so a write either
// fully commits or is not observable at all. redb admits one writer at a
// time, which serializes upsert / merge / delete against each other.
// ============================================================================

pub mod types;

pub use types::{
    clamp_unit, DbStats, MemoryExport, MemoryRecord, ProfileFact, RecordId, RecordKind,
};

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::DedupConfig;
use crate::error::StorageError;
use crate::memory::keywords::{content_hash, jaccard, normalize_key, token_set};

pub(crate) const SECONDS_PER_DAY: i64 = 86_400;

// Table definitions
const PROFILE: TableDefinition<&str, &[u8]> = TableDefinition::new("profile_facts");
const SUMMARIES: TableDefinition<u64, &[u8]> = TableDefinition::new("summaries");
const INSIGHTS: TableDefinition<u64, &[u8]> = TableDefinition::new("insights");
const CONTENT_HASHES: TableDefinition<&str, u64> = TableDefinition::new("content_hashes");
const META: TableDefinition<&str, i64> = TableDefinition::new("meta");

// Meta keys
const NEXT_ID: &str = "next_record_id";
pub(crate) const LAST_MAINTENANCE: &str = "last_maintenance_at";
pub(crate) const LAST_DECAY: &str = "last_decay_at";

type StoreResult<T> = Result<T, StorageError>;

fn records_table(kind: RecordKind) -> TableDefinition<'static, u64, &'static [u8]> {
    match kind {
        RecordKind::Summary => SUMMARIES,
        RecordKind::Insight => INSIGHTS,
    }
}

fn hash_key(kind: RecordKind, hash: &str) -> String {
    format!("{}:{}", kind, hash)
}

/// Result of `insert_or_merge`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A new row was created
    Inserted(RecordId),
    /// The text collided with an existing row, which was reinforced
    Merged(RecordId),
}

impl WriteOutcome {
    pub fn id(&self) -> RecordId {
        match self {
            WriteOutcome::Inserted(id) | WriteOutcome::Merged(id) => *id,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, WriteOutcome::Inserted(_))
    }
}

/// Embedded record store for the companion's memory
pub struct MemoryDb {
    db: Database,
    path: PathBuf,
    dedup: DedupConfig,
}

impl MemoryDb {
    /// Open (or create) the store at the given path.
    /// If `path` is None, uses COMPANION_DB_PATH env var or ~/.companion/memory.redb
    pub fn open(path: Option<&Path>) -> StoreResult<Self> {
        let db_path = if let Some(p) = path {
            p.to_path_buf()
        } else if let Ok(env_path) = std::env::var("COMPANION_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir()
                .ok_or_else(|| StorageError::Path("cannot determine home directory".into()))?;
            home.join(".companion").join("memory.redb")
        };

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!("Opening memory store at: {}", db_path.display());

        let db = Database::create(&db_path)?;

        // Ensure tables exist by doing a write transaction
        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(PROFILE)?;
            write_txn.open_table(SUMMARIES)?;
            write_txn.open_table(INSIGHTS)?;
            write_txn.open_table(CONTENT_HASHES)?;
            write_txn.open_table(META)?;
        }
        write_txn.commit()?;

        debug!("Memory store ready");

        Ok(Self {
            db,
            path: db_path,
            dedup: DedupConfig::default(),
        })
    }

    /// Replace the write-time dedup settings
    pub fn with_dedup(mut self, dedup: DedupConfig) -> Self {
        self.dedup = dedup;
        self
    }

    /// Close the store, releasing the file lock
    pub fn close(self) {
        info!("Closing memory store at: {}", self.path.display());
        drop(self.db);
    }

    /// Get the store file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Profile Facts
    // ========================================================================

    /// Insert or overwrite the fact for a (normalized) key
    pub fn upsert_profile_fact(
        &self,
        key: &str,
        value: &str,
        confidence: f32,
    ) -> StoreResult<ProfileFact> {
        self.upsert_profile_fact_at(key, value, confidence, chrono::Utc::now().timestamp())
    }

    pub fn upsert_profile_fact_at(
        &self,
        key: &str,
        value: &str,
        confidence: f32,
        now: i64,
    ) -> StoreResult<ProfileFact> {
        let key = normalize_key(key);
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            return Err(StorageError::InvalidRecord(format!(
                "profile fact needs a key and a value (key: {:?})",
                key
            )));
        }

        let fact = ProfileFact {
            key,
            value: value.to_string(),
            confidence: clamp_unit(confidence),
            updated_at: now,
        };
        let bytes = bincode::serialize(&fact)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PROFILE)?;
            table.insert(fact.key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;

        debug!("Upserted profile fact: {}", fact.key);
        Ok(fact)
    }

    pub fn get_profile_fact(&self, key: &str) -> StoreResult<Option<ProfileFact>> {
        let key = normalize_key(key);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PROFILE)?;

        match table.get(key.as_str())? {
            Some(value) => Ok(Some(bincode::deserialize(value.value())?)),
            None => Ok(None),
        }
    }

    /// All facts with their metadata, ordered by key
    pub fn list_profile_facts(&self) -> StoreResult<Vec<ProfileFact>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PROFILE)?;

        let mut results = Vec::new();
        for entry in table.iter()? {
            let (_key, value) = entry?;
            results.push(bincode::deserialize(value.value())?);
        }
        Ok(results)
    }

    /// key -> value mapping of every profile fact
    pub fn all_profile_facts(&self) -> StoreResult<BTreeMap<String, String>> {
        Ok(self
            .list_profile_facts()?
            .into_iter()
            .map(|f| (f.key, f.value))
            .collect())
    }

    // ========================================================================
    // Summaries / Insights
    // ========================================================================

    /// Insert a record, or reinforce an existing one with the same or
    /// near-duplicate text. Returns the id of the stored row.
    pub fn insert_or_merge(
        &self,
        kind: RecordKind,
        text: &str,
        importance: f32,
    ) -> StoreResult<RecordId> {
        self.insert_or_merge_at(kind, text, importance, &[], chrono::Utc::now().timestamp())
            .map(|outcome| outcome.id())
    }

    /// `insert_or_merge` with tags and an explicit write time.
    ///
    /// Dedup is two-stage: exact content-hash lookup, then a bounded
    /// similarity scan over the newest records of the same kind created
    /// within the dedup window.
    pub fn insert_or_merge_at(
        &self,
        kind: RecordKind,
        text: &str,
        importance: f32,
        tags: &[String],
        now: i64,
    ) -> StoreResult<WriteOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(StorageError::InvalidRecord(format!("empty {} text", kind)));
        }

        let hash = content_hash(text);
        let index_key = hash_key(kind, &hash);
        let tokens = token_set(text);
        let window_start = now - self.dedup.window_days * SECONDS_PER_DAY;

        let write_txn = self.db.begin_write()?;
        let outcome;
        {
            let mut records = write_txn.open_table(records_table(kind))?;
            let mut hashes = write_txn.open_table(CONTENT_HASHES)?;
            let mut meta = write_txn.open_table(META)?;

            match self.find_existing(&records, &hashes, &index_key, &tokens, window_start)? {
                Some(mut record) => {
                    record.reinforce(importance, tags, now);
                    put_record(&mut records, &record)?;
                    outcome = WriteOutcome::Merged(record.id);
                }
                None => {
                    let record = MemoryRecord {
                        id: allocate_id(&mut meta)?,
                        kind,
                        text: text.to_string(),
                        importance: clamp_unit(importance),
                        relevance_decay: 1.0,
                        content_hash: hash.clone(),
                        created_at: now,
                        updated_at: now,
                        last_retrieved_at: None,
                        retrieval_count: 0,
                        merge_count: 0,
                        tags: tags.to_vec(),
                    };
                    put_record(&mut records, &record)?;
                    outcome = WriteOutcome::Inserted(record.id);
                }
            }

            hashes.insert(index_key.as_str(), outcome.id().0)?;
        }
        write_txn.commit()?;

        match outcome {
            WriteOutcome::Inserted(id) => debug!("Inserted {} {}", kind, id),
            WriteOutcome::Merged(id) => debug!("Merged write into existing {} {}", kind, id),
        }
        Ok(outcome)
    }

    /// Exact hash hit first, then the bounded similarity scan
    fn find_existing<T, H>(
        &self,
        records: &T,
        hashes: &H,
        index_key: &str,
        tokens: &HashSet<String>,
        window_start: i64,
    ) -> StoreResult<Option<MemoryRecord>>
    where
        T: ReadableTable<u64, &'static [u8]>,
        H: ReadableTable<&'static str, u64>,
    {
        let indexed = hashes.get(index_key)?.map(|g| g.value());
        if let Some(id) = indexed {
            if let Some(record) = load_record(records, id)? {
                return Ok(Some(record));
            }
        }
        self.find_near_duplicate(records, tokens, window_start)
    }

    /// Write an exported record back, keeping its timestamps, hit counts
    /// and decay. A colliding record absorbs it instead.
    fn restore_record(&self, exported: &MemoryRecord) -> StoreResult<WriteOutcome> {
        let kind = exported.kind;
        let text = exported.text.trim();
        if text.is_empty() {
            return Err(StorageError::InvalidRecord(format!("empty {} text", kind)));
        }

        let hash = content_hash(text);
        let index_key = hash_key(kind, &hash);
        let tokens = token_set(text);
        let window_start = exported.created_at - self.dedup.window_days * SECONDS_PER_DAY;

        let write_txn = self.db.begin_write()?;
        let outcome;
        {
            let mut records = write_txn.open_table(records_table(kind))?;
            let mut hashes = write_txn.open_table(CONTENT_HASHES)?;
            let mut meta = write_txn.open_table(META)?;

            match self.find_existing(&records, &hashes, &index_key, &tokens, window_start)? {
                Some(mut record) => {
                    record.absorb(exported);
                    put_record(&mut records, &record)?;
                    outcome = WriteOutcome::Merged(record.id);
                }
                None => {
                    let record = MemoryRecord {
                        id: allocate_id(&mut meta)?,
                        text: text.to_string(),
                        importance: clamp_unit(exported.importance),
                        relevance_decay: clamp_unit(exported.relevance_decay),
                        content_hash: hash.clone(),
                        ..exported.clone()
                    };
                    put_record(&mut records, &record)?;
                    outcome = WriteOutcome::Inserted(record.id);
                }
            }

            hashes.insert(index_key.as_str(), outcome.id().0)?;
        }
        write_txn.commit()?;
        Ok(outcome)
    }

    fn find_near_duplicate<T>(
        &self,
        records: &T,
        tokens: &HashSet<String>,
        window_start: i64,
    ) -> StoreResult<Option<MemoryRecord>>
    where
        T: ReadableTable<u64, &'static [u8]>,
    {
        let mut best: Option<(f32, MemoryRecord)> = None;

        for entry in records.iter()?.rev().take(self.dedup.scan_limit) {
            let (_key, value) = entry?;
            let record: MemoryRecord = bincode::deserialize(value.value())?;
            if record.created_at < window_start {
                continue;
            }
            let similarity = jaccard(tokens, &token_set(&record.text));
            if similarity >= self.dedup.near_duplicate_threshold
                && best.as_ref().map_or(true, |(s, _)| similarity > *s)
            {
                best = Some((similarity, record));
            }
        }

        Ok(best.map(|(_, record)| record))
    }

    pub fn get(&self, kind: RecordKind, id: RecordId) -> StoreResult<Option<MemoryRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(records_table(kind))?;
        load_record(&table, id.0)
    }

    /// Every record of a kind, in creation order
    pub fn all(&self, kind: RecordKind) -> StoreResult<Vec<MemoryRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(records_table(kind))?;

        let mut results = Vec::new();
        for entry in table.iter()? {
            let (_key, value) = entry?;
            results.push(bincode::deserialize(value.value())?);
        }
        Ok(results)
    }

    pub fn count(&self, kind: RecordKind) -> StoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(records_table(kind))?;
        Ok(table.len()?)
    }

    /// Delete a record and every hash index entry pointing at it.
    /// Returns whether it existed.
    pub fn delete(&self, kind: RecordKind, id: RecordId) -> StoreResult<bool> {
        self.delete_where(kind, id, |_| true)
    }

    /// Delete a record only if `predicate` holds for its current state,
    /// checked inside the write transaction. Returns whether it was removed.
    pub fn delete_where<P>(&self, kind: RecordKind, id: RecordId, predicate: P) -> StoreResult<bool>
    where
        P: FnOnce(&MemoryRecord) -> bool,
    {
        let write_txn = self.db.begin_write()?;
        let removed;
        {
            let mut records = write_txn.open_table(records_table(kind))?;
            let mut hashes = write_txn.open_table(CONTENT_HASHES)?;

            removed = match load_record(&records, id.0)? {
                Some(record) => {
                    let doomed = predicate(&record);
                    if doomed {
                        records.remove(id.0)?;
                        repoint_hashes(&mut hashes, kind, id, None)?;
                    }
                    doomed
                }
                None => false,
            };
        }
        write_txn.commit()?;

        if removed {
            debug!("Deleted {} {}", kind, id);
        }
        Ok(removed)
    }

    /// Overwrite a record's importance (clamped to [0, 1])
    pub fn update_importance(
        &self,
        kind: RecordKind,
        id: RecordId,
        new_importance: f32,
    ) -> StoreResult<bool> {
        self.modify(kind, &[id], |record| {
            record.importance = clamp_unit(new_importance);
            true
        })
        .map(|n| n > 0)
    }

    /// Multiply importance (and the cumulative decay factor) of each listed
    /// record by the factor `factor_for` computes from the record as loaded
    /// in the write transaction. `None` leaves the record untouched.
    pub fn apply_decay<F>(&self, kind: RecordKind, ids: &[RecordId], mut factor_for: F) -> StoreResult<usize>
    where
        F: FnMut(&MemoryRecord) -> Option<f32>,
    {
        self.modify(kind, ids, |record| match factor_for(record) {
            Some(factor) => {
                let factor = clamp_unit(factor);
                record.importance = clamp_unit(record.importance * factor);
                record.relevance_decay = clamp_unit(record.relevance_decay * factor);
                true
            }
            None => false,
        })
    }

    /// Note that records were injected into a prompt
    pub fn record_hits(&self, kind: RecordKind, ids: &[RecordId], now: i64) -> StoreResult<usize> {
        self.modify(kind, ids, |record| {
            record.retrieval_count += 1;
            record.last_retrieved_at = Some(record.last_retrieved_at.unwrap_or(0).max(now));
            true
        })
    }

    fn modify<F>(&self, kind: RecordKind, ids: &[RecordId], mut f: F) -> StoreResult<usize>
    where
        F: FnMut(&mut MemoryRecord) -> bool,
    {
        if ids.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        let mut changed = 0;
        {
            let mut records = write_txn.open_table(records_table(kind))?;
            for id in ids {
                if let Some(mut record) = load_record(&records, id.0)? {
                    if f(&mut record) {
                        put_record(&mut records, &record)?;
                        changed += 1;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(changed)
    }

    /// Fold `absorbed` into `survivor` and delete `absorbed`.
    /// Returns false (and changes nothing) if either record is gone.
    pub fn merge_records(
        &self,
        kind: RecordKind,
        survivor: RecordId,
        absorbed: RecordId,
    ) -> StoreResult<bool> {
        if survivor == absorbed {
            return Ok(false);
        }

        let write_txn = self.db.begin_write()?;
        let merged;
        {
            let mut records = write_txn.open_table(records_table(kind))?;
            let mut hashes = write_txn.open_table(CONTENT_HASHES)?;

            let keep = load_record(&records, survivor.0)?;
            let gone = load_record(&records, absorbed.0)?;
            merged = match (keep, gone) {
                (Some(mut keep), Some(gone)) => {
                    keep.absorb(&gone);
                    put_record(&mut records, &keep)?;
                    records.remove(absorbed.0)?;
                    // Future writes of any absorbed text land on the survivor
                    repoint_hashes(&mut hashes, kind, absorbed, Some(survivor))?;
                    hashes.insert(hash_key(kind, &gone.content_hash).as_str(), survivor.0)?;
                    true
                }
                _ => false,
            };
        }
        write_txn.commit()?;

        if merged {
            debug!("Consolidated {} {} into {}", kind, absorbed, survivor);
        }
        Ok(merged)
    }

    // ========================================================================
    // Export / Clear / Import
    // ========================================================================

    /// Dump every collection from one consistent snapshot
    pub fn export_all(&self) -> StoreResult<MemoryExport> {
        let read_txn = self.db.begin_read()?;

        let mut profile = Vec::new();
        for entry in read_txn.open_table(PROFILE)?.iter()? {
            let (_key, value) = entry?;
            profile.push(bincode::deserialize(value.value())?);
        }

        let mut collections = Vec::with_capacity(2);
        for kind in RecordKind::ALL {
            let mut records = Vec::new();
            for entry in read_txn.open_table(records_table(kind))?.iter()? {
                let (_key, value) = entry?;
                records.push(bincode::deserialize(value.value())?);
            }
            collections.push(records);
        }
        let insights = collections.pop().unwrap_or_default();
        let summaries = collections.pop().unwrap_or_default();

        Ok(MemoryExport {
            exported_at: chrono::Utc::now().timestamp(),
            profile,
            summaries,
            insights,
        })
    }

    /// Empty all three collections and the hash index atomically
    pub fn clear_all(&self) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            write_txn.delete_table(PROFILE)?;
            write_txn.delete_table(SUMMARIES)?;
            write_txn.delete_table(INSIGHTS)?;
            write_txn.delete_table(CONTENT_HASHES)?;

            write_txn.open_table(PROFILE)?;
            write_txn.open_table(SUMMARIES)?;
            write_txn.open_table(INSIGHTS)?;
            write_txn.open_table(CONTENT_HASHES)?;
        }
        write_txn.commit()?;

        info!("Cleared all memory collections");
        Ok(())
    }

    /// Restore an export. Records keep their timestamps, hit counts and
    /// decay, so a faded record comes back faded; colliding records merge.
    /// Thresholds are not re-applied. Returns the number of rows written.
    pub fn import(&self, export: &MemoryExport) -> StoreResult<usize> {
        let mut written = 0;

        for fact in &export.profile {
            self.upsert_profile_fact_at(&fact.key, &fact.value, fact.confidence, fact.updated_at)?;
            written += 1;
        }

        for record in export.summaries.iter().chain(export.insights.iter()) {
            self.restore_record(record)?;
            written += 1;
        }

        info!("Imported {} memory rows", written);
        Ok(written)
    }

    // ========================================================================
    // Meta / Statistics
    // ========================================================================

    pub(crate) fn meta(&self, key: &str) -> StoreResult<Option<i64>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META)?;
        let value = table.get(key)?.map(|g| g.value());
        Ok(value)
    }

    pub(crate) fn set_meta(&self, key: &str, value: i64) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(META)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn stats(&self) -> StoreResult<DbStats> {
        let read_txn = self.db.begin_read()?;
        let profile_facts = read_txn.open_table(PROFILE)?.len()?;
        let summaries = read_txn.open_table(SUMMARIES)?.len()?;
        let insights_table = read_txn.open_table(INSIGHTS)?;
        let insights = insights_table.len()?;

        let mut tag_counts = HashMap::new();
        for entry in insights_table.iter()? {
            let (_key, value) = entry?;
            let record: MemoryRecord = bincode::deserialize(value.value())?;
            for tag in record.tags {
                *tag_counts.entry(tag).or_insert(0usize) += 1;
            }
        }

        let last_maintenance_at = read_txn
            .open_table(META)?
            .get(LAST_MAINTENANCE)?
            .map(|g| g.value());

        Ok(DbStats {
            profile_facts,
            summaries,
            insights,
            last_maintenance_at,
            tag_counts,
        })
    }
}

fn load_record<T>(table: &T, id: u64) -> StoreResult<Option<MemoryRecord>>
where
    T: ReadableTable<u64, &'static [u8]>,
{
    match table.get(id)? {
        Some(value) => Ok(Some(bincode::deserialize(value.value())?)),
        None => Ok(None),
    }
}

fn put_record(table: &mut redb::Table<u64, &'static [u8]>, record: &MemoryRecord) -> StoreResult<()> {
    let bytes = bincode::serialize(record)?;
    table.insert(record.id.0, bytes.as_slice())?;
    Ok(())
}

fn allocate_id(meta: &mut redb::Table<&'static str, i64>) -> StoreResult<RecordId> {
    let next = meta.get(NEXT_ID)?.map(|g| g.value()).unwrap_or(1);
    meta.insert(NEXT_ID, next + 1)?;
    Ok(RecordId(next as u64))
}

/// Move every index entry of `kind` that points at `from` to `to`, or drop
/// it when `to` is None. Near-duplicate merges alias extra hashes to a row,
/// so a row can own more than its own `content_hash`.
fn repoint_hashes(
    hashes: &mut redb::Table<&'static str, u64>,
    kind: RecordKind,
    from: RecordId,
    to: Option<RecordId>,
) -> StoreResult<usize> {
    let prefix = hash_key(kind, "");
    let mut keys = Vec::new();
    for entry in hashes.iter()? {
        let (key, value) = entry?;
        if value.value() == from.0 && key.value().starts_with(&prefix) {
            keys.push(key.value().to_string());
        }
    }

    for key in &keys {
        match to {
            Some(id) => hashes.insert(key.as_str(), id.0)?,
            None => hashes.remove(key.as_str())?,
        };
    }
    Ok(keys.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, MemoryDb) {
        let dir = TempDir::new().unwrap();
        let db = MemoryDb::open(Some(&dir.path().join("memory.redb"))).unwrap();
        (dir, db)
    }

    const DAY: i64 = SECONDS_PER_DAY;

    #[test]
    fn test_upsert_overwrites_same_key() {
        let (_dir, db) = open_temp();
        db.upsert_profile_fact("Favorite Color", "blue", 0.6).unwrap();
        db.upsert_profile_fact("favorite_color", "purple", 0.9).unwrap();

        let facts = db.list_profile_facts().unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].key, "favorite_color");
        assert_eq!(facts[0].value, "purple");
        assert_eq!(facts[0].confidence, 0.9);

        let map = db.all_profile_facts().unwrap();
        assert_eq!(map.get("favorite_color").map(String::as_str), Some("purple"));
    }

    #[test]
    fn test_upsert_rejects_empty() {
        let (_dir, db) = open_temp();
        assert!(db.upsert_profile_fact("  ", "x", 0.5).is_err());
        assert!(db.upsert_profile_fact("name", "   ", 0.5).is_err());
        assert!(db.list_profile_facts().unwrap().is_empty());
    }

    #[test]
    fn test_identical_text_merges_to_max_importance() {
        let (_dir, db) = open_temp();
        let first = db.insert_or_merge(RecordKind::Summary, "User adopted a cat named Miso", 0.4).unwrap();
        let second = db.insert_or_merge(RecordKind::Summary, "User adopted a cat named Miso", 0.7).unwrap();
        assert_eq!(first, second);

        let third = db.insert_or_merge(RecordKind::Summary, "user adopted a cat named miso!", 0.5).unwrap();
        assert_eq!(first, third);

        let all = db.all(RecordKind::Summary).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].importance, 0.7);
        assert_eq!(all[0].merge_count, 2);
    }

    #[test]
    fn test_kinds_are_separate_collections() {
        let (_dir, db) = open_temp();
        db.insert_or_merge(RecordKind::Summary, "User enjoys chess", 0.5).unwrap();
        db.insert_or_merge(RecordKind::Insight, "User enjoys chess", 0.5).unwrap();
        assert_eq!(db.count(RecordKind::Summary).unwrap(), 1);
        assert_eq!(db.count(RecordKind::Insight).unwrap(), 1);
    }

    #[test]
    fn test_near_duplicate_within_window_merges() {
        let (_dir, db) = open_temp();
        let now = 1_000 * DAY;
        let a = db
            .insert_or_merge_at(
                RecordKind::Insight,
                "The user is learning to play jazz piano in the evenings after work",
                0.5,
                &[],
                now,
            )
            .unwrap();
        let b = db
            .insert_or_merge_at(
                RecordKind::Insight,
                "The user is learning to play jazz piano in the evenings after their work",
                0.6,
                &["skills".to_string()],
                now + DAY,
            )
            .unwrap();
        assert!(a.is_insert());
        assert_eq!(b, WriteOutcome::Merged(a.id()));

        let record = db.get(RecordKind::Insight, a.id()).unwrap().unwrap();
        assert_eq!(record.importance, 0.6);
        assert_eq!(record.updated_at, now + DAY);
        assert_eq!(record.created_at, now);
        assert_eq!(record.tags, vec!["skills".to_string()]);
    }

    #[test]
    fn test_near_duplicate_outside_window_inserts() {
        let (_dir, db) = open_temp();
        let now = 1_000 * DAY;
        db.insert_or_merge_at(RecordKind::Summary, "User talked about their trip to Japan in spring", 0.5, &[], now)
            .unwrap();
        let later = db
            .insert_or_merge_at(
                RecordKind::Summary,
                "User talked about their trip to Japan in the spring",
                0.6,
                &[],
                now + 20 * DAY,
            )
            .unwrap();
        assert!(later.is_insert());
        assert_eq!(db.count(RecordKind::Summary).unwrap(), 2);
    }

    #[test]
    fn test_all_is_creation_order() {
        let (_dir, db) = open_temp();
        for text in ["first topic alpha", "second topic beta", "third topic gamma"] {
            db.insert_or_merge(RecordKind::Summary, text, 0.5).unwrap();
        }
        let texts: Vec<_> = db.all(RecordKind::Summary).unwrap().into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["first topic alpha", "second topic beta", "third topic gamma"]);
    }

    #[test]
    fn test_delete_and_update_importance() {
        let (_dir, db) = open_temp();
        let id = db.insert_or_merge(RecordKind::Summary, "User is moving to Berlin", 0.5).unwrap();

        assert!(db.update_importance(RecordKind::Summary, id, 1.5).unwrap());
        assert_eq!(db.get(RecordKind::Summary, id).unwrap().unwrap().importance, 1.0);

        assert!(db.delete(RecordKind::Summary, id).unwrap());
        assert!(!db.delete(RecordKind::Summary, id).unwrap());
        assert!(!db.update_importance(RecordKind::Summary, id, 0.5).unwrap());

        // Hash index entry went with it: same text is a fresh insert
        let again = db.insert_or_merge(RecordKind::Summary, "User is moving to Berlin", 0.3).unwrap();
        assert_ne!(again, id);
        assert_eq!(db.get(RecordKind::Summary, again).unwrap().unwrap().importance, 0.3);
    }

    #[test]
    fn test_merge_records_never_resurrects() {
        let (_dir, db) = open_temp();
        let a = db.insert_or_merge(RecordKind::Summary, "alpha record one", 0.3).unwrap();
        let b = db.insert_or_merge(RecordKind::Summary, "completely different beta", 0.8).unwrap();

        assert!(db.merge_records(RecordKind::Summary, a, b).unwrap());
        let kept = db.get(RecordKind::Summary, a).unwrap().unwrap();
        assert_eq!(kept.importance, 0.8);
        assert!(db.get(RecordKind::Summary, b).unwrap().is_none());

        // Absorbed record is gone; merging again is a no-op
        assert!(!db.merge_records(RecordKind::Summary, a, b).unwrap());
        // Writing the absorbed text reinforces the survivor
        let c = db.insert_or_merge(RecordKind::Summary, "completely different beta", 0.2).unwrap();
        assert_eq!(c, a);
    }

    fn hash_index_len(db: &MemoryDb) -> u64 {
        let read_txn = db.db.begin_read().unwrap();
        read_txn.open_table(CONTENT_HASHES).unwrap().len().unwrap()
    }

    const PIANO: &str = "The user is learning to play jazz piano in the evenings after work";
    const PIANO_VARIANT: &str = "The user is learning to play jazz piano in the evenings after their work";

    #[test]
    fn test_delete_drops_aliased_hashes() {
        let (_dir, db) = open_temp();
        let now = 1_000 * DAY;
        let id = db.insert_or_merge_at(RecordKind::Insight, PIANO, 0.5, &[], now).unwrap().id();
        let merged = db.insert_or_merge_at(RecordKind::Insight, PIANO_VARIANT, 0.5, &[], now).unwrap();
        assert_eq!(merged, WriteOutcome::Merged(id));
        assert_eq!(hash_index_len(&db), 2);

        assert!(db.delete(RecordKind::Insight, id).unwrap());
        assert_eq!(db.count(RecordKind::Insight).unwrap(), 0);
        assert_eq!(hash_index_len(&db), 0);
    }

    #[test]
    fn test_merge_records_moves_aliased_hashes() {
        let (_dir, db) = open_temp();
        let now = 1_000 * DAY;
        let piano = db.insert_or_merge_at(RecordKind::Insight, PIANO, 0.5, &[], now).unwrap().id();
        db.insert_or_merge_at(RecordKind::Insight, PIANO_VARIANT, 0.5, &[], now).unwrap();
        let other = db
            .insert_or_merge_at(RecordKind::Insight, "User collects vinyl records", 0.9, &[], now)
            .unwrap()
            .id();

        assert!(db.merge_records(RecordKind::Insight, other, piano).unwrap());

        // Outside the similarity window, only the hash index can find the survivor
        let later = db
            .insert_or_merge_at(RecordKind::Insight, PIANO_VARIANT, 0.3, &[], now + 30 * DAY)
            .unwrap();
        assert_eq!(later, WriteOutcome::Merged(other));
        assert_eq!(db.count(RecordKind::Insight).unwrap(), 1);
    }

    #[test]
    fn test_delete_where_rechecks_current_state() {
        let (_dir, db) = open_temp();
        let id = db.insert_or_merge(RecordKind::Summary, "User mentioned a dentist visit", 0.5).unwrap();
        db.update_importance(RecordKind::Summary, id, 0.04).unwrap();
        // Reinforced before the delete lands
        db.insert_or_merge(RecordKind::Summary, "User mentioned a dentist visit", 0.7).unwrap();

        let faded = |r: &MemoryRecord| r.importance < 0.05;
        assert!(!db.delete_where(RecordKind::Summary, id, faded).unwrap());
        assert_eq!(db.get(RecordKind::Summary, id).unwrap().unwrap().importance, 0.7);

        db.update_importance(RecordKind::Summary, id, 0.01).unwrap();
        assert!(db.delete_where(RecordKind::Summary, id, faded).unwrap());
    }

    #[test]
    fn test_import_keeps_decay_and_hits() {
        let (_dir, db) = open_temp();
        let id = db.insert_or_merge(RecordKind::Summary, "User described an old apartment", 0.8).unwrap();
        db.apply_decay(RecordKind::Summary, &[id], |_| Some(0.05)).unwrap();
        db.record_hits(RecordKind::Summary, &[id], 777).unwrap();

        let export = db.export_all().unwrap();
        db.clear_all().unwrap();
        db.import(&export).unwrap();

        let restored = db.all(RecordKind::Summary).unwrap();
        assert_eq!(restored.len(), 1);
        assert!((restored[0].importance - 0.04).abs() < 1e-6);
        assert!((restored[0].relevance_decay - 0.05).abs() < 1e-6);
        assert_eq!(restored[0].retrieval_count, 1);
        assert_eq!(restored[0].last_retrieved_at, Some(777));
        assert_eq!(restored[0].created_at, export.summaries[0].created_at);

        // Importing the same export again merges instead of duplicating
        db.import(&export).unwrap();
        assert_eq!(db.count(RecordKind::Summary).unwrap(), 1);
    }

    #[test]
    fn test_apply_decay_and_hits() {
        let (_dir, db) = open_temp();
        let id = db.insert_or_merge(RecordKind::Insight, "User prefers short answers", 0.8).unwrap();
        assert_eq!(db.apply_decay(RecordKind::Insight, &[id], |_| Some(0.5)).unwrap(), 1);
        assert_eq!(db.apply_decay(RecordKind::Insight, &[id], |_| None).unwrap(), 0);
        let record = db.get(RecordKind::Insight, id).unwrap().unwrap();
        assert!((record.importance - 0.4).abs() < 1e-6);
        assert!((record.relevance_decay - 0.5).abs() < 1e-6);

        db.record_hits(RecordKind::Insight, &[id], 12345).unwrap();
        let record = db.get(RecordKind::Insight, id).unwrap().unwrap();
        assert_eq!(record.retrieval_count, 1);
        assert_eq!(record.last_retrieved_at, Some(12345));
    }

    #[test]
    fn test_clear_all_and_export_import() {
        let (_dir, db) = open_temp();
        db.upsert_profile_fact("name", "Ada", 0.9).unwrap();
        db.insert_or_merge(RecordKind::Summary, "User asked about sourdough", 0.5).unwrap();
        db.insert_or_merge_at(RecordKind::Insight, "User is patient", 0.6, &["personality".into()], 42)
            .unwrap();

        let export = db.export_all().unwrap();
        assert_eq!(export.profile.len(), 1);
        assert_eq!(export.summaries.len(), 1);
        assert_eq!(export.insights.len(), 1);

        db.clear_all().unwrap();
        let empty = db.export_all().unwrap();
        assert!(empty.profile.is_empty() && empty.summaries.is_empty() && empty.insights.is_empty());

        assert_eq!(db.import(&export).unwrap(), 3);
        let insights = db.all(RecordKind::Insight).unwrap();
        assert_eq!(insights[0].created_at, 42);
        assert_eq!(insights[0].tags, vec!["personality".to_string()]);
    }

    #[test]
    fn test_stats_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("memory.redb");
        {
            let db = MemoryDb::open(Some(&path)).unwrap();
            db.upsert_profile_fact("age", "31", 0.9).unwrap();
            db.insert_or_merge_at(RecordKind::Insight, "User is curious", 0.6, &["personality".into()], 7)
                .unwrap();
            db.set_meta(LAST_MAINTENANCE, 99).unwrap();
            db.close();
        }

        let db = MemoryDb::open(Some(&path)).unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.profile_facts, 1);
        assert_eq!(stats.summaries, 0);
        assert_eq!(stats.insights, 1);
        assert_eq!(stats.last_maintenance_at, Some(99));
        assert_eq!(stats.tag_counts.get("personality"), Some(&1));
    }

    #[test]
    fn test_empty_text_rejected() {
        let (_dir, db) = open_temp();
        assert!(matches!(
            db.insert_or_merge(RecordKind::Summary, "   ", 0.5),
            Err(StorageError::InvalidRecord(_))
        ));
    }
}
