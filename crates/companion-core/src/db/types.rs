//! ============================================================================
//! Record Types - Serializable memory records for redb storage
//! ============================================================================
//! Stored values are bincode-encoded, so these structs must not use
//! `skip_serializing_if` or other data-dependent serde attributes.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Durable key/value fact about the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileFact {
    /// Normalized key, e.g. "favorite_color"
    pub key: String,
    pub value: String,
    /// Extraction confidence (0.0 - 1.0)
    pub confidence: f32,
    pub updated_at: i64,
}

/// Which collection a summary-shaped record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Condensed highlight of one exchange
    Summary,
    /// Behavioral observation about the user
    Insight,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Summary, RecordKind::Insight];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Summary => "summary",
            RecordKind::Insight => "insight",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" | "summaries" => Ok(RecordKind::Summary),
            "insight" | "insights" => Ok(RecordKind::Insight),
            _ => Err(format!("Unknown record kind: {}", s)),
        }
    }
}

/// Opaque record identifier; allocated in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A Summary or Insight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: RecordId,
    pub kind: RecordKind,
    pub text: String,
    /// Long-term value (0.0 - 1.0)
    pub importance: f32,
    /// Cumulative decay factor applied to importance by maintenance
    pub relevance_decay: f32,
    /// Digest of the normalized text
    pub content_hash: String,
    pub created_at: i64,
    /// Last time the record was written or reinforced by a merge
    pub updated_at: i64,
    pub last_retrieved_at: Option<i64>,
    pub retrieval_count: u32,
    /// How many other records were folded into this one
    pub merge_count: u32,
    /// Structured labels (insight category, ...)
    pub tags: Vec<String>,
}

impl MemoryRecord {
    /// Most recent activity: write, merge, or retrieval hit
    pub fn last_active(&self) -> i64 {
        self.updated_at
            .max(self.last_retrieved_at.unwrap_or(0))
            .max(self.created_at)
    }

    /// Reinforce with a colliding write
    pub(crate) fn reinforce(&mut self, importance: f32, tags: &[String], now: i64) {
        self.importance = self.importance.max(clamp_unit(importance));
        self.updated_at = self.updated_at.max(now);
        self.merge_count += 1;
        self.union_tags(tags);
    }

    /// Fold another record into this one, keeping the higher importance and
    /// the union of metadata. Timestamps only ever move forward.
    pub(crate) fn absorb(&mut self, other: &MemoryRecord) {
        self.importance = self.importance.max(other.importance);
        self.relevance_decay = self.relevance_decay.max(other.relevance_decay);
        self.created_at = self.created_at.max(other.created_at);
        self.updated_at = self.updated_at.max(other.updated_at);
        self.last_retrieved_at = match (self.last_retrieved_at, other.last_retrieved_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.retrieval_count += other.retrieval_count;
        self.merge_count += other.merge_count + 1;
        self.union_tags(&other.tags);
    }

    fn union_tags(&mut self, tags: &[String]) {
        for tag in tags {
            if !self.tags.contains(tag) {
                self.tags.push(tag.clone());
            }
        }
    }
}

/// Clamp a score into [0, 1]; NaN becomes 0
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Full dump of the store for the memory viewer and backups
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryExport {
    pub exported_at: i64,
    pub profile: Vec<ProfileFact>,
    pub summaries: Vec<MemoryRecord>,
    pub insights: Vec<MemoryRecord>,
}

/// Store statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStats {
    pub profile_facts: u64,
    pub summaries: u64,
    pub insights: u64,
    pub last_maintenance_at: Option<i64>,
    pub tag_counts: HashMap<String, usize>,
}
