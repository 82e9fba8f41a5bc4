//! ============================================================================
//! Memory Types - Turns, retrieval bundles and ingestion reports
//! ============================================================================
//! Defines conversation turns, the memory bundle injected into prompts and
//! the counters returned by ingestion.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::db::MemoryRecord;

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single turn in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    /// Message content
    pub content: String,
    /// Unix timestamp
    pub timestamp: i64,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// One completed user / companion exchange
#[derive(Debug, Clone, Copy)]
pub struct Exchange<'a> {
    pub user_message: &'a str,
    pub ai_response: &'a str,
}

/// Memory selected for one turn, ready to inject into a system prompt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryBundle {
    /// Every profile fact, key -> value
    pub profile: BTreeMap<String, String>,
    /// Up to `summary_limit` summaries, best first
    pub summaries: Vec<MemoryRecord>,
    /// Up to `insight_limit` insights, best first
    pub insights: Vec<MemoryRecord>,
}

impl MemoryBundle {
    pub fn is_empty(&self) -> bool {
        self.profile.is_empty() && self.summaries.is_empty() && self.insights.is_empty()
    }

    /// Format memories as the background-context block of the system prompt
    pub fn format_for_prompt(&self) -> String {
        if self.is_empty() {
            return String::new();
        }

        let mut formatted = String::from("\n<background_context>\n");

        if !self.profile.is_empty() {
            formatted.push_str("About the user:\n");
            for (key, value) in &self.profile {
                formatted.push_str(&format!("- {}: {}\n", key.replace('_', " "), value));
            }
        }

        if !self.summaries.is_empty() {
            formatted.push_str("Past conversations:\n");
            for summary in &self.summaries {
                formatted.push_str(&format!("- {}\n", summary.text));
            }
        }

        if !self.insights.is_empty() {
            formatted.push_str("Observations:\n");
            for insight in &self.insights {
                match insight.tags.first() {
                    Some(category) => {
                        formatted.push_str(&format!("- [{}] {}\n", category, insight.text))
                    }
                    None => formatted.push_str(&format!("- {}\n", insight.text)),
                }
            }
        }

        formatted.push_str("</background_context>\n");
        formatted
    }
}

/// What one ingestion wrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub facts_written: usize,
    pub summaries_written: usize,
    pub insights_written: usize,
}

impl IngestReport {
    pub fn total(&self) -> usize {
        self.facts_written + self.summaries_written + self.insights_written
    }
}
