//! ============================================================================
//! Exchange Analysis - Facts, importance, summaries and insights
//! ============================================================================
//! Two strategies sit behind the same traits:
//! - HeuristicAnalyzer: pattern rules, no network
//! - ModelAnalyzer: prompts a small completion model
//!
//! Any failure surfaces as `ScoringFailure`; the ingestion pipeline treats
//! it as a zero score.
//! ============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::keywords::{extract_keywords, normalize_key};
use super::types::Exchange;
use crate::error::ScoringFailure;
use crate::services::{CompletionRequest, CompletionService};

/// A profile fact proposed by an extractor
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFact {
    pub key: String,
    pub value: String,
    pub confidence: f32,
}

impl CandidateFact {
    fn new(key: &str, value: impl Into<String>, confidence: f32) -> Self {
        Self {
            key: normalize_key(key),
            value: value.into(),
            confidence,
        }
    }
}

/// What an insight says something about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightCategory {
    Personality,
    Interests,
    Preferences,
    Behavior,
    Emotions,
    Relationships,
    Goals,
    Skills,
    General,
}

impl InsightCategory {
    pub const ALL: [InsightCategory; 9] = [
        InsightCategory::Personality,
        InsightCategory::Interests,
        InsightCategory::Preferences,
        InsightCategory::Behavior,
        InsightCategory::Emotions,
        InsightCategory::Relationships,
        InsightCategory::Goals,
        InsightCategory::Skills,
        InsightCategory::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InsightCategory::Personality => "personality",
            InsightCategory::Interests => "interests",
            InsightCategory::Preferences => "preferences",
            InsightCategory::Behavior => "behavior",
            InsightCategory::Emotions => "emotions",
            InsightCategory::Relationships => "relationships",
            InsightCategory::Goals => "goals",
            InsightCategory::Skills => "skills",
            InsightCategory::General => "general",
        }
    }

    /// First category named in free text; General if none
    pub fn from_reply(reply: &str) -> Self {
        let lower = reply.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| lower.contains(c.as_str()))
            .unwrap_or(InsightCategory::General)
    }
}

impl fmt::Display for InsightCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An insight proposed by an analyzer
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateInsight {
    pub text: String,
    pub category: InsightCategory,
}

/// Derives candidate profile facts from an exchange
#[async_trait]
pub trait FactExtractor: Send + Sync {
    async fn extract(&self, exchange: &Exchange<'_>) -> Result<Vec<CandidateFact>, ScoringFailure>;
}

/// Scores an exchange and condenses it into summary / insight text
#[async_trait]
pub trait ExchangeAnalyzer: Send + Sync {
    /// Long-term memory value of the exchange, in [0, 1]
    async fn importance(&self, exchange: &Exchange<'_>) -> Result<f32, ScoringFailure>;

    async fn summarize(
        &self,
        exchange: &Exchange<'_>,
        importance: f32,
    ) -> Result<Option<String>, ScoringFailure>;

    async fn insight(
        &self,
        exchange: &Exchange<'_>,
        importance: f32,
    ) -> Result<Option<CandidateInsight>, ScoringFailure>;
}

// ============================================================================
// Heuristic strategy
// ============================================================================

const PERSONAL_MARKERS: &[&str] = &[
    "favorite",
    "favourite",
    "prefer",
    "remember",
    "important",
    "my name",
    "i love",
    "i hate",
    "i feel",
    "my family",
    "i live",
    "years old",
];
const WORK_MARKERS: &[&str] = &["project", "work", "coding", "job", "studying", "learning"];
const SMALL_TALK: &[&str] = &[
    "hi", "hello", "hey", "thanks", "thank", "ok", "okay", "bye", "cool", "lol", "yo",
];

const SUMMARY_MAX_CHARS: usize = 160;

/// Rule-based analyzer; never fails
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicAnalyzer;

impl HeuristicAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn score(message: &str) -> f32 {
        let lower = message.to_lowercase();

        if PERSONAL_MARKERS.iter().any(|m| lower.contains(m)) {
            return 0.7;
        }
        if WORK_MARKERS.iter().any(|m| lower.contains(m)) {
            return 0.5;
        }

        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        if words.is_empty() || (words.len() <= 4 && words.iter().any(|w| SMALL_TALK.contains(w))) {
            return 0.15;
        }

        0.4
    }

    pub fn facts(message: &str) -> Vec<CandidateFact> {
        let mut facts = Vec::new();

        if let Some(name) = extract_name(message) {
            facts.push(name);
        }
        facts.extend(extract_favorites(message));

        let simple: [(&str, &[&str], f32); 4] = [
            ("location", &["i live in ", "i'm living in ", "i moved to "], 0.8),
            ("hometown", &["i'm from ", "i am from ", "i grew up in "], 0.7),
            ("occupation", &["i work as an ", "i work as a ", "my job is "], 0.7),
            ("pet", &["my dog is named ", "my cat is named "], 0.6),
        ];
        for (key, patterns, confidence) in simple {
            if let Some(value) = patterns.iter().find_map(|p| capture_after(message, p)) {
                facts.push(CandidateFact::new(key, value, confidence));
            }
        }

        if let Some(age) = extract_age(message) {
            facts.push(CandidateFact::new("age", age, 0.9));
        }

        facts
    }
}

#[async_trait]
impl FactExtractor for HeuristicAnalyzer {
    async fn extract(&self, exchange: &Exchange<'_>) -> Result<Vec<CandidateFact>, ScoringFailure> {
        Ok(Self::facts(exchange.user_message))
    }
}

#[async_trait]
impl ExchangeAnalyzer for HeuristicAnalyzer {
    async fn importance(&self, exchange: &Exchange<'_>) -> Result<f32, ScoringFailure> {
        Ok(Self::score(exchange.user_message))
    }

    async fn summarize(
        &self,
        exchange: &Exchange<'_>,
        _importance: f32,
    ) -> Result<Option<String>, ScoringFailure> {
        if extract_keywords(exchange.user_message).is_empty() {
            return Ok(None);
        }
        let snippet = truncate_chars(first_sentence(exchange.user_message), SUMMARY_MAX_CHARS);
        Ok(Some(format!("User said: {}", snippet)))
    }

    async fn insight(
        &self,
        exchange: &Exchange<'_>,
        _importance: f32,
    ) -> Result<Option<CandidateInsight>, ScoringFailure> {
        let message = exchange.user_message;
        let insight = extract_preference(message)
            .map(|text| CandidateInsight {
                text: format!("User preference: {}", text),
                category: InsightCategory::Preferences,
            })
            .or_else(|| {
                extract_goal(message).map(|text| CandidateInsight {
                    text: format!("User goal: {}", text),
                    category: InsightCategory::Goals,
                })
            })
            .or_else(|| {
                capture_clause(message, &["i feel ", "i'm feeling ", "i am feeling "], 5).map(
                    |text| CandidateInsight {
                        text: format!("User mood: {}", text),
                        category: InsightCategory::Emotions,
                    },
                )
            });
        Ok(insight)
    }
}

fn first_sentence(text: &str) -> &str {
    let text = text.trim();
    let end = text
        .find(|c| matches!(c, '.' | '!' | '?' | '\n'))
        .unwrap_or(text.len());
    let sentence = text[..end].trim();
    if sentence.is_empty() {
        text
    } else {
        sentence
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{}...", cut.trim_end())
}

/// Short value following a pattern, up to the next clause break.
/// `to_ascii_lowercase` keeps byte offsets aligned with the original text.
fn capture_after(content: &str, pattern: &str) -> Option<String> {
    let lower = content.to_ascii_lowercase();
    let pos = lower.find(pattern)?;
    let rest = &content[pos + pattern.len()..];

    let value: String = rest
        .chars()
        .take_while(|c| !matches!(c, '.' | '!' | '?' | ',' | ';' | '\n'))
        .collect();
    let words: Vec<&str> = value
        .split_whitespace()
        .take_while(|w| !matches!(w.to_ascii_lowercase().as_str(), "and" | "but" | "so" | "because"))
        .take(6)
        .collect();

    if words.is_empty() {
        return None;
    }
    let value = words.join(" ");
    (value.len() <= 60).then_some(value)
}

/// Whole clause starting at a pattern (pattern included)
fn capture_clause(content: &str, patterns: &[&str], min_len: usize) -> Option<String> {
    let lower = content.to_ascii_lowercase();

    for pattern in patterns {
        if let Some(pos) = lower.find(pattern) {
            let clause: String = content[pos..]
                .chars()
                .take_while(|c| !matches!(c, '.' | '!' | '?' | '\n'))
                .collect();
            let clause = clause.trim();
            if clause.len() > pattern.len() + min_len && clause.len() < 200 {
                return Some(clause.to_string());
            }
        }
    }

    None
}

fn extract_name(content: &str) -> Option<CandidateFact> {
    // Explicit introductions
    for pattern in ["my name is ", "call me ", "they call me "] {
        if let Some(name) = capture_name(content, pattern, false) {
            return Some(CandidateFact::new("name", name, 0.9));
        }
    }

    // "I'm Ada" only when the next word is capitalized
    for pattern in ["i'm ", "i am "] {
        if let Some(name) = capture_name(content, pattern, true) {
            return Some(CandidateFact::new("name", name, 0.6));
        }
    }

    None
}

fn capture_name(content: &str, pattern: &str, require_capital: bool) -> Option<String> {
    let lower = content.to_ascii_lowercase();
    let pos = lower.find(pattern)?;
    let rest = &content[pos + pattern.len()..];

    let words: Vec<&str> = rest
        .split(|c: char| !(c.is_alphabetic() || c == '-' || c == ' '))
        .next()
        .unwrap_or("")
        .split_whitespace()
        .take_while(|w| !matches!(w.to_lowercase().as_str(), "and" | "but" | "so" | "i" | "im"))
        .take(if require_capital { 1 } else { 3 })
        .collect();

    let first = words.first()?;
    if require_capital && !first.chars().next().is_some_and(char::is_uppercase) {
        return None;
    }

    let name = words.join(" ");
    (name.len() < 50).then_some(name)
}

fn extract_favorites(content: &str) -> Vec<CandidateFact> {
    let lower = content.to_ascii_lowercase();
    let mut facts = Vec::new();

    for marker in ["my favorite ", "my favourite "] {
        let mut search_from = 0;
        while let Some(offset) = lower[search_from..].find(marker) {
            let start = search_from + offset + marker.len();
            search_from = start;

            let Some(is_at) = lower[start..].find(" is ") else {
                break;
            };
            let subject = content[start..start + is_at].trim();
            if subject.is_empty() || subject.split_whitespace().count() > 3 {
                continue;
            }
            if let Some(value) = capture_after(&content[start + is_at..], " is ") {
                facts.push(CandidateFact::new(
                    &format!("favorite {}", subject),
                    value,
                    0.8,
                ));
            }
        }
    }

    facts
}

fn extract_age(content: &str) -> Option<String> {
    let lower = content.to_ascii_lowercase();
    let pos = lower.find(" years old")?;
    let digits: String = lower[..pos]
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let age: u32 = digits.parse().ok()?;
    (1..130).contains(&age).then(|| age.to_string())
}

fn extract_preference(content: &str) -> Option<String> {
    capture_clause(
        content,
        &[
            "i prefer ",
            "i like ",
            "i love ",
            "i hate ",
            "i don't like ",
            "my favorite ",
            "my favourite ",
        ],
        3,
    )
}

fn extract_goal(content: &str) -> Option<String> {
    capture_clause(
        content,
        &[
            "i want to ",
            "i'm trying to ",
            "i need to ",
            "my goal is ",
            "i'm working on ",
        ],
        5,
    )
}

// ============================================================================
// Model-backed strategy
// ============================================================================

/// Analyzer that asks a small completion model
pub struct ModelAnalyzer {
    service: Arc<dyn CompletionService>,
    model: String,
}

impl ModelAnalyzer {
    pub fn new(service: Arc<dyn CompletionService>, model: impl Into<String>) -> Self {
        Self {
            service,
            model: model.into(),
        }
    }

    async fn ask(&self, prompt: String, temperature: f32, max_tokens: u32) -> Result<String, ScoringFailure> {
        let request = CompletionRequest::new(prompt, self.model.clone())
            .with_temperature(temperature)
            .with_max_tokens(max_tokens);
        Ok(self.service.complete(&request).await?)
    }
}

fn transcript(exchange: &Exchange<'_>) -> String {
    format!("User: {}\nAI: {}", exchange.user_message, exchange.ai_response)
}

/// First decimal number in a reply, clamped to [0, 1]
pub fn parse_score(reply: &str) -> Option<f32> {
    let start = reply.find(|c: char| c.is_ascii_digit())?;
    let mut seen_dot = false;
    let number: String = reply[start..]
        .chars()
        .take_while(|c| {
            if *c == '.' && !seen_dot {
                seen_dot = true;
                true
            } else {
                c.is_ascii_digit()
            }
        })
        .collect();
    let value: f32 = number.trim_end_matches('.').parse().ok()?;
    Some(value.clamp(0.0, 1.0))
}

/// Parse `{"facts": {key: {value, confidence}}}` or a flat `{key: value}`
pub fn parse_facts(reply: &str) -> Result<Vec<CandidateFact>, ScoringFailure> {
    let (Some(start), Some(end)) = (reply.find('{'), reply.rfind('}')) else {
        return Err(ScoringFailure("no JSON object in fact reply".into()));
    };
    if end < start {
        return Err(ScoringFailure("no JSON object in fact reply".into()));
    }

    let json: serde_json::Value = serde_json::from_str(&reply[start..=end])
        .map_err(|e| ScoringFailure(format!("fact JSON: {}", e)))?;

    let object = match json.get("facts") {
        Some(facts) => facts.as_object(),
        None => json.as_object(),
    }
    .ok_or_else(|| ScoringFailure("fact reply is not an object".into()))?;

    let mut facts = Vec::new();
    for (key, entry) in object {
        let (value, confidence) = match entry {
            serde_json::Value::Object(fields) => (
                fields.get("value").map(json_to_text),
                fields
                    .get("confidence")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(0.5) as f32,
            ),
            other => (Some(json_to_text(other)), 0.5),
        };

        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            facts.push(CandidateFact::new(key, value.trim(), confidence.clamp(0.0, 1.0)));
        }
    }

    Ok(facts)
}

fn json_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl FactExtractor for ModelAnalyzer {
    async fn extract(&self, exchange: &Exchange<'_>) -> Result<Vec<CandidateFact>, ScoringFailure> {
        let prompt = format!(
            "Extract personal facts about the user from this conversation. \
             For each fact, provide a confidence score (0.0-1.0).\n\n\
             Return ONLY valid JSON in this exact format:\n\
             {{\"facts\": {{\"fact_key\": {{\"value\": \"fact_value\", \"confidence\": 0.8}}}}}}\n\n\
             {}\n\n\
             Definitive personal information gets high confidence, preferences medium, \
             implied characteristics low.\n\nJSON:",
            transcript(exchange)
        );

        let reply = self.ask(prompt, 0.2, 300).await?;
        let facts = parse_facts(&reply)?;
        debug!("Model extracted {} candidate facts", facts.len());
        Ok(facts)
    }
}

#[async_trait]
impl ExchangeAnalyzer for ModelAnalyzer {
    async fn importance(&self, exchange: &Exchange<'_>) -> Result<f32, ScoringFailure> {
        let prompt = format!(
            "Rate this conversation exchange's importance for long-term memory on a scale \
             of 0.0 to 1.0.\n\nConsider personal information revealed, emotional significance, \
             preferences, recurring themes and practical information.\n\n{}\n\n\
             Return ONLY a number between 0.0 and 1.0:",
            transcript(exchange)
        );

        let reply = self.ask(prompt, 0.1, 10).await?;
        parse_score(&reply).ok_or_else(|| ScoringFailure(format!("no score in reply {:?}", reply)))
    }

    async fn summarize(
        &self,
        exchange: &Exchange<'_>,
        importance: f32,
    ) -> Result<Option<String>, ScoringFailure> {
        let instruction = if importance < 0.3 {
            "Create a brief 1-sentence summary of this low-importance exchange"
        } else if importance > 0.7 {
            "Create a detailed 2-3 sentence summary of this important conversation, capturing key details"
        } else {
            "Summarize this conversation in 1-2 sentences"
        };
        let prompt = format!("{}:\n{}\n\nSummary:", instruction, transcript(exchange));

        let reply = self.ask(prompt, 0.4, 150).await?;
        let summary = reply.trim();
        Ok((!summary.is_empty()).then(|| summary.to_string()))
    }

    async fn insight(
        &self,
        exchange: &Exchange<'_>,
        importance: f32,
    ) -> Result<Option<CandidateInsight>, ScoringFailure> {
        let prompt = format!(
            "Based on this conversation, generate a brief insight about the user's \
             personality, interests, or patterns.\n\n{}\nImportance: {:.2}\n\n\
             Generate a concise insight (1-2 sentences) that reveals something meaningful \
             about the user:",
            transcript(exchange),
            importance
        );
        let reply = self.ask(prompt, 0.5, 120).await?;
        let text = reply.trim().to_string();
        if text.is_empty() {
            return Ok(None);
        }

        let names: Vec<&str> = InsightCategory::ALL.iter().map(|c| c.as_str()).collect();
        let prompt = format!(
            "Categorize this insight into ONE of these categories: {}\n\nInsight: {}\n\n\
             Return ONLY the category name:",
            names.join(", "),
            text
        );
        // An uncategorized insight is still worth keeping
        let category = match self.ask(prompt, 0.1, 10).await {
            Ok(reply) => InsightCategory::from_reply(&reply),
            Err(e) => {
                debug!("Insight categorization failed: {}", e);
                InsightCategory::General
            }
        };

        Ok(Some(CandidateInsight { text, category }))
    }
}
