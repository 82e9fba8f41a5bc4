//! ============================================================================
//! Conversation Session - One turn, start to finish
//! ============================================================================
//! retrieve memory → build prompt → complete (with timeout) → record hits →
//! ingest → optional speech. A turn whose completion fails leaves memory
//! untouched, retrieval hits included.
//! No store access is in flight while waiting on the network.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::memory::{ConversationTurn, IngestReport, MemoryBundle, MemoryManager};
use crate::services::{CompletionRequest, CompletionService, SpeechService};

const PERSONA: &str = "\
You are a thoughtful conversational companion with a personality that grows over time.

PERSONALITY:
- Curious about the user and what they care about
- Supportive without being gushing
- A little witty; you enjoy a good joke
- Technical when the topic calls for it, relaxed otherwise
- Upfront about what you don't know

STYLE:
- Keep replies concise and natural
- Answer what the user actually said
- Ask follow-up questions when you are genuinely curious
- NEVER bring up past conversations or stored facts unless the user asks about them
- Stay on the current topic

MEMORY:
- Only refer to past details when the user asks (\"remember when...\", \"what did I tell you about...\")
- Let what you know shape HOW you respond, not WHAT you talk about
- Behave like a friend who knows the user well and doesn't keep bringing up old conversations";

/// Wrap the memory bundle in the companion persona
pub fn build_system_prompt(bundle: &MemoryBundle) -> String {
    let mut prompt = String::from(PERSONA);
    if !bundle.is_empty() {
        prompt.push_str("\n\nThe background context below is for calibrating tone only. Do not quote it.");
        prompt.push_str(&bundle.format_for_prompt());
    }
    prompt
}

/// Result of one processed turn
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub reply: String,
    /// What the turn added to memory; None if the store failed
    pub memory: Option<IngestReport>,
    /// Synthesized reply audio, when speech is enabled and succeeded
    #[serde(skip)]
    pub audio: Option<Vec<u8>>,
    pub speech_error: Option<String>,
}

pub struct ConversationSession {
    memory: Arc<MemoryManager>,
    completion: Arc<dyn CompletionService>,
    speech: Option<Arc<dyn SpeechService>>,
    config: ServiceConfig,
    history: Vec<ConversationTurn>,
}

impl ConversationSession {
    pub fn new(memory: Arc<MemoryManager>, completion: Arc<dyn CompletionService>, config: ServiceConfig) -> Self {
        Self {
            memory,
            completion,
            speech: None,
            config,
            history: Vec::new(),
        }
    }

    /// Speak every reply through this service
    pub fn with_speech(mut self, speech: Arc<dyn SpeechService>) -> Self {
        self.speech = Some(speech);
        self
    }

    /// Turns kept for the next request, oldest first
    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    /// Process one user message
    pub async fn process_message(&mut self, user_message: &str) -> Result<TurnOutcome, ServiceError> {
        let bundle = self.memory.build_context(user_message);
        debug!(
            "Context: {} facts, {} summaries, {} insights",
            bundle.profile.len(),
            bundle.summaries.len(),
            bundle.insights.len()
        );

        let request = CompletionRequest::new(user_message, self.config.chat_model.clone())
            .with_system(build_system_prompt(&bundle))
            .with_history(self.history.clone())
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens);

        let timeout = self.timeout();
        let reply = tokio::time::timeout(timeout, self.completion.complete(&request))
            .await
            .map_err(|_| ServiceError::Timeout(timeout))??;
        let reply = reply.trim().to_string();
        if reply.is_empty() {
            return Err(ServiceError::InvalidResponse("empty completion".into()));
        }

        self.memory.record_hits(&bundle);
        self.push_history(ConversationTurn::user(user_message));
        self.push_history(ConversationTurn::assistant(reply.clone()));

        let memory = self.memory.record_exchange(user_message, &reply).await;

        let mut outcome = TurnOutcome {
            reply,
            memory,
            ..TurnOutcome::default()
        };

        if let Some(speech) = &self.speech {
            let spoken = tokio::time::timeout(timeout, speech.speak(&outcome.reply, &self.config.speech_voice))
                .await
                .map_err(|_| ServiceError::Timeout(timeout))
                .and_then(|result| result);
            match spoken {
                Ok(audio) => outcome.audio = Some(audio),
                Err(e) => {
                    warn!("Speech synthesis failed: {}", e);
                    outcome.speech_error = Some(e.to_string());
                }
            }
        }

        info!("Turn complete ({} chars)", outcome.reply.len());
        Ok(outcome)
    }

    fn push_history(&mut self, turn: ConversationTurn) {
        self.history.push(turn);
        let cap = self.config.history_turns;
        if self.history.len() > cap {
            let excess = self.history.len() - cap;
            self.history.drain(..excess);
        }
    }
}
