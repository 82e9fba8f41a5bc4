//! ============================================================================
//! Speech Service - Text-to-speech behind a trait
//! ============================================================================
//! `AzureSpeechClient` posts SSML to the Azure Cognitive Services TTS REST
//! endpoint and returns the encoded audio. Playback is the caller's job.
//! ============================================================================

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use super::completion::strip_reasoning;
use crate::config::ServiceConfig;
use crate::error::ServiceError;

/// Audio container requested from the TTS endpoint
const OUTPUT_FORMAT: &str = "audio-24khz-48kbitrate-mono-mp3";

/// Synthesizes speech for text
#[async_trait]
pub trait SpeechService: Send + Sync {
    async fn speak(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, ServiceError>;
}

/// Azure text-to-speech REST client
pub struct AzureSpeechClient {
    client: reqwest::Client,
    subscription_key: String,
    region: String,
    timeout: Duration,
}

impl AzureSpeechClient {
    pub fn new(subscription_key: String, region: String, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::NotConfigured(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            subscription_key,
            region,
            timeout,
        })
    }

    /// Build from service settings; fails if no speech key is configured
    pub fn from_config(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let key = config
            .speech_key
            .clone()
            .ok_or_else(|| ServiceError::NotConfigured("no speech subscription key".into()))?;
        Self::new(key, config.speech_region.clone(), Duration::from_secs(config.timeout_secs))
    }

    fn endpoint(&self) -> String {
        format!(
            "https://{}.tts.speech.microsoft.com/cognitiveservices/v1",
            self.region
        )
    }
}

#[async_trait]
impl SpeechService for AzureSpeechClient {
    async fn speak(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, ServiceError> {
        let cleaned = clean_text_for_speech(text);
        if cleaned.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Synthesizing {} chars with voice {}", cleaned.len(), voice_id);

        let response = self
            .client
            .post(self.endpoint())
            .header("Ocp-Apim-Subscription-Key", &self.subscription_key)
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", OUTPUT_FORMAT)
            .header("User-Agent", "companion-core")
            .body(build_ssml(&cleaned, voice_id))
            .send()
            .await
            .map_err(|e| match ServiceError::from(e) {
                ServiceError::Timeout(_) => ServiceError::Timeout(self.timeout),
                other => other,
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status, body));
        }

        let audio = response.bytes().await?;
        info!("Synthesized {} bytes of audio", audio.len());
        Ok(audio.to_vec())
    }
}

/// Strip reasoning blocks, markdown markers and emoji; collapse whitespace
/// and expand chat abbreviations so the voice reads naturally.
pub fn clean_text_for_speech(text: &str) -> String {
    let without_reasoning = strip_reasoning(text);

    let filtered: String = without_reasoning
        .chars()
        .filter(|c| !matches!(c, '*' | '_' | '#' | '`' | '~'))
        .filter(|c| !is_emoji(*c))
        .collect();

    let mut words = Vec::new();
    for word in filtered.split_whitespace() {
        let expanded = match word.to_lowercase().as_str() {
            "btw" => "by the way",
            "tbh" => "to be honest",
            "ngl" => "not gonna lie",
            "omg" => "oh my god",
            _ => word,
        };
        words.push(expanded.to_string());
    }

    let mut joined = words.join(" ");
    while joined.contains("!!") {
        joined = joined.replace("!!", "!");
    }
    while joined.contains("??") {
        joined = joined.replace("??", "?");
    }
    joined
}

fn is_emoji(c: char) -> bool {
    matches!(c as u32, 0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0xFE0F | 0x200D)
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// SSML document for one utterance
pub fn build_ssml(text: &str, voice_id: &str) -> String {
    format!(
        "<speak version=\"1.0\" xmlns=\"http://www.w3.org/2001/10/synthesis\" xml:lang=\"en-US\">\
         <voice name=\"{}\">{}</voice></speak>",
        escape_xml(voice_id),
        escape_xml(text)
    )
}
