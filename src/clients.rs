//! External service clients and the trait contracts the pipeline depends on.
//!
//! Three collaborators, all invoked with bounded timeouts:
//! - `MediaAnalyzer`: vision/transcription over raw media. Receives only the
//!   ephemeral session ID and the payload, never a patient name or
//!   long-lived identity.
//! - `ClinicalReasoner`: structured summarization + anomaly scoring over
//!   text. Text only, no media.
//! - `DeliveryChannel`: alert fan-out. A non-success is a per-action
//!   failure, never a pipeline failure.
//!
//! Shipped implementations talk to an OpenAI-compatible inference gateway
//! and the Telegram Bot API. Tests swap in mocks.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::{GatewayConfig, TelegramConfig};
use crate::retention::MediaKind;
use crate::types::Severity;

/// Errors from external service calls.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Http(String),

    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    #[error("Service returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse service response: {0}")]
    Parse(String),

    #[error("Channel not configured")]
    NotConfigured,
}

impl ClientError {
    fn from_reqwest(err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            ClientError::Timeout(timeout_secs)
        } else {
            ClientError::Http(err.to_string())
        }
    }
}

/// Structured result of the reasoning call.
#[derive(Debug, Clone, Deserialize)]
pub struct SummaryOutcome {
    #[serde(default)]
    pub summary: String,
    /// Normalized [0,1]; how unusual the combined signal pattern looks.
    #[serde(default)]
    pub anomaly_score: f64,
}

/// Vision/transcription over raw media bytes.
#[async_trait]
pub trait MediaAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        session_id: &str,
        kind: MediaKind,
        payload: &[u8],
    ) -> Result<String, ClientError>;
}

/// Structured clinical summarization over text signals.
#[async_trait]
pub trait ClinicalReasoner: Send + Sync {
    async fn summarize(
        &self,
        session_id: &str,
        text_signals: &str,
        anonymized_history: &str,
    ) -> Result<SummaryOutcome, ClientError>;
}

/// One message the dispatcher hands to a channel.
#[derive(Debug, Clone)]
pub struct AlertMessage {
    pub severity: Severity,
    /// Already scrubbed: redacted patient reference, no display name.
    pub text: String,
}

/// A delivery target for one alert action.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send(&self, message: &AlertMessage) -> Result<(), ClientError>;
}

// ---------------------------------------------------------------------------
// Inference gateway (OpenAI-compatible HTTP API)
// ---------------------------------------------------------------------------

/// Client for the inference gateway: chat, vision, transcription, speech.
pub struct InferenceGateway {
    http: reqwest::Client,
    config: GatewayConfig,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl InferenceGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ClientError::Http(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn auth(&self) -> Result<&str, ClientError> {
        self.config
            .api_key
            .as_deref()
            .ok_or(ClientError::NotConfigured)
    }

    async fn chat(&self, model: &str, messages: serde_json::Value) -> Result<String, ClientError> {
        let key = self.auth()?;
        let url = format!("{}/chat/completions", self.config.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(key)
            .json(&json!({ "model": model, "messages": messages }))
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(e, self.config.request_timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                body: crate::util::truncate(&body, 200),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ClientError::Parse("empty choices".to_string()))
    }

    /// Synthesize a spoken alert. Returns raw audio bytes.
    pub async fn speech(&self, text: &str) -> Result<Vec<u8>, ClientError> {
        let key = self.auth()?;
        let url = format!("{}/audio/speech", self.config.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(key)
            .json(&json!({
                "model": self.config.tts_model,
                "input": text,
                "response_format": "mp3",
            }))
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(e, self.config.request_timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                body: crate::util::truncate(&body, 200),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl MediaAnalyzer for InferenceGateway {
    async fn analyze(
        &self,
        session_id: &str,
        kind: MediaKind,
        payload: &[u8],
    ) -> Result<String, ClientError> {
        match kind {
            MediaKind::Photo => {
                let data_url = format!(
                    "data:image/png;base64,{}",
                    base64::engine::general_purpose::STANDARD.encode(payload)
                );
                let messages = json!([
                    {
                        "role": "system",
                        "content": "You are a clinical observation assistant. Describe any \
                                    visible symptoms, wounds, swelling, or skin changes in the \
                                    image. Observations only, no diagnosis. The subject is \
                                    identified only by an anonymous session ID."
                    },
                    {
                        "role": "user",
                        "content": [
                            { "type": "text", "text": format!("Session {session_id}. Describe clinically relevant observations.") },
                            { "type": "image_url", "image_url": { "url": data_url } }
                        ]
                    }
                ]);
                self.chat(&self.config.vision_model, messages).await
            }
            MediaKind::Audio => {
                let key = self.auth()?;
                let url = format!("{}/audio/transcriptions", self.config.base_url);
                let part = reqwest::multipart::Part::bytes(payload.to_vec())
                    .file_name(format!("{session_id}.wav"))
                    .mime_str("audio/wav")
                    .map_err(|e| ClientError::Http(e.to_string()))?;
                let form = reqwest::multipart::Form::new()
                    .text("model", self.config.stt_model.clone())
                    .part("file", part);

                let response = self
                    .http
                    .post(&url)
                    .bearer_auth(key)
                    .multipart(form)
                    .send()
                    .await
                    .map_err(|e| {
                        ClientError::from_reqwest(e, self.config.request_timeout_secs)
                    })?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ClientError::Api {
                        status: status.as_u16(),
                        body: crate::util::truncate(&body, 200),
                    });
                }
                let parsed: TranscriptionResponse = response
                    .json()
                    .await
                    .map_err(|e| ClientError::Parse(e.to_string()))?;
                Ok(parsed.text)
            }
        }
    }
}

#[async_trait]
impl ClinicalReasoner for InferenceGateway {
    async fn summarize(
        &self,
        session_id: &str,
        text_signals: &str,
        anonymized_history: &str,
    ) -> Result<SummaryOutcome, ClientError> {
        let messages = json!([
            {
                "role": "system",
                "content": "You analyze anonymized patient signals for a monitoring system. \
                            Respond with strict JSON: {\"summary\": string, \
                            \"anomaly_score\": number between 0 and 1}. The score reflects \
                            how unusual the combined pattern is against the history. \
                            No names are available; refer to the subject as the session ID."
            },
            {
                "role": "user",
                "content": format!(
                    "Session {session_id}.\nCurrent signals:\n{text_signals}\n\nHistory:\n{anonymized_history}"
                )
            }
        ]);

        let content = self.chat(&self.config.chat_model, messages).await?;
        parse_summary(&content)
    }
}

/// Pull the JSON object out of a model response that may wrap it in prose or
/// code fences.
fn parse_summary(content: &str) -> Result<SummaryOutcome, ClientError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let slice = match (start, end) {
        (Some(s), Some(e)) if e > s => &content[s..=e],
        _ => return Err(ClientError::Parse("no JSON object in response".to_string())),
    };
    let outcome: SummaryOutcome =
        serde_json::from_str(slice).map_err(|e| ClientError::Parse(e.to_string()))?;
    Ok(SummaryOutcome {
        summary: outcome.summary,
        anomaly_score: outcome.anomaly_score.clamp(0.0, 1.0),
    })
}

// ---------------------------------------------------------------------------
// Telegram delivery
// ---------------------------------------------------------------------------

/// Telegram Bot API channel. `doctor` channels are the same API with a
/// different chat ID.
pub struct TelegramChannel {
    http: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramChannel {
    /// Build the patient-facing channel from config, if configured.
    pub fn patient(config: &TelegramConfig) -> Option<Self> {
        Self::build(config.bot_token.as_deref(), config.chat_id.as_deref())
    }

    /// Build the doctor-notification channel from config, if configured.
    pub fn doctor(config: &TelegramConfig) -> Option<Self> {
        Self::build(config.bot_token.as_deref(), config.doctor_chat_id.as_deref())
    }

    fn build(bot_token: Option<&str>, chat_id: Option<&str>) -> Option<Self> {
        let bot_token = bot_token?.to_string();
        let chat_id = chat_id?.to_string();
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .ok()?;
        Some(Self {
            http,
            bot_token,
            chat_id,
        })
    }

    async fn check(&self, response: reqwest::Response) -> Result<(), ClientError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ClientError::Api {
                status: status.as_u16(),
                body: crate::util::truncate(&body, 200),
            })
        }
    }

    pub async fn send_text(&self, text: &str) -> Result<(), ClientError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": text,
                "parse_mode": "HTML",
            }))
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(e, 15))?;
        self.check(response).await
    }

    pub async fn send_audio(&self, audio: Vec<u8>, caption: &str) -> Result<(), ClientError> {
        let url = format!("https://api.telegram.org/bot{}/sendAudio", self.bot_token);
        let part = reqwest::multipart::Part::bytes(audio)
            .file_name("alert.mp3")
            .mime_str("audio/mpeg")
            .map_err(|e| ClientError::Http(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", caption.to_string())
            .part("audio", part);
        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(e, 15))?;
        self.check(response).await
    }
}

#[async_trait]
impl DeliveryChannel for TelegramChannel {
    async fn send(&self, message: &AlertMessage) -> Result<(), ClientError> {
        let prefix = match message.severity {
            Severity::Critical => "\u{1F6A8} <b>CRITICAL ALERT</b>",
            Severity::Warning => "\u{26A0} <b>WARNING</b>",
            Severity::Info => "<b>Info</b>",
        };
        self.send_text(&format!("{}\n\n{}", prefix, message.text)).await
    }
}

/// Spoken-alert channel: synthesizes speech through the gateway and delivers
/// the audio via Telegram.
pub struct SpokenAlertChannel {
    gateway: Arc<InferenceGateway>,
    telegram: TelegramChannel,
}

impl SpokenAlertChannel {
    pub fn new(gateway: Arc<InferenceGateway>, telegram: TelegramChannel) -> Self {
        Self { gateway, telegram }
    }
}

#[async_trait]
impl DeliveryChannel for SpokenAlertChannel {
    async fn send(&self, message: &AlertMessage) -> Result<(), ClientError> {
        let script = format!(
            "Critical health alert. {} Please seek immediate medical attention or contact your doctor.",
            message.text
        );
        let audio = self.gateway.speech(&script).await?;
        self.telegram
            .send_audio(audio, "Critical alert audio")
            .await
    }
}
