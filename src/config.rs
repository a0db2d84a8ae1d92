//! Process configuration.
//!
//! All settings come from environment variables with working defaults, so a
//! bare `healthguard` start runs against a local data dir with delivery and
//! inference disabled until keys are supplied.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Inference gateway (OpenAI-compatible API used for vision, transcription,
/// speech synthesis, and structured clinical reasoning).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub chat_model: String,
    pub vision_model: String,
    pub stt_model: String,
    pub tts_model: String,
    /// Bound on every outbound call; a timeout is a recoverable failure.
    pub request_timeout_secs: u64,
}

impl GatewayConfig {
    fn from_env() -> Self {
        Self {
            base_url: env_string("HG_GATEWAY_URL", "https://api.venice.ai/api/v1"),
            api_key: env_opt("HG_GATEWAY_API_KEY"),
            chat_model: env_string("HG_CHAT_MODEL", "llama-3.3-70b"),
            vision_model: env_string("HG_VISION_MODEL", "qwen-2.5-vl"),
            stt_model: env_string("HG_STT_MODEL", "whisper-large-v3"),
            tts_model: env_string("HG_TTS_MODEL", "tts-kokoro"),
            request_timeout_secs: env_u64("HG_GATEWAY_TIMEOUT_SECS", 30),
        }
    }

    pub fn enabled(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Telegram delivery. The doctor channel is a second chat ID; in a
/// single-operator deployment both may point at the same chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub doctor_chat_id: Option<String>,
}

impl TelegramConfig {
    fn from_env() -> Self {
        let chat_id = env_opt("HG_TELEGRAM_CHAT_ID");
        Self {
            bot_token: env_opt("HG_TELEGRAM_BOT_TOKEN"),
            doctor_chat_id: env_opt("HG_TELEGRAM_DOCTOR_CHAT_ID").or_else(|| chat_id.clone()),
            chat_id,
        }
    }

    pub fn enabled(&self) -> bool {
        self.bot_token.is_some() && self.chat_id.is_some()
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub telegram: TelegramConfig,
    /// Root for the state DB, audit DB, and the ephemeral media dir.
    pub data_dir: PathBuf,
    /// Autonomous re-evaluation period.
    pub cycle_interval_secs: u64,
    /// Hard lifetime of raw media assets.
    pub raw_media_ttl_secs: u64,
    /// Alert dedup window.
    pub dedup_cooldown_secs: u64,
    /// Rolling window consulted for trend rules and anomaly context.
    pub history_window: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = env_opt("HG_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".healthguard")
        });

        Self {
            gateway: GatewayConfig::from_env(),
            telegram: TelegramConfig::from_env(),
            data_dir,
            cycle_interval_secs: env_u64("HG_CYCLE_INTERVAL_SECS", 60),
            raw_media_ttl_secs: env_u64("HG_RAW_MEDIA_TTL_SECS", 60),
            dedup_cooldown_secs: env_u64("HG_DEDUP_COOLDOWN_SECS", 300),
            history_window: env_u64("HG_HISTORY_WINDOW", 20) as usize,
        }
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }

    pub fn audit_db_path(&self) -> PathBuf {
        self.data_dir.join("audit.db")
    }

    pub fn ephemeral_dir(&self) -> PathBuf {
        self.data_dir.join("ephemeral")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
