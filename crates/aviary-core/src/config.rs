use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::AviaryError;

/// Top-level Aviary configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub reply: ReplyConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub consent: ConsentConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    /// Bots hosted by this process. Empty means nothing to serve.
    #[serde(default)]
    pub bots: Vec<BotConfig>,
}

/// HTTP listener and public callback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public base URL Telegram will POST updates to (no trailing slash).
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: String::new(),
            log_level: default_log_level(),
        }
    }
}

/// Eligibility gate settings: subscription channel and consent policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Channel the user must be subscribed to (e.g. "@my_channel").
    #[serde(default)]
    pub required_channel: String,
    /// Consent-terms version a record must carry to be current.
    #[serde(default = "default_policy_version")]
    pub policy_version: i64,
    /// Message sent when the user is not subscribed. `{channel}` is
    /// replaced with `required_channel`.
    #[serde(default = "default_subscribe_message")]
    pub subscribe_message: String,
    /// Message shown with the accept/decline consent keyboard.
    #[serde(default = "default_consent_message")]
    pub consent_message: String,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            required_channel: String::new(),
            policy_version: default_policy_version(),
            subscribe_message: default_subscribe_message(),
            consent_message: default_consent_message(),
        }
    }
}

/// Reply engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    /// History keeps at most `2 * max_turns` entries per (bot, user).
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Probability of picking the long response mode when no marker
    /// forces one.
    #[serde(default = "default_p_long")]
    pub p_long: f64,
    /// Fixed apology sent when all completion attempts fail.
    #[serde(default = "default_fallback")]
    pub fallback: String,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            p_long: default_p_long(),
            fallback: default_fallback(),
        }
    }
}

/// Completion service (OpenAI-compatible) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_provider_model")]
    pub model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            api_key: String::new(),
            model: default_provider_model(),
        }
    }
}

/// Consent store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Webhook registration behavior at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Ask Telegram to drop updates queued before registration.
    #[serde(default = "default_true")]
    pub drop_pending: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            drop_pending: default_true(),
        }
    }
}

/// One hosted bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Bot id used in the webhook path. Normalized to lowercase.
    pub id: String,
    /// Telegram bot token.
    pub token: String,
    /// Per-bot webhook secret, echoed back by Telegram in a header.
    pub secret: String,
    /// Persona system prompt.
    pub persona: String,
    /// Greeting sent in reply to /start once the user is eligible.
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

// --- Default value functions ---

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_policy_version() -> i64 {
    1
}
fn default_subscribe_message() -> String {
    "Чтобы общаться со мной, подпишись на канал {channel} и напиши мне ещё раз 💌".to_string()
}
fn default_consent_message() -> String {
    "Прежде чем мы начнём: подтверди, что тебе есть 18 лет и ты согласен(на) с правилами общения. \
     Это можно отозвать в любой момент."
        .to_string()
}
fn default_max_turns() -> usize {
    12
}
fn default_p_long() -> f64 {
    0.5
}
fn default_fallback() -> String {
    "Извини, я немного завис… Напиши мне ещё раз чуть позже 🙏".to_string()
}
fn default_provider_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_provider_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_db_path() -> String {
    "~/.aviary/consent.db".to_string()
}
fn default_true() -> bool {
    true
}
fn default_greeting() -> String {
    "Привет! Я на связи 💬".to_string()
}

/// Expand `~` to home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Load configuration from a TOML file.
///
/// Falls back to defaults if the file does not exist (the caller decides
/// whether an empty bot list is acceptable).
pub fn load(path: &str) -> Result<Config, AviaryError> {
    let path = Path::new(path);
    if !path.exists() {
        // Missing file is not an error; the caller reports it once
        // logging is up and decides whether defaults are acceptable.
        return Ok(Config {
            gateway: GatewayConfig::default(),
            access: AccessConfig::default(),
            reply: ReplyConfig::default(),
            provider: ProviderConfig::default(),
            consent: ConsentConfig::default(),
            webhook: WebhookConfig::default(),
            bots: Vec::new(),
        });
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| AviaryError::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| AviaryError::Config(format!("failed to parse config: {}", e)))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.gateway.port, 8080);
        assert_eq!(cfg.access.policy_version, 1);
        assert_eq!(cfg.reply.max_turns, 12);
        assert!((cfg.reply.p_long - 0.5).abs() < f64::EPSILON);
        assert!(cfg.webhook.drop_pending);
        assert!(cfg.bots.is_empty());
    }

    #[test]
    fn test_bots_from_toml() {
        let toml_str = r#"
            [gateway]
            base_url = "https://bots.example.com"

            [access]
            required_channel = "@my_channel"
            policy_version = 3

            [[bots]]
            id = "Jacob_Bot"
            token = "1234:AAA"
            secret = "jacob_s3cret"
            persona = "Ты — Джейкоб."

            [[bots]]
            id = "other_bot"
            token = "5678:BBB"
            secret = "other_s3cret"
            persona = "Ты — другой."
            greeting = "Привет!"
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.bots.len(), 2);
        // Ids are normalized at registration, not at parse time.
        assert_eq!(cfg.bots[0].id, "Jacob_Bot");
        assert_eq!(cfg.bots[0].greeting, default_greeting());
        assert_eq!(cfg.bots[1].greeting, "Привет!");
        assert_eq!(cfg.access.policy_version, 3);
        assert_eq!(cfg.access.required_channel, "@my_channel");
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let cfg = load("/nonexistent/aviary/config.toml").unwrap();
        assert_eq!(cfg.gateway.port, 8080);
        assert!(cfg.bots.is_empty());
    }

    #[test]
    fn test_subscribe_message_placeholder() {
        let access = AccessConfig::default();
        assert!(access.subscribe_message.contains("{channel}"));
    }

    #[test]
    fn test_shellexpand_home() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(shellexpand("~/x.db"), "/home/tester/x.db");
        assert_eq!(shellexpand("/abs/x.db"), "/abs/x.db");
    }
}
