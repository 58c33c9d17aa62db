//! Reply engine: response-length policy, prompt assembly, completion
//! calls with retry, and the post-reply history append.

use aviary_core::{
    traits::Completion,
    turn::{CompletionRequest, Turn},
};
use aviary_memory::SessionStore;
use std::sync::Arc;
use tracing::{info, warn};

/// Completion attempts before giving up and sending the fallback.
const MAX_ATTEMPTS: u32 = 3;

/// Marker tokens that force the short mode. Checked before long markers:
/// a message carrying both kinds resolves to short.
const SHORT_MARKERS: &[&str] = &["кратко", "коротко", "в двух словах", "одним словом"];

/// Marker tokens that force the long mode.
const LONG_MARKERS: &[&str] = &[
    "подробнее",
    "подробно",
    "расскажи больше",
    "развернуто",
    "развёрнуто",
];

/// Response-length mode, selected per turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    Short,
    Long,
}

impl ReplyMode {
    /// Pick a mode for one input. Deterministic markers win over the
    /// probabilistic draw; short markers take precedence over long ones.
    pub fn classify(text: &str, p_long: f64, draw: f64) -> Self {
        let lower = text.to_lowercase();
        if SHORT_MARKERS.iter().any(|m| lower.contains(m)) {
            return Self::Short;
        }
        if LONG_MARKERS.iter().any(|m| lower.contains(m)) {
            return Self::Long;
        }
        if draw < p_long {
            Self::Long
        } else {
            Self::Short
        }
    }

    pub fn temperature(self) -> f32 {
        match self {
            Self::Short => 0.5,
            Self::Long => 0.8,
        }
    }

    pub fn max_tokens(self) -> u32 {
        match self {
            Self::Short => 35,
            Self::Long => 220,
        }
    }

    /// Length directive appended to the persona for this turn.
    pub fn directive(self) -> &'static str {
        match self {
            Self::Short => "Ответь очень коротко: буквально 3-5 слов, без пояснений.",
            Self::Long => "Ответь тепло и развёрнуто, примерно 150-200 слов.",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Long => "long",
        }
    }
}

/// Builds bounded prompts and turns completions into replies.
///
/// Owns the post-reply session append: a turn is only recorded after its
/// reply (real or fallback) exists, as one atomic pair.
pub struct ReplyEngine {
    provider: Arc<dyn Completion>,
    sessions: Arc<SessionStore>,
    p_long: f64,
    fallback: String,
}

impl ReplyEngine {
    pub fn new(
        provider: Arc<dyn Completion>,
        sessions: Arc<SessionStore>,
        p_long: f64,
        fallback: String,
    ) -> Self {
        Self {
            provider,
            sessions,
            p_long,
            fallback,
        }
    }

    /// Generate a reply for one user message. Never fails: terminal
    /// completion errors degrade to the fixed fallback, which is still
    /// appended as the assistant turn to preserve continuity.
    pub async fn generate(
        &self,
        bot_id: &str,
        user_id: i64,
        persona: &str,
        input: &str,
    ) -> String {
        let mode = ReplyMode::classify(input, self.p_long, rand::random::<f64>());

        let mut turns = self.sessions.history(bot_id, user_id).await;
        turns.push(Turn::user(input));

        info!(
            "[{bot_id}] generating {} reply for {user_id} ({} turns of history)",
            mode.label(),
            turns.len() - 1
        );

        let request = CompletionRequest {
            system: format!("{persona}\n\n{}", mode.directive()),
            turns,
            temperature: mode.temperature(),
            max_tokens: mode.max_tokens(),
        };

        let reply = match self.complete_with_retry(&request).await {
            Some(text) => text,
            None => {
                warn!("[{bot_id}] all completion attempts failed, sending fallback to {user_id}");
                self.fallback.clone()
            }
        };

        self.sessions
            .append_exchange(bot_id, user_id, Turn::user(input), Turn::assistant(&reply))
            .await;

        reply
    }

    /// Call the completion service up to `MAX_ATTEMPTS` times.
    async fn complete_with_retry(&self, request: &CompletionRequest) -> Option<String> {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.provider.complete(request).await {
                Ok(text) if !text.trim().is_empty() => return Some(text),
                Ok(_) => warn!("empty completion (attempt {attempt}/{MAX_ATTEMPTS})"),
                Err(e) => warn!("completion failed (attempt {attempt}/{MAX_ATTEMPTS}): {e}"),
            }
        }
        None
    }
}
