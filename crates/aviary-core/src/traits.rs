use crate::{error::AviaryError, turn::CompletionRequest};
use async_trait::async_trait;

/// Completion service trait — the voice.
///
/// Every completion backend (OpenAI-compatible API, a local model, a test
/// mock) implements this trait to provide a uniform interface.
#[async_trait]
pub trait Completion: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Run one completion call and return the generated text.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AviaryError>;

    /// Check if the backend is reachable and ready.
    async fn is_available(&self) -> bool;
}

/// Channel-membership lookup used by the eligibility gate.
///
/// Kept as a seam so the gate can be tested without the platform API.
#[async_trait]
pub trait Membership: Send + Sync {
    /// Whether `user_id` is subscribed to `channel` (e.g. "@my_channel").
    async fn is_member(&self, channel: &str, user_id: i64) -> Result<bool, AviaryError>;
}

/// One inline button: label shown to the user, callback payload sent back.
#[derive(Debug, Clone)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Outbound messaging surface of the chat platform.
///
/// The gateway only ever talks to users through this trait; the Telegram
/// client implements it for production, mocks implement it in tests.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send a plain text message to a chat.
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), AviaryError>;

    /// Send a text message with one inline button per row.
    async fn send_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        buttons: &[Button],
    ) -> Result<(), AviaryError>;

    /// Show a typing indicator. Best-effort.
    async fn send_typing(&self, _chat_id: i64) -> Result<(), AviaryError> {
        Ok(())
    }

    /// Acknowledge a button press so the client stops its spinner. Best-effort.
    async fn ack_callback(&self, _callback_id: &str) -> Result<(), AviaryError> {
        Ok(())
    }
}
