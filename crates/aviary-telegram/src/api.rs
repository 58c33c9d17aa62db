//! Bot API client: outbound sends, keyboards, webhook lifecycle, and
//! membership lookups.

use crate::types::{ApiResponse, ChatMember};
use async_trait::async_trait;
use aviary_core::{
    error::AviaryError,
    traits::{Button, Channel, Membership},
};
use tracing::{debug, info, warn};

/// Telegram Bot API limit on message length.
const MAX_MESSAGE_LEN: usize = 4096;

/// One bot's view of the Telegram Bot API.
pub struct TelegramApi {
    client: reqwest::Client,
    base_url: String,
}

impl TelegramApi {
    /// Create a client for one bot token.
    pub fn new(token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("https://api.telegram.org/bot{token}"),
        }
    }

    /// Send a text message, chunked to the API limit, falling back to
    /// plain text when Markdown fails to parse.
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), AviaryError> {
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            let body = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
                "parse_mode": "Markdown",
            });

            let resp = self
                .client
                .post(format!("{}/sendMessage", self.base_url))
                .json(&body)
                .send()
                .await
                .map_err(|e| AviaryError::Telegram(format!("sendMessage failed: {e}")))?;

            let status = resp.status();
            if !status.is_success() {
                let error_text = resp.text().await.unwrap_or_default();
                if error_text.contains("can't parse entities") {
                    debug!("Markdown parse failed, retrying as plain text");
                    let plain_body = serde_json::json!({
                        "chat_id": chat_id,
                        "text": chunk,
                    });
                    self.client
                        .post(format!("{}/sendMessage", self.base_url))
                        .json(&plain_body)
                        .send()
                        .await
                        .map_err(|e| {
                            AviaryError::Telegram(format!("sendMessage (plain) failed: {e}"))
                        })?;
                } else {
                    return Err(AviaryError::Telegram(format!(
                        "sendMessage returned {status}: {error_text}"
                    )));
                }
            }
        }

        Ok(())
    }

    /// POST a method whose payload fits in one JSON body, checking the
    /// `ok` envelope flag.
    async fn call(&self, method: &str, body: serde_json::Value) -> Result<(), AviaryError> {
        let resp = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AviaryError::Telegram(format!("{method} failed: {e}")))?;

        let parsed: ApiResponse<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| AviaryError::Telegram(format!("{method} parse failed: {e}")))?;

        if !parsed.ok {
            return Err(AviaryError::Telegram(format!(
                "{method} rejected: {}",
                parsed.description.unwrap_or_default()
            )));
        }

        Ok(())
    }

    /// Register this bot's webhook URL with its secret token.
    ///
    /// `allowed_updates` is pinned to the update kinds the gateway can
    /// actually route.
    pub async fn set_webhook(
        &self,
        url: &str,
        secret: &str,
        drop_pending: bool,
    ) -> Result<(), AviaryError> {
        self.call(
            "setWebhook",
            serde_json::json!({
                "url": url,
                "secret_token": secret,
                "drop_pending_updates": drop_pending,
                "allowed_updates": ["message", "callback_query"],
            }),
        )
        .await?;
        info!("webhook set to {url}");
        Ok(())
    }

    /// De-register the webhook. Best-effort at shutdown.
    pub async fn delete_webhook(&self) -> Result<(), AviaryError> {
        self.call("deleteWebhook", serde_json::json!({})).await?;
        info!("webhook deleted");
        Ok(())
    }

    /// Look up a user's membership status in a channel.
    pub async fn get_chat_member(
        &self,
        channel: &str,
        user_id: i64,
    ) -> Result<ChatMember, AviaryError> {
        let resp = self
            .client
            .post(format!("{}/getChatMember", self.base_url))
            .json(&serde_json::json!({
                "chat_id": channel,
                "user_id": user_id,
            }))
            .send()
            .await
            .map_err(|e| AviaryError::Telegram(format!("getChatMember failed: {e}")))?;

        let parsed: ApiResponse<ChatMember> = resp
            .json()
            .await
            .map_err(|e| AviaryError::Telegram(format!("getChatMember parse failed: {e}")))?;

        parsed.result.ok_or_else(|| {
            AviaryError::Telegram(format!(
                "getChatMember rejected: {}",
                parsed.description.unwrap_or_default()
            ))
        })
    }
}

#[async_trait]
impl Channel for TelegramApi {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), AviaryError> {
        self.send_text(chat_id, text).await
    }

    async fn send_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        buttons: &[Button],
    ) -> Result<(), AviaryError> {
        let rows: Vec<Vec<serde_json::Value>> = buttons
            .iter()
            .map(|b| {
                vec![serde_json::json!({
                    "text": b.label,
                    "callback_data": b.data,
                })]
            })
            .collect();

        self.call(
            "sendMessage",
            serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "reply_markup": { "inline_keyboard": rows },
            }),
        )
        .await
    }

    async fn send_typing(&self, chat_id: i64) -> Result<(), AviaryError> {
        self.call(
            "sendChatAction",
            serde_json::json!({
                "chat_id": chat_id,
                "action": "typing",
            }),
        )
        .await
    }

    async fn ack_callback(&self, callback_id: &str) -> Result<(), AviaryError> {
        self.call(
            "answerCallbackQuery",
            serde_json::json!({ "callback_query_id": callback_id }),
        )
        .await
    }
}

#[async_trait]
impl Membership for TelegramApi {
    async fn is_member(&self, channel: &str, user_id: i64) -> Result<bool, AviaryError> {
        match self.get_chat_member(channel, user_id).await {
            Ok(member) => Ok(member.is_subscribed()),
            Err(e) => {
                warn!("membership check failed for {user_id} in {channel}: {e}");
                Err(e)
            }
        }
    }
}

/// Split a long message into chunks that respect Telegram's limit,
/// preferring newline boundaries.
pub fn split_message(text: &str, max_len: usize) -> Vec<&str> {
    if text.len() <= max_len {
        return vec![text];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        // A limit smaller than one char must still make progress, even
        // if the chunk overshoots it.
        if end == start {
            end += 1;
            while !text.is_char_boundary(end) {
                end += 1;
            }
        }
        let break_at = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .map(|i| start + i + 1)
                .unwrap_or(end)
        } else {
            end
        };
        chunks.push(&text[start..break_at]);
        start = break_at;
    }

    chunks
}
