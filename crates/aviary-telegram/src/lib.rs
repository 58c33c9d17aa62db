//! # aviary-telegram
//!
//! Telegram Bot API transport: update envelope types, outbound sends,
//! webhook registration, and channel-membership lookups.
//! Docs: <https://core.telegram.org/bots/api>

pub mod api;
pub mod types;

pub use api::TelegramApi;
pub use types::{CallbackQuery, Chat, ChatMember, Message, Update, User};
