//! Bot registry — maps a lowercased bot id to its credentials, webhook
//! secret, and the handler pipeline materialized at registration.
//!
//! Populated once at startup and read-only thereafter, so lookups need
//! no locking.

use aviary_core::error::AviaryError;
use aviary_telegram::{types::Update, TelegramApi};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One hosted bot: config-derived identity plus its running pipeline.
pub struct BotEntry {
    /// Lowercased, unique within the process.
    pub id: String,
    /// Per-bot webhook secret compared against the request header.
    pub secret: String,
    /// The bot's own view of the Telegram API (used for webhook
    /// registration and teardown).
    pub api: Arc<TelegramApi>,
    /// Inbound side of the bot's handler pipeline.
    pub queue: mpsc::Sender<Update>,
}

/// Registry of all bots hosted by this process.
#[derive(Default)]
pub struct BotRegistry {
    bots: HashMap<String, BotEntry>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bot. The id is normalized to lowercase; a
    /// case-insensitive collision is an error.
    pub fn register(&mut self, mut entry: BotEntry) -> Result<(), AviaryError> {
        entry.id = entry.id.to_lowercase();
        if self.bots.contains_key(&entry.id) {
            return Err(AviaryError::DuplicateBot(entry.id));
        }
        self.bots.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Look up a bot by its (already lowercased) id.
    pub fn lookup(&self, id: &str) -> Option<&BotEntry> {
        self.bots.get(id)
    }

    /// Sorted, lowercased ids of every registered bot.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.bots.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn entries(&self) -> impl Iterator<Item = &BotEntry> {
        self.bots.values()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }
}
