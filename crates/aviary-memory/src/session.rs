//! Volatile per-(bot, user) dialogue history.
//!
//! Each key maps to its own mutex-guarded turn list, so appends for one
//! user serialize while distinct users (and distinct bots) never contend.
//! Everything here is lost on restart by design.

use aviary_core::turn::Turn;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

type SessionKey = (String, i64);
type Entry = Arc<Mutex<Vec<Turn>>>;

/// In-memory session state for every (bot, user) pair.
pub struct SessionStore {
    /// History keeps at most `2 * max_turns` entries per key.
    max_turns: usize,
    entries: Mutex<HashMap<SessionKey, Entry>>,
}

impl SessionStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get-or-create the guarded entry for a key. The map lock is held
    /// only for the lookup, never across an append.
    async fn entry(&self, bot_id: &str, user_id: i64) -> Entry {
        let mut entries = self.entries.lock().await;
        entries
            .entry((bot_id.to_string(), user_id))
            .or_default()
            .clone()
    }

    /// Snapshot of the history, oldest first. Empty for unseen keys.
    pub async fn history(&self, bot_id: &str, user_id: i64) -> Vec<Turn> {
        let entry = self.entry(bot_id, user_id).await;
        let turns = entry.lock().await;
        turns.clone()
    }

    /// Append one turn, dropping the oldest entries past the bound.
    pub async fn append_turn(&self, bot_id: &str, user_id: i64, turn: Turn) {
        let entry = self.entry(bot_id, user_id).await;
        let mut turns = entry.lock().await;
        turns.push(turn);
        Self::trim(&mut turns, self.max_turns * 2);
    }

    /// Append a user/assistant pair under one lock so the pair can never
    /// interleave with a concurrent exchange for the same key.
    pub async fn append_exchange(&self, bot_id: &str, user_id: i64, user: Turn, assistant: Turn) {
        let entry = self.entry(bot_id, user_id).await;
        let mut turns = entry.lock().await;
        turns.push(user);
        turns.push(assistant);
        Self::trim(&mut turns, self.max_turns * 2);
    }

    /// Clear the history for a key. Idempotent.
    pub async fn reset(&self, bot_id: &str, user_id: i64) {
        let mut entries = self.entries.lock().await;
        entries.remove(&(bot_id.to_string(), user_id));
    }

    fn trim(turns: &mut Vec<Turn>, cap: usize) {
        if turns.len() > cap {
            let overflow = turns.len() - cap;
            turns.drain(..overflow);
        }
    }
}
