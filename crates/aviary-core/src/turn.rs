use serde::{Deserialize, Serialize};

/// Who produced a turn in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Wire-format role name as used by chat completion APIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message in a per-user dialogue history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A fully assembled prompt for one completion call.
///
/// Ephemeral: exists only for the duration of a single reply generation.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System instruction: persona text plus the length directive.
    pub system: String,
    /// Bounded history (oldest first) followed by the new user turn.
    pub turns: Vec<Turn>,
    pub temperature: f32,
    pub max_tokens: u32,
}
