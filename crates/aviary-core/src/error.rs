use thiserror::Error;

/// Top-level error type for Aviary.
#[derive(Debug, Error)]
pub enum AviaryError {
    /// A bot id was registered twice (case-insensitively).
    #[error("duplicate bot id: {0}")]
    DuplicateBot(String),

    /// Error talking to the Telegram Bot API.
    #[error("telegram error: {0}")]
    Telegram(String),

    /// Error from the completion service.
    #[error("completion error: {0}")]
    Completion(String),

    /// Consent store error.
    #[error("consent error: {0}")]
    Consent(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),
}
