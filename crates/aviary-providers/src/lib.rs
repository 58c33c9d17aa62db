//! # aviary-providers
//!
//! Completion-service clients behind the `Completion` trait.

pub mod openai;

pub use openai::OpenAiCompletion;
