//! # aviary-memory
//!
//! Two stores with very different lifetimes:
//! - `consent` — durable per-user acceptance records, SQLite-backed.
//! - `session` — volatile per-(bot, user) dialogue history, in-memory.

pub mod consent;
pub mod session;

pub use consent::{ConsentRecord, ConsentStore};
pub use session::SessionStore;
