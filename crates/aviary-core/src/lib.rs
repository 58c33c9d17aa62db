//! # aviary-core
//!
//! Core types, traits, configuration, and error handling for the Aviary
//! webhook gateway.

pub mod config;
pub mod error;
pub mod traits;
pub mod turn;
