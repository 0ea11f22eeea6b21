//! # wabot-core
//!
//! Core types, configuration, and error handling for the wabot assistant.

pub mod config;
pub mod error;
pub mod turn;

pub use config::shellexpand;
