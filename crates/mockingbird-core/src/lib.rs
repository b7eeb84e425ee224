//! Core types, config, errors, wire protocol, and conversation model for mockingbird.

pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transcript_store;
pub mod types;
