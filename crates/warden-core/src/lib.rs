//! Core runtime for the Warden chat bot.
//!
//! This crate is transport-agnostic. The chat platform lives behind [`chat::ChatPort`]
//! and the relational store behind [`persistence::Store`]; adapter crates implement
//! both.

pub mod automod;
pub mod chat;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod persistence;
pub mod resilience;
pub mod runtime;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use errors::{Error, Result};
