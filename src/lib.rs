#![forbid(unsafe_code)]

//! Host-side engine for the Agent Client Protocol.
//!
//! Drives an external agent process over newline-delimited JSON-RPC: the
//! initialization handshake, session creation, prompting with streamed
//! updates, cancellation, and answering permission requests the agent
//! raises mid-turn.

pub mod acp;
pub mod config;
pub mod driver;
pub mod errors;
pub mod retry;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
