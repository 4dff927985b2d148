//! Conversation backend.
//!
//! Authenticates users, persists chat sessions and messages in libSQL,
//! forwards each turn to AI Core, and reports on the metadata AI Core
//! attaches to its replies.

pub mod auth;
pub mod channels;
pub mod config;
pub mod db;
pub mod error;
pub mod metadata;
pub mod service;
pub mod settings;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;
