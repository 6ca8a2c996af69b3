//! Conversation orchestration.
//!
//! A [`SessionClient`] owns one transport and writes into a shared
//! [`crate::store::EventStore`]. Each `start` runs a turn on its own task with a
//! turn-level retry loop; the client's [`SessionState`] is published on a watch
//! channel for UI consumers.

mod client;
mod state;

pub use client::{SessionClient, TurnHandle};
pub use state::{SessionState, TurnReport};
