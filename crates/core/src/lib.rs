//! Offline-first sync engine for field construction data.
//!
//! Writes land in a local store immediately and are replayed to the hosted
//! remote store through a durable outbox once connectivity allows.

pub mod config;
pub mod connectivity;
pub mod errors;
pub mod events;
pub mod sync;

pub use errors::{Error, Result};
