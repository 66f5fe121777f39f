//! # parley-store
//!
//! Local offline-first storage for the Parley messaging core, backed by
//! SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for messages,
//! per-participant conversation state, address-book contacts and the derived
//! conversation summaries. Opaque payloads (attachments, cipher info,
//! metadata) are serialized to JSON text at the mapping boundary and never
//! interpreted here.

pub mod contacts;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod participants;
pub mod summaries;

mod codec;
mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use messages::UpsertOutcome;
pub use models::*;
