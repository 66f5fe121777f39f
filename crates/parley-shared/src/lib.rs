//! Identifiers, phone-number canonicalization and constants shared by the
//! store and sync crates.

pub mod constants;
pub mod phone;
pub mod types;

pub use phone::canonicalize_phone;
pub use types::{ConversationId, MessageId, UserId};
