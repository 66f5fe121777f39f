//! # parley-sync
//!
//! Reconciliation of the local conversation store against a remote source
//! of truth.
//!
//! * [`MessageSyncEngine`] owns the outgoing message lifecycle
//!   (SENDING -> SENT / ERROR), mirrors live remote events into the local
//!   store, runs catch-up pulls and publishes conversation summaries.
//! * [`ContactReconciler`] diffs the device address book against the cached
//!   contacts and confirms registrations through a remote lookup.
//!
//! The remote side is reached only through the [`RemoteMessageBridge`] and
//! [`RegistrationLookupBridge`] traits; the local side only through a
//! [`LocalStore`] handle passed in at construction.

pub mod bridge;
pub mod config;
pub mod contacts;
pub mod engine;
pub mod error;
pub mod lookup;
pub mod memory;
pub mod participants;
pub mod store;
pub mod subscription;
pub mod telemetry;

mod live;

pub use bridge::{ReceiptKind, RemoteEvent, RemoteMessage, RemoteMessageBridge, WriteAck};
pub use config::SyncConfig;
pub use contacts::{
    CheckSource, ContactCheck, ContactReconciler, DeviceContact, ReconcilePass, ReconcileReport,
};
pub use engine::MessageSyncEngine;
pub use error::{BridgeError, Result, SyncError};
pub use lookup::{LookupResult, RegistrationLookupBridge};
pub use participants::ParticipantStateStore;
pub use store::{LocalStore, StoreChange};
pub use subscription::Subscription;
