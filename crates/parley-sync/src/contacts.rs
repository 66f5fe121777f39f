//! Address-book reconciliation.
//!
//! A pass diffs the device contacts against the cached table, applies the
//! removals, inserts and field updates, then asks the registration directory
//! which numbers belong to registered users. Results stream out as they are
//! known: cached registrations first, lookup confirmations as chunks return.
//! Whatever the lookup did not confirm is marked unregistered at the end of
//! the pass, including after a lookup failure.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use parley_shared::canonicalize_phone;
use parley_store::Contact;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::lookup::RegistrationLookupBridge;
use crate::store::{LocalStore, StoreChange};

/// A raw address-book entry as read from the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceContact {
    pub id: String,
    pub name: String,
    /// Phone number as typed by the user, any formatting.
    pub phone_no: String,
    pub description: Option<String>,
    pub photo: Option<String>,
}

impl DeviceContact {
    fn into_contact(self, phone_no: String) -> Contact {
        Contact {
            id: self.id,
            name: self.name,
            phone_no,
            description: self.description,
            photo: self.photo,
            is_registered: false,
            remote_uid: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSource {
    /// Registered according to the cache, emitted before any lookup.
    Cached,
    /// Confirmed by the registration lookup during this pass.
    Lookup,
}

/// A contact known to be registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCheck {
    pub contact: Contact,
    pub source: CheckSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub removed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub confirmed: usize,
    pub unconfirmed: usize,
    /// At least one lookup chunk failed; its numbers count as unconfirmed.
    pub lookup_failed: bool,
}

/// A pass running in the background.
pub struct ReconcilePass {
    pub checks: mpsc::UnboundedReceiver<ContactCheck>,
    pub report: JoinHandle<Result<ReconcileReport>>,
}

impl ReconcilePass {
    /// Wait for the pass to finish, discarding unread checks.
    pub async fn finish(self) -> Result<ReconcileReport> {
        self.report.await?
    }
}

#[derive(Clone)]
pub struct ContactReconciler {
    inner: Arc<ReconcilerInner>,
}

struct ReconcilerInner {
    store: LocalStore,
    lookup: Arc<dyn RegistrationLookupBridge>,
    batch_size: usize,
    concurrency: usize,
    default_country_code: Option<String>,
    pass: Mutex<()>,
}

impl ContactReconciler {
    pub fn new(
        store: LocalStore,
        lookup: Arc<dyn RegistrationLookupBridge>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ReconcilerInner {
                store,
                lookup,
                batch_size: config.lookup_batch_size.max(1),
                concurrency: config.lookup_concurrency.max(1),
                default_country_code: config.default_country_code.clone(),
                pass: Mutex::new(()),
            }),
        }
    }

    /// Run a pass on its own task. The pass completes, finalization included,
    /// even if the returned handle is dropped.
    pub fn start(&self, device_contacts: Vec<DeviceContact>) -> ReconcilePass {
        let (tx, checks) = mpsc::unbounded_channel();
        let reconciler = self.clone();
        let report = tokio::spawn(async move { reconciler.reconcile(device_contacts, &tx).await });
        ReconcilePass { checks, report }
    }

    /// Run one pass, sending registered contacts to `checks` as they become
    /// known. Passes on the same reconciler never overlap.
    pub async fn reconcile(
        &self,
        device_contacts: Vec<DeviceContact>,
        checks: &mpsc::UnboundedSender<ContactCheck>,
    ) -> Result<ReconcileReport> {
        let _pass = self.inner.pass.lock().await;
        let store = &self.inner.store;
        let now = Utc::now();
        let mut report = ReconcileReport::default();

        let device = index_device_contacts(
            device_contacts,
            self.inner.default_country_code.as_deref(),
        );
        let cached: HashMap<String, Contact> = store
            .with_db(|db| db.list_contacts())
            .await?
            .into_iter()
            .map(|c| (c.phone_no.clone(), c))
            .collect();

        // Diff
        let removals: Vec<String> = cached
            .keys()
            .filter(|phone| !device.contains_key(*phone))
            .cloned()
            .collect();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut emitted = HashSet::new();

        for (phone, contact) in &device {
            let Some(existing) = cached.get(phone) else {
                inserts.push(contact.clone());
                continue;
            };
            if device_fields_differ(existing, contact) {
                updates.push(contact.clone());
            }
            if existing.is_registered {
                emitted.insert(phone.clone());
                emit(
                    checks,
                    Contact {
                        is_registered: true,
                        remote_uid: existing.remote_uid.clone(),
                        ..contact.clone()
                    },
                    CheckSource::Cached,
                );
            }
        }

        report.removed = removals.len();
        report.inserted = inserts.len();
        report.updated = updates.len();

        if !(removals.is_empty() && inserts.is_empty() && updates.is_empty()) {
            store
                .with_db(|db| {
                    db.delete_contacts(&removals)?;
                    db.insert_contacts(&inserts, now)?;
                    db.update_contacts(&updates, now)
                })
                .await?;
            store.notify(StoreChange::Contacts);
        }

        // Lookup, in chunks
        let needs_validation: Vec<String> = device.keys().cloned().collect();
        let chunks: Vec<Vec<String>> = needs_validation
            .chunks(self.inner.batch_size)
            .map(<[String]>::to_vec)
            .collect();
        let mut outcomes = futures::stream::iter(chunks.into_iter().map(|chunk| {
            let lookup = Arc::clone(&self.inner.lookup);
            async move {
                let outcome = lookup.check_many(&chunk).await;
                (chunk, outcome)
            }
        }))
        .buffer_unordered(self.inner.concurrency);

        let mut confirmed: HashSet<String> = HashSet::new();
        while let Some((chunk, outcome)) = outcomes.next().await {
            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(batch = chunk.len(), error = %e, "registration lookup failed");
                    report.lookup_failed = true;
                    continue;
                }
            };
            for phone in &result.registered {
                if !chunk.contains(phone) || !confirmed.insert(phone.clone()) {
                    continue;
                }
                let uid = result.uid_for(phone).cloned();
                store
                    .with_db(|db| db.mark_contact_registered(phone, uid.as_ref(), now))
                    .await?;
                if emitted.insert(phone.clone()) {
                    if let Some(contact) = device.get(phone) {
                        emit(
                            checks,
                            Contact {
                                is_registered: true,
                                remote_uid: uid,
                                ..contact.clone()
                            },
                            CheckSource::Lookup,
                        );
                    }
                }
            }
        }

        // Finalize
        let unconfirmed: Vec<String> = needs_validation
            .into_iter()
            .filter(|phone| !confirmed.contains(phone))
            .collect();
        store
            .with_db(|db| db.mark_contacts_unregistered(&unconfirmed, now))
            .await?;
        store.notify(StoreChange::Contacts);

        report.confirmed = confirmed.len();
        report.unconfirmed = unconfirmed.len();
        tracing::info!(
            removed = report.removed,
            inserted = report.inserted,
            updated = report.updated,
            confirmed = report.confirmed,
            unconfirmed = report.unconfirmed,
            lookup_failed = report.lookup_failed,
            "contact reconciliation finished"
        );
        Ok(report)
    }
}

/// Canonicalize and de-duplicate device contacts. The first entry for a
/// number wins; entries without a usable number are dropped.
fn index_device_contacts(
    contacts: Vec<DeviceContact>,
    default_country_code: Option<&str>,
) -> BTreeMap<String, Contact> {
    let mut indexed = BTreeMap::new();
    for device_contact in contacts {
        let Some(phone) = canonicalize_phone(&device_contact.phone_no, default_country_code)
        else {
            tracing::debug!(contact = %device_contact.id, "skipping contact without phone number");
            continue;
        };
        if indexed.contains_key(&phone) {
            tracing::debug!(contact = %device_contact.id, "duplicate phone number ignored");
            continue;
        }
        indexed.insert(phone.clone(), device_contact.into_contact(phone));
    }
    indexed
}

fn device_fields_differ(cached: &Contact, device: &Contact) -> bool {
    cached.id != device.id
        || cached.name != device.name
        || cached.description != device.description
        || cached.photo != device.photo
}

fn emit(checks: &mpsc::UnboundedSender<ContactCheck>, contact: Contact, source: CheckSource) {
    // The caller may have stopped listening; the pass still runs to the end.
    let _ = checks.send(ContactCheck { contact, source });
}
