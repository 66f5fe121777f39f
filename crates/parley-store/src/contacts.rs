//! Address-book contacts keyed by canonical phone number.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use parley_shared::UserId;

use crate::codec::millis;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Contact;

const CONTACT_COLUMNS: &str = "phone_no, id, name, description, photo, is_registered, remote_uid";

impl Database {
    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// All cached contacts, ordered by name.
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY name ASC, phone_no ASC");
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([], row_to_contact)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn get_contact(&self, phone_no: &str) -> Result<Option<Contact>> {
        let sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE phone_no = ?1");
        let row = self
            .conn()
            .query_row(&sql, params![phone_no], row_to_contact)
            .optional()?;
        Ok(row)
    }

    /// The contact whose number was confirmed to belong to `uid`.
    pub fn contact_by_remote_uid(&self, uid: &UserId) -> Result<Option<Contact>> {
        let sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE remote_uid = ?1 LIMIT 1");
        let row = self
            .conn()
            .query_row(&sql, params![uid.as_str()], row_to_contact)
            .optional()?;
        Ok(row)
    }

    // ------------------------------------------------------------------
    // Batch writes
    // ------------------------------------------------------------------

    /// Insert a batch of contacts in one transaction.
    pub fn insert_contacts(&mut self, contacts: &[Contact], now: DateTime<Utc>) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;
        let mut written = 0;
        for c in contacts {
            written += tx.execute(
                "INSERT OR REPLACE INTO contacts
                 (phone_no, id, name, description, photo, is_registered, remote_uid, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    c.phone_no,
                    c.id,
                    c.name,
                    c.description,
                    c.photo,
                    c.is_registered as i32,
                    c.remote_uid.as_ref().map(|u| u.as_str()),
                    millis(&now),
                ],
            )?;
        }
        tx.commit()?;
        Ok(written)
    }

    /// Rewrite the device-sourced fields (id, name, description, photo) of
    /// existing contacts. Registration state is not touched.
    pub fn update_contacts(&mut self, contacts: &[Contact], now: DateTime<Utc>) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;
        let mut written = 0;
        for c in contacts {
            written += tx.execute(
                "UPDATE contacts
                 SET id = ?2, name = ?3, description = ?4, photo = ?5, updated_at = ?6
                 WHERE phone_no = ?1",
                params![
                    c.phone_no,
                    c.id,
                    c.name,
                    c.description,
                    c.photo,
                    millis(&now),
                ],
            )?;
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn delete_contacts(&mut self, phone_nos: &[String]) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;
        let mut removed = 0;
        for phone in phone_nos {
            removed += tx.execute("DELETE FROM contacts WHERE phone_no = ?1", params![phone])?;
        }
        tx.commit()?;
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Registration state
    // ------------------------------------------------------------------

    /// Record a confirmed registration. Returns `false` if the number is not
    /// cached.
    pub fn mark_contact_registered(
        &self,
        phone_no: &str,
        remote_uid: Option<&UserId>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE contacts SET is_registered = 1, remote_uid = ?2, updated_at = ?3
             WHERE phone_no = ?1",
            params![phone_no, remote_uid.map(|u| u.as_str()), millis(&now)],
        )?;
        Ok(affected > 0)
    }

    /// Mark a batch of numbers as not registered and forget their uid.
    pub fn mark_contacts_unregistered(
        &mut self,
        phone_nos: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;
        let mut written = 0;
        for phone in phone_nos {
            written += tx.execute(
                "UPDATE contacts SET is_registered = 0, remote_uid = NULL, updated_at = ?2
                 WHERE phone_no = ?1",
                params![phone, millis(&now)],
            )?;
        }
        tx.commit()?;
        Ok(written)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Contact`].
fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        phone_no: row.get(0)?,
        id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        photo: row.get(4)?,
        is_registered: row.get::<_, i32>(5)? != 0,
        remote_uid: row.get::<_, Option<String>>(6)?.map(UserId),
    })
}
