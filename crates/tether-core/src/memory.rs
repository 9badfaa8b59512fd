//! In-memory [`ContactStore`] implementation for tests and embedding.
//!
//! A single mutex guards the table. A transaction runs against a snapshot of
//! the table while holding the lock, and the snapshot replaces the live table
//! only when the transaction succeeds.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use thiserror::Error;

use crate::{
  Invariant, Result,
  contact::{Contact, ContactId, LinkPrecedence, NewContact},
  store::{ContactStore, ContactTx},
};

#[derive(Debug, Error)]
pub enum MemoryError {
  #[error("contact table lock poisoned")]
  Poisoned,
}

#[derive(Debug, Clone, Default)]
struct Table {
  rows:    Vec<Contact>,
  last_id: ContactId,
}

impl Table {
  fn select(&self, pred: impl Fn(&Contact) -> bool) -> Vec<Contact> {
    let mut out: Vec<Contact> = self.rows.iter().filter(|c| pred(c)).cloned().collect();
    out.sort_by_key(Contact::age_key);
    out
  }
}

impl ContactTx for Table {
  fn find_matching(
    &mut self,
    email: Option<&str>,
    phone_number: Option<&str>,
  ) -> Result<Vec<Contact>> {
    Ok(self.select(|c| {
      (email.is_some() && c.email.as_deref() == email)
        || (phone_number.is_some() && c.phone_number.as_deref() == phone_number)
    }))
  }

  fn contacts_by_ids(&mut self, ids: &[ContactId]) -> Result<Vec<Contact>> {
    Ok(self.select(|c| ids.contains(&c.id)))
  }

  fn cluster(&mut self, primary_id: ContactId) -> Result<Vec<Contact>> {
    Ok(self.select(|c| c.id == primary_id || c.linked_id == Some(primary_id)))
  }

  fn insert(&mut self, contact: NewContact) -> Result<Contact> {
    self.last_id += 1;
    let row = contact.into_contact(self.last_id, Utc::now());
    self.rows.push(row.clone());
    Ok(row)
  }

  fn demote(&mut self, id: ContactId, primary_id: ContactId) -> Result<()> {
    let row = self
      .rows
      .iter_mut()
      .find(|c| c.id == id && c.is_primary())
      .ok_or(Invariant::DemotedNonPrimary(id))?;
    row.link_precedence = LinkPrecedence::Secondary;
    row.linked_id = Some(primary_id);
    row.updated_at = Utc::now();
    Ok(())
  }

  fn relink_secondaries(&mut self, from: ContactId, to: ContactId) -> Result<usize> {
    let now = Utc::now();
    let mut changed = 0;
    for row in self.rows.iter_mut().filter(|c| !c.is_primary() && c.linked_id == Some(from)) {
      row.linked_id = Some(to);
      row.updated_at = now;
      changed += 1;
    }
    Ok(changed)
  }
}

/// A contact store that lives entirely in process memory.
///
/// Cloning is cheap and clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
  table: Arc<Mutex<Table>>,
}

impl MemoryStore {
  pub fn new() -> Self { Self::default() }

  fn lock(&self) -> Result<MutexGuard<'_, Table>, MemoryError> {
    self.table.lock().map_err(|_| MemoryError::Poisoned)
  }
}

impl ContactStore for MemoryStore {
  type Error = MemoryError;

  async fn get_contact(&self, id: ContactId) -> Result<Option<Contact>, MemoryError> {
    Ok(self.lock()?.rows.iter().find(|c| c.id == id).cloned())
  }

  async fn list_contacts(&self) -> Result<Vec<Contact>, MemoryError> {
    Ok(self.lock()?.select(|_| true))
  }

  async fn transact<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&mut dyn ContactTx) -> Result<T> + Send + 'static,
  {
    let mut live = self.lock().map_err(crate::Error::store)?;
    let mut snapshot = live.clone();
    let out = f(&mut snapshot)?;
    *live = snapshot;
    Ok(out)
  }
}
