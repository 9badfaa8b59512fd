//! The `ContactStore` and `ContactTx` traits.
//!
//! Storage backends (e.g. `tether-store-sqlite`, [`crate::memory`]) implement
//! both. The reconciliation engine only ever talks to a [`ContactTx`], handed
//! to it by [`ContactStore::transact`], so every read that informs a decision
//! and every write that follows commit or roll back together.

use std::future::Future;

use crate::{
  Result,
  contact::{Contact, ContactId, NewContact},
};

// ─── Transaction ─────────────────────────────────────────────────────────────

/// Operations available inside one store transaction.
///
/// Every method that returns several contacts orders them by `created_at`
/// ascending, ties broken by `id` ascending.
pub trait ContactTx {
  /// All contacts whose email equals `email` or whose phone number equals
  /// `phone_number`. A `None` argument matches nothing.
  fn find_matching(
    &mut self,
    email: Option<&str>,
    phone_number: Option<&str>,
  ) -> Result<Vec<Contact>>;

  /// The contacts with the given ids, whatever their precedence.
  fn contacts_by_ids(&mut self, ids: &[ContactId]) -> Result<Vec<Contact>>;

  /// `primary_id` itself plus every contact whose `linked_id` equals it.
  fn cluster(&mut self, primary_id: ContactId) -> Result<Vec<Contact>>;

  /// Persist a new contact and return it with its assigned id.
  fn insert(&mut self, contact: NewContact) -> Result<Contact>;

  /// Turn the primary `id` into a secondary of `primary_id`.
  ///
  /// Fails with [`Invariant::DemotedNonPrimary`](crate::Invariant) if `id` is
  /// missing or already secondary.
  fn demote(&mut self, id: ContactId, primary_id: ContactId) -> Result<()>;

  /// Re-point every secondary linked to `from` at `to`. Returns the number of
  /// contacts changed.
  fn relink_secondaries(&mut self, from: ContactId, to: ContactId) -> Result<usize>;
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// Abstraction over a Tether contact store backend.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes (e.g. tokio with `axum`).
pub trait ContactStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Retrieve a contact by id. Returns `None` if not found.
  fn get_contact(
    &self,
    id: ContactId,
  ) -> impl Future<Output = Result<Option<Contact>, Self::Error>> + Send + '_;

  /// List every stored contact, oldest first.
  fn list_contacts(
    &self,
  ) -> impl Future<Output = Result<Vec<Contact>, Self::Error>> + Send + '_;

  /// Run `f` inside one atomic transaction.
  ///
  /// The transaction commits if `f` returns `Ok` and rolls back otherwise;
  /// either way it is finished before the returned future resolves.
  /// Backend failures surface as [`Error::Store`](crate::Error::Store).
  fn transact<T, F>(&self, f: F) -> impl Future<Output = Result<T>> + Send + '_
  where
    T: Send + 'static,
    F: FnOnce(&mut dyn ContactTx) -> Result<T> + Send + 'static;
}
