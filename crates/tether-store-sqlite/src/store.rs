//! [`SqliteStore`] — the SQLite implementation of [`ContactStore`].

use std::path::Path;

use chrono::Utc;
use rusqlite::{OptionalExtension as _, TransactionBehavior};
use tether_core::{
  Invariant,
  contact::{Contact, ContactId, LinkPrecedence, NewContact},
  store::{ContactStore, ContactTx},
};

use crate::{
  Result,
  encode::{
    CONTACT_COLUMNS, RawContact, decode_all, encode_dt, encode_precedence, storable,
  },
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Tether contact store backed by a single SQLite file.
///
/// Cloning is cheap — the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store — useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

/// Run `sql` and collect every row as a [`RawContact`].
fn select_raw(
  conn: &rusqlite::Connection,
  sql: &str,
  params: impl rusqlite::Params,
) -> rusqlite::Result<Vec<RawContact>> {
  let mut stmt = conn.prepare_cached(sql)?;
  stmt
    .query_map(params, RawContact::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()
}

// ─── Transaction ─────────────────────────────────────────────────────────────

/// A [`ContactTx`] over an open `BEGIN IMMEDIATE` transaction.
struct SqliteTx<'a> {
  conn: &'a rusqlite::Connection,
}

impl SqliteTx<'_> {
  fn select(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Contact>> {
    decode_all(select_raw(self.conn, sql, params)?)
  }
}

impl ContactTx for SqliteTx<'_> {
  fn find_matching(
    &mut self,
    email: Option<&str>,
    phone_number: Option<&str>,
  ) -> tether_core::Result<Vec<Contact>> {
    // `column = NULL` is never true, so an absent argument matches nothing.
    let sql = format!(
      "SELECT {CONTACT_COLUMNS} FROM contacts
       WHERE email = ?1 OR phone_number = ?2
       ORDER BY created_at, id"
    );
    Ok(self.select(&sql, rusqlite::params![email, phone_number])?)
  }

  fn contacts_by_ids(&mut self, ids: &[ContactId]) -> tether_core::Result<Vec<Contact>> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    let placeholders = (1..=ids.len())
      .map(|i| format!("?{i}"))
      .collect::<Vec<_>>()
      .join(", ");
    let sql = format!(
      "SELECT {CONTACT_COLUMNS} FROM contacts
       WHERE id IN ({placeholders})
       ORDER BY created_at, id"
    );
    Ok(self.select(&sql, rusqlite::params_from_iter(ids.iter()))?)
  }

  fn cluster(&mut self, primary_id: ContactId) -> tether_core::Result<Vec<Contact>> {
    let sql = format!(
      "SELECT {CONTACT_COLUMNS} FROM contacts
       WHERE id = ?1 OR linked_id = ?1
       ORDER BY created_at, id"
    );
    Ok(self.select(&sql, rusqlite::params![primary_id])?)
  }

  fn insert(&mut self, contact: NewContact) -> tether_core::Result<Contact> {
    let mut row = contact.into_contact(0, Utc::now());
    row.created_at = storable(row.created_at);
    row.updated_at = row.created_at;

    self
      .conn
      .execute(
        "INSERT INTO contacts (
           email, phone_number, linked_id, link_precedence, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
          row.email,
          row.phone_number,
          row.linked_id,
          encode_precedence(row.link_precedence),
          encode_dt(row.created_at),
          encode_dt(row.updated_at),
        ],
      )
      .map_err(crate::Error::from)?;
    row.id = self.conn.last_insert_rowid();
    Ok(row)
  }

  fn demote(&mut self, id: ContactId, primary_id: ContactId) -> tether_core::Result<()> {
    let changed = self
      .conn
      .execute(
        "UPDATE contacts
         SET link_precedence = ?3, linked_id = ?2, updated_at = ?5
         WHERE id = ?1 AND link_precedence = ?4",
        rusqlite::params![
          id,
          primary_id,
          encode_precedence(LinkPrecedence::Secondary),
          encode_precedence(LinkPrecedence::Primary),
          encode_dt(storable(Utc::now())),
        ],
      )
      .map_err(crate::Error::from)?;
    if changed == 0 {
      return Err(Invariant::DemotedNonPrimary(id).into());
    }
    Ok(())
  }

  fn relink_secondaries(
    &mut self,
    from: ContactId,
    to: ContactId,
  ) -> tether_core::Result<usize> {
    let changed = self
      .conn
      .execute(
        "UPDATE contacts
         SET linked_id = ?2, updated_at = ?4
         WHERE linked_id = ?1 AND link_precedence = ?3",
        rusqlite::params![
          from,
          to,
          encode_precedence(LinkPrecedence::Secondary),
          encode_dt(storable(Utc::now())),
        ],
      )
      .map_err(crate::Error::from)?;
    Ok(changed)
  }
}

// ─── ContactStore impl ───────────────────────────────────────────────────────

impl ContactStore for SqliteStore {
  type Error = crate::Error;

  async fn get_contact(&self, id: ContactId) -> Result<Option<Contact>> {
    let raw: Option<RawContact> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
            rusqlite::params![id],
            RawContact::from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawContact::into_contact).transpose()
  }

  async fn list_contacts(&self) -> Result<Vec<Contact>> {
    let raws = self
      .conn
      .call(|conn| {
        Ok(select_raw(
          conn,
          &format!("SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY created_at, id"),
          [],
        )?)
      })
      .await?;

    decode_all(raws)
  }

  /// Runs `f` on the connection thread inside `BEGIN IMMEDIATE`, which takes
  /// the database write lock before the first read. Concurrent
  /// reconciliations are therefore serialised.
  async fn transact<T, F>(&self, f: F) -> tether_core::Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&mut dyn ContactTx) -> tether_core::Result<T> + Send + 'static,
  {
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = f(&mut SqliteTx { conn: &tx });
        // Dropping an uncommitted transaction rolls it back.
        if outcome.is_ok() {
          tx.commit()?;
        }
        Ok(outcome)
      })
      .await
      .map_err(|e| tether_core::Error::from(crate::Error::from(e)))?
  }
}
