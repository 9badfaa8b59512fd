//! Contact — the sole stored entity.
//!
//! A contact is one observed combination of email and phone number. Contacts
//! belonging to the same customer form a cluster: exactly one primary plus any
//! number of secondaries whose `linked_id` names that primary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned contact identifier.
pub type ContactId = i64;

/// Whether a contact is the canonical record of its cluster.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
  strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LinkPrecedence {
  Primary,
  Secondary,
}

/// A persisted contact row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
  pub id:              ContactId,
  pub email:           Option<String>,
  pub phone_number:    Option<String>,
  /// Present iff `link_precedence` is [`LinkPrecedence::Secondary`].
  pub linked_id:       Option<ContactId>,
  pub link_precedence: LinkPrecedence,
  pub created_at:      DateTime<Utc>,
  pub updated_at:      DateTime<Utc>,
}

impl Contact {
  pub fn is_primary(&self) -> bool {
    self.link_precedence == LinkPrecedence::Primary
  }

  /// The id of the primary this contact belongs to: its own id when it is a
  /// primary, otherwise the contact it links to.
  pub fn owner_id(&self) -> ContactId {
    match self.link_precedence {
      LinkPrecedence::Primary => self.id,
      LinkPrecedence::Secondary => self.linked_id.unwrap_or(self.id),
    }
  }

  /// Ordering key used everywhere contacts are listed: oldest first, ties
  /// broken by id.
  pub fn age_key(&self) -> (DateTime<Utc>, ContactId) { (self.created_at, self.id) }
}

/// Input to [`ContactTx::insert`](crate::store::ContactTx::insert). The store
/// assigns the id and, unless `created_at` is set, the timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
  pub email:        Option<String>,
  pub phone_number: Option<String>,
  /// `None` creates a primary; `Some(id)` creates a secondary of `id`.
  pub linked_id:    Option<ContactId>,
  /// Overrides the creation time. Used when importing historical records.
  pub created_at:   Option<DateTime<Utc>>,
}

impl NewContact {
  pub fn primary(email: Option<String>, phone_number: Option<String>) -> Self {
    Self { email, phone_number, linked_id: None, created_at: None }
  }

  pub fn secondary(
    email: Option<String>,
    phone_number: Option<String>,
    primary_id: ContactId,
  ) -> Self {
    Self { email, phone_number, linked_id: Some(primary_id), created_at: None }
  }

  pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
    self.created_at = Some(at);
    self
  }

  pub fn link_precedence(&self) -> LinkPrecedence {
    if self.linked_id.is_some() {
      LinkPrecedence::Secondary
    } else {
      LinkPrecedence::Primary
    }
  }

  /// Materialise the row a store would persist for this input.
  pub fn into_contact(self, id: ContactId, now: DateTime<Utc>) -> Contact {
    let link_precedence = self.link_precedence();
    let created_at = self.created_at.unwrap_or(now);
    Contact {
      id,
      email: self.email,
      phone_number: self.phone_number,
      linked_id: self.linked_id,
      link_precedence,
      created_at,
      updated_at: created_at,
    }
  }
}
