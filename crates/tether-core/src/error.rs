//! Error types for `tether-core`.
//!
//! Callers distinguish user mistakes from internal failures by variant, never
//! by message text. See [`Error::is_user_error`].

use thiserror::Error;

use crate::contact::ContactId;

#[derive(Debug, Error)]
pub enum Error {
  /// Neither an email nor a phone number was supplied.
  #[error("either email or phoneNumber must be provided")]
  MissingIdentifier,

  /// Stored state contradicts the cluster invariants. Always fatal.
  #[error("invariant violation: {0}")]
  Invariant(#[from] Invariant),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
  /// Wrap a backend failure.
  pub fn store(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
    Self::Store(e.into())
  }

  /// `true` if the caller supplied bad input, `false` for internal failures.
  pub fn is_user_error(&self) -> bool { matches!(self, Self::MissingIdentifier) }
}

/// The ways stored contacts can contradict the single-primary model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Invariant {
  #[error("matched contacts {0:?} resolve to no primary contact")]
  UnresolvedPrimary(Vec<ContactId>),

  #[error("cluster of contact {0} has no primary contact")]
  ClusterWithoutPrimary(ContactId),

  #[error("link chain starting at contact {0} never reaches a primary contact")]
  BrokenLinkChain(ContactId),

  #[error("contact {0} cannot be demoted: it is not a primary contact")]
  DemotedNonPrimary(ContactId),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
