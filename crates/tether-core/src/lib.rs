//! Core types and the identity-reconciliation engine for Tether.
//!
//! This crate is deliberately free of HTTP and database dependencies.
//! Storage backends implement [`store::ContactStore`]; the HTTP layer calls
//! [`reconcile::identify`].

pub mod contact;
pub mod error;
pub mod identify;
pub mod memory;
pub mod reconcile;
pub mod store;

pub use error::{Error, Invariant, Result};
