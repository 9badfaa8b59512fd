//! JSON REST API for Tether.
//!
//! Exposes an axum [`Router`] backed by any [`tether_core::store::ContactStore`].
//! Transport, tracing layers and process wiring are the caller's
//! responsibility.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/identify` | Body: `{"email":..., "phoneNumber":...}` |
//! | `GET`  | `/contacts` | Every stored contact, oldest first |
//! | `GET`  | `/contacts/{id}` | 404 if not found |

pub mod contacts;
pub mod error;
pub mod identify;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post},
};
use tether_core::store::ContactStore;

pub use error::ApiError;

/// Build the API router for `store`.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<S>(store: Arc<S>) -> Router<()>
where
  S: ContactStore + 'static,
{
  Router::new()
    .route("/identify", post(identify::handler::<S>))
    .route("/contacts", get(contacts::list::<S>))
    .route("/contacts/{id}", get(contacts::get_one::<S>))
    .with_state(store)
}
