//! Handler for `POST /identify`.

use std::sync::Arc;

use axum::{Json, extract::State};
use serde::{Deserialize, Deserializer};
use tether_core::{
  identify::{IdentifyRequest, IdentifyResponse},
  reconcile,
  store::ContactStore,
};

use crate::error::ApiError;

/// JSON body accepted by `POST /identify`.
///
/// Clients commonly send the phone number as a JSON number; it is stored as
/// its decimal string.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyBody {
  #[serde(default)]
  pub email:        Option<String>,
  #[serde(default, deserialize_with = "string_or_number")]
  pub phone_number: Option<String>,
}

impl From<IdentifyBody> for IdentifyRequest {
  fn from(b: IdentifyBody) -> Self {
    IdentifyRequest { email: b.email, phone_number: b.phone_number }
  }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Raw {
    Text(String),
    Number(serde_json::Number),
  }

  Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
    Raw::Text(s) => s,
    Raw::Number(n) => n.to_string(),
  }))
}

/// `POST /identify` — reconcile the supplied identifiers and return the
/// consolidated cluster.
pub async fn handler<S>(
  State(store): State<Arc<S>>,
  Json(body): Json<IdentifyBody>,
) -> Result<Json<IdentifyResponse>, ApiError>
where
  S: ContactStore,
{
  let response = reconcile::identify(store.as_ref(), body.into()).await?;
  Ok(Json(response))
}
