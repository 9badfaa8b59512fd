//! Request and response types for the `identify` operation.

use serde::{Deserialize, Serialize};

use crate::{Error, Result, contact::ContactId};

/// The raw identifiers a caller supplied. Either field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifyRequest {
  pub email:        Option<String>,
  pub phone_number: Option<String>,
}

impl IdentifyRequest {
  pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Self {
    Self {
      email:        email.map(str::to_owned),
      phone_number: phone_number.map(str::to_owned),
    }
  }

  /// Drop empty values and reject a request that carries nothing.
  pub fn validate(self) -> Result<Identifiers> {
    let email = self.email.filter(|e| !e.is_empty());
    let phone_number = self.phone_number.filter(|p| !p.is_empty());
    if email.is_none() && phone_number.is_none() {
      return Err(Error::MissingIdentifier);
    }
    Ok(Identifiers { email, phone_number })
  }
}

/// A validated request: at least one field is present and non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifiers {
  email:        Option<String>,
  phone_number: Option<String>,
}

impl Identifiers {
  pub fn email(&self) -> Option<&str> { self.email.as_deref() }

  pub fn phone_number(&self) -> Option<&str> { self.phone_number.as_deref() }
}

/// The consolidated view of one customer cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedContact {
  pub primary_contact_id:    ContactId,
  /// Distinct emails, primary's first.
  #[serde(rename = "email")]
  pub emails:                Vec<String>,
  /// Distinct phone numbers, primary's first.
  #[serde(rename = "phoneNumber")]
  pub phone_numbers:         Vec<String>,
  pub secondary_contact_ids: Vec<ContactId>,
}

/// Wire envelope returned by `POST /identify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
  pub contact: ConsolidatedContact,
}
