//! The identity-reconciliation engine.
//!
//! One call to [`identify`] runs four steps inside a single store
//! transaction:
//!
//! 1. **Matching**: every contact sharing the supplied email or phone number.
//! 2. **Cluster resolution**: the primaries those contacts belong to, oldest
//!    first. The oldest is canonical.
//! 3. **Merge**: demote the other primaries under the canonical one, and
//!    record a new contact if the request carries an unseen email or phone
//!    number (a primary when nothing matched, a secondary otherwise).
//! 4. **Consolidation**: re-read the cluster and flatten it into a
//!    [`ConsolidatedContact`].

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::{
  Invariant, Result,
  contact::{Contact, ContactId, NewContact},
  identify::{ConsolidatedContact, IdentifyRequest, IdentifyResponse, Identifiers},
  store::{ContactStore, ContactTx},
};

/// Validate `request`, reconcile it against `store` and return the
/// consolidated cluster.
///
/// Input errors are reported before the store is touched.
pub async fn identify<S: ContactStore>(
  store: &S,
  request: IdentifyRequest,
) -> Result<IdentifyResponse> {
  let identifiers = request.validate()?;
  let contact = store.transact(move |tx| reconcile(tx, &identifiers)).await?;
  Ok(IdentifyResponse { contact })
}

/// Run the reconciliation steps against an open transaction.
pub fn reconcile(tx: &mut dyn ContactTx, ids: &Identifiers) -> Result<ConsolidatedContact> {
  let matched = tx.find_matching(ids.email(), ids.phone_number())?;
  debug!(matched = matched.len(), "matched existing contacts");

  if matched.is_empty() {
    let created = tx.insert(NewContact::primary(
      ids.email().map(str::to_owned),
      ids.phone_number().map(str::to_owned),
    ))?;
    info!(contact_id = created.id, "created primary contact");
    return consolidate(created.id, &[created]);
  }

  let resolution = resolve_cluster(tx, &matched)?;
  let canonical = resolution.canonical.id;

  for other in &resolution.absorbed {
    tx.demote(other.id, canonical)?;
    let moved = tx.relink_secondaries(other.id, canonical)?;
    info!(
      primary_id = canonical,
      demoted_id = other.id,
      relinked = moved,
      "merged clusters"
    );
  }
  for stale in &resolution.stale_links {
    tx.relink_secondaries(*stale, canonical)?;
  }

  if carries_new_information(&matched, ids) {
    let created = tx.insert(NewContact::secondary(
      ids.email().map(str::to_owned),
      ids.phone_number().map(str::to_owned),
      canonical,
    ))?;
    info!(contact_id = created.id, primary_id = canonical, "created secondary contact");
  }

  let cluster = tx.cluster(canonical)?;
  consolidate(canonical, &cluster)
}

// ─── Cluster resolution ──────────────────────────────────────────────────────

/// The primaries competing for one request.
#[derive(Debug)]
struct Resolution {
  /// The oldest primary; survives the merge.
  canonical:   Contact,
  /// Younger primaries, oldest first; demoted by the merge.
  absorbed:    Vec<Contact>,
  /// Secondaries found in the middle of a link chain. Anything still linked
  /// to them is re-pointed at the canonical primary.
  stale_links: Vec<ContactId>,
}

fn resolve_cluster(tx: &mut dyn ContactTx, matched: &[Contact]) -> Result<Resolution> {
  let mut frontier: Vec<ContactId> = matched
    .iter()
    .map(Contact::owner_id)
    .collect::<BTreeSet<_>>()
    .into_iter()
    .collect();
  let mut visited = BTreeSet::new();
  let mut primaries: Vec<Contact> = Vec::new();
  // Every secondary met on the way, with the contact it links to.
  let mut links: BTreeMap<ContactId, Option<ContactId>> = BTreeMap::new();

  // Normally one round. Further rounds only happen for secondaries that still
  // point at a contact demoted before re-linking existed.
  while !frontier.is_empty() {
    visited.extend(frontier.iter().copied());
    let (found, linked): (Vec<_>, Vec<_>) = tx
      .contacts_by_ids(&frontier)?
      .into_iter()
      .partition(Contact::is_primary);
    primaries.extend(found);

    let mut next = BTreeSet::new();
    for contact in linked {
      if let Some(id) = contact.linked_id
        && !visited.contains(&id)
      {
        next.insert(id);
      }
      links.insert(contact.id, contact.linked_id);
    }
    frontier = next.into_iter().collect();
  }

  // Each chain must end at a primary within as many hops as there are
  // secondaries; anything longer loops.
  let primary_ids: BTreeSet<ContactId> = primaries.iter().map(|p| p.id).collect();
  for &start in links.keys() {
    let mut at = start;
    let mut hops = 0;
    while !primary_ids.contains(&at) {
      match links.get(&at).copied().flatten() {
        Some(next) if hops < links.len() => {
          at = next;
          hops += 1;
        }
        _ => return Err(Invariant::BrokenLinkChain(start).into()),
      }
    }
  }
  let stale_links: Vec<ContactId> = links.into_keys().collect();

  primaries.sort_by_key(Contact::age_key);
  let mut primaries = primaries.into_iter();
  let canonical = primaries.next().ok_or_else(|| {
    Invariant::UnresolvedPrimary(matched.iter().map(|c| c.id).collect())
  })?;
  let absorbed: Vec<Contact> = primaries.collect();

  debug!(
    primary_id = canonical.id,
    competing = absorbed.len() + 1,
    "resolved canonical primary"
  );
  Ok(Resolution { canonical, absorbed, stale_links })
}

// ─── Merge ───────────────────────────────────────────────────────────────────

/// `true` if the supplied email or phone number appears on none of the
/// matched contacts.
fn carries_new_information(matched: &[Contact], ids: &Identifiers) -> bool {
  let email_is_new = ids
    .email()
    .is_some_and(|e| matched.iter().all(|c| c.email.as_deref() != Some(e)));
  let phone_is_new = ids
    .phone_number()
    .is_some_and(|p| matched.iter().all(|c| c.phone_number.as_deref() != Some(p)));
  email_is_new || phone_is_new
}

// ─── Consolidation ───────────────────────────────────────────────────────────

/// Flatten a cluster (ordered oldest first) into its consolidated view. The
/// primary's values always lead the lists.
pub fn consolidate(primary_id: ContactId, cluster: &[Contact]) -> Result<ConsolidatedContact> {
  let primary = cluster
    .iter()
    .find(|c| c.is_primary())
    .ok_or(Invariant::ClusterWithoutPrimary(primary_id))?;
  let secondaries: Vec<&Contact> = cluster.iter().filter(|c| !c.is_primary()).collect();
  let members = || std::iter::once(primary).chain(secondaries.iter().copied());

  Ok(ConsolidatedContact {
    primary_contact_id:    primary.id,
    emails:                distinct(members().map(|c| c.email.as_deref())),
    phone_numbers:         distinct(members().map(|c| c.phone_number.as_deref())),
    secondary_contact_ids: secondaries.iter().map(|c| c.id).collect(),
  })
}

/// Non-empty values in first-occurrence order.
fn distinct<'a>(values: impl Iterator<Item = Option<&'a str>>) -> Vec<String> {
  let mut seen = BTreeSet::new();
  values
    .flatten()
    .filter(|v| !v.is_empty() && seen.insert(*v))
    .map(str::to_owned)
    .collect()
}

#[cfg(test)]
mod tests {
  use chrono::{Duration, TimeZone, Utc};

  use super::*;
  use crate::{Error, contact::LinkPrecedence, memory::MemoryStore};

  fn req(email: Option<&str>, phone: Option<&str>) -> IdentifyRequest {
    IdentifyRequest::new(email, phone)
  }

  /// Insert `contact` directly, bypassing reconciliation.
  async fn seed(store: &MemoryStore, contact: NewContact) -> Contact {
    store.transact(move |tx| tx.insert(contact)).await.unwrap()
  }

  fn at(minutes: i64) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 4, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
  }

  fn some(s: &str) -> Option<String> { Some(s.to_owned()) }

  // ── No match ──────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn no_match_creates_single_primary() {
    let store = MemoryStore::new();
    let resp = identify(&store, req(Some("new@x.com"), Some("999"))).await.unwrap();

    let all = store.list_contacts().await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].is_primary());
    assert_eq!(all[0].linked_id, None);
    assert_eq!(resp.contact.primary_contact_id, all[0].id);
    assert_eq!(resp.contact.emails, vec!["new@x.com"]);
    assert_eq!(resp.contact.phone_numbers, vec!["999"]);
    assert!(resp.contact.secondary_contact_ids.is_empty());
  }

  #[tokio::test]
  async fn missing_identifiers_never_reach_the_store() {
    let store = MemoryStore::new();
    let err = identify(&store, req(None, None)).await.unwrap_err();
    assert!(matches!(err, Error::MissingIdentifier));
    assert!(store.list_contacts().await.unwrap().is_empty());
  }

  // ── Single primary ────────────────────────────────────────────────────────

  #[tokio::test]
  async fn new_phone_creates_one_secondary() {
    let store = MemoryStore::new();
    let primary = seed(&store, NewContact::primary(some("a@x.com"), None)).await;

    let resp = identify(&store, req(Some("a@x.com"), Some("555"))).await.unwrap();

    let all = store.list_contacts().await.unwrap();
    assert_eq!(all.len(), 2);
    let secondary = &all[1];
    assert_eq!(secondary.link_precedence, LinkPrecedence::Secondary);
    assert_eq!(secondary.linked_id, Some(primary.id));
    assert_eq!(resp.contact.primary_contact_id, primary.id);
    assert_eq!(resp.contact.emails, vec!["a@x.com"]);
    assert_eq!(resp.contact.phone_numbers, vec!["555"]);
    assert_eq!(resp.contact.secondary_contact_ids, vec![secondary.id]);
  }

  #[tokio::test]
  async fn repeated_request_is_idempotent() {
    let store = MemoryStore::new();
    let first = identify(&store, req(Some("a@x.com"), Some("555"))).await.unwrap();
    let second = identify(&store, req(Some("a@x.com"), Some("555"))).await.unwrap();
    let third = identify(&store, req(Some("a@x.com"), None)).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first, third);
    assert_eq!(store.list_contacts().await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn known_fields_spread_over_cluster_create_nothing() {
    let store = MemoryStore::new();
    let p = seed(&store, NewContact::primary(some("a@x.com"), some("111"))).await;
    seed(&store, NewContact::secondary(some("b@x.com"), some("111"), p.id)).await;

    let resp = identify(&store, req(Some("b@x.com"), Some("111"))).await.unwrap();
    assert_eq!(store.list_contacts().await.unwrap().len(), 2);
    assert_eq!(resp.contact.primary_contact_id, p.id);
    assert_eq!(resp.contact.emails, vec!["a@x.com", "b@x.com"]);
    assert_eq!(resp.contact.phone_numbers, vec!["111"]);
  }

  #[tokio::test]
  async fn match_through_secondary_resolves_to_its_primary() {
    let store = MemoryStore::new();
    let p = seed(&store, NewContact::primary(some("a@x.com"), some("111"))).await;
    let s = seed(&store, NewContact::secondary(some("b@x.com"), some("111"), p.id)).await;

    let resp = identify(&store, req(Some("b@x.com"), None)).await.unwrap();
    assert_eq!(resp.contact.primary_contact_id, p.id);
    assert_eq!(resp.contact.secondary_contact_ids, vec![s.id]);
  }

  // ── Merge ─────────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn two_primaries_merge_under_the_oldest() {
    let store = MemoryStore::new();
    let a = seed(&store, NewContact::primary(some("a@x.com"), None).created_at(at(0))).await;
    let b = seed(&store, NewContact::primary(None, some("555")).created_at(at(5))).await;

    let resp = identify(&store, req(Some("a@x.com"), Some("555"))).await.unwrap();

    assert_eq!(resp.contact.primary_contact_id, a.id);
    assert_eq!(resp.contact.secondary_contact_ids, vec![b.id]);
    assert_eq!(resp.contact.emails, vec!["a@x.com"]);
    assert_eq!(resp.contact.phone_numbers, vec!["555"]);

    let demoted = store.get_contact(b.id).await.unwrap().unwrap();
    assert_eq!(demoted.link_precedence, LinkPrecedence::Secondary);
    assert_eq!(demoted.linked_id, Some(a.id));
    // Both values were already known, so nothing new was recorded.
    assert_eq!(store.list_contacts().await.unwrap().len(), 2);
  }

  #[tokio::test]
  async fn canonical_primary_is_oldest_not_lowest_id() {
    let store = MemoryStore::new();
    let young = seed(&store, NewContact::primary(some("a@x.com"), None).created_at(at(10))).await;
    let old = seed(&store, NewContact::primary(None, some("555")).created_at(at(0))).await;

    let resp = identify(&store, req(Some("a@x.com"), Some("555"))).await.unwrap();
    assert_eq!(resp.contact.primary_contact_id, old.id);
    assert_eq!(resp.contact.secondary_contact_ids, vec![young.id]);
    assert_eq!(resp.contact.emails, vec!["a@x.com"]);
    assert_eq!(resp.contact.phone_numbers, vec!["555"]);
  }

  #[tokio::test]
  async fn merge_carries_demoted_primarys_secondaries() {
    let store = MemoryStore::new();
    let a = seed(&store, NewContact::primary(some("a@x.com"), some("111")).created_at(at(0))).await;
    let b = seed(&store, NewContact::primary(some("b@x.com"), some("222")).created_at(at(1))).await;
    let b2 = seed(
      &store,
      NewContact::secondary(some("b2@x.com"), some("222"), b.id).created_at(at(2)),
    )
    .await;

    let resp = identify(&store, req(Some("a@x.com"), Some("222"))).await.unwrap();

    assert_eq!(resp.contact.primary_contact_id, a.id);
    assert_eq!(resp.contact.secondary_contact_ids, vec![b.id, b2.id]);
    assert_eq!(resp.contact.emails, vec!["a@x.com", "b@x.com", "b2@x.com"]);
    assert_eq!(resp.contact.phone_numbers, vec!["111", "222"]);

    let relinked = store.get_contact(b2.id).await.unwrap().unwrap();
    assert_eq!(relinked.linked_id, Some(a.id));
  }

  #[tokio::test]
  async fn merge_with_new_information_adds_secondary() {
    let store = MemoryStore::new();
    let a = seed(&store, NewContact::primary(some("a@x.com"), None).created_at(at(0))).await;
    let b = seed(&store, NewContact::primary(some("b@x.com"), some("555")).created_at(at(1))).await;

    let resp = identify(&store, req(Some("a@x.com"), Some("555"))).await.unwrap();
    assert_eq!(resp.contact.primary_contact_id, a.id);
    assert_eq!(resp.contact.secondary_contact_ids, vec![b.id]);
    assert_eq!(store.list_contacts().await.unwrap().len(), 2);

    // 555 now resolves to A through the demoted B; the email is unseen.
    let resp = identify(&store, req(Some("c@x.com"), Some("555"))).await.unwrap();
    assert_eq!(resp.contact.primary_contact_id, a.id);
    assert_eq!(resp.contact.secondary_contact_ids.len(), 2);
    assert_eq!(resp.contact.emails, vec!["a@x.com", "b@x.com", "c@x.com"]);
  }

  #[tokio::test]
  async fn three_clusters_collapse_to_one_primary() {
    let store = MemoryStore::new();
    let a = seed(&store, NewContact::primary(some("a@x.com"), some("111")).created_at(at(0))).await;
    let b = seed(&store, NewContact::primary(some("b@x.com"), some("222")).created_at(at(1))).await;
    let c = seed(&store, NewContact::primary(some("c@x.com"), some("333")).created_at(at(2))).await;

    identify(&store, req(Some("b@x.com"), Some("333"))).await.unwrap();
    let resp = identify(&store, req(Some("c@x.com"), Some("111"))).await.unwrap();

    assert_eq!(resp.contact.primary_contact_id, a.id);
    assert_eq!(resp.contact.secondary_contact_ids, vec![b.id, c.id]);
    let primaries = store
      .list_contacts()
      .await
      .unwrap()
      .into_iter()
      .filter(Contact::is_primary)
      .count();
    assert_eq!(primaries, 1);
  }

  #[tokio::test]
  async fn legacy_chain_through_demoted_primary_is_followed() {
    let store = MemoryStore::new();
    let a = seed(&store, NewContact::primary(some("a@x.com"), None).created_at(at(0))).await;
    // B was demoted under A without its secondary being re-pointed.
    let b = seed(&store, NewContact::secondary(some("b@x.com"), None, a.id).created_at(at(1))).await;
    let s = seed(&store, NewContact::secondary(None, some("777"), b.id).created_at(at(2))).await;

    let resp = identify(&store, req(None, Some("777"))).await.unwrap();
    assert_eq!(resp.contact.primary_contact_id, a.id);
    assert_eq!(resp.contact.secondary_contact_ids, vec![b.id, s.id]);
    assert_eq!(store.get_contact(s.id).await.unwrap().unwrap().linked_id, Some(a.id));
  }

  #[tokio::test]
  async fn chain_members_sharing_a_round_are_followed() {
    let store = MemoryStore::new();
    let a = seed(&store, NewContact::primary(some("a@x.com"), None).created_at(at(0))).await;
    let c = seed(&store, NewContact::secondary(some("c@x.com"), None, a.id).created_at(at(1))).await;
    let b = seed(&store, NewContact::secondary(some("b@x.com"), None, c.id).created_at(at(2))).await;
    let x = seed(&store, NewContact::secondary(some("x@x.com"), None, b.id).created_at(at(3))).await;
    let y = seed(&store, NewContact::secondary(None, some("777"), c.id).created_at(at(4))).await;

    let resp = identify(&store, req(Some("x@x.com"), Some("777"))).await.unwrap();
    assert_eq!(resp.contact.primary_contact_id, a.id);
    assert_eq!(resp.contact.secondary_contact_ids, vec![c.id, b.id, x.id, y.id]);
    assert_eq!(resp.contact.emails, vec!["a@x.com", "c@x.com", "b@x.com", "x@x.com"]);
    assert_eq!(resp.contact.phone_numbers, vec!["777"]);
    assert_eq!(store.list_contacts().await.unwrap().len(), 5);

    for id in [b.id, x.id, y.id] {
      assert_eq!(store.get_contact(id).await.unwrap().unwrap().linked_id, Some(a.id));
    }
  }

  // ── Invariant violations ──────────────────────────────────────────────────

  #[tokio::test]
  async fn dangling_link_is_an_invariant_violation() {
    let store = MemoryStore::new();
    seed(&store, NewContact::secondary(some("a@x.com"), None, 42)).await;

    let err = identify(&store, req(Some("a@x.com"), Some("555"))).await.unwrap_err();
    assert!(matches!(err, Error::Invariant(Invariant::UnresolvedPrimary(_))));
    assert!(!err.is_user_error());
    // The failed transaction recorded nothing.
    assert_eq!(store.list_contacts().await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn link_cycle_is_an_invariant_violation() {
    let store = MemoryStore::new();
    seed(&store, NewContact::secondary(some("a@x.com"), None, 2)).await;
    seed(&store, NewContact::secondary(some("b@x.com"), None, 1)).await;

    let err = identify(&store, req(Some("a@x.com"), None)).await.unwrap_err();
    assert!(matches!(err, Error::Invariant(Invariant::BrokenLinkChain(_))));
  }

  #[test]
  fn consolidate_requires_a_primary() {
    let now = Utc::now();
    let orphan = NewContact::secondary(some("a@x.com"), None, 7).into_contact(3, now);
    let err = consolidate(7, &[orphan]).unwrap_err();
    assert!(matches!(err, Error::Invariant(Invariant::ClusterWithoutPrimary(7))));
  }

  #[test]
  fn consolidate_deduplicates_in_first_occurrence_order() {
    let now = Utc::now();
    let cluster = vec![
      NewContact::primary(some("a@x.com"), some("1")).into_contact(1, now),
      NewContact::secondary(some("b@x.com"), some("1"), 1).into_contact(2, now),
      NewContact::secondary(some("a@x.com"), some("2"), 1).into_contact(3, now),
      NewContact::secondary(None, some("2"), 1).into_contact(4, now),
    ];
    let view = consolidate(1, &cluster).unwrap();
    assert_eq!(view.primary_contact_id, 1);
    assert_eq!(view.emails, vec!["a@x.com", "b@x.com"]);
    assert_eq!(view.phone_numbers, vec!["1", "2"]);
    assert_eq!(view.secondary_contact_ids, vec![2, 3, 4]);
  }

  #[tokio::test]
  async fn concurrent_identical_requests_create_one_primary() {
    let store = MemoryStore::new();
    let mut handles = Vec::new();
    for _ in 0..16 {
      let store = store.clone();
      handles.push(tokio::spawn(async move {
        identify(&store, req(Some("race@x.com"), Some("123"))).await
      }));
    }
    let mut primary_ids = BTreeSet::new();
    for handle in handles {
      primary_ids.insert(handle.await.unwrap().unwrap().contact.primary_contact_id);
    }
    assert_eq!(primary_ids.len(), 1);
    assert_eq!(store.list_contacts().await.unwrap().len(), 1);
  }
}
