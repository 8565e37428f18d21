use crate::membership::candidate::{elect_cmp, Candidate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A deduplicated collection of [`Candidate`], kept sorted by the election
/// order at all times.
///
/// Entries are unique on `id`. Inserting a candidate whose `id` is already
/// present replaces the old entry; an agent that re-registered supersedes
/// its stale advertisement. Serialization is canonical: the same set always
/// produces the same bytes, so snapshots can be compared bit for bit.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MemberSet {
  members: Vec<Candidate>,
}

impl MemberSet {
  pub fn new() -> MemberSet {
    MemberSet { members: vec![] }
  }

  /// Inserts `cand`, replacing any entry with the same `id`.
  pub fn insert(&mut self, cand: Candidate) {
    self.members.retain(|m| m.id != cand.id);
    let at = self
      .members
      .partition_point(|m| elect_cmp(m, &cand) == Ordering::Less);
    self.members.insert(at, cand);
  }

  pub fn len(&self) -> usize {
    self.members.len()
  }

  pub fn is_empty(&self) -> bool {
    self.members.is_empty()
  }

  /// Iterates in election order, most preferred first.
  pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
    self.members.iter()
  }

  /// The candidate ranked first under the election order.
  pub fn min_rank(&self) -> Option<Candidate> {
    self.members.first().cloned()
  }

  pub fn clear(&mut self) {
    self.members.clear();
  }

  pub fn contains_identity(&self, cand: &Candidate) -> bool {
    self.members.iter().any(|m| m.same_identity(cand))
  }

  /// Candidates in `a` that are not in `b`, compared on identity fields.
  ///
  /// If the designated leader appears in the result, its entry carries the
  /// leader bit and lease so event payloads name the leader correctly.
  pub fn set_diff(a: &MemberSet, b: &MemberSet, lead: &Candidate) -> MemberSet {
    let mut out = MemberSet::new();
    for m in a.iter().filter(|m| !b.contains_identity(m)) {
      let mut m = m.clone();
      if !lead.id.is_empty() && m.id == lead.id {
        m.is_leader = lead.is_leader;
        m.lease_expires = lead.lease_expires;
      }
      out.insert(m);
    }
    out
  }

  /// Element-wise equality on identity fields. Leadership churn alone does
  /// not make two rounds differ.
  pub fn sets_equal(a: &MemberSet, b: &MemberSet) -> bool {
    a.members.len() == b.members.len()
      && a
        .members
        .iter()
        .zip(b.members.iter())
        .all(|(x, y)| x.same_identity(y))
  }

  /// Canonical JSON, members in election order.
  pub fn to_bytes(&self) -> Vec<u8> {
    serde_json::to_vec(self).expect("member set serializes")
  }

  pub fn from_bytes(by: &[u8]) -> Result<MemberSet, serde_json::Error> {
    serde_json::from_slice(by)
  }
}

impl fmt::Display for MemberSet {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let by = serde_json::to_string(self).map_err(|_| fmt::Error)?;
    write!(f, "{}", by)
  }
}
