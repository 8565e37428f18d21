use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// The lease value carried by every non-leader. Serializes as
/// `0001-01-01T00:00:00Z`, which keeps agents on different hosts
/// byte-compatible when they compare pong payloads.
pub static ZERO_TIME: Lazy<DateTime<Utc>> =
  Lazy::new(|| Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap());

/// The identity and election standing of one agent, as advertised in pongs.
///
/// An empty `id` means "unknown agent". Unknown candidates sort higher than
/// every named candidate, so they always lose elections. `lease_expires` is
/// [`ZERO_TIME`] on anything that is not the current leader.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Candidate {
  #[serde(rename = "serverId")]
  pub id: String,
  pub host: String,
  pub port: u16,
  /// Set only on the elected candidate.
  #[serde(rename = "leader")]
  pub is_leader: bool,
  /// When the leader's lease lapses. [`ZERO_TIME`] for non-leaders.
  #[serde(rename = "leaseExpires")]
  pub lease_expires: DateTime<Utc>,
  /// Operator-assigned leadership priority. Lower is stronger.
  pub rank: i32,
}

impl Candidate {
  pub fn new(id: &str, host: &str, port: u16, rank: i32) -> Candidate {
    Candidate {
      id: id.to_string(),
      host: host.to_string(),
      port: port,
      is_leader: false,
      lease_expires: *ZERO_TIME,
      rank: rank,
    }
  }

  /// True when this candidate has never been granted a lease.
  pub fn lease_is_zero(&self) -> bool {
    self.lease_expires == *ZERO_TIME
  }

  /// Identity comparison: the fields that make two pongs refer to the same
  /// agent. Leadership and lease state are deliberately excluded.
  pub fn same_identity(&self, other: &Candidate) -> bool {
    self.id == other.id
      && self.host == other.host
      && self.port == other.port
      && self.rank == other.rank
  }

  pub fn from_bytes(by: &[u8]) -> Result<Candidate, serde_json::Error> {
    serde_json::from_slice(by)
  }

  pub fn to_bytes(&self) -> Vec<u8> {
    serde_json::to_vec(self).expect("candidate serializes")
  }
}

impl Default for Candidate {
  fn default() -> Self {
    Candidate::new("", "", 0, 0)
  }
}

impl fmt::Display for Candidate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let by = serde_json::to_string(self).map_err(|_| fmt::Error)?;
    write!(f, "{}", by)
  }
}

/// Full election comparison. Must be computable from candidate fields alone
/// so every agent reaches the same verdict on the same input set.
///
/// Evaluated in order, first discriminating field decides: empty ids sort
/// high, then rank ascending, id, host, port.
pub(crate) fn elect_cmp(a: &Candidate, b: &Candidate) -> Ordering {
  match (a.id.is_empty(), b.id.is_empty()) {
    (true, true) => return Ordering::Equal,
    (true, false) => return Ordering::Greater,
    (false, true) => return Ordering::Less,
    (false, false) => {}
  }
  a.rank
    .cmp(&b.rank)
    .then_with(|| a.id.cmp(&b.id))
    .then_with(|| cmp_empty_high(&a.host, &b.host))
    .then_with(|| a.port.cmp(&b.port))
}

/// Returns true iff `a` is preferred over `b` as leader.
///
/// Lease expirations are not part of this order. Renewal of a sitting
/// leader's lease is handled by the lead holder's acceptance rule instead.
pub fn candidate_less_than(a: &Candidate, b: &Candidate) -> bool {
  elect_cmp(a, b) == Ordering::Less
}

// Empty strings sort big, not small.
fn cmp_empty_high(a: &str, b: &str) -> Ordering {
  match (a.is_empty(), b.is_empty()) {
    (true, true) => Ordering::Equal,
    (true, false) => Ordering::Greater,
    (false, true) => Ordering::Less,
    (false, false) => a.cmp(b),
  }
}
