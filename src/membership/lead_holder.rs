use crate::membership::{candidate_less_than, Candidate};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

const DEFAULT_HISTORY: usize = 100;

// Bounded ring of accepted leaders, oldest evicted on overflow.
struct RingBuf {
  cap: usize,
  buf: VecDeque<Candidate>,
}

impl RingBuf {
  fn new(cap: usize) -> RingBuf {
    RingBuf {
      cap: cap,
      buf: VecDeque::with_capacity(cap),
    }
  }

  fn push(&mut self, item: Candidate) {
    while self.buf.len() >= self.cap {
      self.buf.pop_front();
    }
    self.buf.push_back(item);
  }
}

/// Guards the accepted leader.
///
/// The update rule is monotone under the election order for as long as the
/// incumbent's lease is live: a sitting leader is only ever replaced by a
/// strictly preferred candidate, or by itself with a longer lease. Once
/// the lease lapses, skew allowance included, the incumbent no longer
/// blocks and a freshly leased winner takes over regardless of rank. The
/// holder never hands out references into its own state; every return is
/// an owned copy.
pub(crate) struct LeadHolder {
  inner: Mutex<LeadState>,
  max_skew: chrono::Duration,
}

struct LeadState {
  cur: Candidate,
  my_loc_set: bool,
  history: RingBuf,
}

impl LeadHolder {
  pub fn new(history_count: usize, max_clock_skew: Duration) -> LeadHolder {
    let histsz = if history_count == 0 {
      DEFAULT_HISTORY
    } else {
      history_count
    };
    LeadHolder {
      inner: Mutex::new(LeadState {
        cur: Candidate::default(),
        my_loc_set: false,
        history: RingBuf::new(histsz),
      }),
      max_skew: chrono::Duration::from_std(max_clock_skew)
        .expect("clock skew fits in chrono range"),
    }
  }

  /// Records the local identity. May only be called once per holder.
  pub fn set_my_loc(&self, _my_loc: &Candidate) {
    let mut state = self.inner.lock().unwrap();
    assert!(!state.my_loc_set, "local identity set twice");
    state.my_loc_set = true;
  }

  pub fn get_leader(&self) -> Candidate {
    self.inner.lock().unwrap().cur.clone()
  }

  pub fn leader_as_bytes(&self) -> Vec<u8> {
    self.get_leader().to_bytes()
  }

  /// Offers `cand` as leader and reports what the holder now believes.
  ///
  /// Returns `(accepted, effective)`. When rejected, `effective` is the
  /// retained leader; when accepted it is a copy of `cand`. Candidates with
  /// an empty id are always rejected. Equal candidates are accepted only
  /// when they extend the current lease, which is how a sitting leader
  /// renews without an election. A weaker candidate is accepted only when
  /// the incumbent's lease has lapsed and the candidate holds a newer one;
  /// that is the takeover path after a leader dies.
  pub fn set_leader(&self, cand: &Candidate) -> (bool, Candidate) {
    let mut state = self.inner.lock().unwrap();
    if cand.id.is_empty() {
      return (false, state.cur.clone());
    }
    let new_wins = candidate_less_than(cand, &state.cur);
    let old_wins = candidate_less_than(&state.cur, cand);
    let longer_lease = cand.lease_expires > state.cur.lease_expires;
    let cur_lapsed = !state.cur.id.is_empty()
      && state.cur.lease_expires + self.max_skew < Utc::now();
    let won = if new_wins {
      true
    } else if old_wins {
      // a dead leader's rank must not pin leadership forever
      cur_lapsed && longer_lease
    } else {
      longer_lease
    };
    if won {
      state.cur = cand.clone();
      state.history.push(cand.clone());
      (true, cand.clone())
    } else {
      (false, state.cur.clone())
    }
  }

  /// Copies the accepted-leader history, oldest first. Diagnostics only.
  pub fn history_snapshot(&self) -> Vec<Candidate> {
    let state = self.inner.lock().unwrap();
    state.history.buf.iter().cloned().collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Duration, Utc};

  fn cand(id: &str, rank: i32) -> Candidate {
    Candidate::new(id, "localhost", 4222, rank)
  }

  fn leased(id: &str, rank: i32, secs: i64) -> Candidate {
    let mut c = cand(id, rank);
    c.is_leader = true;
    c.lease_expires = Utc::now() + Duration::seconds(secs);
    c
  }

  fn holder(history_count: usize) -> LeadHolder {
    LeadHolder::new(history_count, std::time::Duration::from_secs(1))
  }

  #[test]
  fn empty_id_is_rejected() {
    let lh = holder(10);
    let (won, eff) = lh.set_leader(&Candidate::default());
    assert!(!won);
    assert!(eff.id.is_empty());
  }

  #[test]
  fn stronger_candidate_replaces_weaker() {
    let lh = holder(10);
    assert!(lh.set_leader(&leased("b", 5, 10)).0);
    let (won, eff) = lh.set_leader(&leased("a", 1, 10));
    assert!(won);
    assert_eq!(eff.id, "a");
    // the displaced candidate cannot come back while the lease is live
    let (won, eff) = lh.set_leader(&leased("b", 5, 60));
    assert!(!won);
    assert_eq!(eff.id, "a");
  }

  #[test]
  fn lapsed_incumbent_yields_to_a_freshly_leased_weaker_candidate() {
    let lh = holder(10);
    // strongest rank, but its lease ran out well past the skew allowance
    assert!(lh.set_leader(&leased("b", 0, -5)).0);
    let (won, eff) = lh.set_leader(&leased("a", 1, 10));
    assert!(won);
    assert_eq!(eff.id, "a");
    assert_eq!(lh.get_leader().id, "a");
  }

  #[test]
  fn lapsed_incumbent_is_not_displaced_by_a_zero_lease_candidate() {
    let lh = holder(10);
    assert!(lh.set_leader(&leased("b", 0, -5)).0);
    // a stale advertisement without a lease wins nothing
    let (won, eff) = lh.set_leader(&cand("a", 1));
    assert!(!won);
    assert_eq!(eff.id, "b");
  }

  #[test]
  fn equal_candidate_renews_only_with_longer_lease() {
    let lh = holder(10);
    let first = leased("a", 1, 10);
    assert!(lh.set_leader(&first).0);

    let mut stale = first.clone();
    stale.lease_expires = first.lease_expires - Duration::seconds(5);
    let (won, eff) = lh.set_leader(&stale);
    assert!(!won);
    assert_eq!(eff.lease_expires, first.lease_expires);

    let mut renewed = first.clone();
    renewed.lease_expires = first.lease_expires + Duration::seconds(5);
    let (won, eff) = lh.set_leader(&renewed);
    assert!(won);
    assert_eq!(eff.lease_expires, renewed.lease_expires);
  }

  #[test]
  fn history_is_bounded() {
    let lh = holder(3);
    // each accepted update outranks its predecessor
    for rank in (0..10).rev() {
      let ok = lh.set_leader(&leased(&format!("c{}", rank), rank, 10)).0;
      assert!(ok);
    }
    let hist = lh.history_snapshot();
    assert_eq!(hist.len(), 3);
    assert_eq!(hist.last().unwrap().id, "c0");
  }

  #[test]
  fn zero_history_count_upgrades_to_default() {
    let lh = holder(0);
    assert_eq!(lh.inner.lock().unwrap().history.cap, DEFAULT_HISTORY);
  }

  #[test]
  #[should_panic(expected = "local identity set twice")]
  fn my_loc_cannot_be_set_twice() {
    let lh = holder(10);
    let me = cand("me", 0);
    lh.set_my_loc(&me);
    lh.set_my_loc(&me);
  }
}
