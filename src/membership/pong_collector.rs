use crate::membership::{Candidate, MemberSet, MembershipError};
use std::sync::Mutex;

/// Accumulates the pongs received in response to allcall pings during the
/// most recent heartbeat window.
///
/// Bus delivery callbacks insert concurrently; the membership loop is the
/// sole reader and drains atomically once per round.
pub(crate) struct PongCollector {
  from: Mutex<MemberSet>,
}

impl PongCollector {
  pub fn new() -> PongCollector {
    PongCollector {
      from: Mutex::new(MemberSet::new()),
    }
  }

  /// Decodes a pong payload and folds it into the current window.
  pub fn receive_pong(&self, data: &[u8]) -> Result<(), MembershipError> {
    let loc = Candidate::from_bytes(data).map_err(MembershipError::MalformedPong)?;
    self.from.lock().unwrap().insert(loc);
    Ok(())
  }

  /// Snapshots the window, clears it, and pre-seeds the next window with
  /// `my_loc`. Seeding makes self-membership independent of loopback
  /// delivery. Returns the snapshot and its cardinality.
  pub fn get_set_and_clear(&self, my_loc: &Candidate) -> (usize, MemberSet) {
    let mut guard = self.from.lock().unwrap();
    let snap = std::mem::take(&mut *guard);
    guard.insert(my_loc.clone());
    drop(guard);
    (snap.len(), snap)
  }
}
