use tokio::sync::watch;

/// A one-shot close signal. Closing is idempotent and wakes every waiter,
/// including waiters that subscribe after the close.
pub(crate) struct Signal {
  tx: watch::Sender<bool>,
}

impl Signal {
  pub fn new() -> Signal {
    let (tx, _rx) = watch::channel(false);
    Signal { tx: tx }
  }

  pub fn close(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_closed(&self) -> bool {
    *self.tx.borrow()
  }

  pub async fn wait(&self) {
    let mut rx = self.tx.subscribe();
    while !*rx.borrow_and_update() {
      if rx.changed().await.is_err() {
        return;
      }
    }
  }
}

/// The halt-request / halt-done pair used for cooperative shutdown. Every
/// blocking wait in the membership loop races `req_stop`; the loop closes
/// `done` on its way out so `stop()` callers unblock.
pub(crate) struct Halter {
  pub req_stop: Signal,
  pub done: Signal,
}

impl Halter {
  pub fn new() -> Halter {
    Halter {
      req_stop: Signal::new(),
      done: Signal::new(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn close_is_idempotent_and_wakes_late_waiters() {
    let sig = Signal::new();
    assert!(!sig.is_closed());
    sig.close();
    sig.close();
    assert!(sig.is_closed());
    // waiting after the close must resolve immediately
    tokio::time::timeout(Duration::from_secs(1), sig.wait())
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn wait_blocks_until_closed() {
    let halter = std::sync::Arc::new(Halter::new());
    let h = halter.clone();
    let waiter = tokio::spawn(async move { h.done.wait().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());
    halter.done.close();
    tokio::time::timeout(Duration::from_secs(1), waiter)
      .await
      .unwrap()
      .unwrap();
  }
}
