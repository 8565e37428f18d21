use crate::bus::{
  Bus, BusConnector, BusError, BusLoc, BusMsg, ConnectOpts, DisconnectHandler,
  MsgHandler,
};
use crate::testkit::FailureConfigMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

/// A single-process pub/sub hub, the reference [`Bus`] adapter.
///
/// Each distinct url is one endpoint with a hub-assigned identity that
/// survives reconnects, so several agents in one process get distinct,
/// stable locations. Delivery goes through one unbounded queue per
/// connection, drained by a background task that invokes the handlers.
/// Traffic can be degraded per endpoint with a [`FailureConfigMap`] and
/// connections can be forcibly severed, which is how the integration tests
/// exercise disconnect and reconnect paths.
///
/// Connect options need no special handling here: there is exactly one hub
/// behind every url, so connections can neither migrate nor be randomized.
#[derive(Clone)]
pub struct MemoryHub {
  core: Arc<HubCore>,
}

struct HubCore {
  state: Mutex<HubState>,
  next_port: AtomicU16,
}

struct HubState {
  endpoints: HashMap<String, BusLoc>,
  conns: Vec<Arc<ConnShared>>,
  fail: FailureConfigMap,
}

type Delivery = (BusMsg, Option<Duration>);

struct ConnShared {
  url: String,
  loc: BusLoc,
  // dropped on close so the delivery task drains and exits
  tx: Mutex<Option<tokio::sync::mpsc::UnboundedSender<Delivery>>>,
  subs: Mutex<HashMap<String, Vec<Arc<dyn Fn(BusMsg) + Send + Sync>>>>,
  on_disconnect: Mutex<Option<DisconnectHandler>>,
  closed: AtomicBool,
}

impl ConnShared {
  fn shut(&self) {
    self.closed.store(true, Ordering::Release);
    self.tx.lock().unwrap().take();
  }

  fn enqueue(&self, delivery: Delivery) {
    if let Some(tx) = self.tx.lock().unwrap().as_ref() {
      let _ = tx.send(delivery);
    }
  }

  fn dispatch(&self, msg: BusMsg) {
    if self.closed.load(Ordering::Acquire) {
      return;
    }
    let handlers = {
      let subs = self.subs.lock().unwrap();
      subs.get(&msg.subject).cloned().unwrap_or_default()
    };
    for h in handlers {
      h(msg.clone());
    }
  }
}

async fn deliver(shared: Arc<ConnShared>, mut rx: UnboundedReceiver<Delivery>) {
  while let Some((msg, delay)) = rx.recv().await {
    match delay {
      None => shared.dispatch(msg),
      Some(d) => {
        let sh = shared.clone();
        tokio::spawn(async move {
          tokio::time::sleep(d).await;
          sh.dispatch(msg);
        });
      }
    }
  }
}

impl MemoryHub {
  pub fn new() -> MemoryHub {
    MemoryHub {
      core: Arc::new(HubCore {
        state: Mutex::new(HubState {
          endpoints: HashMap::new(),
          conns: Vec::new(),
          fail: FailureConfigMap::default(),
        }),
        next_port: AtomicU16::new(4222),
      }),
    }
  }

  /// Replaces the failure injection settings, keyed by endpoint url.
  pub fn set_failure(&self, fail: FailureConfigMap) {
    self.core.state.lock().unwrap().fail = fail;
  }

  /// Severs every live connection on `url`, firing disconnect handlers.
  /// Returns how many connections went down.
  pub fn sever(&self, url: &str) -> usize {
    let severed = {
      let mut state = self.core.state.lock().unwrap();
      let (gone, keep) = state
        .conns
        .drain(..)
        .partition::<Vec<_>, _>(|c| c.url == url);
      state.conns = keep;
      gone
    };
    for conn in severed.iter() {
      conn.shut();
      if let Some(cb) = conn.on_disconnect.lock().unwrap().take() {
        cb();
      }
    }
    severed.len()
  }

  /// Forgets the identity assigned to `url`. The next connection there
  /// gets a fresh one, which an agent must treat as fatal.
  pub fn assign_new_identity(&self, url: &str) {
    self.core.state.lock().unwrap().endpoints.remove(url);
  }

  pub fn connection_count(&self) -> usize {
    self.core.state.lock().unwrap().conns.len()
  }
}

impl Default for MemoryHub {
  fn default() -> Self {
    MemoryHub::new()
  }
}

impl BusConnector for MemoryHub {
  fn connect(&self, url: &str, _opts: ConnectOpts) -> Result<Arc<dyn Bus>, BusError> {
    let core = self.core.clone();
    let loc = {
      let mut state = core.state.lock().unwrap();
      match state.endpoints.get(url) {
        Some(loc) => loc.clone(),
        None => {
          let loc = BusLoc {
            id: format!("{:016x}", rand::random::<u64>()),
            host: "127.0.0.1".to_string(),
            port: core.next_port.fetch_add(1, Ordering::Relaxed),
          };
          state.endpoints.insert(url.to_string(), loc.clone());
          loc
        }
      }
    };
    let (tx, rx) = unbounded_channel();
    let shared = Arc::new(ConnShared {
      url: url.to_string(),
      loc: loc,
      tx: Mutex::new(Some(tx)),
      subs: Mutex::new(HashMap::new()),
      on_disconnect: Mutex::new(None),
      closed: AtomicBool::new(false),
    });
    core.state.lock().unwrap().conns.push(shared.clone());
    tokio::spawn(deliver(shared.clone(), rx));
    Ok(Arc::new(MemoryConn {
      hub: Arc::downgrade(&core),
      shared: shared,
    }))
  }
}

struct MemoryConn {
  hub: Weak<HubCore>,
  shared: Arc<ConnShared>,
}

impl MemoryConn {
  fn fanout(&self, msg: BusMsg) -> Result<(), BusError> {
    if self.shared.closed.load(Ordering::Acquire) {
      return Err(BusError::Closed);
    }
    let hub = self.hub.upgrade().ok_or(BusError::Closed)?;
    let state = hub.state.lock().unwrap();
    for conn in state.conns.iter() {
      let fc = state.fail.get(&conn.url);
      if fc.drop_prob > 0.0 && rand::random::<f64>() < fc.drop_prob {
        continue;
      }
      let delay = fc
        .delay
        .map(|(lo, hi)| lo + (hi - lo).mul_f64(rand::random::<f64>()));
      conn.enqueue((msg.clone(), delay));
    }
    Ok(())
  }
}

impl Bus for MemoryConn {
  fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BusError> {
    self.fanout(BusMsg {
      subject: subject.to_string(),
      reply_to: None,
      data: payload.to_vec(),
    })
  }

  fn publish_request(
    &self,
    subject: &str,
    reply_to: &str,
    payload: &[u8],
  ) -> Result<(), BusError> {
    self.fanout(BusMsg {
      subject: subject.to_string(),
      reply_to: Some(reply_to.to_string()),
      data: payload.to_vec(),
    })
  }

  fn subscribe(&self, subject: &str, handler: MsgHandler) -> Result<(), BusError> {
    if self.shared.closed.load(Ordering::Acquire) {
      return Err(BusError::Closed);
    }
    let mut subs = self.shared.subs.lock().unwrap();
    subs
      .entry(subject.to_string())
      .or_default()
      .push(Arc::from(handler));
    Ok(())
  }

  fn server_location(&self) -> Result<BusLoc, BusError> {
    if self.shared.closed.load(Ordering::Acquire) {
      return Err(BusError::Closed);
    }
    Ok(self.shared.loc.clone())
  }

  fn set_disconnect_handler(&self, cb: DisconnectHandler) {
    *self.shared.on_disconnect.lock().unwrap() = Some(cb);
  }

  fn close(&self) {
    self.shared.shut();
    if let Some(hub) = self.hub.upgrade() {
      let mut state = hub.state.lock().unwrap();
      state.conns.retain(|c| !Arc::ptr_eq(c, &self.shared));
    }
  }
}
