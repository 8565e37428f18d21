use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// A message handed to a subscription handler.
#[derive(Clone, Debug)]
pub struct BusMsg {
  pub subject: String,
  pub reply_to: Option<String>,
  pub data: Vec<u8>,
}

/// The identity a bus assigns to one connected endpoint. Agents adopt this
/// as their own identity, so it must be stable for the lifetime of the
/// endpoint, including across reconnects to the same address.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BusLoc {
  pub id: String,
  pub host: String,
  pub port: u16,
}

pub type MsgHandler = Box<dyn Fn(BusMsg) + Send + Sync + 'static>;
pub type DisconnectHandler = Box<dyn Fn() + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum BusError {
  #[error("bus connection is closed")]
  Closed,
  #[error("cannot reach bus at '{url}': {reason}")]
  Unreachable { url: String, reason: String },
}

/// One connection to a pub/sub message bus.
///
/// Handlers run on the bus's delivery tasks and must be cheap; they are the
/// trust boundary for foreign payloads. Subscription delivery queues are
/// unbounded, so a burst of pongs inside one heartbeat window is never
/// dropped by the adapter itself.
pub trait Bus: Send + Sync {
  fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BusError>;

  /// Publishes `payload` on `subject`, asking receivers to answer on
  /// `reply_to`.
  fn publish_request(
    &self,
    subject: &str,
    reply_to: &str,
    payload: &[u8],
  ) -> Result<(), BusError>;

  fn subscribe(&self, subject: &str, handler: MsgHandler) -> Result<(), BusError>;

  /// The identity of the monitored endpoint.
  fn server_location(&self) -> Result<BusLoc, BusError>;

  /// Registers `cb`, invoked at most once per disconnection event.
  fn set_disconnect_handler(&self, cb: DisconnectHandler);

  /// Voluntarily drops the connection. Does not fire the disconnect
  /// handler.
  fn close(&self);
}

/// Connection options every adapter must honor.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectOpts {
  /// Never migrate transparently to another bus instance. An agent
  /// monitors one specific server; failing over behind its back would
  /// silently change what is being watched.
  pub no_reconnect: bool,
  /// Attempt connection addresses in deterministic order.
  pub dont_randomize: bool,
}

/// Produces [`Bus`] connections from a configured address.
pub trait BusConnector: Send + Sync {
  fn connect(&self, url: &str, opts: ConnectOpts) -> Result<Arc<dyn Bus>, BusError>;
}
