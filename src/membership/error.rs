use thiserror::Error;

/// Failures surfaced by a membership agent.
#[derive(Debug, Error)]
pub enum MembershipError {
  /// The bus could not be reached on startup, or reconnection attempts
  /// were exhausted.
  #[error("message bus unreachable at '{url}': {reason}")]
  BusUnreachable { url: String, reason: String },
  /// A pong payload failed to decode. Callbacks log and drop these; they
  /// never cross the delivery boundary.
  #[error("malformed pong payload: {0}")]
  MalformedPong(#[from] serde_json::Error),
  /// A halt request interrupted a blocking operation.
  #[error("shutdown requested")]
  Shutdown,
  /// After a reconnect the bus reported an identity other than the one
  /// this agent was started against. Monitoring a different server's
  /// health would be meaningless, so this is fatal.
  #[error("agent location changed: was {was}, now {now}")]
  LocationChanged { was: String, now: String },
}
