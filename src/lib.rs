//! [`membus`](crate) keeps a cluster of processes aware of each other and
//! converged on a single leader, using nothing but a pub/sub message bus.
//!
//! Each process embeds one [`Membership`](membership::Membership) agent.
//! Agents discover each other through periodic broadcast-and-gather
//! rounds: a ping on the allcall topic, pongs on the reply topic, and a
//! member set snapshotted per heartbeat. Leadership is decided by a
//! deterministic order over candidates combined with a lease discipline,
//! so the cluster converges without quorums, log replication, or any
//! server-side coordination. Membership changes are published back onto
//! the bus as `lost`, `gained`, and `list` events for anyone listening.
//!
//! # Modules
//! - [`membership`] is the agent: the heartbeat loop, the election rule,
//!   the lease bookkeeping, and the event stream.
//! - [`bus`] is the transport seam: the adapter contract an embedding
//!   picks its bus client through, plus an in-process hub for tests and
//!   single-process clusters.
//! - [`testkit`] carries the failure-injection knobs and the injected
//!   logger.
//!
//! # Guarantees and non-guarantees
//! Agents fed the same pongs reach the same verdict on who leads, and an
//! accepted leader is never displaced while its lease holds except by a
//! strictly preferred candidate. Event delivery is at-least-once:
//! consumers must tolerate duplicate `lost` and `gained` notifications.
//! There is no Byzantine tolerance and no authentication of peers at this
//! layer.

pub mod bus;
pub mod membership;
pub mod testkit;
