//! Cluster membership and lease-based leader election over a pub/sub bus.
//!
//! Every process in the cluster runs one [`Membership`] agent. On each
//! heartbeat the agent broadcasts an allcall ping carrying its believed
//! leader; every agent, itself included, answers with its own identity on
//! the reply topic. The pongs gathered inside one beat form that round's
//! member set.
//!
//! ### Elections
//! There is no separate consensus protocol. Candidates are totally ordered
//! by `(rank, id, host, port)`, with unranked empty ids sorting dead last,
//! so every agent looking at the same member set picks the same winner. A
//! winner holds a time-bounded lease and keeps leadership until the lease,
//! stretched by the configured clock-skew allowance, lapses. Renewal is
//! folded into the same rule: a sitting leader re-wins with a longer
//! lease. The update rule guarding the accepted leader is monotone, so
//! leadership never regresses while a lease holds.
//!
//! ### Events
//! Consecutive rounds are diffed. Departures go out on the `lost` topic,
//! arrivals on `added`, and whenever a lease expiry forced a re-election
//! the full set goes out on `list`. Delivery is best effort and may
//! duplicate; consumers must treat the notifications as hints and the
//! `list` payloads as authoritative snapshots.

mod candidate;
mod error;
mod halt;
mod lead_holder;
mod member_set;
mod membership;
mod pong_collector;

/// Namespace for system cluster-membership traffic. Only agents should
/// write to these topics, but everyone is welcome to listen on them.
pub const SYS_MEMBER_PREFIX: &str = "_nats.cluster.members.";

#[rustfmt::skip]
pub(crate) use {
  halt::Halter,
  lead_holder::LeadHolder,
  pong_collector::PongCollector,
};

#[rustfmt::skip]
pub use {
  candidate::candidate_less_than,
  candidate::Candidate,
  candidate::ZERO_TIME,
  error::MembershipError,
  member_set::MemberSet,
  membership::leader_lease_check,
  membership::MemberEvent,
  membership::Membership,
  membership::MembershipCfg,
};
