//! The seam between agents and the message bus.
//!
//! [`Bus`] is the adapter contract: publish, request/reply publish,
//! subscriptions with callback delivery, an endpoint identity, and a
//! disconnect hook. Agents obtain connections through a [`BusConnector`]
//! so the transport stays swappable. [`MemoryHub`] is the in-process
//! implementation used by the integration tests and by embedders running
//! a whole cluster inside one process.

mod adapter;
mod memory;

#[rustfmt::skip]
pub use {
  adapter::Bus,
  adapter::BusConnector,
  adapter::BusError,
  adapter::BusLoc,
  adapter::BusMsg,
  adapter::ConnectOpts,
  adapter::DisconnectHandler,
  adapter::MsgHandler,
  memory::MemoryHub,
};
