//! Tools for exercising agents under adverse conditions: a failure
//! injection map consumed by the in-memory bus, and the injected leveled
//! logger every agent carries.

mod failure_config;
mod logging;

#[rustfmt::skip]
pub use {
  failure_config::FailureConfig,
  failure_config::FailureConfigMap,
  logging::LogLevel,
  logging::Logger,
};
