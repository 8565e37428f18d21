use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Dictates how the in-memory bus degrades deliveries to one endpoint.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct FailureConfig {
  /// Probability in `[0, 1]` that a delivery is dropped outright.
  pub drop_prob: f64,
  /// When set, each surviving delivery is held back by a duration drawn
  /// uniformly from this range.
  pub delay: Option<(Duration, Duration)>,
}

/// Failure settings for a whole cluster, with per-endpoint overrides keyed
/// by bus url.
#[derive(Clone, Default, Deserialize, Serialize)]
pub struct FailureConfigMap {
  pub cluster_wide: FailureConfig,
  pub node_wide: HashMap<String, FailureConfig>,
}

impl FailureConfigMap {
  pub fn get(&self, url: &str) -> &FailureConfig {
    self.node_wide.get(url).unwrap_or(&self.cluster_wide)
  }
}
