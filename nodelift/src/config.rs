//! Operational knobs with their defaults.
//!
//! Loading these from flags or files is the embedder's job; the core only
//! defines the typed shape and the defaults it was designed around.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// How long the provisioner waits to batch pending pods
    pub batch_window: Duration,
    /// Cap on eligible instance types surfaced per new node
    pub max_instance_types: usize,
    /// Disruption loop polling period
    pub polling_period: Duration,
    /// Stabilization wait before re-simulating an emitted command
    pub validation_stabilization: Duration,
    /// Wall-clock bound on one single-node consolidation pass
    pub single_node_timeout: Duration,
    /// Wall-clock bound on one multi-node consolidation computation
    pub multi_node_timeout: Duration,
    /// Wall-clock bound on executing one disruption command
    pub command_timeout: Duration,
    /// Minimum cheaper instance types required for spot-to-spot consolidation
    pub spot_min_flexibility: usize,
    /// Largest candidate set multi-node consolidation will consider
    pub max_consolidation_candidates: usize,
    /// Concurrent command reconciles in the orchestration queue
    pub queue_concurrency: usize,
    /// Retry backoff bounds for command reconciliation
    pub queue_base_delay: Duration,
    pub queue_max_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            batch_window: Duration::from_secs(10),
            max_instance_types: 60,
            polling_period: Duration::from_secs(10),
            validation_stabilization: Duration::from_secs(15),
            single_node_timeout: Duration::from_secs(3 * 60),
            multi_node_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(10 * 60),
            spot_min_flexibility: 15,
            max_consolidation_candidates: 100,
            queue_concurrency: 100,
            queue_base_delay: Duration::from_secs(1),
            queue_max_delay: Duration::from_secs(10),
        }
    }
}

impl Options {
    /// Nominations protect a node for two batch windows
    pub fn nomination_window(&self) -> Duration {
        self.batch_window * 2
    }
}
