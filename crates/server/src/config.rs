//! Controller configuration

use std::{net::SocketAddr, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, ControllerResult};

/// Main controller configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Statistics collection
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Flood-port computation
    #[serde(default)]
    pub spanning_tree: SpanningTreeConfig,

    /// Socket addresses
    #[serde(default)]
    pub listen: ListenConfig,
}

impl ControllerConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> ControllerResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ControllerError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ControllerError::ConfigParse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_poll_secs")]
    pub table_stats_poll_secs: u64,

    #[serde(default = "default_poll_secs")]
    pub port_stats_poll_secs: u64,

    #[serde(default = "default_poll_secs")]
    pub aggregate_stats_poll_secs: u64,

    /// Length of one collection epoch (logical clock tick)
    #[serde(default = "default_epoch_secs")]
    pub collection_epoch_secs: u64,

    #[serde(default = "default_max_snapshots")]
    pub max_snapshots_per_switch: usize,

    /// Period of the unsolicited `linkutils` broadcast
    #[serde(default = "default_utilization_secs")]
    pub utilization_broadcast_secs: u64,

    /// On-demand queries unanswered for this long are failed back to the
    /// client
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl MonitoringConfig {
    pub fn table_stats_period(&self) -> Duration {
        Duration::from_secs(self.table_stats_poll_secs)
    }

    pub fn port_stats_period(&self) -> Duration {
        Duration::from_secs(self.port_stats_poll_secs)
    }

    pub fn aggregate_stats_period(&self) -> Duration {
        Duration::from_secs(self.aggregate_stats_poll_secs)
    }

    pub fn epoch_period(&self) -> Duration {
        Duration::from_secs(self.collection_epoch_secs)
    }

    pub fn utilization_period(&self) -> Duration {
        Duration::from_secs(self.utilization_broadcast_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// The stats debug pass runs every other epoch.
    pub fn stats_debug_period(&self) -> Duration {
        self.epoch_period() * 2
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            table_stats_poll_secs: default_poll_secs(),
            port_stats_poll_secs: default_poll_secs(),
            aggregate_stats_poll_secs: default_poll_secs(),
            collection_epoch_secs: default_epoch_secs(),
            max_snapshots_per_switch: default_max_snapshots(),
            utilization_broadcast_secs: default_utilization_secs(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanningTreeConfig {
    /// How often flood ports are recomputed
    #[serde(default = "default_recompute_secs")]
    pub recompute_secs: u64,

    /// Hold time before a newly-up port may flood
    #[serde(default = "default_flood_wait_secs")]
    pub flood_wait_secs: u64,
}

impl SpanningTreeConfig {
    pub fn recompute_period(&self) -> Duration {
        Duration::from_secs(self.recompute_secs)
    }

    pub fn flood_wait(&self) -> Duration {
        Duration::from_secs(self.flood_wait_secs)
    }
}

impl Default for SpanningTreeConfig {
    fn default() -> Self {
        Self {
            recompute_secs: default_recompute_secs(),
            flood_wait_secs: default_flood_wait_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// JSON control-plane clients
    #[serde(default = "default_client_addr")]
    pub client_addr: SocketAddr,

    /// Datapath agents
    #[serde(default = "default_datapath_addr")]
    pub datapath_addr: SocketAddr,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            client_addr: default_client_addr(),
            datapath_addr: default_datapath_addr(),
        }
    }
}

fn default_poll_secs() -> u64 {
    20
}

fn default_epoch_secs() -> u64 {
    10
}

fn default_max_snapshots() -> usize {
    10
}

fn default_utilization_secs() -> u64 {
    1
}

fn default_query_timeout_secs() -> u64 {
    10
}

fn default_recompute_secs() -> u64 {
    5
}

fn default_flood_wait_secs() -> u64 {
    10
}

fn default_client_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 2703))
}

fn default_datapath_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 6633))
}
