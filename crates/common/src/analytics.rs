use crate::{Dpid, PortNo};
use serde::{Deserialize, Serialize};

/// Point-in-time statistics of one switch, as sent to clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotReport {
    pub dpid: Dpid,

    /// Collection epoch (logical clock) the snapshot belongs to.
    pub collection_epoch: u64,

    /// Wall-clock capture time (microseconds since UNIX epoch).
    pub timestamp_us: u64,

    /// Epochs elapsed since the previous snapshot, if there was one.
    pub epoch_delta: Option<u64>,

    /// Wall-clock gap to the previous snapshot in seconds.
    pub time_since_delta_secs: f64,

    /// Flow table aggregates from the last aggregate-stats reply.
    pub number_of_flows: Option<u32>,
    pub bytes_in_flows: Option<u64>,
    pub packets_in_flows: Option<u64>,

    /// Switch-wide counters summed over all ports.
    pub totals: CounterReport,

    /// Per-port breakdown, ordered by port number.
    pub ports: Vec<PortInfoReport>,

    /// Whether every delta has been filled in.
    pub ready: bool,
}

/// Cumulative counters and their deltas against the previous snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterReport {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,

    /// `None` until a previous snapshot has been seen.
    pub delta: Option<CounterDeltaReport>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterDeltaReport {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortInfoReport {
    pub port_no: PortNo,
    pub counters: CounterReport,

    /// Static capability, absent when the port was never announced.
    pub capability: Option<PortCapabilityReport>,

    pub bits_received_per_sec: f64,
    pub bits_sent_per_sec: f64,
    pub packets_received_per_sec: f64,
    pub packets_sent_per_sec: f64,

    /// Percent of the port's max speed; 0 when the speed is unknown.
    pub rx_utilization_pct: f64,
    pub tx_utilization_pct: f64,
    pub avg_utilization_pct: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortCapabilityReport {
    pub port_name: String,
    pub port_no: PortNo,
    pub port_enabled: bool,
    pub link_enabled: bool,
    pub max_speed_bps: u64,
    pub full_duplex: bool,
}

/// Estimated load of one port.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PortUtilization {
    pub dpid: Dpid,
    pub port: PortNo,
    pub bps_transmitted: f64,
    pub bps_received: f64,
    pub capacity_bps: u64,
}

impl PortUtilization {
    /// Average of tx and rx rates over capacity. Not clamped: values above
    /// 1.0 point at counter or clock anomalies.
    pub fn utilization(&self) -> f64 {
        if self.capacity_bps == 0 {
            return 0.0;
        }
        let avg = (self.bps_transmitted + self.bps_received) / 2.0;
        avg / self.capacity_bps as f64
    }
}

/// Entry of a `linkutils` broadcast.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct LinkUtil {
    pub dpid: Dpid,
    pub port: PortNo,
    pub utilization: f64,
}

impl From<&PortUtilization> for LinkUtil {
    fn from(util: &PortUtilization) -> Self {
        LinkUtil {
            dpid: util.dpid,
            port: util.port,
            utilization: util.utilization(),
        }
    }
}

/// Drops, errors or a counter regression observed on a port in one window.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortErrorReport {
    pub dpid: Dpid,
    pub port: PortNo,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,

    /// At least one cumulative counter went backwards (reset or wrap).
    pub counter_regression: bool,
}
