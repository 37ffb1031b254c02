//! Frames exchanged between the controller and datapath agents.
//!
//! These are logical OpenFlow 1.0 shapes, not byte-exact protocol messages.

use serde::{Deserialize, Serialize};

use crate::{Dpid, PortNo};

// ofp_port_config
pub const OFPPC_PORT_DOWN: u32 = 1 << 0;
pub const OFPPC_NO_FLOOD: u32 = 1 << 4;

// ofp_port_state
pub const OFPPS_LINK_DOWN: u32 = 1 << 0;

// ofp_port_features
pub const OFPPF_10MB_HD: u32 = 1 << 0;
pub const OFPPF_10MB_FD: u32 = 1 << 1;
pub const OFPPF_100MB_HD: u32 = 1 << 2;
pub const OFPPF_100MB_FD: u32 = 1 << 3;
pub const OFPPF_1GB_HD: u32 = 1 << 4;
pub const OFPPF_1GB_FD: u32 = 1 << 5;
pub const OFPPF_10GB_FD: u32 = 1 << 6;

/// Match every flow.
pub const OFPFW_ALL: u32 = 0x003f_ffff;
/// Every table.
pub const ALL_TABLES: u8 = 0xff;

/// Port description as announced at join time or in a port-status message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    pub port_no: PortNo,
    pub name: String,
    pub hw_addr: [u8; 6],
    /// `OFPPC_*` bits.
    pub config: u32,
    /// `OFPPS_*` bits.
    pub state: u32,
    /// Current `OFPPF_*` feature bits.
    pub curr: u32,
}

impl PortDescriptor {
    pub fn is_port_down(&self) -> bool {
        self.config & OFPPC_PORT_DOWN != 0
    }

    pub fn is_link_down(&self) -> bool {
        self.state & OFPPS_LINK_DOWN != 0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortReason {
    Add,
    Delete,
    Modify,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum StatsKind {
    Port,
    Table,
    Aggregate,
    Flow,
    Queue,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowMatch {
    pub wildcards: u32,
}

impl FlowMatch {
    pub fn all() -> Self {
        FlowMatch {
            wildcards: OFPFW_ALL,
        }
    }
}

/// Outbound statistics request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatsRequest {
    pub dpid: Dpid,
    pub kind: StatsKind,
    pub xid: u32,
    pub flow_match: Option<FlowMatch>,
    pub table_id: Option<u8>,
}

/// Outbound port configuration (`ofp_port_mod`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub dpid: Dpid,
    pub port: PortNo,
    pub hw_addr: [u8; 6],
    pub mask: u32,
    pub config: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStats {
    pub port_no: PortNo,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct TableStats {
    pub table_id: u8,
    pub name: String,
    pub max_entries: u32,
    pub active_count: u32,
    pub lookup_count: u64,
    pub matched_count: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregateStats {
    pub packet_count: u64,
    pub byte_count: u64,
    pub flow_count: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct FlowStats {
    pub table_id: u8,
    pub flow_match: FlowMatch,
    pub duration_sec: u32,
    pub priority: u16,
    pub packet_count: u64,
    pub byte_count: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub port_no: PortNo,
    pub queue_id: u32,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
}

/// Body of a statistics reply; the variant names the stats kind.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum StatsBody {
    Port(Vec<PortStats>),
    Table(Vec<TableStats>),
    Aggregate(AggregateStats),
    Flow(Vec<FlowStats>),
    Queue(Vec<QueueStats>),
}

impl StatsBody {
    pub fn kind(&self) -> StatsKind {
        match self {
            StatsBody::Port(_) => StatsKind::Port,
            StatsBody::Table(_) => StatsKind::Table,
            StatsBody::Aggregate(_) => StatsKind::Aggregate,
            StatsBody::Flow(_) => StatsKind::Flow,
            StatsBody::Queue(_) => StatsKind::Queue,
        }
    }
}

/// One direction of a discovered link.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Link {
    pub src_dpid: Dpid,
    pub src_port: PortNo,
    pub dst_dpid: Dpid,
    pub dst_port: PortNo,
}

impl Link {
    pub fn new(src_dpid: Dpid, src_port: PortNo, dst_dpid: Dpid, dst_port: PortNo) -> Self {
        Link {
            src_dpid,
            src_port,
            dst_dpid,
            dst_port,
        }
    }

    pub fn reversed(&self) -> Self {
        Link::new(self.dst_dpid, self.dst_port, self.src_dpid, self.src_port)
    }
}

/// Datapath agent -> controller.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum DatapathEvent {
    SwitchJoined {
        dpid: Dpid,
        ports: Vec<PortDescriptor>,
    },
    SwitchLeft {
        dpid: Dpid,
    },
    PortStatus {
        dpid: Dpid,
        reason: PortReason,
        port: PortDescriptor,
    },
    StatsReply {
        dpid: Dpid,
        xid: u32,
        body: StatsBody,
    },
    LinkUp(Link),
    LinkDown(Link),
}

/// Controller -> datapath agent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ControllerCommand {
    StatsRequest(StatsRequest),
    PortConfig(PortConfig),
}

impl ControllerCommand {
    pub fn dpid(&self) -> Dpid {
        match self {
            ControllerCommand::StatsRequest(request) => request.dpid,
            ControllerCommand::PortConfig(config) => config.dpid,
        }
    }
}
