//! Northbound control-plane client protocol.
//!
//! Clients address either the `monitoring` or the `spanning_tree`
//! subsystem. Requests and replies are closed tagged unions so malformed
//! input is rejected once, at decode time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    Dpid, PortNo,
    analytics::{LinkUtil, PortErrorReport, SnapshotReport},
    southbound::{AggregateStats, FlowStats, PortStats, QueueStats, StatsKind, TableStats},
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Monitoring(MonitoringCommand),
    SpanningTree(SpanningTreeCommand),
    /// Drop every subscription and pending query of the sender.
    Disconnect,
}

#[derive(Debug, thiserror::Error)]
#[error("malformed client request: {0}")]
pub struct RequestError(#[from] serde_json::Error);

impl ClientRequest {
    pub fn parse(buf: &[u8]) -> Result<Self, RequestError> {
        Ok(serde_json::from_slice(buf)?)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum MonitoringCommand {
    Subscribe { msg_type: MonitoringTopic },
    PortStats { dpid: Dpid, xid: u32 },
    TableStats { dpid: Dpid, xid: u32 },
    AggStats { dpid: Dpid, xid: u32 },
    FlowStats { dpid: Dpid, xid: u32 },
    QueueStats { dpid: Dpid, xid: u32 },
    LatestSnapshot { dpid: Dpid, xid: u32 },
}

impl MonitoringCommand {
    /// The on-demand query this command asks for, if it is one.
    pub fn query(&self) -> Option<(QueryKind, Dpid, u32)> {
        use MonitoringCommand::*;
        match *self {
            Subscribe { .. } => None,
            PortStats { dpid, xid } => Some((QueryKind::PortStats, dpid, xid)),
            TableStats { dpid, xid } => Some((QueryKind::TableStats, dpid, xid)),
            AggStats { dpid, xid } => Some((QueryKind::AggStats, dpid, xid)),
            FlowStats { dpid, xid } => Some((QueryKind::FlowStats, dpid, xid)),
            QueueStats { dpid, xid } => Some((QueryKind::QueueStats, dpid, xid)),
            LatestSnapshot { dpid, xid } => Some((QueryKind::LatestSnapshot, dpid, xid)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum SpanningTreeCommand {
    Subscribe { msg_type: SpanningTreeTopic },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MonitoringTopic {
    LinkUtils,
    PortError,
    SilentSwitch,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpanningTreeTopic {
    #[serde(rename = "stp_ports")]
    StpPorts,
}

/// Anything a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Monitoring(MonitoringTopic),
    SpanningTree(SpanningTreeTopic),
}

/// What an on-demand monitoring query asks for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    PortStats,
    TableStats,
    AggStats,
    FlowStats,
    QueueStats,
    LatestSnapshot,
}

impl QueryKind {
    /// Stats kind to request from the switch; `None` for queries answered
    /// locally.
    pub fn stats_kind(self) -> Option<StatsKind> {
        match self {
            QueryKind::PortStats => Some(StatsKind::Port),
            QueryKind::TableStats => Some(StatsKind::Table),
            QueryKind::AggStats => Some(StatsKind::Aggregate),
            QueryKind::FlowStats => Some(StatsKind::Flow),
            QueryKind::QueueStats => Some(StatsKind::Queue),
            QueryKind::LatestSnapshot => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Monitoring(MonitoringMessage),
    SpanningTree(SpanningTreeMessage),
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "msg_type", rename_all = "lowercase")]
pub enum MonitoringMessage {
    PortStats {
        xid: u32,
        dpid: Dpid,
        data: Vec<PortStats>,
    },
    TableStats {
        xid: u32,
        dpid: Dpid,
        data: Vec<TableStats>,
    },
    AggStats {
        xid: u32,
        dpid: Dpid,
        data: AggregateStats,
    },
    FlowStats {
        xid: u32,
        dpid: Dpid,
        data: Vec<FlowStats>,
    },
    QueueStats {
        xid: u32,
        dpid: Dpid,
        data: Vec<QueueStats>,
    },
    LatestSnapshot {
        xid: u32,
        dpid: Dpid,
        data: Box<SnapshotReport>,
    },
    /// Unsolicited utilization broadcast.
    LinkUtils { utils: Vec<LinkUtil> },
    PortError(PortErrorReport),
    SilentSwitch { dpid: Dpid },
}

impl MonitoringMessage {
    pub fn topic(&self) -> Option<MonitoringTopic> {
        match self {
            MonitoringMessage::LinkUtils { .. } => Some(MonitoringTopic::LinkUtils),
            MonitoringMessage::PortError(_) => Some(MonitoringTopic::PortError),
            MonitoringMessage::SilentSwitch { .. } => Some(MonitoringTopic::SilentSwitch),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "msg_type")]
pub enum SpanningTreeMessage {
    #[serde(rename = "stp_ports")]
    StpPorts { ports: StpPorts },
}

/// Flood ports per switch plus the designated root.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct StpPorts {
    #[serde(flatten)]
    pub flood_ports: BTreeMap<Dpid, Vec<PortNo>>,
    pub root: Option<Dpid>,
    #[serde(default)]
    pub roots: Vec<Dpid>,
}
