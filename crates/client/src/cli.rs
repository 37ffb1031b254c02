use std::net::SocketAddr;

use clap::{Parser, Subcommand, ValueEnum};
use common::{
    Dpid, PortNo,
    protocol::{MonitoringTopic, QueryKind, SpanningTreeTopic, Topic},
};

/// Control-plane client and switch emulator for canopyd
#[derive(Parser, Debug)]
#[command(name = "canopyctl")]
#[command(version)]
pub struct Cli {
    /// Controller address for control-plane clients
    #[arg(short, long, env = "CANOPY_SERVER", default_value = "127.0.0.1:2703")]
    pub server: SocketAddr,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Subscribe to a broadcast and print every message received
    Subscribe {
        #[arg(value_enum)]
        topic: TopicArg,

        /// Stop after this many messages
        #[arg(long)]
        count: Option<usize>,
    },

    /// Ask for one switch's statistics and print the reply
    Query {
        #[arg(value_enum)]
        kind: QueryArg,

        /// Datapath id in hex
        dpid: Dpid,

        #[arg(long, default_value_t = 1)]
        xid: u32,

        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },

    /// Pretend to be a switch: join, answer stats requests, apply port configs
    Emulate {
        /// Controller address for datapath agents
        #[arg(long, default_value = "127.0.0.1:6633")]
        controller: SocketAddr,

        /// Datapath id in hex
        #[arg(long)]
        dpid: Dpid,

        /// Number of physical ports
        #[arg(long, default_value_t = 4)]
        ports: u16,

        /// Outgoing link `local_port:peer_dpid:peer_port`, repeatable
        #[arg(long = "link", value_parser = parse_link)]
        links: Vec<(PortNo, Dpid, PortNo)>,

        /// Synthetic traffic per port and direction
        #[arg(long, default_value_t = 125_000)]
        bytes_per_sec: u64,

        /// Leave after this many seconds
        #[arg(long)]
        duration_secs: Option<u64>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum TopicArg {
    Linkutils,
    Porterror,
    Silentswitch,
    StpPorts,
}

impl From<TopicArg> for Topic {
    fn from(arg: TopicArg) -> Self {
        match arg {
            TopicArg::Linkutils => Topic::Monitoring(MonitoringTopic::LinkUtils),
            TopicArg::Porterror => Topic::Monitoring(MonitoringTopic::PortError),
            TopicArg::Silentswitch => Topic::Monitoring(MonitoringTopic::SilentSwitch),
            TopicArg::StpPorts => Topic::SpanningTree(SpanningTreeTopic::StpPorts),
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum QueryArg {
    Portstats,
    Tablestats,
    Aggstats,
    Flowstats,
    Queuestats,
    Latestsnapshot,
}

impl From<QueryArg> for QueryKind {
    fn from(arg: QueryArg) -> Self {
        match arg {
            QueryArg::Portstats => QueryKind::PortStats,
            QueryArg::Tablestats => QueryKind::TableStats,
            QueryArg::Aggstats => QueryKind::AggStats,
            QueryArg::Flowstats => QueryKind::FlowStats,
            QueryArg::Queuestats => QueryKind::QueueStats,
            QueryArg::Latestsnapshot => QueryKind::LatestSnapshot,
        }
    }
}

fn parse_link(value: &str) -> Result<(PortNo, Dpid, PortNo), String> {
    let parts: Vec<&str> = value.split(':').collect();
    let [local, peer, peer_port] = parts.as_slice() else {
        return Err(format!("expected local_port:peer_dpid:peer_port, got {value}"));
    };
    let local = local
        .parse::<PortNo>()
        .map_err(|_| format!("invalid port: {local}"))?;
    let peer = peer
        .parse::<Dpid>()
        .map_err(|_| format!("invalid dpid: {peer}"))?;
    let peer_port = peer_port
        .parse::<PortNo>()
        .map_err(|_| format!("invalid port: {peer_port}"))?;
    Ok((local, peer, peer_port))
}
