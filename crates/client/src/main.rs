use std::{
    io::{Error, ErrorKind, Result},
    net::{SocketAddr, UdpSocket},
    time::{Duration, Instant},
};

use clap::Parser;
use common::{
    ClientRequest, Dpid, ServerMessage, decode_message, encode_message,
    protocol::{MonitoringCommand, QueryKind, SpanningTreeCommand, Topic},
};

use crate::{
    cli::{Cli, Command},
    emulator::EmulatedSwitch,
};

mod cli;
mod emulator;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Subscribe { topic, count } => subscribe(cli.server, topic.into(), count),
        Command::Query {
            kind,
            dpid,
            xid,
            timeout_secs,
        } => query(
            cli.server,
            kind.into(),
            dpid,
            xid,
            Duration::from_secs(timeout_secs),
        ),
        Command::Emulate {
            controller,
            dpid,
            ports,
            links,
            bytes_per_sec,
            duration_secs,
        } => {
            let switch = links.into_iter().fold(
                EmulatedSwitch::new(dpid, ports, bytes_per_sec),
                |switch, (local, peer, peer_port)| switch.with_link(local, peer, peer_port),
            );
            emulator::run(switch, controller, duration_secs.map(Duration::from_secs))
        }
    }
}

fn open_socket(server: SocketAddr) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))?;
    socket.connect(server)?;
    Ok(socket)
}

fn send_request(socket: &UdpSocket, request: &ClientRequest) -> Result<()> {
    let bytes = encode_message(request).map_err(Error::other)?;
    socket.send(&bytes)?;
    Ok(())
}

fn recv_message(socket: &UdpSocket, buf: &mut [u8]) -> Result<ServerMessage> {
    let len = socket.recv(buf)?;
    decode_message(&buf[..len]).map_err(Error::other)
}

fn print_message(message: &ServerMessage) -> Result<()> {
    let text = serde_json::to_string_pretty(message).map_err(Error::other)?;
    println!("{text}");
    Ok(())
}

fn subscribe_request(topic: Topic) -> ClientRequest {
    match topic {
        Topic::Monitoring(msg_type) => {
            ClientRequest::Monitoring(MonitoringCommand::Subscribe { msg_type })
        }
        Topic::SpanningTree(msg_type) => {
            ClientRequest::SpanningTree(SpanningTreeCommand::Subscribe { msg_type })
        }
    }
}

fn query_request(kind: QueryKind, dpid: Dpid, xid: u32) -> ClientRequest {
    let command = match kind {
        QueryKind::PortStats => MonitoringCommand::PortStats { dpid, xid },
        QueryKind::TableStats => MonitoringCommand::TableStats { dpid, xid },
        QueryKind::AggStats => MonitoringCommand::AggStats { dpid, xid },
        QueryKind::FlowStats => MonitoringCommand::FlowStats { dpid, xid },
        QueryKind::QueueStats => MonitoringCommand::QueueStats { dpid, xid },
        QueryKind::LatestSnapshot => MonitoringCommand::LatestSnapshot { dpid, xid },
    };
    ClientRequest::Monitoring(command)
}

fn subscribe(server: SocketAddr, topic: Topic, count: Option<usize>) -> Result<()> {
    let socket = open_socket(server)?;
    send_request(&socket, &subscribe_request(topic))?;

    let mut buf = vec![0u8; 64 * 1024];
    let mut received = 0;
    while count.is_none_or(|limit| received < limit) {
        match recv_message(&socket, &mut buf) {
            Ok(message) => {
                print_message(&message)?;
                received += 1;
            }
            Err(err) if err.kind() == ErrorKind::Other => {
                eprintln!("ignoring undecodable message: {err}");
            }
            Err(err) => return Err(err),
        }
    }

    send_request(&socket, &ClientRequest::Disconnect)
}

fn query(server: SocketAddr, kind: QueryKind, dpid: Dpid, xid: u32, timeout: Duration) -> Result<()> {
    let socket = open_socket(server)?;
    send_request(&socket, &query_request(kind, dpid, xid))?;

    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::new(
                ErrorKind::TimedOut,
                format!("no reply for xid {xid} from {server}"),
            ));
        }
        socket.set_read_timeout(Some(remaining))?;
        match recv_message(&socket, &mut buf) {
            Ok(message) => return print_message(&message),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(err) => return Err(err),
        }
    }
}
