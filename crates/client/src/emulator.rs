//! A software switch that speaks the southbound frames.

use std::{
    collections::BTreeMap,
    io::{Error, ErrorKind, Result},
    net::{SocketAddr, UdpSocket},
    time::{Duration, Instant},
};

use common::{
    ControllerCommand, DatapathEvent, Dpid, PortNo, decode_frame, encode_frame,
    southbound::{
        AggregateStats, FlowMatch, FlowStats, Link, OFPPF_1GB_FD, PortConfig, PortDescriptor,
        PortReason, PortStats, QueueStats, StatsBody, StatsKind, StatsRequest, TableStats,
    },
};

const AVG_PACKET_BYTES: u64 = 1_000;

pub struct EmulatedSwitch {
    pub dpid: Dpid,
    pub ports: Vec<PortDescriptor>,
    pub links: Vec<Link>,
    bytes_per_sec: u64,
    counters: BTreeMap<PortNo, PortStats>,
    lookups: u64,
    pub port_mods: u64,
}

impl EmulatedSwitch {
    pub fn new(dpid: Dpid, port_count: u16, bytes_per_sec: u64) -> Self {
        let ports: Vec<PortDescriptor> = (1..=port_count)
            .map(|port_no| PortDescriptor {
                port_no,
                name: format!("eth{port_no}"),
                hw_addr: hw_addr(dpid, port_no),
                config: 0,
                state: 0,
                curr: OFPPF_1GB_FD,
            })
            .collect();
        let counters = ports
            .iter()
            .map(|port| {
                (
                    port.port_no,
                    PortStats {
                        port_no: port.port_no,
                        ..Default::default()
                    },
                )
            })
            .collect();
        EmulatedSwitch {
            dpid,
            ports,
            links: Vec::new(),
            bytes_per_sec,
            counters,
            lookups: 0,
            port_mods: 0,
        }
    }

    pub fn with_link(mut self, local: PortNo, peer: Dpid, peer_port: PortNo) -> Self {
        self.links.push(Link::new(self.dpid, local, peer, peer_port));
        self
    }

    pub fn join_event(&self) -> DatapathEvent {
        DatapathEvent::SwitchJoined {
            dpid: self.dpid,
            ports: self.ports.clone(),
        }
    }

    /// Grow every port's counters by `elapsed` worth of synthetic traffic.
    pub fn advance(&mut self, elapsed: Duration) {
        let bytes = (self.bytes_per_sec as f64 * elapsed.as_secs_f64()) as u64;
        let packets = bytes / AVG_PACKET_BYTES;
        for stats in self.counters.values_mut() {
            stats.rx_bytes += bytes;
            stats.tx_bytes += bytes;
            stats.rx_packets += packets;
            stats.tx_packets += packets;
        }
        self.lookups += packets;
    }

    /// Reply to a statistics request, echoing its xid.
    pub fn answer(&self, request: &StatsRequest) -> DatapathEvent {
        let body = match request.kind {
            StatsKind::Port => StatsBody::Port(self.counters.values().copied().collect()),
            StatsKind::Table => StatsBody::Table(vec![TableStats {
                table_id: 0,
                name: "classifier".into(),
                max_entries: 1 << 20,
                active_count: self.ports.len() as u32,
                lookup_count: self.lookups,
                matched_count: self.lookups,
            }]),
            StatsKind::Aggregate => StatsBody::Aggregate(AggregateStats {
                packet_count: self.counters.values().map(|s| s.rx_packets).sum(),
                byte_count: self.counters.values().map(|s| s.rx_bytes).sum(),
                flow_count: self.ports.len() as u32,
            }),
            StatsKind::Flow => StatsBody::Flow(
                self.counters
                    .values()
                    .map(|stats| FlowStats {
                        table_id: 0,
                        flow_match: FlowMatch::default(),
                        duration_sec: 0,
                        priority: 0x8000,
                        packet_count: stats.rx_packets,
                        byte_count: stats.rx_bytes,
                    })
                    .collect(),
            ),
            StatsKind::Queue => StatsBody::Queue(
                self.counters
                    .values()
                    .map(|stats| QueueStats {
                        port_no: stats.port_no,
                        queue_id: 0,
                        tx_bytes: stats.tx_bytes,
                        tx_packets: stats.tx_packets,
                        tx_errors: 0,
                    })
                    .collect(),
            ),
        };
        DatapathEvent::StatsReply {
            dpid: self.dpid,
            xid: request.xid,
            body,
        }
    }

    /// Apply a port modification. Returns the port when its configuration
    /// actually changed.
    pub fn apply(&mut self, config: &PortConfig) -> Option<PortDescriptor> {
        let port = self
            .ports
            .iter_mut()
            .find(|port| port.port_no == config.port)?;
        let updated = (port.config & !config.mask) | (config.config & config.mask);
        self.port_mods += 1;
        if updated == port.config {
            return None;
        }
        port.config = updated;
        Some(port.clone())
    }
}

fn hw_addr(dpid: Dpid, port_no: PortNo) -> [u8; 6] {
    let [.., a, b, c] = dpid.0.to_be_bytes();
    let [p0, p1] = port_no.to_be_bytes();
    [0x02, a, b, c, p0, p1]
}

fn send_event(socket: &UdpSocket, event: &DatapathEvent) -> Result<()> {
    let frame = encode_frame(event).map_err(Error::other)?;
    socket.send(&frame)?;
    Ok(())
}

/// Join the controller and serve it until `duration` runs out.
pub fn run(
    mut switch: EmulatedSwitch,
    controller: SocketAddr,
    duration: Option<Duration>,
) -> Result<()> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))?;
    socket.connect(controller)?;
    socket.set_read_timeout(Some(Duration::from_millis(200)))?;

    send_event(&socket, &switch.join_event())?;
    for link in &switch.links {
        send_event(&socket, &DatapathEvent::LinkUp(*link))?;
    }
    println!(
        "switch {} joined {controller} with {} ports",
        switch.dpid,
        switch.ports.len()
    );

    let started = Instant::now();
    let mut last = started;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        if duration.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }

        let now = Instant::now();
        switch.advance(now - last);
        last = now;

        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue;
            }
            Err(err) => return Err(err),
        };
        let command: ControllerCommand = match decode_frame(&buf[..len]) {
            Ok(command) => command,
            Err(err) => {
                eprintln!("ignoring undecodable frame: {err}");
                continue;
            }
        };
        match command {
            ControllerCommand::StatsRequest(request) => {
                send_event(&socket, &switch.answer(&request))?;
            }
            ControllerCommand::PortConfig(config) => {
                if let Some(port) = switch.apply(&config) {
                    println!("port {} config now {:#x}", port.port_no, port.config);
                    send_event(
                        &socket,
                        &DatapathEvent::PortStatus {
                            dpid: switch.dpid,
                            reason: PortReason::Modify,
                            port,
                        },
                    )?;
                }
            }
        }
    }

    send_event(&socket, &DatapathEvent::SwitchLeft { dpid: switch.dpid })?;
    println!(
        "switch {} left after {} port mods",
        switch.dpid, switch.port_mods
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::southbound::OFPPC_NO_FLOOD;

    #[test]
    fn counters_grow_and_xid_is_echoed() {
        let mut switch = EmulatedSwitch::new(Dpid(1), 2, 1_000);
        switch.advance(Duration::from_secs(2));

        let reply = switch.answer(&StatsRequest {
            dpid: Dpid(1),
            kind: StatsKind::Port,
            xid: 42,
            flow_match: None,
            table_id: None,
        });
        let DatapathEvent::StatsReply { xid, body, .. } = reply else {
            panic!("expected a stats reply");
        };
        assert_eq!(xid, 42);
        let StatsBody::Port(stats) = body else {
            panic!("expected port stats");
        };
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|s| s.rx_bytes == 2_000 && s.tx_bytes == 2_000));
    }

    #[test]
    fn port_config_is_applied_once() {
        let mut switch = EmulatedSwitch::new(Dpid(1), 1, 0);
        let config = PortConfig {
            dpid: Dpid(1),
            port: 1,
            hw_addr: switch.ports[0].hw_addr,
            mask: OFPPC_NO_FLOOD,
            config: OFPPC_NO_FLOOD,
        };

        let port = switch.apply(&config).expect("config changed");
        assert_eq!(port.config, OFPPC_NO_FLOOD);
        assert!(switch.apply(&config).is_none());
        assert_eq!(switch.port_mods, 2);
    }

    #[test]
    fn links_originate_at_the_emulated_switch() {
        let switch = EmulatedSwitch::new(Dpid(2), 2, 0).with_link(1, Dpid(3), 4);
        assert_eq!(switch.links, vec![Link::new(Dpid(2), 1, Dpid(3), 4)]);
    }
}
