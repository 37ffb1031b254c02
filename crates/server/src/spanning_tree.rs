//! Flood-port computation over the discovered link graph.
//!
//! Every pass rebuilds a spanning forest from scratch: candidate ports are
//! refreshed, unidirectional links discarded, one link kept between each
//! pair of switches, and redundant links between already connected switches
//! disabled. Switches are only reconfigured where the decision changed.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Instant,
};

use common::{
    Dpid, PortNo, ServerMessage, is_physical_port,
    protocol::{SpanningTreeMessage, SpanningTreeTopic, StpPorts, Topic},
    southbound::{OFPPC_NO_FLOOD, PortConfig, PortDescriptor, PortReason},
};
use tracing::{debug, info, warn};

use crate::{
    capability::PortCapability,
    client::Delivery,
    config::SpanningTreeConfig,
    transport::{LinkSource, Transport},
};

/// Per-port tree state, as seen after the last pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanningTreePortState {
    /// Candidate for use in this pass.
    pub enabled: bool,
    /// Flooding currently allowed on the switch.
    pub flood: bool,
    /// Chosen as the preferred link between two switches in this pass.
    pub keep: bool,
    /// Earliest time the port may flood; `None` for reserved ports.
    pub enable_time: Option<Instant>,
}

#[derive(Debug, Clone)]
struct TreePort {
    hw_addr: [u8; 6],
    speed_bps: u64,
    link_down: bool,
    state: SpanningTreePortState,
}

impl TreePort {
    fn new(port: &PortDescriptor, enable_time: Option<Instant>) -> Self {
        TreePort {
            hw_addr: port.hw_addr,
            speed_bps: PortCapability::from_descriptor(port).max_speed_bps,
            link_down: port.is_link_down(),
            state: SpanningTreePortState {
                enabled: false,
                flood: false,
                keep: false,
                enable_time,
            },
        }
    }
}

/// `src -> dst -> {(src_port, dst_port)}`
type LinkMap = BTreeMap<Dpid, BTreeMap<Dpid, BTreeSet<(PortNo, PortNo)>>>;

#[derive(Debug)]
pub struct SpanningTreeEngine {
    config: SpanningTreeConfig,
    datapaths: BTreeMap<Dpid, BTreeMap<PortNo, TreePort>>,
    roots: BTreeSet<Dpid>,
    current_flood_ports: BTreeMap<Dpid, Vec<PortNo>>,
    unidirectional_links: u64,
    delivery_failures: u64,
    outbox: Vec<Delivery>,
}

impl SpanningTreeEngine {
    pub fn new(config: SpanningTreeConfig) -> Self {
        SpanningTreeEngine {
            config,
            datapaths: BTreeMap::new(),
            roots: BTreeSet::new(),
            current_flood_ports: BTreeMap::new(),
            unidirectional_links: 0,
            delivery_failures: 0,
            outbox: Vec::new(),
        }
    }

    /// Track a new switch. Physical ports start blocked and wait out the
    /// hold time before they may flood. A repeated join is ignored.
    pub fn on_datapath_join(
        &mut self,
        transport: &mut dyn Transport,
        dpid: Dpid,
        ports: &[PortDescriptor],
        now: Instant,
    ) -> bool {
        if self.datapaths.contains_key(&dpid) {
            debug!(dpid = %dpid, "Ignoring repeated join");
            return false;
        }
        self.datapaths.insert(dpid, BTreeMap::new());
        for port in ports {
            self.add_port(transport, dpid, port, now);
        }
        info!(dpid = %dpid, ports = ports.len(), "Tracking switch");
        true
    }

    pub fn on_datapath_leave(&mut self, dpid: Dpid) -> bool {
        let known = self.datapaths.remove(&dpid).is_some();
        if known {
            info!(dpid = %dpid, "Stopped tracking switch");
        }
        known
    }

    /// Apply a port change. Nothing is recomputed until the next pass.
    pub fn on_port_status(
        &mut self,
        transport: &mut dyn Transport,
        dpid: Dpid,
        reason: PortReason,
        port: &PortDescriptor,
        now: Instant,
    ) {
        if !self.datapaths.contains_key(&dpid) {
            return;
        }
        match reason {
            PortReason::Add => self.add_port(transport, dpid, port, now),
            PortReason::Delete => {
                if let Some(ports) = self.datapaths.get_mut(&dpid) {
                    ports.remove(&port.port_no);
                }
                debug!(dpid = %dpid, port = port.port_no, "Port removed");
            }
            PortReason::Modify => {
                let wait = self.config.flood_wait();
                let Some(entry) = self
                    .datapaths
                    .get_mut(&dpid)
                    .and_then(|ports| ports.get_mut(&port.port_no))
                else {
                    self.add_port(transport, dpid, port, now);
                    return;
                };
                let came_up = entry.link_down && !port.is_link_down();
                entry.link_down = port.is_link_down();
                entry.hw_addr = port.hw_addr;
                entry.speed_bps = PortCapability::from_descriptor(port).max_speed_bps;
                if came_up && is_physical_port(port.port_no) {
                    entry.state.enable_time = Some(now + wait);
                    debug!(dpid = %dpid, port = port.port_no, "Link up, holding flood");
                }
            }
        }
    }

    /// Start tracking `port` from scratch. Re-adding a known port is the
    /// same as adding it anew: its entry is replaced with a blocked one,
    /// the hold time restarts and a no-flood config is sent again.
    fn add_port(
        &mut self,
        transport: &mut dyn Transport,
        dpid: Dpid,
        port: &PortDescriptor,
        now: Instant,
    ) {
        let physical = is_physical_port(port.port_no);
        let enable_time = physical.then(|| now + self.config.flood_wait());
        if let Some(ports) = self.datapaths.get_mut(&dpid) {
            ports.insert(port.port_no, TreePort::new(port, enable_time));
        }
        if physical {
            self.send_flood_config(transport, dpid, port.port_no, port.hw_addr, false);
        }
    }

    fn send_flood_config(
        &mut self,
        transport: &mut dyn Transport,
        dpid: Dpid,
        port: PortNo,
        hw_addr: [u8; 6],
        flood: bool,
    ) -> bool {
        let config = PortConfig {
            dpid,
            port,
            hw_addr,
            mask: OFPPC_NO_FLOOD,
            config: if flood { 0 } else { OFPPC_NO_FLOOD },
        };
        match transport.send_port_config(config) {
            Ok(()) => true,
            Err(err) => {
                self.delivery_failures += 1;
                warn!(dpid = %dpid, port, error = %err, "Port config not delivered");
                false
            }
        }
    }

    /// One full recomputation pass. Returns whether the flood-port map
    /// changed (and was broadcast).
    pub fn recompute(
        &mut self,
        transport: &mut dyn Transport,
        links: &dyn LinkSource,
        now: Instant,
    ) -> bool {
        self.refresh_candidates(now);
        let mut link_map = self.build_link_map(links);
        self.verify_bidirectional(&mut link_map);
        self.roots = self.build_forest(&link_map);
        self.apply_flood_decisions(transport);
        self.publish_if_changed()
    }

    fn refresh_candidates(&mut self, now: Instant) {
        for ports in self.datapaths.values_mut() {
            for (port_no, port) in ports.iter_mut() {
                port.state.enabled = !is_physical_port(*port_no)
                    || port.state.enable_time.is_none_or(|at| now >= at);
                port.state.keep = false;
            }
        }
    }

    fn port_mut(&mut self, dpid: Dpid, port: PortNo) -> Option<&mut TreePort> {
        self.datapaths.get_mut(&dpid)?.get_mut(&port)
    }

    fn port_enabled(&self, dpid: Dpid, port: PortNo) -> bool {
        self.datapaths
            .get(&dpid)
            .and_then(|ports| ports.get(&port))
            .is_some_and(|port| port.state.enabled)
    }

    fn disable(&mut self, dpid: Dpid, port: PortNo) {
        if let Some(port) = self.port_mut(dpid, port) {
            port.state.enabled = false;
        }
    }

    /// Links whose two endpoints are both current candidates.
    fn build_link_map(&self, links: &dyn LinkSource) -> LinkMap {
        let mut map = LinkMap::new();
        for link in links.link_snapshot() {
            if self.port_enabled(link.src_dpid, link.src_port)
                && self.port_enabled(link.dst_dpid, link.dst_port)
            {
                map.entry(link.src_dpid)
                    .or_default()
                    .entry(link.dst_dpid)
                    .or_default()
                    .insert((link.src_port, link.dst_port));
            }
        }
        map
    }

    /// Drop links seen in one direction only, disabling the port on the
    /// larger-dpid end.
    fn verify_bidirectional(&mut self, links: &mut LinkMap) {
        let mut one_way = Vec::new();
        for (src, dsts) in links.iter() {
            for (dst, pairs) in dsts {
                for &(src_port, dst_port) in pairs {
                    let reverse = links
                        .get(dst)
                        .and_then(|m| m.get(src))
                        .is_some_and(|p| p.contains(&(dst_port, src_port)));
                    if !reverse {
                        one_way.push((*src, src_port, *dst, dst_port));
                    }
                }
            }
        }

        for (src, src_port, dst, dst_port) in one_way {
            warn!(
                src = %src,
                src_port,
                dst = %dst,
                dst_port,
                "Unidirectional link detected"
            );
            self.unidirectional_links += 1;
            if src <= dst {
                self.disable(dst, dst_port);
            } else {
                self.disable(src, src_port);
            }

            if let Some(dsts) = links.get_mut(&src) {
                if let Some(pairs) = dsts.get_mut(&dst) {
                    pairs.remove(&(src_port, dst_port));
                    if pairs.is_empty() {
                        dsts.remove(&dst);
                    }
                }
                if dsts.is_empty() {
                    links.remove(&src);
                }
            }
        }
    }

    /// Greedy forest construction. The worklist pops the lowest pending
    /// dpid; neighbours reached from it are processed next, lowest first.
    fn build_forest(&mut self, links: &LinkMap) -> BTreeSet<Dpid> {
        let mut srcs: Vec<Dpid> = self.datapaths.keys().rev().copied().collect();
        let mut seen = BTreeSet::new();
        let mut roots = BTreeSet::new();

        while let Some(src) = srcs.pop() {
            if seen.insert(src) {
                roots.insert(src);
            }
            let Some(dsts) = links.get(&src) else {
                continue;
            };

            let mut next = Vec::new();
            for (&dst, pairs) in dsts {
                if !seen.contains(&dst) {
                    self.keep_fastest(src, dst, pairs);
                    seen.insert(dst);
                    next.push(dst);
                } else {
                    self.disable_redundant(src, dst, links);
                }
            }

            next.reverse();
            srcs.retain(|dpid| !next.contains(dpid));
            srcs.extend(next);
        }
        roots
    }

    /// Keep the parallel link with the fastest source port; ties go to the
    /// lowest port pair. Losers are blocked on the far side.
    fn keep_fastest(&mut self, src: Dpid, dst: Dpid, pairs: &BTreeSet<(PortNo, PortNo)>) {
        let mut best: Option<(u64, (PortNo, PortNo))> = None;
        for &pair in pairs {
            let Some(speed) = self
                .datapaths
                .get(&src)
                .and_then(|ports| ports.get(&pair.0))
                .map(|port| port.speed_bps)
            else {
                continue;
            };
            if best.is_none_or(|(best_speed, _)| speed > best_speed) {
                best = Some((speed, pair));
            }
        }

        let best_pair = best.map(|(_, pair)| pair);
        for &(src_port, dst_port) in pairs {
            if Some((src_port, dst_port)) == best_pair {
                if let Some(port) = self.port_mut(src, src_port) {
                    port.state.keep = true;
                }
                if let Some(port) = self.port_mut(dst, dst_port) {
                    port.state.keep = true;
                }
            } else {
                self.disable(dst, dst_port);
            }
        }
    }

    /// Block every link between two already connected switches, sparing
    /// ports kept earlier in this pass.
    fn disable_redundant(&mut self, src: Dpid, dst: Dpid, links: &LinkMap) {
        let (low, high) = if src <= dst { (src, dst) } else { (dst, src) };
        let Some(pairs) = links.get(&low).and_then(|m| m.get(&high)) else {
            return;
        };
        for &(mut low_port, mut high_port) in pairs {
            if low == high && low_port > high_port {
                std::mem::swap(&mut low_port, &mut high_port);
            }
            for (dpid, port_no) in [(high, high_port), (low, low_port)] {
                if let Some(port) = self.port_mut(dpid, port_no) {
                    if !port.state.keep {
                        port.state.enabled = false;
                    }
                }
            }
        }
    }

    /// Push `flood = enabled` to switches where it differs. A failed send
    /// leaves the old value so the next pass retries.
    fn apply_flood_decisions(&mut self, transport: &mut dyn Transport) {
        let mut changes = Vec::new();
        for (dpid, ports) in &self.datapaths {
            for (port_no, port) in ports {
                if is_physical_port(*port_no) && port.state.enabled != port.state.flood {
                    changes.push((*dpid, *port_no, port.hw_addr, port.state.enabled));
                }
            }
        }

        for (dpid, port_no, hw_addr, flood) in changes {
            debug!(
                dpid = %dpid,
                port = port_no,
                flood,
                "{} flooding",
                if flood { "Enabling" } else { "Disabling" }
            );
            if self.send_flood_config(transport, dpid, port_no, hw_addr, flood) {
                if let Some(port) = self.port_mut(dpid, port_no) {
                    port.state.flood = flood;
                }
            }
        }
    }

    fn computed_flood_ports(&self) -> BTreeMap<Dpid, Vec<PortNo>> {
        self.datapaths
            .iter()
            .map(|(dpid, ports)| {
                let flood = ports
                    .iter()
                    .filter(|(port_no, port)| is_physical_port(**port_no) && port.state.flood)
                    .map(|(port_no, _)| *port_no)
                    .collect();
                (*dpid, flood)
            })
            .collect()
    }

    fn publish_if_changed(&mut self) -> bool {
        let flood_ports = self.computed_flood_ports();
        if flood_ports == self.current_flood_ports {
            debug!("Spanning tree unchanged");
            return false;
        }
        self.current_flood_ports = flood_ports;
        info!(
            switches = self.current_flood_ports.len(),
            roots = self.roots.len(),
            "Spanning tree changed"
        );
        self.outbox.push(Delivery::Topic(
            Topic::SpanningTree(SpanningTreeTopic::StpPorts),
            self.stp_message(),
        ));
        true
    }

    /// The current flood-port map as sent to subscribers.
    pub fn current_ports(&self) -> StpPorts {
        StpPorts {
            flood_ports: self.current_flood_ports.clone(),
            root: self.roots.first().copied(),
            roots: self.roots.iter().copied().collect(),
        }
    }

    pub fn stp_message(&self) -> ServerMessage {
        ServerMessage::SpanningTree(SpanningTreeMessage::StpPorts {
            ports: self.current_ports(),
        })
    }

    pub fn drain_outbox(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.outbox)
    }

    /// One root per connected component, from the last pass.
    pub fn roots(&self) -> &BTreeSet<Dpid> {
        &self.roots
    }

    pub fn flood_ports(&self, dpid: Dpid) -> Option<&[PortNo]> {
        self.current_flood_ports.get(&dpid).map(Vec::as_slice)
    }

    /// Whether broadcast traffic arriving on this port may be processed.
    pub fn is_flood_port(&self, dpid: Dpid, port: PortNo) -> bool {
        self.port_state(dpid, port).is_some_and(|state| state.flood)
    }

    pub fn port_state(&self, dpid: Dpid, port: PortNo) -> Option<SpanningTreePortState> {
        self.datapaths
            .get(&dpid)
            .and_then(|ports| ports.get(&port))
            .map(|port| port.state)
    }

    pub fn is_tracked(&self, dpid: Dpid) -> bool {
        self.datapaths.contains_key(&dpid)
    }

    pub fn unidirectional_links(&self) -> u64 {
        self.unidirectional_links
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use common::{
        OFPP_LOCAL,
        southbound::{Link, OFPPF_1GB_FD, OFPPF_100MB_FD, OFPPS_LINK_DOWN, StatsRequest},
    };
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        configs: Vec<PortConfig>,
    }

    impl Transport for Recorder {
        fn send_stats_request(&mut self, _request: StatsRequest) -> Result<(), TransportError> {
            Ok(())
        }

        fn send_port_config(&mut self, config: PortConfig) -> Result<(), TransportError> {
            self.configs.push(config);
            Ok(())
        }
    }

    fn port(port_no: PortNo, curr: u32) -> PortDescriptor {
        PortDescriptor {
            port_no,
            name: format!("eth{port_no}"),
            hw_addr: [0, 0, 0, 0, 0, port_no as u8],
            config: 0,
            state: 0,
            curr,
        }
    }

    fn both_ways(a: u64, a_port: PortNo, b: u64, b_port: PortNo) -> [Link; 2] {
        let link = Link::new(Dpid(a), a_port, Dpid(b), b_port);
        [link, link.reversed()]
    }

    fn engine() -> SpanningTreeEngine {
        SpanningTreeEngine::new(SpanningTreeConfig::default())
    }

    fn settled(base: Instant) -> Instant {
        base + Duration::from_secs(11)
    }

    #[test]
    fn join_blocks_physical_ports_only() {
        let mut stp = engine();
        let mut transport = Recorder::default();
        let base = Instant::now();
        stp.on_datapath_join(
            &mut transport,
            Dpid(1),
            &[port(1, OFPPF_1GB_FD), port(OFPP_LOCAL, 0)],
            base,
        );

        assert_eq!(transport.configs.len(), 1);
        assert_eq!(transport.configs[0].config, OFPPC_NO_FLOOD);
        assert_eq!(transport.configs[0].mask, OFPPC_NO_FLOOD);
        let local = stp.port_state(Dpid(1), OFPP_LOCAL).expect("local port");
        assert_eq!(local.enable_time, None);
    }

    #[test]
    fn faster_parallel_link_wins() {
        let mut stp = engine();
        let mut transport = Recorder::default();
        let base = Instant::now();
        for dpid in [1, 2] {
            stp.on_datapath_join(
                &mut transport,
                Dpid(dpid),
                &[port(1, OFPPF_100MB_FD), port(2, OFPPF_1GB_FD)],
                base,
            );
        }
        let links: Vec<Link> = both_ways(1, 1, 2, 1)
            .into_iter()
            .chain(both_ways(1, 2, 2, 2))
            .collect();

        stp.recompute(&mut transport, &links, settled(base));

        for dpid in [1, 2] {
            let fast = stp.port_state(Dpid(dpid), 2).expect("fast port");
            assert!(fast.keep && fast.flood, "dpid {dpid}: {fast:?}");
            let slow = stp.port_state(Dpid(dpid), 1).expect("slow port");
            assert!(!slow.flood, "dpid {dpid}: {slow:?}");
        }
        assert_eq!(stp.flood_ports(Dpid(1)), Some(&[2][..]));
    }

    #[test]
    fn triangle_loses_one_link() {
        let mut stp = engine();
        let mut transport = Recorder::default();
        let base = Instant::now();
        for dpid in [1, 2, 3] {
            stp.on_datapath_join(
                &mut transport,
                Dpid(dpid),
                &[port(1, OFPPF_1GB_FD), port(2, OFPPF_1GB_FD)],
                base,
            );
        }
        // 1:1-2:1, 1:2-3:1, 2:2-3:2
        let links: Vec<Link> = both_ways(1, 1, 2, 1)
            .into_iter()
            .chain(both_ways(1, 2, 3, 1))
            .chain(both_ways(2, 2, 3, 2))
            .collect();
        stp.recompute(&mut transport, &links, settled(base));

        assert_eq!(stp.roots().iter().copied().collect::<Vec<_>>(), vec![Dpid(1)]);
        assert_eq!(stp.flood_ports(Dpid(1)), Some(&[1, 2][..]));
        assert_eq!(stp.flood_ports(Dpid(2)), Some(&[1][..]));
        assert_eq!(stp.flood_ports(Dpid(3)), Some(&[1][..]));
    }

    #[test]
    fn disconnected_switches_are_separate_roots() {
        let mut stp = engine();
        let mut transport = Recorder::default();
        let base = Instant::now();
        for dpid in [5, 3] {
            stp.on_datapath_join(&mut transport, Dpid(dpid), &[port(1, OFPPF_1GB_FD)], base);
        }
        stp.recompute(&mut transport, &Vec::new(), settled(base));

        let ports = stp.current_ports();
        assert_eq!(ports.root, Some(Dpid(3)));
        assert_eq!(ports.roots, vec![Dpid(3), Dpid(5)]);
    }

    #[test]
    fn link_up_resets_hold_time() {
        let mut stp = engine();
        let mut transport = Recorder::default();
        let base = Instant::now();
        stp.on_datapath_join(&mut transport, Dpid(1), &[port(1, OFPPF_1GB_FD)], base);

        let mut down = port(1, OFPPF_1GB_FD);
        down.state = OFPPS_LINK_DOWN;
        let later = base + Duration::from_secs(30);
        stp.on_port_status(&mut transport, Dpid(1), PortReason::Modify, &down, later);
        stp.on_port_status(
            &mut transport,
            Dpid(1),
            PortReason::Modify,
            &port(1, OFPPF_1GB_FD),
            later,
        );

        stp.recompute(&mut transport, &Vec::new(), later + Duration::from_secs(5));
        assert!(!stp.is_flood_port(Dpid(1), 1));
        stp.recompute(&mut transport, &Vec::new(), later + Duration::from_secs(10));
        assert!(stp.is_flood_port(Dpid(1), 1));
    }

    #[test]
    fn re_added_port_is_blocked_and_held_again() {
        let mut stp = engine();
        let mut transport = Recorder::default();
        let base = Instant::now();
        stp.on_datapath_join(&mut transport, Dpid(1), &[port(1, OFPPF_1GB_FD)], base);
        stp.recompute(&mut transport, &Vec::new(), settled(base));
        assert!(stp.is_flood_port(Dpid(1), 1));

        let later = base + Duration::from_secs(30);
        let sent_before = transport.configs.len();
        stp.on_port_status(
            &mut transport,
            Dpid(1),
            PortReason::Add,
            &port(1, OFPPF_1GB_FD),
            later,
        );
        assert_eq!(transport.configs.len(), sent_before + 1);
        assert_eq!(transport.configs[sent_before].config, OFPPC_NO_FLOOD);
        let state = stp.port_state(Dpid(1), 1).expect("port");
        assert!(!state.flood);
        assert_eq!(state.enable_time, Some(later + Duration::from_secs(10)));

        stp.recompute(&mut transport, &Vec::new(), later + Duration::from_secs(5));
        assert!(!stp.is_flood_port(Dpid(1), 1));
        stp.recompute(&mut transport, &Vec::new(), later + Duration::from_secs(10));
        assert!(stp.is_flood_port(Dpid(1), 1));
    }

    #[test]
    fn deleted_port_disappears() {
        let mut stp = engine();
        let mut transport = Recorder::default();
        let base = Instant::now();
        stp.on_datapath_join(
            &mut transport,
            Dpid(1),
            &[port(1, OFPPF_1GB_FD), port(2, OFPPF_1GB_FD)],
            base,
        );
        stp.on_port_status(
            &mut transport,
            Dpid(1),
            PortReason::Delete,
            &port(2, OFPPF_1GB_FD),
            base,
        );
        assert!(stp.port_state(Dpid(1), 2).is_none());

        stp.recompute(&mut transport, &Vec::new(), settled(base));
        assert_eq!(stp.flood_ports(Dpid(1)), Some(&[1][..]));
    }
}
