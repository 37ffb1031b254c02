//! Static per-port capabilities derived from join-time port descriptors.

use std::collections::{BTreeMap, HashMap};

use common::{
    Dpid, PortNo,
    analytics::PortCapabilityReport,
    southbound::{
        OFPPF_1GB_FD, OFPPF_1GB_HD, OFPPF_10GB_FD, OFPPF_10MB_FD, OFPPF_10MB_HD, OFPPF_100MB_FD,
        OFPPF_100MB_HD, PortDescriptor,
    },
};

const SPEED_10GB: u64 = 10_000_000_000;
const SPEED_1GB: u64 = 1_000_000_000;
const SPEED_100MB: u64 = 100_000_000;
const SPEED_10MB: u64 = 10_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCapability {
    pub port_no: PortNo,
    pub name: String,
    pub port_enabled: bool,
    pub link_enabled: bool,
    pub supports_10mb_hd: bool,
    pub supports_10mb_fd: bool,
    pub supports_100mb_hd: bool,
    pub supports_100mb_fd: bool,
    pub supports_1gb_hd: bool,
    pub supports_1gb_fd: bool,
    pub supports_10gb_fd: bool,
    pub max_speed_bps: u64,
    pub full_duplex: bool,
}

impl PortCapability {
    pub fn from_descriptor(port: &PortDescriptor) -> Self {
        let has = |flag: u32| port.curr & flag != 0;
        let mut capability = PortCapability {
            port_no: port.port_no,
            name: port.name.clone(),
            port_enabled: !port.is_port_down(),
            link_enabled: !port.is_link_down(),
            supports_10mb_hd: has(OFPPF_10MB_HD),
            supports_10mb_fd: has(OFPPF_10MB_FD),
            supports_100mb_hd: has(OFPPF_100MB_HD),
            supports_100mb_fd: has(OFPPF_100MB_FD),
            supports_1gb_hd: has(OFPPF_1GB_HD),
            supports_1gb_fd: has(OFPPF_1GB_FD),
            supports_10gb_fd: has(OFPPF_10GB_FD),
            max_speed_bps: 0,
            full_duplex: false,
        };
        capability.max_speed_bps = capability.compute_max_speed_bps();
        capability.full_duplex = capability.supports_10gb_fd
            || capability.supports_1gb_fd
            || capability.supports_100mb_fd
            || capability.supports_10mb_fd;
        capability
    }

    /// Highest supported speed class wins; half and full duplex count the
    /// same below 10Gb.
    fn compute_max_speed_bps(&self) -> u64 {
        if self.supports_10gb_fd {
            SPEED_10GB
        } else if self.supports_1gb_hd || self.supports_1gb_fd {
            SPEED_1GB
        } else if self.supports_100mb_hd || self.supports_100mb_fd {
            SPEED_100MB
        } else if self.supports_10mb_hd || self.supports_10mb_fd {
            SPEED_10MB
        } else {
            0
        }
    }

    pub fn report(&self) -> PortCapabilityReport {
        PortCapabilityReport {
            port_name: self.name.clone(),
            port_no: self.port_no,
            port_enabled: self.port_enabled,
            link_enabled: self.link_enabled,
            max_speed_bps: self.max_speed_bps,
            full_duplex: self.full_duplex,
        }
    }
}

/// Capability tables of every known switch.
#[derive(Debug, Default)]
pub struct PortCapabilityRegistry {
    switches: HashMap<Dpid, BTreeMap<PortNo, PortCapability>>,
}

impl PortCapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the table of `dpid` wholesale.
    pub fn register_switch(&mut self, dpid: Dpid, ports: &[PortDescriptor]) {
        let table = ports
            .iter()
            .map(|port| (port.port_no, PortCapability::from_descriptor(port)))
            .collect();
        self.switches.insert(dpid, table);
    }

    pub fn remove_switch(&mut self, dpid: Dpid) {
        self.switches.remove(&dpid);
    }

    /// Insert or replace one port of a known switch.
    pub fn upsert_port(&mut self, dpid: Dpid, port: &PortDescriptor) {
        self.switches
            .entry(dpid)
            .or_default()
            .insert(port.port_no, PortCapability::from_descriptor(port));
    }

    pub fn remove_port(&mut self, dpid: Dpid, port: PortNo) -> Option<PortCapability> {
        self.switches.get_mut(&dpid)?.remove(&port)
    }

    pub fn switch(&self, dpid: Dpid) -> Option<&BTreeMap<PortNo, PortCapability>> {
        self.switches.get(&dpid)
    }

    pub fn port(&self, dpid: Dpid, port: PortNo) -> Option<&PortCapability> {
        self.switches.get(&dpid)?.get(&port)
    }

    /// Max speed of a port, 0 when unknown.
    pub fn speed_bps(&self, dpid: Dpid, port: PortNo) -> u64 {
        self.port(dpid, port).map_or(0, |cap| cap.max_speed_bps)
    }
}
