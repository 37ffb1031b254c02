//! Seams to the collaborators that talk to switches.

use std::collections::BTreeSet;

use common::{
    Dpid,
    southbound::{Link, PortConfig, StatsRequest},
};

use crate::error::TransportError;

/// Outbound path to switches. Sends are fire-and-forget: an `Err` means the
/// message never left, not that the switch rejected it.
pub trait Transport {
    fn send_stats_request(&mut self, request: StatsRequest) -> Result<(), TransportError>;
    fn send_port_config(&mut self, config: PortConfig) -> Result<(), TransportError>;
}

/// Current link-state view from topology discovery. Healthy links appear
/// once per direction.
pub trait LinkSource {
    fn link_snapshot(&self) -> Vec<Link>;
}

/// Links reported up by discovery and not yet reported down.
#[derive(Debug, Default, Clone)]
pub struct LinkTable {
    links: BTreeSet<Link>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link_up(&mut self, link: Link) -> bool {
        self.links.insert(link)
    }

    pub fn link_down(&mut self, link: &Link) -> bool {
        self.links.remove(link)
    }

    /// Forget every link touching `dpid`.
    pub fn remove_switch(&mut self, dpid: Dpid) {
        self.links
            .retain(|link| link.src_dpid != dpid && link.dst_dpid != dpid);
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl LinkSource for LinkTable {
    fn link_snapshot(&self) -> Vec<Link> {
        self.links.iter().copied().collect()
    }
}

impl LinkSource for Vec<Link> {
    fn link_snapshot(&self) -> Vec<Link> {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_removal_drops_both_directions() {
        let mut table = LinkTable::new();
        let link = Link::new(Dpid(1), 1, Dpid(2), 1);
        table.link_up(link);
        table.link_up(link.reversed());
        table.link_up(Link::new(Dpid(3), 1, Dpid(4), 1));

        table.remove_switch(Dpid(2));
        assert_eq!(
            table.link_snapshot(),
            vec![Link::new(Dpid(3), 1, Dpid(4), 1)]
        );
    }

    #[test]
    fn link_down_is_directional() {
        let mut table = LinkTable::new();
        let link = Link::new(Dpid(1), 1, Dpid(2), 1);
        table.link_up(link);
        table.link_up(link.reversed());
        assert!(table.link_down(&link));
        assert!(!table.link_down(&link));
        assert_eq!(table.len(), 1);
    }
}
