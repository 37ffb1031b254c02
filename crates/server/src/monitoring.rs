//! Statistics collection, snapshot folding and utilization reporting.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    net::SocketAddr,
    time::Instant,
};

use common::{
    Dpid, PortNo, ServerMessage,
    analytics::{LinkUtil, PortUtilization},
    protocol::{MonitoringMessage, MonitoringTopic, QueryKind, Topic},
    southbound::{PortDescriptor, PortReason, StatsBody, StatsKind},
};
use tracing::{debug, info, warn};

use crate::{
    capability::{PortCapability, PortCapabilityRegistry},
    client::Delivery,
    config::MonitoringConfig,
    dispatcher::{Correlation, PendingQuery, QueryOrigin, StatsRequestDispatcher},
    error::TransportError,
    scheduler::PollKind,
    snapshot::{DeltaOutcome, FoldKind, FoldResult, Snapshot, SnapshotHistory},
    transport::Transport,
};

/// Abnormal but survivable conditions, counted apart from normal traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnomalyCounters {
    /// Replies whose xid matched no pending query, or from unknown switches.
    pub unknown_correlation: u64,
    /// Ports in a reply that had no capability entry or no previous sample.
    pub skipped_ports: u64,
    /// Epoch-tagged replies older than the newest snapshot.
    pub stale_replies: u64,
    pub counter_regressions: u64,
    pub delivery_failures: u64,
    pub malformed_commands: u64,
}

/// Owns every monitored switch's statistics state.
///
/// Driven from a single event loop: replies, joins and timer ticks are fed
/// in one at a time; messages for clients pile up in an outbox the caller
/// drains.
#[derive(Debug)]
pub struct MonitoringEngine {
    config: MonitoringConfig,
    switches: BTreeSet<Dpid>,
    silent: BTreeSet<Dpid>,
    histories: HashMap<Dpid, SnapshotHistory>,
    capabilities: PortCapabilityRegistry,
    dispatcher: StatsRequestDispatcher,
    collection_epoch: u64,
    max_stats_reply_epoch: u64,
    anomalies: AnomalyCounters,
    outbox: Vec<Delivery>,
}

impl MonitoringEngine {
    pub fn new(config: MonitoringConfig) -> Self {
        MonitoringEngine {
            config,
            switches: BTreeSet::new(),
            silent: BTreeSet::new(),
            histories: HashMap::new(),
            capabilities: PortCapabilityRegistry::new(),
            dispatcher: StatsRequestDispatcher::new(),
            collection_epoch: 0,
            max_stats_reply_epoch: 0,
            anomalies: AnomalyCounters::default(),
            outbox: Vec::new(),
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    /// Start monitoring a switch. It stays silent until its first reply.
    ///
    /// A repeated join only marks the switch silent again; its history and
    /// port capabilities are kept. Returns whether the switch is new.
    pub fn on_datapath_join(&mut self, dpid: Dpid, ports: &[PortDescriptor]) -> bool {
        if !self.switches.insert(dpid) {
            debug!(dpid = %dpid, "Repeated join for monitored switch");
            self.silent.insert(dpid);
            return false;
        }
        info!(dpid = %dpid, ports = ports.len(), epoch = self.collection_epoch, "Switch joined");
        self.capabilities.register_switch(dpid, ports);
        self.histories
            .insert(dpid, SnapshotHistory::new(self.config.max_snapshots_per_switch));
        self.silent.insert(dpid);
        true
    }

    /// Forget a switch, its history and any query still waiting on it.
    pub fn on_datapath_leave(&mut self, dpid: Dpid) -> bool {
        let known = self.switches.remove(&dpid);
        self.histories.remove(&dpid);
        self.capabilities.remove_switch(dpid);
        self.silent.remove(&dpid);

        for query in self.dispatcher.forget_switch(dpid) {
            self.outbox.push(Delivery::To(
                query.origin.client,
                ServerMessage::error(format!(
                    "datapath {dpid} left before answering query {}",
                    query.origin.client_xid
                )),
            ));
        }
        if known {
            info!(dpid = %dpid, epoch = self.collection_epoch, "Switch left");
        }
        known
    }

    pub fn on_port_status(&mut self, dpid: Dpid, reason: PortReason, port: &PortDescriptor) {
        if !self.switches.contains(&dpid) {
            debug!(dpid = %dpid, port = port.port_no, "Port status for unmonitored switch");
            return;
        }
        match reason {
            PortReason::Add | PortReason::Modify => self.capabilities.upsert_port(dpid, port),
            PortReason::Delete => {
                self.capabilities.remove_port(dpid, port.port_no);
            }
        }
        debug!(dpid = %dpid, port = port.port_no, ?reason, "Port capability updated");
    }

    /// Handle a statistics reply of any kind.
    pub fn on_stats_reply(&mut self, dpid: Dpid, xid: u32, body: StatsBody, now: Instant) {
        let correlation = Correlation::from_wire(xid);

        if let Correlation::Query(id) = correlation {
            match self.dispatcher.take(id) {
                Some(query) => self.answer_query(query, &body),
                None => {
                    self.anomalies.unknown_correlation += 1;
                    debug!(dpid = %dpid, query = %id, "Reply for unknown query");
                }
            }
        }

        if !self.switches.contains(&dpid) {
            self.anomalies.unknown_correlation += 1;
            debug!(dpid = %dpid, xid, "Reply from unmonitored switch");
            return;
        }
        self.silent.remove(&dpid);

        let Correlation::Epoch(epoch) = correlation else {
            return;
        };
        let result = match &body {
            StatsBody::Port(stats) => {
                if epoch > self.max_stats_reply_epoch {
                    self.max_stats_reply_epoch = epoch;
                }
                let capabilities = self.capabilities.switch(dpid);
                let Some(history) = self.histories.get_mut(&dpid) else {
                    return;
                };
                history.fold(dpid, epoch, now, |snapshot| {
                    snapshot.store_port_info(stats, |port| {
                        capabilities.is_some_and(|caps| caps.contains_key(&port))
                    })
                })
            }
            StatsBody::Aggregate(stats) => {
                let Some(history) = self.histories.get_mut(&dpid) else {
                    return;
                };
                FoldResult {
                    kind: history.fold_aggregate(dpid, epoch, now, stats),
                    outcome: DeltaOutcome::default(),
                }
            }
            StatsBody::Table(_) | StatsBody::Flow(_) | StatsBody::Queue(_) => return,
        };
        self.after_fold(dpid, epoch, body.kind(), result);
    }

    fn after_fold(&mut self, dpid: Dpid, epoch: u64, kind: StatsKind, result: FoldResult) {
        match result.kind {
            FoldKind::Stale => {
                self.anomalies.stale_replies += 1;
                debug!(dpid = %dpid, epoch, ?kind, "Dropped stale reply");
                return;
            }
            FoldKind::Inserted | FoldKind::Updated => {
                debug!(dpid = %dpid, epoch, ?kind, fold = ?result.kind, "Folded reply");
            }
        }

        if !result.outcome.skipped_ports.is_empty() {
            self.anomalies.skipped_ports += result.outcome.skipped_ports.len() as u64;
            debug!(dpid = %dpid, ports = ?result.outcome.skipped_ports, "Skipped port deltas");
        }

        for report in result.outcome.port_errors {
            if report.counter_regression {
                self.anomalies.counter_regressions += 1;
            }
            warn!(
                dpid = %dpid,
                port = report.port,
                rx_dropped = report.rx_dropped,
                tx_dropped = report.tx_dropped,
                rx_errors = report.rx_errors,
                tx_errors = report.tx_errors,
                counter_regression = report.counter_regression,
                "Port error"
            );
            self.outbox.push(Delivery::Topic(
                Topic::Monitoring(MonitoringTopic::PortError),
                ServerMessage::Monitoring(MonitoringMessage::PortError(report)),
            ));
        }
    }

    fn answer_query(&mut self, query: PendingQuery, body: &StatsBody) {
        let PendingQuery { dpid, origin, .. } = query;
        if origin.kind.stats_kind() != Some(body.kind()) {
            debug!(dpid = %dpid, asked = ?origin.kind, got = ?body.kind(), "Query answered with another stats kind");
        }
        let xid = origin.client_xid;
        let message = match body.clone() {
            StatsBody::Port(data) => MonitoringMessage::PortStats { xid, dpid, data },
            StatsBody::Table(data) => MonitoringMessage::TableStats { xid, dpid, data },
            StatsBody::Aggregate(data) => MonitoringMessage::AggStats { xid, dpid, data },
            StatsBody::Flow(data) => MonitoringMessage::FlowStats { xid, dpid, data },
            StatsBody::Queue(data) => MonitoringMessage::QueueStats { xid, dpid, data },
        };
        debug!(dpid = %dpid, xid, client = %origin.client, "Answering switch query");
        self.outbox
            .push(Delivery::To(origin.client, ServerMessage::Monitoring(message)));
    }

    /// Serve an on-demand query. `latestsnapshot` is answered from the
    /// history; every other kind goes to the switch.
    pub fn handle_query(
        &mut self,
        transport: &mut dyn Transport,
        client: SocketAddr,
        kind: QueryKind,
        dpid: Dpid,
        client_xid: u32,
        now: Instant,
    ) {
        if !self.switches.contains(&dpid) {
            self.reply_error(client, format!("unknown datapath {dpid}"));
            return;
        }

        let Some(stats_kind) = kind.stats_kind() else {
            let message = match self.latest_switch_stats(dpid) {
                Some(snapshot) => ServerMessage::Monitoring(MonitoringMessage::LatestSnapshot {
                    xid: client_xid,
                    dpid,
                    data: Box::new(snapshot.report(self.capabilities.switch(dpid))),
                }),
                None => ServerMessage::error(format!("no snapshot yet for datapath {dpid}")),
            };
            self.outbox.push(Delivery::To(client, message));
            return;
        };

        let origin = QueryOrigin {
            kind,
            client,
            client_xid,
        };
        match self
            .dispatcher
            .send_query(transport, dpid, stats_kind, origin, now)
        {
            Ok(id) => debug!(dpid = %dpid, query = %id, client_xid, "Sent switch query"),
            Err(err) => {
                self.anomalies.delivery_failures += 1;
                warn!(dpid = %dpid, error = %err, "Query could not be delivered");
                self.reply_error(client, err.to_string());
            }
        }
    }

    /// Count and answer a command that failed validation.
    pub fn reject_command(&mut self, client: SocketAddr, reason: impl Into<String>) {
        let reason = reason.into();
        self.anomalies.malformed_commands += 1;
        warn!(client = %client, reason = %reason, "Malformed client command");
        self.reply_error(client, reason);
    }

    fn reply_error(&mut self, client: SocketAddr, message: String) {
        self.outbox
            .push(Delivery::To(client, ServerMessage::error(message)));
    }

    /// Drop the pending queries of a departed client.
    pub fn forget_client(&mut self, client: SocketAddr) -> usize {
        self.dispatcher.forget_client(client)
    }

    /// Fail every on-demand query its switch left unanswered for longer than
    /// the configured timeout.
    pub fn fire_query_expiry(&mut self, now: Instant) -> usize {
        let expired = self.dispatcher.expire(now, self.config.query_timeout());
        for query in &expired {
            warn!(dpid = %query.dpid, query = %query.id, client = %query.origin.client, "Query timed out");
            self.outbox.push(Delivery::To(
                query.origin.client,
                ServerMessage::error(format!(
                    "datapath {} did not answer query {} in time",
                    query.dpid, query.origin.client_xid
                )),
            ));
        }
        expired.len()
    }

    /// Advance the collection epoch. Switches still silent from the epoch
    /// that just ended are reported, then every switch starts the new epoch
    /// silent.
    pub fn fire_epoch_timer(&mut self) {
        for dpid in &self.silent {
            warn!(dpid = %dpid, epoch = self.collection_epoch, "Silent switch");
            self.outbox.push(Delivery::Topic(
                Topic::Monitoring(MonitoringTopic::SilentSwitch),
                ServerMessage::Monitoring(MonitoringMessage::SilentSwitch { dpid: *dpid }),
            ));
        }
        self.silent = self.switches.clone();
        self.collection_epoch += 1;
        debug!(epoch = self.collection_epoch, "Updated collection epoch");
    }

    /// Send one periodic poll. `Ok(false)` means the switch is gone and the
    /// timer should stop.
    pub fn fire_poll(
        &mut self,
        transport: &mut dyn Transport,
        dpid: Dpid,
        kind: PollKind,
    ) -> Result<bool, TransportError> {
        if !self.switches.contains(&dpid) {
            return Ok(false);
        }
        let stats_kind = kind.stats_kind();
        if let Err(err) =
            self.dispatcher
                .send_poll(transport, dpid, stats_kind, self.collection_epoch)
        {
            self.anomalies.delivery_failures += 1;
            return Err(err);
        }
        debug!(dpid = %dpid, kind = ?stats_kind, epoch = self.collection_epoch, "Polled switch");
        Ok(true)
    }

    /// Per-port rates from each switch's newest ready snapshot. With
    /// `time_consistent`, only snapshots of the newest reply epoch count.
    pub fn get_latest_port_bps(&self, time_consistent: bool) -> Vec<PortUtilization> {
        let mut utils = Vec::new();
        for dpid in &self.switches {
            let Some(snapshot) = self.latest_switch_stats(*dpid) else {
                continue;
            };
            if !snapshot.ready() {
                continue;
            }
            if time_consistent && snapshot.collection_epoch != self.max_stats_reply_epoch {
                continue;
            }
            for info in snapshot.ports.values() {
                let rates = snapshot.port_rates(info);
                utils.push(PortUtilization {
                    dpid: *dpid,
                    port: info.port_no,
                    bps_transmitted: rates.bits_sent_per_sec,
                    bps_received: rates.bits_received_per_sec,
                    capacity_bps: self.capabilities.speed_bps(*dpid, info.port_no),
                });
            }
        }
        utils
    }

    /// Broadcast current utilization to `linkutils` subscribers. Nothing is
    /// sent while no snapshot qualifies.
    pub fn fire_utilization_broadcast(&mut self) -> usize {
        let utils: Vec<LinkUtil> = self
            .get_latest_port_bps(true)
            .iter()
            .map(LinkUtil::from)
            .collect();
        if utils.is_empty() {
            return 0;
        }
        let count = utils.len();
        self.outbox.push(Delivery::Topic(
            Topic::Monitoring(MonitoringTopic::LinkUtils),
            ServerMessage::Monitoring(MonitoringMessage::LinkUtils { utils }),
        ));
        count
    }

    /// Log a utilization summary.
    pub fn fire_stats_debug(&self) {
        let utils = self.get_latest_port_bps(true);
        debug!(
            epoch = self.collection_epoch,
            max_reply_epoch = self.max_stats_reply_epoch,
            ports = utils.len(),
            silent = self.silent.len(),
            "Stats summary"
        );
        for util in &utils {
            debug!(
                dpid = %util.dpid,
                port = util.port,
                bps_tx = util.bps_transmitted,
                bps_rx = util.bps_received,
                utilization = util.utilization(),
                "Port load"
            );
        }
    }

    pub fn drain_outbox(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.outbox)
    }

    pub fn collection_epoch(&self) -> u64 {
        self.collection_epoch
    }

    /// Newest epoch seen in an epoch-tagged port-stats reply.
    pub fn max_stats_reply_epoch(&self) -> u64 {
        self.max_stats_reply_epoch
    }

    pub fn anomalies(&self) -> AnomalyCounters {
        self.anomalies
    }

    pub fn is_monitored(&self, dpid: Dpid) -> bool {
        self.switches.contains(&dpid)
    }

    pub fn switches(&self) -> impl Iterator<Item = Dpid> + '_ {
        self.switches.iter().copied()
    }

    pub fn silent_switches(&self) -> &BTreeSet<Dpid> {
        &self.silent
    }

    pub fn count_silent_switches(&self) -> usize {
        self.silent.len()
    }

    pub fn all_switch_stats(&self, dpid: Dpid) -> Option<&SnapshotHistory> {
        self.histories.get(&dpid)
    }

    pub fn latest_switch_stats(&self, dpid: Dpid) -> Option<&Snapshot> {
        self.histories.get(&dpid)?.latest()
    }

    pub fn port_capabilities(&self, dpid: Dpid) -> Option<&BTreeMap<PortNo, PortCapability>> {
        self.capabilities.switch(dpid)
    }

    pub fn port_capability(&self, dpid: Dpid, port: PortNo) -> Option<&PortCapability> {
        self.capabilities.port(dpid, port)
    }

    pub fn capabilities(&self) -> &PortCapabilityRegistry {
        &self.capabilities
    }

    pub fn pending_queries(&self) -> usize {
        self.dispatcher.pending_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::southbound::{AggregateStats, OFPPF_1GB_FD, PortConfig, PortStats, StatsRequest};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        requests: Vec<StatsRequest>,
    }

    impl Transport for Recorder {
        fn send_stats_request(&mut self, request: StatsRequest) -> Result<(), TransportError> {
            self.requests.push(request);
            Ok(())
        }

        fn send_port_config(&mut self, _config: PortConfig) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn port(port_no: PortNo) -> PortDescriptor {
        PortDescriptor {
            port_no,
            name: format!("eth{port_no}"),
            hw_addr: [0; 6],
            config: 0,
            state: 0,
            curr: OFPPF_1GB_FD,
        }
    }

    fn port_reply(rx_bytes: u64) -> StatsBody {
        StatsBody::Port(vec![PortStats {
            port_no: 1,
            rx_bytes,
            ..Default::default()
        }])
    }

    fn engine_with_switch() -> MonitoringEngine {
        let mut engine = MonitoringEngine::new(MonitoringConfig::default());
        engine.fire_epoch_timer();
        engine.on_datapath_join(Dpid(1), &[port(1)]);
        engine
    }

    #[test]
    fn poll_carries_current_epoch() {
        let mut engine = engine_with_switch();
        let mut transport = Recorder::default();
        assert!(engine.fire_poll(&mut transport, Dpid(1), PollKind::Port).expect("sent"));
        assert_eq!(transport.requests[0].xid, 1);
        assert_eq!(transport.requests[0].kind, StatsKind::Port);

        engine.on_datapath_leave(Dpid(1));
        assert!(!engine.fire_poll(&mut transport, Dpid(1), PollKind::Port).expect("no-op"));
        assert_eq!(transport.requests.len(), 1);
    }

    #[test]
    fn any_reply_clears_silence() {
        let mut engine = engine_with_switch();
        assert_eq!(engine.count_silent_switches(), 1);
        engine.on_stats_reply(Dpid(1), 1, StatsBody::Table(Vec::new()), Instant::now());
        assert_eq!(engine.count_silent_switches(), 0);
    }

    #[test]
    fn epoch_tick_reports_and_resets_silence() {
        let mut engine = engine_with_switch();
        engine.fire_epoch_timer();
        let out = engine.drain_outbox();
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0],
            Delivery::Topic(Topic::Monitoring(MonitoringTopic::SilentSwitch), _)
        ));
        assert!(engine.silent_switches().contains(&Dpid(1)));
        assert_eq!(engine.collection_epoch(), 2);
    }

    #[test]
    fn stale_epoch_reply_is_counted() {
        let mut engine = engine_with_switch();
        let base = Instant::now();
        engine.on_stats_reply(Dpid(1), 3, port_reply(10), base);
        engine.on_stats_reply(Dpid(1), 2, port_reply(5), base + Duration::from_secs(1));
        assert_eq!(engine.anomalies().stale_replies, 1);
        assert_eq!(engine.max_stats_reply_epoch(), 3);
        assert_eq!(
            engine.latest_switch_stats(Dpid(1)).map(|s| s.collection_epoch),
            Some(3)
        );
    }

    #[test]
    fn query_reply_does_not_touch_history() {
        let mut engine = engine_with_switch();
        let mut transport = Recorder::default();
        let client = SocketAddr::from(([127, 0, 0, 1], 5000));
        engine.handle_query(
            &mut transport,
            client,
            QueryKind::PortStats,
            Dpid(1),
            42,
            Instant::now(),
        );
        let xid = transport.requests[0].xid;
        engine.on_stats_reply(Dpid(1), xid, port_reply(100), Instant::now());

        assert!(engine.latest_switch_stats(Dpid(1)).is_none());
        assert_eq!(engine.max_stats_reply_epoch(), 0);
        let out = engine.drain_outbox();
        let Some(Delivery::To(to, ServerMessage::Monitoring(MonitoringMessage::PortStats { xid, .. }))) =
            out.first()
        else {
            panic!("expected a port stats reply, got {out:?}");
        };
        assert_eq!((*to, *xid), (client, 42));
    }

    #[test]
    fn aggregate_reply_keeps_port_rates() {
        let mut engine = engine_with_switch();
        let base = Instant::now();
        engine.on_stats_reply(Dpid(1), 1, port_reply(100), base);
        engine.on_stats_reply(Dpid(1), 2, port_reply(600), base + Duration::from_secs(1));
        engine.on_stats_reply(
            Dpid(1),
            2,
            StatsBody::Aggregate(AggregateStats {
                packet_count: 6,
                byte_count: 600,
                flow_count: 3,
            }),
            base + Duration::from_secs(3),
        );

        let snapshot = engine.latest_switch_stats(Dpid(1)).expect("snapshot");
        assert_eq!(snapshot.number_of_flows, Some(3));
        assert_eq!(snapshot.time_since_delta, Duration::from_secs(1));
        let utils = engine.get_latest_port_bps(true);
        assert_eq!(utils[0].bps_received, 4000.0);
    }

    #[test]
    fn repeated_join_keeps_history() {
        let mut engine = engine_with_switch();
        engine.on_stats_reply(Dpid(1), 1, port_reply(100), Instant::now());
        assert_eq!(engine.count_silent_switches(), 0);

        assert!(!engine.on_datapath_join(Dpid(1), &[port(1), port(2)]));
        assert_eq!(engine.all_switch_stats(Dpid(1)).map(|h| h.len()), Some(1));
        assert!(engine.port_capability(Dpid(1), 2).is_none());
        assert!(engine.silent_switches().contains(&Dpid(1)));
    }

    #[test]
    fn unanswered_query_fails_after_timeout() {
        let mut engine = engine_with_switch();
        let mut transport = Recorder::default();
        let client = SocketAddr::from(([127, 0, 0, 1], 5000));
        let base = Instant::now();
        engine.handle_query(&mut transport, client, QueryKind::PortStats, Dpid(1), 7, base);

        assert_eq!(engine.fire_query_expiry(base + Duration::from_secs(9)), 0);
        assert_eq!(engine.fire_query_expiry(base + Duration::from_secs(10)), 1);
        assert_eq!(engine.pending_queries(), 0);
        assert!(matches!(
            engine.drain_outbox().as_slice(),
            [Delivery::To(to, ServerMessage::Error { .. })] if *to == client
        ));

        // A late answer is no longer routed to anyone.
        let xid = transport.requests[0].xid;
        engine.on_stats_reply(Dpid(1), xid, port_reply(1), base + Duration::from_secs(11));
        assert!(engine.drain_outbox().is_empty());
        assert_eq!(engine.anomalies().unknown_correlation, 1);
    }

    #[test]
    fn unknown_query_xid_is_counted() {
        let mut engine = engine_with_switch();
        engine.on_stats_reply(Dpid(1), 0x8000_0005, port_reply(1), Instant::now());
        assert_eq!(engine.anomalies().unknown_correlation, 1);
        assert!(engine.drain_outbox().is_empty());
    }

    #[test]
    fn query_for_unknown_switch_gets_error() {
        let mut engine = engine_with_switch();
        let mut transport = Recorder::default();
        let client = SocketAddr::from(([127, 0, 0, 1], 5000));
        engine.handle_query(
            &mut transport,
            client,
            QueryKind::TableStats,
            Dpid(9),
            1,
            Instant::now(),
        );
        assert!(transport.requests.is_empty());
        assert!(matches!(
            engine.drain_outbox().as_slice(),
            [Delivery::To(_, ServerMessage::Error { .. })]
        ));
    }
}
