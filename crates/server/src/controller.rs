//! The single owner of all controller state.
//!
//! Every input (datapath event, client request, timer expiry) enters
//! through one `&mut self` method; the binary's event loop is the only
//! caller, so no state is ever shared.

use std::{net::SocketAddr, time::Instant};

use common::{
    ClientRequest, DatapathEvent, ServerMessage,
    protocol::{MonitoringCommand, SpanningTreeCommand, Topic},
};
use tracing::{debug, info, warn};

use crate::{
    client::{Delivery, SubscriberRegistry},
    config::ControllerConfig,
    monitoring::MonitoringEngine,
    scheduler::{GlobalTask, PollKind, Scheduler, TaskKey},
    spanning_tree::SpanningTreeEngine,
    transport::{LinkTable, Transport},
};

pub struct Controller {
    config: ControllerConfig,
    monitoring: MonitoringEngine,
    spanning_tree: SpanningTreeEngine,
    scheduler: Scheduler,
    subscribers: SubscriberRegistry,
    links: LinkTable,
    outbox: Vec<Delivery>,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        Controller {
            monitoring: MonitoringEngine::new(config.monitoring.clone()),
            spanning_tree: SpanningTreeEngine::new(config.spanning_tree.clone()),
            scheduler: Scheduler::new(),
            subscribers: SubscriberRegistry::new(),
            links: LinkTable::new(),
            outbox: Vec::new(),
            config,
        }
    }

    /// Open the first collection epoch and arm the global timers.
    pub fn start(&mut self, now: Instant) {
        let monitoring = &self.config.monitoring;
        self.monitoring.fire_epoch_timer();
        self.scheduler.schedule_repeating(
            TaskKey::Global(GlobalTask::EpochTick),
            now + monitoring.epoch_period(),
            monitoring.epoch_period(),
        );
        self.scheduler.schedule_repeating(
            TaskKey::Global(GlobalTask::UtilizationBroadcast),
            now + monitoring.utilization_period(),
            monitoring.utilization_period(),
        );
        self.scheduler.schedule_repeating(
            TaskKey::Global(GlobalTask::StatsDebug),
            now + monitoring.stats_debug_period(),
            monitoring.stats_debug_period(),
        );
        self.scheduler.schedule_repeating(
            TaskKey::Global(GlobalTask::QueryExpiry),
            now + monitoring.query_timeout(),
            monitoring.query_timeout(),
        );
        let recompute = self.config.spanning_tree.recompute_period();
        self.scheduler.schedule_repeating(
            TaskKey::Global(GlobalTask::SpanningTreeRecompute),
            now + recompute,
            recompute,
        );
        info!(epoch = self.monitoring.collection_epoch(), "Controller started");
    }

    pub fn handle_datapath_event(
        &mut self,
        transport: &mut dyn Transport,
        event: DatapathEvent,
        now: Instant,
    ) {
        match event {
            DatapathEvent::SwitchJoined { dpid, ports } => {
                let joined = self.monitoring.on_datapath_join(dpid, &ports);
                self.spanning_tree
                    .on_datapath_join(transport, dpid, &ports, now);
                if !joined {
                    return;
                }
                let monitoring = &self.config.monitoring;
                for (kind, period) in [
                    (PollKind::Table, monitoring.table_stats_period()),
                    (PollKind::Port, monitoring.port_stats_period()),
                    (PollKind::Aggregate, monitoring.aggregate_stats_period()),
                ] {
                    self.scheduler
                        .schedule_repeating(TaskKey::Poll(dpid, kind), now + period, period);
                }
            }
            DatapathEvent::SwitchLeft { dpid } => {
                self.monitoring.on_datapath_leave(dpid);
                self.spanning_tree.on_datapath_leave(dpid);
                self.scheduler.cancel_switch(dpid);
                self.links.remove_switch(dpid);
            }
            DatapathEvent::PortStatus { dpid, reason, port } => {
                self.monitoring.on_port_status(dpid, reason, &port);
                self.spanning_tree
                    .on_port_status(transport, dpid, reason, &port, now);
            }
            DatapathEvent::StatsReply { dpid, xid, body } => {
                self.monitoring.on_stats_reply(dpid, xid, body, now);
            }
            DatapathEvent::LinkUp(link) => {
                if self.links.link_up(link) {
                    debug!(src = %link.src_dpid, src_port = link.src_port, dst = %link.dst_dpid, dst_port = link.dst_port, "Link up");
                }
            }
            DatapathEvent::LinkDown(link) => {
                if self.links.link_down(&link) {
                    debug!(src = %link.src_dpid, src_port = link.src_port, dst = %link.dst_dpid, dst_port = link.dst_port, "Link down");
                }
            }
        }
    }

    /// Decode and handle raw client input. Malformed input is answered with
    /// an error message.
    pub fn handle_client_bytes(
        &mut self,
        transport: &mut dyn Transport,
        client: SocketAddr,
        buf: &[u8],
        now: Instant,
    ) {
        match ClientRequest::parse(buf) {
            Ok(request) => self.handle_client_request(transport, client, request, now),
            Err(err) => self.monitoring.reject_command(client, err.to_string()),
        }
    }

    pub fn handle_client_request(
        &mut self,
        transport: &mut dyn Transport,
        client: SocketAddr,
        request: ClientRequest,
        now: Instant,
    ) {
        self.subscribers.touch(client, now);
        match request {
            ClientRequest::Monitoring(MonitoringCommand::Subscribe { msg_type }) => {
                if self
                    .subscribers
                    .subscribe(client, Topic::Monitoring(msg_type), now)
                {
                    info!(client = %client, topic = ?msg_type, "Client subscribed");
                }
            }
            ClientRequest::Monitoring(command) => {
                if let Some((kind, dpid, xid)) = command.query() {
                    self.monitoring
                        .handle_query(transport, client, kind, dpid, xid, now);
                }
            }
            ClientRequest::SpanningTree(SpanningTreeCommand::Subscribe { msg_type }) => {
                if self
                    .subscribers
                    .subscribe(client, Topic::SpanningTree(msg_type), now)
                {
                    info!(client = %client, topic = ?msg_type, "Client subscribed");
                }
                self.outbox
                    .push(Delivery::To(client, self.spanning_tree.stp_message()));
            }
            ClientRequest::Disconnect => self.drop_client(client),
        }
    }

    /// Forget a client's subscriptions and pending queries.
    pub fn drop_client(&mut self, client: SocketAddr) {
        let known = self.subscribers.remove(client).is_some();
        let dropped = self.monitoring.forget_client(client);
        if known || dropped > 0 {
            info!(client = %client, dropped_queries = dropped, "Client disconnected");
        }
    }

    /// Fire every timer due at `now`.
    pub fn run_due(&mut self, transport: &mut dyn Transport, now: Instant) {
        for key in self.scheduler.pop_due(now) {
            match key {
                TaskKey::Global(GlobalTask::EpochTick) => self.monitoring.fire_epoch_timer(),
                TaskKey::Global(GlobalTask::UtilizationBroadcast) => {
                    self.monitoring.fire_utilization_broadcast();
                }
                TaskKey::Global(GlobalTask::StatsDebug) => self.monitoring.fire_stats_debug(),
                TaskKey::Global(GlobalTask::QueryExpiry) => {
                    self.monitoring.fire_query_expiry(now);
                }
                TaskKey::Global(GlobalTask::SpanningTreeRecompute) => {
                    self.spanning_tree.recompute(transport, &self.links, now);
                }
                TaskKey::Poll(dpid, kind) => {
                    match self.monitoring.fire_poll(transport, dpid, kind) {
                        Ok(true) => {}
                        Ok(false) => {
                            self.scheduler.cancel(key);
                        }
                        Err(err) => {
                            warn!(dpid = %dpid, ?kind, error = %err, "Poll not delivered");
                        }
                    }
                }
            }
        }
    }

    /// Everything queued for clients since the last call, one entry per
    /// recipient.
    pub fn drain_outbox(&mut self) -> Vec<(SocketAddr, ServerMessage)> {
        let mut deliveries = std::mem::take(&mut self.outbox);
        deliveries.extend(self.monitoring.drain_outbox());
        deliveries.extend(self.spanning_tree.drain_outbox());
        deliveries
            .into_iter()
            .flat_map(|delivery| self.subscribers.resolve(delivery))
            .collect()
    }

    pub fn next_wakeup(&self) -> Option<Instant> {
        self.scheduler.next_due()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn monitoring(&self) -> &MonitoringEngine {
        &self.monitoring
    }

    pub fn spanning_tree(&self) -> &SpanningTreeEngine {
        &self.spanning_tree
    }

    pub fn subscribers(&self) -> &SubscriberRegistry {
        &self.subscribers
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}
