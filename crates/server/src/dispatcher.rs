//! Outbound statistics requests and the correlation of their replies.
//!
//! Periodic polls carry the collection epoch they belong to; on-demand
//! queries carry a dispatcher-allocated id. Both share the 32-bit wire xid,
//! split by its top bit.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    time::{Duration, Instant},
};

use common::{
    Dpid,
    protocol::QueryKind,
    southbound::{ALL_TABLES, FlowMatch, StatsKind, StatsRequest},
};

use crate::{error::TransportError, transport::Transport};

const QUERY_BIT: u32 = 0x8000_0000;
const EPOCH_MASK: u32 = !QUERY_BIT;

/// Identifier of an outstanding on-demand query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(u32);

impl QueryId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// What a wire xid refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Correlation {
    /// Periodic poll issued during this collection epoch.
    Epoch(u64),
    /// Explicit client query.
    Query(QueryId),
}

impl Correlation {
    pub fn to_wire(self) -> u32 {
        match self {
            Correlation::Epoch(epoch) => (epoch as u32) & EPOCH_MASK,
            Correlation::Query(id) => QUERY_BIT | id.0,
        }
    }

    pub fn from_wire(xid: u32) -> Self {
        if xid & QUERY_BIT != 0 {
            Correlation::Query(QueryId(xid & EPOCH_MASK))
        } else {
            Correlation::Epoch(u64::from(xid))
        }
    }
}

/// Who asked for a query and how to answer them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOrigin {
    pub kind: QueryKind,
    pub client: SocketAddr,
    /// Echoed back to the client, never sent to the switch.
    pub client_xid: u32,
}

/// A client query waiting for its switch to answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingQuery {
    pub id: QueryId,
    pub dpid: Dpid,
    pub origin: QueryOrigin,
    pub issued_at: Instant,
}

/// Builds and sends statistics requests and tracks outstanding queries.
#[derive(Debug, Default)]
pub struct StatsRequestDispatcher {
    pending: HashMap<QueryId, PendingQuery>,
    next_query: u32,
}

impl StatsRequestDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a request for `kind`. Aggregate and flow requests match every
    /// flow in every table.
    pub fn build_request(dpid: Dpid, kind: StatsKind, correlation: Correlation) -> StatsRequest {
        let (flow_match, table_id) = match kind {
            StatsKind::Aggregate | StatsKind::Flow => (Some(FlowMatch::all()), Some(ALL_TABLES)),
            StatsKind::Port | StatsKind::Table | StatsKind::Queue => (None, None),
        };
        StatsRequest {
            dpid,
            kind,
            xid: correlation.to_wire(),
            flow_match,
            table_id,
        }
    }

    /// Send a periodic poll tagged with `epoch`.
    pub fn send_poll(
        &self,
        transport: &mut dyn Transport,
        dpid: Dpid,
        kind: StatsKind,
        epoch: u64,
    ) -> Result<(), TransportError> {
        transport.send_stats_request(Self::build_request(dpid, kind, Correlation::Epoch(epoch)))
    }

    /// Register a pending query and send its request. The registration is
    /// rolled back when the request cannot be delivered.
    pub fn send_query(
        &mut self,
        transport: &mut dyn Transport,
        dpid: Dpid,
        kind: StatsKind,
        origin: QueryOrigin,
        now: Instant,
    ) -> Result<QueryId, TransportError> {
        let id = self.allocate();
        self.pending.insert(
            id,
            PendingQuery {
                id,
                dpid,
                origin,
                issued_at: now,
            },
        );

        let request = Self::build_request(dpid, kind, Correlation::Query(id));
        if let Err(err) = transport.send_stats_request(request) {
            self.pending.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    /// Resolve a reply's query id; each query is answered at most once.
    pub fn take(&mut self, id: QueryId) -> Option<PendingQuery> {
        self.pending.remove(&id)
    }

    /// Remove queries issued more than `timeout` before `now`, oldest
    /// first.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<PendingQuery> {
        let ids: Vec<QueryId> = self
            .pending
            .values()
            .filter(|query| now.saturating_duration_since(query.issued_at) >= timeout)
            .map(|query| query.id)
            .collect();
        let mut expired: Vec<PendingQuery> = ids
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect();
        expired.sort_by_key(|query| (query.issued_at, query.id));
        expired
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop queries addressed to a departed switch.
    pub fn forget_switch(&mut self, dpid: Dpid) -> Vec<PendingQuery> {
        let ids: Vec<QueryId> = self
            .pending
            .values()
            .filter(|query| query.dpid == dpid)
            .map(|query| query.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    /// Drop queries of a client that went away.
    pub fn forget_client(&mut self, client: SocketAddr) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, query| query.origin.client != client);
        before - self.pending.len()
    }

    fn allocate(&mut self) -> QueryId {
        loop {
            let candidate = QueryId(self.next_query);
            self.next_query = self.next_query.wrapping_add(1) & EPOCH_MASK;
            if !self.pending.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::southbound::PortConfig;

    #[derive(Default)]
    struct Recorder {
        requests: Vec<StatsRequest>,
        fail: bool,
    }

    impl Transport for Recorder {
        fn send_stats_request(&mut self, request: StatsRequest) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::UnknownDatapath(request.dpid));
            }
            self.requests.push(request);
            Ok(())
        }

        fn send_port_config(&mut self, _config: PortConfig) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn client() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    fn origin(kind: QueryKind, client_xid: u32) -> QueryOrigin {
        QueryOrigin {
            kind,
            client: client(),
            client_xid,
        }
    }

    #[test]
    fn epoch_and_query_spaces_do_not_collide() {
        let epoch = Correlation::Epoch(7);
        let query = Correlation::Query(QueryId(7));
        assert_ne!(epoch.to_wire(), query.to_wire());
        assert_eq!(Correlation::from_wire(epoch.to_wire()), epoch);
        assert_eq!(Correlation::from_wire(query.to_wire()), query);
    }

    #[test]
    fn aggregate_requests_match_everything() {
        let request =
            StatsRequestDispatcher::build_request(Dpid(1), StatsKind::Aggregate, Correlation::Epoch(3));
        assert_eq!(request.xid, 3);
        assert_eq!(request.flow_match, Some(FlowMatch::all()));
        assert_eq!(request.table_id, Some(ALL_TABLES));

        let request =
            StatsRequestDispatcher::build_request(Dpid(1), StatsKind::Port, Correlation::Epoch(3));
        assert_eq!(request.flow_match, None);
    }

    #[test]
    fn query_is_pending_until_taken() {
        let mut dispatcher = StatsRequestDispatcher::new();
        let mut transport = Recorder::default();
        let id = dispatcher
            .send_query(
                &mut transport,
                Dpid(2),
                StatsKind::Table,
                origin(QueryKind::TableStats, 900),
                Instant::now(),
            )
            .expect("sent");

        let sent = &transport.requests[0];
        assert_eq!(Correlation::from_wire(sent.xid), Correlation::Query(id));
        assert_ne!(sent.xid, 900);

        let pending = dispatcher.take(id).expect("pending");
        assert_eq!(pending.origin.client_xid, 900);
        assert!(dispatcher.take(id).is_none());
    }

    #[test]
    fn failed_send_leaves_nothing_pending() {
        let mut dispatcher = StatsRequestDispatcher::new();
        let mut transport = Recorder {
            fail: true,
            ..Default::default()
        };
        let result = dispatcher.send_query(
            &mut transport,
            Dpid(2),
            StatsKind::Port,
            origin(QueryKind::PortStats, 1),
            Instant::now(),
        );
        assert!(result.is_err());
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[test]
    fn only_overdue_queries_expire() {
        let mut dispatcher = StatsRequestDispatcher::new();
        let mut transport = Recorder::default();
        let base = Instant::now();
        for (offset, client_xid) in [(0, 1), (4, 2), (8, 3)] {
            dispatcher
                .send_query(
                    &mut transport,
                    Dpid(1),
                    StatsKind::Port,
                    origin(QueryKind::PortStats, client_xid),
                    base + Duration::from_secs(offset),
                )
                .expect("sent");
        }

        let expired = dispatcher.expire(base + Duration::from_secs(14), Duration::from_secs(10));
        let xids: Vec<u32> = expired.iter().map(|q| q.origin.client_xid).collect();
        assert_eq!(xids, vec![1, 2]);
        assert_eq!(dispatcher.pending_len(), 1);
        assert!(dispatcher
            .expire(base + Duration::from_secs(14), Duration::from_secs(10))
            .is_empty());
    }

    #[test]
    fn departed_switch_and_client_drop_their_queries() {
        let mut dispatcher = StatsRequestDispatcher::new();
        let mut transport = Recorder::default();
        let now = Instant::now();
        for dpid in [1, 1, 2] {
            dispatcher
                .send_query(
                    &mut transport,
                    Dpid(dpid),
                    StatsKind::Port,
                    origin(QueryKind::PortStats, dpid as u32),
                    now,
                )
                .expect("sent");
        }

        assert_eq!(dispatcher.forget_switch(Dpid(1)).len(), 2);
        assert_eq!(dispatcher.forget_client(client()), 1);
        assert_eq!(dispatcher.pending_len(), 0);
    }
}
