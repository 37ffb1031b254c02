//! Per-switch statistics snapshots and their bounded history.

use std::{
    collections::{BTreeMap, VecDeque},
    time::{Duration, Instant, SystemTime},
};

use common::{
    Dpid, PortNo,
    analytics::{CounterDeltaReport, CounterReport, PortErrorReport, PortInfoReport, SnapshotReport},
    southbound::{AggregateStats, PortStats},
};

use crate::capability::PortCapability;

/// The eight cumulative port counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

impl Counters {
    pub fn from_port_stats(stats: &PortStats) -> Self {
        Counters {
            rx_bytes: stats.rx_bytes,
            tx_bytes: stats.tx_bytes,
            rx_packets: stats.rx_packets,
            tx_packets: stats.tx_packets,
            rx_dropped: stats.rx_dropped,
            tx_dropped: stats.tx_dropped,
            rx_errors: stats.rx_errors,
            tx_errors: stats.tx_errors,
        }
    }

    fn accumulate(&mut self, other: &Counters) {
        self.rx_bytes = self.rx_bytes.saturating_add(other.rx_bytes);
        self.tx_bytes = self.tx_bytes.saturating_add(other.tx_bytes);
        self.rx_packets = self.rx_packets.saturating_add(other.rx_packets);
        self.tx_packets = self.tx_packets.saturating_add(other.tx_packets);
        self.rx_dropped = self.rx_dropped.saturating_add(other.rx_dropped);
        self.tx_dropped = self.tx_dropped.saturating_add(other.tx_dropped);
        self.rx_errors = self.rx_errors.saturating_add(other.rx_errors);
        self.tx_errors = self.tx_errors.saturating_add(other.tx_errors);
    }

    /// Per-field `max(0, self - previous)`, and whether any field went
    /// backwards.
    pub fn delta_from(&self, previous: &Counters) -> (Counters, bool) {
        let mut regressed = false;
        let mut sub = |current: u64, prev: u64| {
            regressed |= current < prev;
            current.saturating_sub(prev)
        };
        let delta = Counters {
            rx_bytes: sub(self.rx_bytes, previous.rx_bytes),
            tx_bytes: sub(self.tx_bytes, previous.tx_bytes),
            rx_packets: sub(self.rx_packets, previous.rx_packets),
            tx_packets: sub(self.tx_packets, previous.tx_packets),
            rx_dropped: sub(self.rx_dropped, previous.rx_dropped),
            tx_dropped: sub(self.tx_dropped, previous.tx_dropped),
            rx_errors: sub(self.rx_errors, previous.rx_errors),
            tx_errors: sub(self.tx_errors, previous.tx_errors),
        };
        (delta, regressed)
    }

    fn has_drops_or_errors(&self) -> bool {
        self.rx_dropped > 0 || self.tx_dropped > 0 || self.rx_errors > 0 || self.tx_errors > 0
    }

    fn report(&self, delta: Option<&Counters>) -> CounterReport {
        CounterReport {
            rx_bytes: self.rx_bytes,
            tx_bytes: self.tx_bytes,
            rx_packets: self.rx_packets,
            tx_packets: self.tx_packets,
            rx_dropped: self.rx_dropped,
            tx_dropped: self.tx_dropped,
            rx_errors: self.rx_errors,
            tx_errors: self.tx_errors,
            delta: delta.map(|d| CounterDeltaReport {
                rx_bytes: d.rx_bytes,
                tx_bytes: d.tx_bytes,
                rx_packets: d.rx_packets,
                tx_packets: d.tx_packets,
                rx_dropped: d.rx_dropped,
                tx_dropped: d.tx_dropped,
                rx_errors: d.rx_errors,
                tx_errors: d.tx_errors,
            }),
        }
    }
}

/// Counters of one port within a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub port_no: PortNo,
    pub totals: Counters,
    pub delta: Option<Counters>,
    /// The port had a capability entry when the reply was stored.
    pub registered: bool,
}

/// Rates derived from a port's deltas and the snapshot's time gap.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PortRates {
    pub bits_received_per_sec: f64,
    pub bits_sent_per_sec: f64,
    pub packets_received_per_sec: f64,
    pub packets_sent_per_sec: f64,
}

/// Side effects of a delta computation the caller has to surface.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeltaOutcome {
    pub port_errors: Vec<PortErrorReport>,
    /// Ports whose delta could not be computed (unregistered, or absent
    /// from the previous snapshot).
    pub skipped_ports: Vec<PortNo>,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub dpid: Dpid,
    pub collection_epoch: u64,
    pub captured_at: Instant,
    /// Wall clock, microseconds since UNIX epoch.
    pub timestamp_us: u64,
    pub epoch_delta: Option<u64>,
    pub time_since_delta: Duration,
    /// Switch-wide sums, present once a port-stats reply was stored.
    pub totals: Option<Counters>,
    pub delta: Option<Counters>,
    pub ports: BTreeMap<PortNo, PortInfo>,
    pub number_of_flows: Option<u32>,
    pub bytes_in_flows: Option<u64>,
    pub packets_in_flows: Option<u64>,
}

impl Snapshot {
    pub fn new(dpid: Dpid, collection_epoch: u64, captured_at: Instant) -> Self {
        Snapshot {
            dpid,
            collection_epoch,
            captured_at,
            timestamp_us: wall_clock_us(),
            epoch_delta: None,
            time_since_delta: Duration::ZERO,
            totals: None,
            delta: None,
            ports: BTreeMap::new(),
            number_of_flows: None,
            bytes_in_flows: None,
            packets_in_flows: None,
        }
    }

    /// The bootstrap snapshot of epoch 1 is always ready; any other one
    /// once its switch-level deltas are known.
    pub fn ready(&self) -> bool {
        self.collection_epoch == 1 || self.delta.is_some()
    }

    /// Replace port counters with the content of a port-stats reply.
    pub fn store_port_info(&mut self, stats: &[PortStats], is_registered: impl Fn(PortNo) -> bool) {
        let mut totals = Counters::default();
        self.ports.clear();
        for item in stats {
            let counters = Counters::from_port_stats(item);
            totals.accumulate(&counters);
            self.ports.insert(
                item.port_no,
                PortInfo {
                    port_no: item.port_no,
                    totals: counters,
                    delta: None,
                    registered: is_registered(item.port_no),
                },
            );
        }
        self.totals = Some(totals);
        self.delta = None;
    }

    pub fn store_aggregate(&mut self, stats: &AggregateStats) {
        self.number_of_flows = Some(stats.flow_count);
        self.bytes_in_flows = Some(stats.byte_count);
        self.packets_in_flows = Some(stats.packet_count);
    }

    pub fn compute_delta_from(&mut self, previous: &Snapshot) -> DeltaOutcome {
        let mut outcome = DeltaOutcome::default();

        if self.collection_epoch != previous.collection_epoch {
            self.epoch_delta = Some(self.collection_epoch.saturating_sub(previous.collection_epoch));
            self.time_since_delta = self.captured_at.saturating_duration_since(previous.captured_at);
        }

        if let (Some(current), Some(prev)) = (self.totals, previous.totals) {
            self.delta = Some(current.delta_from(&prev).0);
        }

        for (port_no, info) in self.ports.iter_mut() {
            let prev = match previous.ports.get(port_no) {
                Some(prev) if info.registered => prev,
                _ => {
                    info.delta = None;
                    outcome.skipped_ports.push(*port_no);
                    continue;
                }
            };
            let (delta, regressed) = info.totals.delta_from(&prev.totals);
            info.delta = Some(delta);
            if regressed || delta.has_drops_or_errors() {
                outcome.port_errors.push(PortErrorReport {
                    dpid: self.dpid,
                    port: *port_no,
                    rx_dropped: delta.rx_dropped,
                    tx_dropped: delta.tx_dropped,
                    rx_errors: delta.rx_errors,
                    tx_errors: delta.tx_errors,
                    counter_regression: regressed,
                });
            }
        }

        outcome
    }

    pub fn port_rates(&self, port: &PortInfo) -> PortRates {
        let secs = self.time_since_delta.as_secs_f64();
        match port.delta {
            Some(delta) if secs > 0.0 => PortRates {
                bits_received_per_sec: delta.rx_bytes as f64 * 8.0 / secs,
                bits_sent_per_sec: delta.tx_bytes as f64 * 8.0 / secs,
                packets_received_per_sec: delta.rx_packets as f64 / secs,
                packets_sent_per_sec: delta.tx_packets as f64 / secs,
            },
            _ => PortRates::default(),
        }
    }

    pub fn report(&self, capabilities: Option<&BTreeMap<PortNo, PortCapability>>) -> SnapshotReport {
        let ports = self
            .ports
            .values()
            .map(|info| {
                let rates = self.port_rates(info);
                let capability = capabilities.and_then(|caps| caps.get(&info.port_no));
                let speed = capability.map_or(0, |cap| cap.max_speed_bps);
                let rx_pct = percent_of(rates.bits_received_per_sec, speed);
                let tx_pct = percent_of(rates.bits_sent_per_sec, speed);
                PortInfoReport {
                    port_no: info.port_no,
                    counters: info.totals.report(info.delta.as_ref()),
                    capability: capability.map(PortCapability::report),
                    bits_received_per_sec: rates.bits_received_per_sec,
                    bits_sent_per_sec: rates.bits_sent_per_sec,
                    packets_received_per_sec: rates.packets_received_per_sec,
                    packets_sent_per_sec: rates.packets_sent_per_sec,
                    rx_utilization_pct: rx_pct,
                    tx_utilization_pct: tx_pct,
                    avg_utilization_pct: (rx_pct + tx_pct) / 2.0,
                }
            })
            .collect();

        SnapshotReport {
            dpid: self.dpid,
            collection_epoch: self.collection_epoch,
            timestamp_us: self.timestamp_us,
            epoch_delta: self.epoch_delta,
            time_since_delta_secs: self.time_since_delta.as_secs_f64(),
            number_of_flows: self.number_of_flows,
            bytes_in_flows: self.bytes_in_flows,
            packets_in_flows: self.packets_in_flows,
            totals: self
                .totals
                .unwrap_or_default()
                .report(self.delta.as_ref()),
            ports,
            ready: self.ready(),
        }
    }
}

/// How a reply was folded into a history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldKind {
    /// A new front entry was created.
    Inserted,
    /// The front entry of the same epoch was updated in place.
    Updated,
    /// Older than the front entry; ignored.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldResult {
    pub kind: FoldKind,
    pub outcome: DeltaOutcome,
}

/// Most-recent-first snapshots of one switch.
#[derive(Debug, Clone)]
pub struct SnapshotHistory {
    snapshots: VecDeque<Snapshot>,
    max_len: usize,
}

impl SnapshotHistory {
    pub fn new(max_len: usize) -> Self {
        SnapshotHistory {
            snapshots: VecDeque::new(),
            max_len: max_len.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter()
    }

    /// Fold a reply for `epoch` into the history.
    ///
    /// Same epoch as the front: update in place and recompute deltas against
    /// the entry behind it. Newer: push a new front with deltas against the
    /// old front, evicting past the bound. Older: ignored.
    pub fn fold(
        &mut self,
        dpid: Dpid,
        epoch: u64,
        now: Instant,
        apply: impl FnOnce(&mut Snapshot),
    ) -> FoldResult {
        let front_epoch = self.snapshots.front().map(|s| s.collection_epoch);
        match front_epoch {
            Some(front) if front == epoch => {
                let mut outcome = DeltaOutcome::default();
                if let Some((latest, rest)) = self.snapshots.make_contiguous().split_first_mut() {
                    latest.captured_at = now;
                    latest.timestamp_us = wall_clock_us();
                    apply(latest);
                    if let Some(previous) = rest.first() {
                        outcome = latest.compute_delta_from(previous);
                    }
                }
                FoldResult {
                    kind: FoldKind::Updated,
                    outcome,
                }
            }
            Some(front) if epoch < front => FoldResult {
                kind: FoldKind::Stale,
                outcome: DeltaOutcome::default(),
            },
            _ => {
                let mut snapshot = Snapshot::new(dpid, epoch, now);
                apply(&mut snapshot);
                let outcome = match self.snapshots.front() {
                    Some(previous) => snapshot.compute_delta_from(previous),
                    None => DeltaOutcome::default(),
                };
                self.snapshots.push_front(snapshot);
                self.snapshots.truncate(self.max_len);
                FoldResult {
                    kind: FoldKind::Inserted,
                    outcome,
                }
            }
        }
    }

    /// Fold an aggregate reply for `epoch` into the history.
    ///
    /// Only the flow fields are written. Capture time, port counters and
    /// deltas of an existing entry stay as the port reply left them; a new
    /// front entry only learns its distance in epochs from the old front.
    pub fn fold_aggregate(
        &mut self,
        dpid: Dpid,
        epoch: u64,
        now: Instant,
        stats: &AggregateStats,
    ) -> FoldKind {
        let front_epoch = self.snapshots.front().map(|s| s.collection_epoch);
        match front_epoch {
            Some(front) if front == epoch => {
                if let Some(latest) = self.snapshots.front_mut() {
                    latest.store_aggregate(stats);
                }
                FoldKind::Updated
            }
            Some(front) if epoch < front => FoldKind::Stale,
            _ => {
                let mut snapshot = Snapshot::new(dpid, epoch, now);
                snapshot.store_aggregate(stats);
                snapshot.epoch_delta = front_epoch.map(|front| epoch - front);
                self.snapshots.push_front(snapshot);
                self.snapshots.truncate(self.max_len);
                FoldKind::Inserted
            }
        }
    }
}

fn percent_of(bps: f64, speed_bps: u64) -> f64 {
    if speed_bps == 0 {
        0.0
    } else {
        bps / speed_bps as f64 * 100.0
    }
}

pub fn wall_clock_us() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(port_no: PortNo, rx_bytes: u64, tx_bytes: u64) -> PortStats {
        PortStats {
            port_no,
            rx_bytes,
            tx_bytes,
            ..Default::default()
        }
    }

    fn fold_ports(
        history: &mut SnapshotHistory,
        epoch: u64,
        now: Instant,
        stats: Vec<PortStats>,
    ) -> FoldResult {
        history.fold(Dpid(1), epoch, now, |snapshot| {
            snapshot.store_port_info(&stats, |_| true)
        })
    }

    #[test]
    fn bootstrap_snapshot_is_ready_without_deltas() {
        let mut history = SnapshotHistory::new(10);
        let base = Instant::now();
        let result = fold_ports(&mut history, 1, base, vec![port(1, 100, 0)]);
        assert_eq!(result.kind, FoldKind::Inserted);

        let latest = history.latest().expect("snapshot");
        assert!(latest.ready());
        assert_eq!(latest.delta, None);
    }

    #[test]
    fn snapshot_without_deltas_is_not_ready() {
        let mut history = SnapshotHistory::new(10);
        fold_ports(&mut history, 4, Instant::now(), vec![port(1, 100, 0)]);
        assert!(!history.latest().expect("snapshot").ready());
    }

    #[test]
    fn newer_epoch_appends_with_deltas() {
        let mut history = SnapshotHistory::new(10);
        let base = Instant::now();
        fold_ports(&mut history, 1, base, vec![port(1, 100, 50)]);
        fold_ports(
            &mut history,
            2,
            base + Duration::from_secs(1),
            vec![port(1, 600, 50)],
        );

        assert_eq!(history.len(), 2);
        let latest = history.latest().expect("snapshot");
        assert_eq!(latest.epoch_delta, Some(1));
        assert_eq!(latest.time_since_delta, Duration::from_secs(1));
        assert_eq!(latest.delta.expect("delta").rx_bytes, 500);
        let info = &latest.ports[&1];
        assert_eq!(info.delta.expect("port delta").rx_bytes, 500);
        assert_eq!(latest.port_rates(info).bits_received_per_sec, 4000.0);
        assert!(latest.ready());
    }

    #[test]
    fn same_epoch_updates_in_place() {
        let mut history = SnapshotHistory::new(10);
        let base = Instant::now();
        fold_ports(&mut history, 1, base, vec![port(1, 100, 0)]);
        fold_ports(&mut history, 2, base + Duration::from_secs(1), vec![port(1, 200, 0)]);
        let result = fold_ports(
            &mut history,
            2,
            base + Duration::from_secs(2),
            vec![port(1, 300, 0)],
        );

        assert_eq!(result.kind, FoldKind::Updated);
        assert_eq!(history.len(), 2);
        let latest = history.latest().expect("snapshot");
        assert_eq!(latest.delta.expect("delta").rx_bytes, 200);
        assert_eq!(latest.time_since_delta, Duration::from_secs(2));
    }

    #[test]
    fn older_epoch_is_stale() {
        let mut history = SnapshotHistory::new(10);
        let base = Instant::now();
        fold_ports(&mut history, 5, base, vec![port(1, 100, 0)]);
        let result = fold_ports(&mut history, 3, base, vec![port(1, 0, 0)]);
        assert_eq!(result.kind, FoldKind::Stale);
        assert_eq!(history.latest().expect("snapshot").collection_epoch, 5);
    }

    #[test]
    fn history_evicts_oldest_past_bound() {
        let mut history = SnapshotHistory::new(3);
        let base = Instant::now();
        for epoch in 1..=5 {
            fold_ports(
                &mut history,
                epoch,
                base + Duration::from_secs(epoch),
                vec![port(1, epoch * 10, 0)],
            );
        }
        assert_eq!(history.len(), 3);
        let epochs: Vec<u64> = history.iter().map(|s| s.collection_epoch).collect();
        assert_eq!(epochs, vec![5, 4, 3]);
    }

    #[test]
    fn counter_reset_clamps_and_raises_port_error() {
        let mut history = SnapshotHistory::new(10);
        let base = Instant::now();
        fold_ports(&mut history, 1, base, vec![port(1, 1000, 1000)]);
        let result = fold_ports(
            &mut history,
            2,
            base + Duration::from_secs(1),
            vec![port(1, 10, 2000)],
        );

        let latest = history.latest().expect("snapshot");
        let delta = latest.ports[&1].delta.expect("delta");
        assert_eq!(delta.rx_bytes, 0);
        assert_eq!(delta.tx_bytes, 1000);
        assert_eq!(result.outcome.port_errors.len(), 1);
        assert!(result.outcome.port_errors[0].counter_regression);
    }

    #[test]
    fn drops_raise_port_error() {
        let mut history = SnapshotHistory::new(10);
        let base = Instant::now();
        fold_ports(&mut history, 1, base, vec![port(1, 0, 0)]);
        let dropped = PortStats {
            port_no: 1,
            rx_dropped: 3,
            ..Default::default()
        };
        let result = fold_ports(&mut history, 2, base + Duration::from_secs(1), vec![dropped]);

        let error = result.outcome.port_errors.first().expect("port error");
        assert_eq!(error.rx_dropped, 3);
        assert!(!error.counter_regression);
    }

    #[test]
    fn unknown_port_is_skipped_not_fatal() {
        let mut history = SnapshotHistory::new(10);
        let base = Instant::now();
        let stats = vec![port(1, 0, 0), port(7, 0, 0)];
        history.fold(Dpid(1), 1, base, |s| s.store_port_info(&stats, |p| p == 1));
        let stats = vec![port(1, 80, 0), port(7, 80, 0)];
        let result = history.fold(Dpid(1), 2, base + Duration::from_secs(1), |s| {
            s.store_port_info(&stats, |p| p == 1)
        });

        assert_eq!(result.outcome.skipped_ports, vec![7]);
        let latest = history.latest().expect("snapshot");
        assert!(latest.ports[&1].delta.is_some());
        assert!(latest.ports[&7].delta.is_none());
        assert_eq!(latest.delta.expect("delta").rx_bytes, 160);
    }

    fn aggregate(flow_count: u32) -> AggregateStats {
        AggregateStats {
            packet_count: 10,
            byte_count: 1_000,
            flow_count,
        }
    }

    #[test]
    fn aggregate_after_ports_keeps_rates_and_errors() {
        let mut history = SnapshotHistory::new(10);
        let base = Instant::now();
        fold_ports(&mut history, 1, base, vec![port(1, 100, 0)]);
        let dropped = PortStats {
            port_no: 1,
            rx_bytes: 600,
            rx_dropped: 3,
            ..Default::default()
        };
        let result = fold_ports(&mut history, 2, base + Duration::from_secs(1), vec![dropped]);
        assert_eq!(result.outcome.port_errors.len(), 1);

        let kind = history.fold_aggregate(Dpid(1), 2, base + Duration::from_secs(3), &aggregate(4));
        assert_eq!(kind, FoldKind::Updated);

        let latest = history.latest().expect("snapshot");
        assert_eq!(latest.number_of_flows, Some(4));
        assert_eq!(latest.captured_at, base + Duration::from_secs(1));
        assert_eq!(latest.time_since_delta, Duration::from_secs(1));
        assert_eq!(latest.port_rates(&latest.ports[&1]).bits_received_per_sec, 4000.0);
    }

    #[test]
    fn aggregate_before_ports_leaves_deltas_to_the_port_reply() {
        let mut history = SnapshotHistory::new(10);
        let base = Instant::now();
        fold_ports(&mut history, 1, base, vec![port(1, 100, 0)]);

        let kind = history.fold_aggregate(Dpid(1), 2, base + Duration::from_millis(200), &aggregate(2));
        assert_eq!(kind, FoldKind::Inserted);
        let latest = history.latest().expect("snapshot");
        assert_eq!(latest.epoch_delta, Some(1));
        assert_eq!(latest.time_since_delta, Duration::ZERO);
        assert!(latest.totals.is_none());
        assert!(!latest.ready());

        fold_ports(&mut history, 2, base + Duration::from_secs(1), vec![port(1, 600, 0)]);
        let latest = history.latest().expect("snapshot");
        assert_eq!(history.len(), 2);
        assert_eq!(latest.number_of_flows, Some(2));
        assert_eq!(latest.time_since_delta, Duration::from_secs(1));
        assert_eq!(latest.port_rates(&latest.ports[&1]).bits_received_per_sec, 4000.0);
        assert!(latest.ready());
    }

    #[test]
    fn stale_aggregate_is_ignored() {
        let mut history = SnapshotHistory::new(10);
        fold_ports(&mut history, 3, Instant::now(), vec![port(1, 0, 0)]);
        let kind = history.fold_aggregate(Dpid(1), 2, Instant::now(), &aggregate(9));
        assert_eq!(kind, FoldKind::Stale);
        assert_eq!(history.latest().expect("snapshot").number_of_flows, None);
    }

    #[test]
    fn zero_time_gap_estimates_nothing() {
        let snapshot = Snapshot::new(Dpid(1), 1, Instant::now());
        let info = PortInfo {
            port_no: 1,
            totals: Counters::default(),
            delta: Some(Counters {
                rx_bytes: 10,
                ..Default::default()
            }),
            registered: true,
        };
        assert_eq!(snapshot.port_rates(&info), PortRates::default());
    }
}
