//! Repeating timers keyed by task, fired from the owning event loop.

use core::cmp::Reverse;
use std::{
    collections::{BinaryHeap, HashMap},
    time::{Duration, Instant},
};

use common::{Dpid, southbound::StatsKind};

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Controller-wide periodic work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GlobalTask {
    EpochTick,
    UtilizationBroadcast,
    StatsDebug,
    SpanningTreeRecompute,
    QueryExpiry,
}

/// Per-switch statistics polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PollKind {
    Table,
    Port,
    Aggregate,
}

impl PollKind {
    pub const ALL: [PollKind; 3] = [PollKind::Table, PollKind::Port, PollKind::Aggregate];

    pub fn stats_kind(self) -> StatsKind {
        match self {
            PollKind::Table => StatsKind::Table,
            PollKind::Port => StatsKind::Port,
            PollKind::Aggregate => StatsKind::Aggregate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKey {
    Global(GlobalTask),
    Poll(Dpid, PollKind),
}

#[derive(Debug, Clone, Copy)]
struct Task {
    period: Duration,
    generation: u64,
}

#[derive(Debug)]
struct Entry {
    due: Instant,
    seq: u64,
    key: TaskKey,
    generation: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Cancelling a task drops its registration; heap entries left behind carry
/// an old generation and are discarded when they surface.
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: BinaryHeap<Reverse<Entry>>,
    tasks: HashMap<TaskKey, Task>,
    next_seq: u64,
    next_generation: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` to fire at `first_due` and every `period` after.
    /// Re-registering replaces the previous schedule.
    pub fn schedule_repeating(&mut self, key: TaskKey, first_due: Instant, period: Duration) {
        self.next_generation += 1;
        let task = Task {
            period: period.max(MIN_PERIOD),
            generation: self.next_generation,
        };
        self.tasks.insert(key, task);
        self.push(key, first_due, task.generation);
    }

    pub fn cancel(&mut self, key: TaskKey) -> bool {
        self.tasks.remove(&key).is_some()
    }

    /// Cancel every poll of `dpid`.
    pub fn cancel_switch(&mut self, dpid: Dpid) {
        for kind in PollKind::ALL {
            self.cancel(TaskKey::Poll(dpid, kind));
        }
    }

    pub fn is_scheduled(&self, key: TaskKey) -> bool {
        self.tasks.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Earliest instant anything may fire; a wake-up hint for the loop.
    #[inline]
    pub fn next_due(&self) -> Option<Instant> {
        self.queue.peek().map(|entry| entry.0.due)
    }

    /// Pop every task due at `now`, in due order, and reschedule each one
    /// period later. Missed periods are skipped, not replayed.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TaskKey> {
        let mut fired = Vec::new();
        while let Some(Reverse(entry)) = self.queue.peek() {
            if entry.due > now {
                break;
            }
            let Some(Reverse(entry)) = self.queue.pop() else {
                break;
            };
            let Some(task) = self.tasks.get(&entry.key).copied() else {
                continue;
            };
            if task.generation != entry.generation {
                continue;
            }

            let mut next = entry.due + task.period;
            if next <= now {
                next = now + task.period;
            }
            self.push(entry.key, next, task.generation);
            fired.push(entry.key);
        }
        fired
    }

    fn push(&mut self, key: TaskKey, due: Instant, generation: u64) {
        self.next_seq += 1;
        self.queue.push(Reverse(Entry {
            due,
            seq: self.next_seq,
            key,
            generation,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPOCH: TaskKey = TaskKey::Global(GlobalTask::EpochTick);

    #[test]
    fn fires_in_due_order_and_repeats() {
        let mut scheduler = Scheduler::new();
        let base = Instant::now();
        scheduler.schedule_repeating(EPOCH, base + Duration::from_secs(10), Duration::from_secs(10));
        let poll = TaskKey::Poll(Dpid(1), PollKind::Port);
        scheduler.schedule_repeating(poll, base + Duration::from_secs(5), Duration::from_secs(5));

        assert!(scheduler.pop_due(base).is_empty());
        assert_eq!(scheduler.pop_due(base + Duration::from_secs(5)), vec![poll]);
        assert_eq!(
            scheduler.pop_due(base + Duration::from_secs(10)),
            vec![poll, EPOCH]
        );
        assert_eq!(
            scheduler.next_due(),
            Some(base + Duration::from_secs(15))
        );
    }

    #[test]
    fn cancelled_task_never_fires() {
        let mut scheduler = Scheduler::new();
        let base = Instant::now();
        let poll = TaskKey::Poll(Dpid(9), PollKind::Table);
        scheduler.schedule_repeating(poll, base, Duration::from_secs(1));
        scheduler.cancel_switch(Dpid(9));

        assert!(!scheduler.is_scheduled(poll));
        assert!(scheduler.pop_due(base + Duration::from_secs(30)).is_empty());
    }

    #[test]
    fn rescheduling_replaces_previous_timer() {
        let mut scheduler = Scheduler::new();
        let base = Instant::now();
        scheduler.schedule_repeating(EPOCH, base, Duration::from_secs(1));
        scheduler.schedule_repeating(EPOCH, base + Duration::from_secs(3), Duration::from_secs(1));

        assert!(scheduler.pop_due(base + Duration::from_secs(2)).is_empty());
        assert_eq!(scheduler.pop_due(base + Duration::from_secs(3)), vec![EPOCH]);
    }

    #[test]
    fn late_wakeup_fires_once() {
        let mut scheduler = Scheduler::new();
        let base = Instant::now();
        scheduler.schedule_repeating(EPOCH, base, Duration::from_secs(1));
        assert_eq!(scheduler.pop_due(base + Duration::from_secs(10)), vec![EPOCH]);
        assert_eq!(scheduler.next_due(), Some(base + Duration::from_secs(11)));
    }
}
