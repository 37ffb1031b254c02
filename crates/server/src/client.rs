use std::{
    collections::{BTreeSet, HashMap},
    net::SocketAddr,
    time::Instant,
};

use common::{ServerMessage, protocol::Topic};

/// A message the engines want delivered, before subscriptions are resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Reply to one client.
    To(SocketAddr, ServerMessage),
    /// Unsolicited broadcast to every subscriber of the topic.
    Topic(Topic, ServerMessage),
}

/// State for a single control-plane client
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub addr: SocketAddr,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub topics: BTreeSet<Topic>,

    /// Messages routed to this client so far
    pub messages_sent: u64,
}

impl Subscriber {
    pub fn new(addr: SocketAddr, now: Instant) -> Self {
        Subscriber {
            addr,
            first_seen: now,
            last_seen: now,
            topics: BTreeSet::new(),
            messages_sent: 0,
        }
    }
}

/// Every client holding at least one subscription, keyed by address
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    clients: HashMap<SocketAddr, Subscriber>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note activity from a known subscriber. Clients that never
    /// subscribed are not tracked.
    pub fn touch(&mut self, addr: SocketAddr, now: Instant) -> bool {
        match self.clients.get_mut(&addr) {
            Some(client) => {
                client.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Returns false when the client was already subscribed.
    pub fn subscribe(&mut self, addr: SocketAddr, topic: Topic, now: Instant) -> bool {
        let client = self
            .clients
            .entry(addr)
            .or_insert_with(|| Subscriber::new(addr, now));
        client.last_seen = now;
        client.topics.insert(topic)
    }

    pub fn remove(&mut self, addr: SocketAddr) -> Option<Subscriber> {
        self.clients.remove(&addr)
    }

    pub fn get(&self, addr: SocketAddr) -> Option<&Subscriber> {
        self.clients.get(&addr)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Subscribers of `topic`, in address order.
    pub fn subscribers_of(&self, topic: Topic) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self
            .clients
            .values()
            .filter(|client| client.topics.contains(&topic))
            .map(|client| client.addr)
            .collect();
        addrs.sort();
        addrs
    }

    /// Expand a delivery into one message per recipient.
    pub fn resolve(&mut self, delivery: Delivery) -> Vec<(SocketAddr, ServerMessage)> {
        let recipients = match &delivery {
            Delivery::To(addr, _) => vec![*addr],
            Delivery::Topic(topic, _) => self.subscribers_of(*topic),
        };
        for addr in &recipients {
            if let Some(client) = self.clients.get_mut(addr) {
                client.messages_sent += 1;
            }
        }

        let message = match delivery {
            Delivery::To(_, message) | Delivery::Topic(_, message) => message,
        };
        recipients
            .into_iter()
            .map(|addr| (addr, message.clone()))
            .collect()
    }
}
