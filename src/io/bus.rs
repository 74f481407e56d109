//! Partitioned, ordered message bus
//!
//! Producers publish `(topic, key, payload)`. The key picks a partition, and every
//! message for a key lands on the same partition, so consumers see a key's messages
//! in publish order. Different partitions are drained by independent tasks and may
//! interleave freely.
//!
//! Each subscription is its own consumer group: every group receives every message.

use bytes::Bytes;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::Hasher;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A message as delivered to a consumer partition
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub key: String,
    pub partition: usize,
    pub payload: Bytes,
}

/// Receivers for one consumer group, one per partition
pub struct Subscription {
    pub topic: String,
    pub group: String,
    pub partitions: Vec<mpsc::UnboundedReceiver<BusMessage>>,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// Ordered, partitioned pub/sub with at-least-once delivery
pub trait MessageBus: Send + Sync {
    /// Enqueue a message; never blocks on consumers
    fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<(), BusError>;

    /// Join `topic` as consumer group `group`
    fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, BusError>;

    /// Number of partitions per topic
    fn partitions(&self) -> usize;
}

/// Stable partition for a key (FxHash is unseeded, so every process agrees)
pub fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = FxHasher::default();
    hasher.write(key.as_bytes());
    (hasher.finish() % partitions.max(1) as u64) as usize
}

/// Sending half of a consumer group
pub(crate) struct GroupRoute {
    pub(crate) group: String,
    pub(crate) senders: Vec<mpsc::UnboundedSender<BusMessage>>,
}

impl GroupRoute {
    /// Create a route and the matching subscription
    pub(crate) fn open(topic: &str, group: &str, partitions: usize) -> (Self, Subscription) {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..partitions.max(1)).map(|_| mpsc::unbounded_channel()).unzip();
        let route = Self { group: group.to_string(), senders };
        let subscription =
            Subscription { topic: topic.to_string(), group: group.to_string(), partitions: receivers };
        (route, subscription)
    }

    /// Deliver to the message's partition; false once the consumer has gone away
    pub(crate) fn deliver(&self, msg: BusMessage) -> bool {
        match self.senders.get(msg.partition) {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }
}

/// Groups per topic, shared by the bus implementations
#[derive(Default)]
pub(crate) struct RouteTable {
    routes: RwLock<FxHashMap<String, Vec<GroupRoute>>>,
}

impl RouteTable {
    pub(crate) fn add(&self, topic: &str, route: GroupRoute) -> Result<(), BusError> {
        let mut routes = self.routes.write();
        let groups = routes.entry(topic.to_string()).or_default();
        if groups.iter().any(|g| g.group == route.group) {
            return Err(BusError::Subscribe(format!(
                "group {} already subscribed to {topic}",
                route.group
            )));
        }
        groups.push(route);
        Ok(())
    }

    /// Fan a message out to every group, dropping groups whose receivers are gone
    pub(crate) fn dispatch(&self, msg: BusMessage) -> usize {
        let mut stale = Vec::new();
        let delivered = {
            let routes = self.routes.read();
            let Some(groups) = routes.get(&msg.topic) else { return 0 };
            let mut delivered = 0;
            for route in groups {
                if route.deliver(msg.clone()) {
                    delivered += 1;
                } else {
                    stale.push(route.group.clone());
                }
            }
            delivered
        };

        if !stale.is_empty() {
            let mut routes = self.routes.write();
            if let Some(groups) = routes.get_mut(&msg.topic) {
                groups.retain(|g| !stale.contains(&g.group));
            }
            debug!(topic = %msg.topic, groups = ?stale, "bus_groups_pruned");
        }
        delivered
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        self.routes.read().keys().cloned().collect()
    }
}

/// In-process bus backed by unbounded channels
pub struct InMemoryBus {
    partitions: usize,
    routes: RouteTable,
}

impl InMemoryBus {
    pub fn new(partitions: usize) -> Self {
        info!(partitions = %partitions.max(1), "in_memory_bus_created");
        Self { partitions: partitions.max(1), routes: RouteTable::default() }
    }
}

impl MessageBus for InMemoryBus {
    fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<(), BusError> {
        let msg = BusMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            partition: partition_for(key, self.partitions),
            payload,
        };
        let delivered = self.routes.dispatch(msg);
        debug!(topic = %topic, key = %key, groups = %delivered, "bus_published");
        Ok(())
    }

    fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, BusError> {
        let (route, subscription) = GroupRoute::open(topic, group, self.partitions);
        self.routes.add(topic, route)?;
        info!(topic = %topic, group = %group, partitions = %self.partitions, "bus_subscribed");
        Ok(subscription)
    }

    fn partitions(&self) -> usize {
        self.partitions
    }
}
