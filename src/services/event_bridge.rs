//! Event bridge - publishes and applies cross-service events
//!
//! Producer side serializes AvailabilityEvent / TripEvent onto the bus keyed by
//! driver id / trip id. Consumer side runs one task per partition, decodes each
//! message and hands it to an idempotent handler. Malformed messages are logged,
//! counted and skipped; they never stop the stream.

use crate::domain::events::{
    self, AvailabilityEvent, TripEvent, DRIVER_LOCATIONS_TOPIC, TRIP_EVENTS_TOPIC,
};
use crate::domain::types::Driver;
use crate::domain::DispatchError;
use crate::infra::metrics::Metrics;
use crate::io::bus::{BusMessage, MessageBus, Subscription};
use crate::services::hub::Hub;
use crate::services::registry::DriverRegistry;
use crate::services::replica::DriverReplica;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Best-effort publisher for domain events
#[derive(Clone)]
pub struct EventProducer {
    bus: Arc<dyn MessageBus>,
    metrics: Arc<Metrics>,
}

impl EventProducer {
    pub fn new(bus: Arc<dyn MessageBus>, metrics: Arc<Metrics>) -> Self {
        Self { bus, metrics }
    }

    /// Publish a driver's current availability on `driver_locations`
    pub fn publish_availability(&self, driver: &Driver) -> bool {
        let event = AvailabilityEvent::from(driver);
        self.publish(DRIVER_LOCATIONS_TOPIC, event.partition_key(), &event)
    }

    /// Publish a trip lifecycle event on `trip_events`
    pub fn publish_trip(&self, event: &TripEvent) -> bool {
        self.publish(TRIP_EVENTS_TOPIC, event.partition_key(), event)
    }

    fn publish<T: Serialize>(&self, topic: &str, key: &str, event: &T) -> bool {
        let payload = match events::encode(event) {
            Ok(p) => p,
            Err(e) => {
                warn!(topic = %topic, key = %key, error = %e, "event_encode_failed");
                self.metrics.record_publish_failure();
                return false;
            }
        };

        match self.bus.publish(topic, key, Bytes::from(payload)) {
            Ok(()) => {
                self.metrics.record_event_published();
                debug!(topic = %topic, key = %key, "event_published");
                true
            }
            Err(e) => {
                self.metrics.record_publish_failure();
                warn!(topic = %topic, key = %key, error = %e, "event_publish_failed");
                false
            }
        }
    }
}

/// Applies decoded events; must tolerate replays
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    type Event: DeserializeOwned + Send;

    fn name(&self) -> &'static str;

    async fn handle(&self, event: Self::Event);
}

/// Spawn one consumer task per partition of `subscription`
///
/// Each task stops as soon as the shutdown signal flips or its channel closes.
pub fn spawn_consumer<H: EventHandler>(
    subscription: Subscription,
    handler: Arc<H>,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let Subscription { topic, group, partitions } = subscription;
    info!(
        handler = %handler.name(),
        topic = %topic,
        group = %group,
        partitions = %partitions.len(),
        "event_consumer_started"
    );

    partitions
        .into_iter()
        .enumerate()
        .map(|(partition, rx)| {
            let handler = handler.clone();
            let metrics = metrics.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(consume_partition(partition, rx, handler, metrics, shutdown))
        })
        .collect()
}

async fn consume_partition<H: EventHandler>(
    partition: usize,
    mut rx: mpsc::UnboundedReceiver<BusMessage>,
    handler: Arc<H>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                apply_message(&*handler, &metrics, msg).await;
            }
        }
    }
    debug!(handler = %handler.name(), partition = %partition, "event_consumer_stopped");
}

/// Decode and apply a single message; returns false if it was dropped as malformed
pub async fn apply_message<H: EventHandler>(handler: &H, metrics: &Metrics, msg: BusMessage) -> bool {
    match events::decode::<H::Event>(&msg.payload) {
        Ok(event) => {
            handler.handle(event).await;
            metrics.record_event_consumed();
            true
        }
        Err(e) => {
            metrics.record_event_malformed();
            warn!(
                handler = %handler.name(),
                topic = %msg.topic,
                key = %msg.key,
                partition = %msg.partition,
                error = %e,
                "event_malformed"
            );
            false
        }
    }
}

/// Driver service: keeps the registry in line with trip lifecycle events
pub struct TripEventApplier {
    registry: Arc<DriverRegistry>,
}

impl TripEventApplier {
    pub fn new(registry: Arc<DriverRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventHandler for TripEventApplier {
    type Event = TripEvent;

    fn name(&self) -> &'static str {
        "trip_event_applier"
    }

    async fn handle(&self, event: TripEvent) {
        let available = event.driver_available_after();
        match self.registry.apply_trip_status(&event.driver_id, &event.trip_id, available) {
            Ok(changed) => debug!(
                trip_id = %event.trip_id,
                driver_id = %event.driver_id,
                event_type = %event.event_type.as_str(),
                changed = %changed,
                "trip_event_applied"
            ),
            Err(DispatchError::DriverNotFound(id)) => {
                warn!(trip_id = %event.trip_id, driver_id = %id, "trip_event_unknown_driver")
            }
            Err(e) => warn!(trip_id = %event.trip_id, error = %e, "trip_event_apply_failed"),
        }
    }
}

/// Gateway: folds availability events into the replica and wakes the hub
pub struct AvailabilityRelay {
    replica: Arc<DriverReplica>,
    hub: Arc<Hub>,
}

impl AvailabilityRelay {
    pub fn new(replica: Arc<DriverReplica>, hub: Arc<Hub>) -> Self {
        Self { replica, hub }
    }
}

#[async_trait]
impl EventHandler for AvailabilityRelay {
    type Event = AvailabilityEvent;

    fn name(&self) -> &'static str {
        "availability_relay"
    }

    async fn handle(&self, event: AvailabilityEvent) {
        let driver_id = event.id.clone();
        if self.replica.apply(event) {
            let delivered = self.hub.on_availability_changed().await;
            debug!(driver_id = %driver_id, observers = %delivered, "availability_relayed");
        } else {
            debug!(driver_id = %driver_id, "availability_replay_ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{DriverId, Location, TripId};
    use crate::io::bus::InMemoryBus;
    use parking_lot::Mutex;

    struct Recorder {
        seen: Mutex<Vec<TripEvent>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        type Event = TripEvent;

        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn handle(&self, event: TripEvent) {
            self.seen.lock().push(event);
        }
    }

    fn message(payload: &'static [u8]) -> BusMessage {
        BusMessage {
            topic: TRIP_EVENTS_TOPIC.to_string(),
            key: "t".to_string(),
            partition: 0,
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_malformed_message_skipped_and_counted() {
        let metrics = Metrics::new();
        let recorder = Recorder { seen: Mutex::new(Vec::new()) };

        assert!(!apply_message(&recorder, &metrics, message(b"{not json")).await);
        assert!(
            apply_message(
                &recorder,
                &metrics,
                message(br#"{"event_type":"TRIP_CREATED","trip_id":"t","driver_id":"d"}"#)
            )
            .await
        );

        assert_eq!(recorder.seen.lock().len(), 1);
        let summary = metrics.report();
        assert_eq!(summary.events_malformed, 1);
        assert_eq!(summary.events_consumed, 1);
    }

    #[tokio::test]
    async fn test_consumer_continues_after_malformed_and_stops_on_shutdown() {
        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(InMemoryBus::new(1));
        let sub = bus.subscribe(TRIP_EVENTS_TOPIC, "g").unwrap();
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = spawn_consumer(sub, recorder.clone(), metrics.clone(), shutdown_rx);

        bus.publish(TRIP_EVENTS_TOPIC, "t1", Bytes::from_static(b"garbage")).unwrap();
        let producer = EventProducer::new(bus.clone(), metrics.clone());
        producer.publish_trip(&TripEvent::completed(TripId::from("t1"), DriverId::from("d1")));

        for _ in 0..100 {
            if !recorder.seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(recorder.seen.lock().len(), 1);

        shutdown_tx.send(true).unwrap();
        for h in handles {
            tokio::time::timeout(std::time::Duration::from_secs(1), h).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_trip_event_applier_is_idempotent() {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(DriverRegistry::new(metrics, None));
        let driver = registry.register("A", Location::new(0.0, 0.0));
        let applier = TripEventApplier::new(registry.clone());

        let created = TripEvent::created(TripId::from("t"), driver.id.clone());
        applier.handle(created.clone()).await;
        applier.handle(created).await;
        assert!(!registry.get_by_id(&driver.id).unwrap().is_available);

        applier.handle(TripEvent::completed(TripId::from("t"), driver.id.clone())).await;
        assert!(registry.get_by_id(&driver.id).unwrap().is_available);

        // Unknown drivers are skipped without panicking
        applier.handle(TripEvent::created(TripId::from("x"), DriverId::from("ghost"))).await;
    }

    #[tokio::test]
    async fn test_redelivered_completion_does_not_free_rebooked_driver() {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(DriverRegistry::new(metrics, None));
        let driver = registry.register("A", Location::new(0.0, 0.0));
        let applier = TripEventApplier::new(registry.clone());
        let (t1, t2) = (TripId::from("t1"), TripId::from("t2"));

        applier.handle(TripEvent::created(t1.clone(), driver.id.clone())).await;
        applier.handle(TripEvent::completed(t1.clone(), driver.id.clone())).await;
        applier.handle(TripEvent::created(t2.clone(), driver.id.clone())).await;
        assert!(!registry.get_by_id(&driver.id).unwrap().is_available);

        // trip1's completion shows up again after the driver took trip2
        applier.handle(TripEvent::completed(t1, driver.id.clone())).await;
        assert!(!registry.get_by_id(&driver.id).unwrap().is_available);

        applier.handle(TripEvent::completed(t2, driver.id.clone())).await;
        assert!(registry.get_by_id(&driver.id).unwrap().is_available);
    }
}
