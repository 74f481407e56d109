//! Availability republisher - periodic full-state publish from the driver service
//!
//! Replicas only hear about changes, so one that missed an event stays wrong until
//! that driver changes again. Re-emitting every driver each interval lets it catch
//! up; unchanged records are ignored as replays on the consumer side.

use crate::services::registry::DriverRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

pub struct AvailabilityRepublisher {
    registry: Arc<DriverRegistry>,
    interval: Duration,
}

impl AvailabilityRepublisher {
    pub fn new(registry: Arc<DriverRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Republish every `interval` until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;

        info!(interval_secs = %self.interval.as_secs(), "availability_republisher_started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("availability_republisher_shutdown");
                        return;
                    }
                }
            }
        }
    }

    /// Publish the current state of every driver; returns how many were sent
    pub fn tick(&self) -> usize {
        let published = self.registry.republish();
        debug!(drivers = %published, "availability_republished");
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::DRIVER_LOCATIONS_TOPIC;
    use crate::domain::types::Location;
    use crate::infra::metrics::Metrics;
    use crate::io::bus::{InMemoryBus, MessageBus};
    use crate::services::event_bridge::{spawn_consumer, AvailabilityRelay, EventProducer};
    use crate::services::hub::Hub;
    use crate::services::replica::DriverReplica;

    #[tokio::test]
    async fn test_replica_converges_after_one_tick() {
        let metrics = Arc::new(Metrics::new());
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new(2));
        let (_tx, rx) = watch::channel(false);
        let registry = Arc::new(DriverRegistry::new(
            metrics.clone(),
            Some(EventProducer::new(bus.clone(), metrics.clone())),
        ));

        // Registered before the gateway subscribed: its event reached nobody
        let driver = registry.register("A", Location::new(0.0, 0.0));

        let replica = Arc::new(DriverReplica::new());
        let hub = Arc::new(Hub::new(replica.clone(), Duration::from_millis(200), metrics.clone()));
        spawn_consumer(
            bus.subscribe(DRIVER_LOCATIONS_TOPIC, "gateway").unwrap(),
            Arc::new(AvailabilityRelay::new(replica.clone(), hub)),
            metrics,
            rx,
        );
        assert!(replica.get(&driver.id).is_none());

        let republisher = AvailabilityRepublisher::new(registry, Duration::from_secs(30));
        assert_eq!(republisher.tick(), 1);

        for _ in 0..100 {
            if replica.get(&driver.id).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(replica.get(&driver.id), Some(driver));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let registry = Arc::new(DriverRegistry::new(Arc::new(Metrics::new()), None));
        let republisher = AvailabilityRepublisher::new(registry, Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(republisher.run(rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
