//! Real-time hub - pushes available-driver snapshots to live observers
//!
//! The hub owns connection bookkeeping only, never domain data: each broadcast
//! re-queries its availability source. Subscribe and broadcast are serialized by
//! one async gate so a new observer always gets its initial snapshot before any
//! incremental push. Pushes run concurrently with a per-observer timeout; an
//! observer whose push fails or times out is evicted without affecting the rest.

use crate::domain::types::Driver;
use crate::infra::metrics::Metrics;
use crate::services::directory::AvailabilitySource;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub type ObserverId = u64;

#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("observer closed")]
    Closed,
    #[error("push timed out after {0:?}")]
    Timeout(Duration),
    #[error("send failed: {0}")]
    Send(String),
}

/// A live consumer of availability snapshots (a websocket, a test recorder, ...)
#[async_trait]
pub trait Observer: Send + Sync {
    /// Deliver a JSON array of drivers
    async fn send(&self, snapshot: Arc<str>) -> Result<(), ObserverError>;

    /// Release transport resources after eviction
    async fn close(&self) {}
}

pub struct Hub {
    observers: Mutex<FxHashMap<ObserverId, Arc<dyn Observer>>>,
    next_id: AtomicU64,
    source: Arc<dyn AvailabilitySource>,
    push_timeout: Duration,
    gate: tokio::sync::Mutex<()>,
    metrics: Arc<Metrics>,
}

impl Hub {
    pub fn new(source: Arc<dyn AvailabilitySource>, push_timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            observers: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
            source,
            push_timeout,
            gate: tokio::sync::Mutex::new(()),
            metrics,
        }
    }

    /// Register an observer after pushing it the current snapshot
    ///
    /// If the initial push fails the observer is not registered. If the source
    /// cannot be queried the observer is registered without an initial snapshot
    /// and catches up on the next change.
    pub async fn subscribe(&self, observer: Arc<dyn Observer>) -> Result<ObserverId, ObserverError> {
        let _gate = self.gate.lock().await;

        match self.source.list_available().await {
            Ok(drivers) => {
                let snapshot = encode_snapshot(&drivers);
                push(observer.as_ref(), snapshot, self.push_timeout).await?;
            }
            Err(e) => warn!(error = %e, "hub_initial_snapshot_failed"),
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let total = {
            let mut observers = self.observers.lock();
            observers.insert(id, observer);
            observers.len()
        };
        self.metrics.set_observers(total as u64);
        info!(observer_id = %id, total = %total, "observer_added");
        Ok(id)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let (removed, total) = {
            let mut observers = self.observers.lock();
            let removed = observers.remove(&id).is_some();
            (removed, observers.len())
        };
        if removed {
            self.metrics.set_observers(total as u64);
            info!(observer_id = %id, total = %total, "observer_removed");
        }
        removed
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Re-query the source and push the fresh snapshot to every observer
    ///
    /// Returns the number of observers that received it.
    pub async fn on_availability_changed(&self) -> usize {
        let _gate = self.gate.lock().await;
        match self.source.list_available().await {
            Ok(drivers) => self.push_all(&drivers).await,
            Err(e) => {
                warn!(error = %e, "hub_snapshot_query_failed");
                0
            }
        }
    }

    /// Push an explicit snapshot to every observer
    pub async fn broadcast(&self, drivers: &[Driver]) -> usize {
        let _gate = self.gate.lock().await;
        self.push_all(drivers).await
    }

    async fn push_all(&self, drivers: &[Driver]) -> usize {
        let targets: Vec<(ObserverId, Arc<dyn Observer>)> =
            self.observers.lock().iter().map(|(id, o)| (*id, o.clone())).collect();
        if targets.is_empty() {
            return 0;
        }

        let snapshot = encode_snapshot(drivers);
        let timeout = self.push_timeout;
        let mut pushes = JoinSet::new();
        for (id, observer) in targets {
            let snapshot = snapshot.clone();
            pushes.spawn(async move {
                let result = push(observer.as_ref(), snapshot, timeout).await;
                (id, observer, result)
            });
        }

        let mut delivered = 0;
        let mut failed = Vec::new();
        while let Some(joined) = pushes.join_next().await {
            match joined {
                Ok((_, _, Ok(()))) => delivered += 1,
                Ok((id, observer, Err(e))) => failed.push((id, observer, e.to_string())),
                Err(e) => warn!(error = %e, "hub_push_task_failed"),
            }
        }

        for (id, observer, reason) in failed {
            self.evict(id, observer, &reason).await;
        }

        self.metrics.record_broadcast();
        debug!(drivers = %drivers.len(), delivered = %delivered, "hub_broadcast");
        delivered
    }

    async fn evict(&self, id: ObserverId, observer: Arc<dyn Observer>, reason: &str) {
        let total = {
            let mut observers = self.observers.lock();
            observers.remove(&id);
            observers.len()
        };
        self.metrics.set_observers(total as u64);
        self.metrics.record_observer_evicted();
        warn!(observer_id = %id, reason = %reason, total = %total, "observer_evicted");
        let _ = tokio::time::timeout(self.push_timeout, observer.close()).await;
    }
}

async fn push(observer: &dyn Observer, snapshot: Arc<str>, timeout: Duration) -> Result<(), ObserverError> {
    match tokio::time::timeout(timeout, observer.send(snapshot)).await {
        Ok(result) => result,
        Err(_) => Err(ObserverError::Timeout(timeout)),
    }
}

/// JSON array wire form pushed to observers
pub fn encode_snapshot(drivers: &[Driver]) -> Arc<str> {
    serde_json::to_string(drivers).unwrap_or_else(|_| "[]".to_string()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Location;
    use crate::services::registry::DriverRegistry;

    /// Records every snapshot it receives
    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<Vec<Driver>>>,
    }

    #[async_trait]
    impl Observer for Recorder {
        async fn send(&self, snapshot: Arc<str>) -> Result<(), ObserverError> {
            let drivers: Vec<Driver> =
                serde_json::from_str(&snapshot).map_err(|e| ObserverError::Send(e.to_string()))?;
            self.received.lock().push(drivers);
            Ok(())
        }
    }

    /// Fails every push
    struct Broken;

    #[async_trait]
    impl Observer for Broken {
        async fn send(&self, _snapshot: Arc<str>) -> Result<(), ObserverError> {
            Err(ObserverError::Closed)
        }
    }

    /// Accepts the first push, then hangs forever
    #[derive(Default)]
    struct Stalls {
        calls: AtomicU64,
    }

    #[async_trait]
    impl Observer for Stalls {
        async fn send(&self, _snapshot: Arc<str>) -> Result<(), ObserverError> {
            if self.calls.fetch_add(1, Ordering::Relaxed) == 0 {
                return Ok(());
            }
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn setup() -> (Arc<DriverRegistry>, Hub) {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(DriverRegistry::new(metrics.clone(), None));
        let hub = Hub::new(registry.clone(), Duration::from_millis(50), metrics);
        (registry, hub)
    }

    #[tokio::test]
    async fn test_subscribe_receives_initial_snapshot() {
        let (registry, hub) = setup();
        registry.register("A", Location::new(0.0, 0.0));

        let recorder = Arc::new(Recorder::default());
        hub.subscribe(recorder.clone()).await.unwrap();

        let received = recorder.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].len(), 1);
        assert_eq!(received[0][0].name, "A");
    }

    #[tokio::test]
    async fn test_change_rebroadcasts_fresh_snapshot() {
        let (registry, hub) = setup();
        let a = registry.register("A", Location::new(0.0, 0.0));
        let recorder = Arc::new(Recorder::default());
        hub.subscribe(recorder.clone()).await.unwrap();

        registry.update_status(&a.id, false).unwrap();
        assert_eq!(hub.on_availability_changed().await, 1);

        let received = recorder.received.lock();
        assert_eq!(received.len(), 2);
        assert!(received[1].is_empty());
    }

    #[tokio::test]
    async fn test_failing_observer_evicted_others_still_served() {
        let (registry, hub) = setup();
        registry.register("A", Location::new(0.0, 0.0));

        let good = Arc::new(Recorder::default());
        hub.subscribe(good.clone()).await.unwrap();
        let stalls = Arc::new(Stalls::default());
        hub.subscribe(stalls).await.unwrap();
        assert_eq!(hub.observer_count(), 2);

        assert_eq!(hub.on_availability_changed().await, 1);
        assert_eq!(hub.observer_count(), 1);
        assert_eq!(good.received.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_initial_push_failure_not_registered() {
        let (_registry, hub) = setup();
        assert!(hub.subscribe(Arc::new(Broken)).await.is_err());
        assert_eq!(hub.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let (_registry, hub) = setup();
        let id = hub.subscribe(Arc::new(Recorder::default())).await.unwrap();
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        assert_eq!(hub.on_availability_changed().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_explicit_snapshot() {
        let (_registry, hub) = setup();
        let recorder = Arc::new(Recorder::default());
        hub.subscribe(recorder.clone()).await.unwrap();

        assert_eq!(hub.broadcast(&[]).await, 1);
        assert_eq!(recorder.received.lock().len(), 2);
    }

    #[test]
    fn test_encode_snapshot_is_json_array() {
        assert_eq!(&*encode_snapshot(&[]), "[]");
    }
}
