//! MQTT transport for the message bus
//!
//! Topic layout: `<topic>/<partition>/<key>`, published with QoS 1 (at-least-once).
//! Consumers subscribe `<topic>/#` and the event loop routes each publish to the
//! partition channel named in its topic. The broker preserves per-topic order from a
//! single publisher, which gives per-key ordering.
//!
//! The MQTT client id acts as the consumer group across processes; inside one
//! process every registered group receives its own copy.
//!
//! `connect` waits for the broker's first ConnAck, so a broker that is down at
//! startup fails the boot instead of leaving a bus that silently drops events.

use crate::infra::config::Config;
use crate::io::bus::{partition_for, BusError, BusMessage, GroupRoute, MessageBus, RouteTable, Subscription};
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Split `<topic>/<partition>/<key>` into its parts
pub fn parse_bus_topic(full: &str) -> Option<(&str, usize, &str)> {
    let mut parts = full.rsplitn(3, '/');
    let key = parts.next()?;
    let partition = parts.next()?.parse().ok()?;
    let topic = parts.next()?;
    if topic.is_empty() || key.is_empty() {
        return None;
    }
    Some((topic, partition, key))
}

pub fn bus_topic(topic: &str, partition: usize, key: &str) -> String {
    format!("{topic}/{partition}/{key}")
}

pub struct MqttBus {
    client: AsyncClient,
    partitions: usize,
    routes: Arc<RouteTable>,
}

impl MqttBus {
    /// Connect to the configured broker and spawn the event loop task
    ///
    /// Fails if no ConnAck arrives within `[bus] connect_timeout_ms`. The task
    /// stops on shutdown and disconnects the client.
    pub async fn connect(
        config: &Config,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, JoinHandle<()>), BusError> {
        let client_id = client_id(config);
        let mut mqttoptions = MqttOptions::new(client_id.clone(), config.bus_host(), config.bus_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        // Persistent session: the broker keeps QoS 1 messages for this id while it
        // is offline. Processes sharing a role need distinct `[bus] client_id`s.
        mqttoptions.set_clean_session(false);

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 1000);
        let retry_delay = Duration::from_millis(config.bus_poll_interval_ms());
        await_connack(&mut eventloop, Duration::from_millis(config.bus_connect_timeout_ms()), retry_delay).await?;

        let routes = Arc::new(RouteTable::default());
        let partitions = config.bus_partitions().max(1);

        let handle = tokio::spawn(run_event_loop(eventloop, client.clone(), routes.clone(), retry_delay, shutdown));

        info!(
            client_id = %client_id,
            host = %config.bus_host(),
            port = %config.bus_port(),
            partitions = %partitions,
            "mqtt_bus_started"
        );

        Ok((Self { client, partitions, routes }, handle))
    }
}

/// Stable per role so a restarted process resumes its persistent session
fn client_id(config: &Config) -> String {
    format!("{}-{}", config.bus_client_id(), config.role().as_str())
}

/// Poll until the broker acknowledges the connection, retrying errors until `limit`
async fn await_connack(eventloop: &mut EventLoop, limit: Duration, retry_delay: Duration) -> Result<(), BusError> {
    let mut last_error = String::from("no response from broker");
    let connected = tokio::time::timeout(limit, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(code = ?ack.code, session_present = %ack.session_present, "mqtt_bus_connected");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "mqtt_bus_connect_attempt_failed");
                    last_error = e.to_string();
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    })
    .await;

    connected.map_err(|_| BusError::Connect(format!("no ConnAck within {} ms: {last_error}", limit.as_millis())))
}

impl MessageBus for MqttBus {
    fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<(), BusError> {
        let partition = partition_for(key, self.partitions);
        self.client
            .try_publish(bus_topic(topic, partition, key), QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, BusError> {
        let (route, subscription) = GroupRoute::open(topic, group, self.partitions);
        self.routes.add(topic, route)?;
        self.client
            .try_subscribe(format!("{topic}/#"), QoS::AtLeastOnce)
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        info!(topic = %topic, group = %group, "mqtt_bus_subscribed");
        Ok(subscription)
    }

    fn partitions(&self) -> usize {
        self.partitions
    }
}

async fn run_event_loop(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    routes: Arc<RouteTable>,
    retry_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // Rate-limit connection error logs to 1 per 5 seconds
    let mut last_error_log = Instant::now() - Duration::from_secs(10);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    if let Err(e) = client.try_disconnect() {
                        debug!(error = %e, "mqtt_bus_disconnect_failed");
                    }
                    info!("mqtt_bus_shutdown");
                    return;
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Some((topic, partition, key)) = parse_bus_topic(&publish.topic) else {
                            warn!(topic = %publish.topic, "mqtt_bus_unroutable_topic");
                            continue;
                        };
                        let msg = BusMessage {
                            topic: topic.to_string(),
                            key: key.to_string(),
                            partition,
                            payload: publish.payload.clone(),
                        };
                        routes.dispatch(msg);
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_bus_connected");
                        // Re-establish subscriptions after a reconnect
                        for topic in routes.topics() {
                            if let Err(e) = client.try_subscribe(format!("{topic}/#"), QoS::AtLeastOnce) {
                                warn!(topic = %topic, error = %e, "mqtt_bus_resubscribe_failed");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if last_error_log.elapsed() > Duration::from_secs(5) {
                            error!(error = %e, "mqtt_bus_error");
                            last_error_log = Instant::now();
                        }
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }
        }
    }
}
