//! Websocket gateway - live available-driver feed
//!
//! Each connection to `/ws/drivers/available` becomes a hub observer. The hub
//! pushes the current snapshot on connect and a fresh one on every availability
//! change. Frames sent by the client are read and discarded.

use crate::services::hub::{Hub, Observer, ObserverError};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};

pub const AVAILABLE_DRIVERS_PATH: &str = "/ws/drivers/available";

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Hub observer backed by the write half of a websocket
pub struct WsObserver {
    peer: SocketAddr,
    sink: Mutex<WsSink>,
}

impl WsObserver {
    fn new(peer: SocketAddr, sink: WsSink) -> Self {
        Self { peer, sink: Mutex::new(sink) }
    }
}

#[async_trait]
impl Observer for WsObserver {
    async fn send(&self, snapshot: Arc<str>) -> Result<(), ObserverError> {
        self.sink
            .lock()
            .await
            .send(Message::Text(snapshot.to_string()))
            .await
            .map_err(|e| ObserverError::Send(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.sink.lock().await.close().await {
            debug!(peer = %self.peer, error = %e, "ws_close_failed");
        }
    }
}

/// Handshake callback: only the available-drivers feed is served
fn check_path(req: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if req.uri().path() == AVAILABLE_DRIVERS_PATH {
        return Ok(response);
    }
    let mut rejection = ErrorResponse::new(Some("not found".to_string()));
    *rejection.status_mut() = StatusCode::NOT_FOUND;
    Err(rejection)
}

/// Bind the listener; failure here is fatal at startup
pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await
}

/// Accept websocket observers until shutdown
pub async fn serve(listener: TcpListener, hub: Arc<Hub>, mut shutdown: watch::Receiver<bool>) {
    info!(addr = ?listener.local_addr().ok(), path = %AVAILABLE_DRIVERS_PATH, "ws_gateway_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(stream, peer, hub.clone(), shutdown.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "ws_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("ws_gateway_shutdown");
                    return;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: Arc<Hub>,
    mut shutdown: watch::Receiver<bool>,
) {
    let ws = match accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, error = %e, "ws_handshake_failed");
            return;
        }
    };

    let (sink, mut incoming) = ws.split();
    let observer = Arc::new(WsObserver::new(peer, sink));
    let id = match hub.subscribe(observer.clone()).await {
        Ok(id) => id,
        Err(e) => {
            warn!(peer = %peer, error = %e, "ws_subscribe_failed");
            observer.close().await;
            return;
        }
    };
    info!(peer = %peer, observer_id = %id, "ws_observer_connected");

    loop {
        tokio::select! {
            frame = incoming.next() => {
                match frame {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(peer = %peer, error = %e, "ws_read_error");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    hub.unsubscribe(id);
    observer.close().await;
    info!(peer = %peer, observer_id = %id, "ws_observer_disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Driver, Location};
    use crate::infra::metrics::Metrics;
    use crate::services::registry::DriverRegistry;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    async fn start() -> (Arc<DriverRegistry>, Arc<Hub>, SocketAddr, watch::Sender<bool>) {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(DriverRegistry::new(metrics.clone(), None));
        let hub = Arc::new(Hub::new(registry.clone(), Duration::from_millis(500), metrics));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(serve(listener, hub.clone(), rx));
        (registry, hub, addr, tx)
    }

    async fn next_snapshot(
        ws: &mut WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) -> Vec<Driver> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_initial_snapshot_then_updates() {
        let (registry, hub, addr, _tx) = start().await;
        let a = registry.register("A", Location::new(0.0, 0.0));

        let (mut ws, _) = connect_async(format!("ws://{addr}{AVAILABLE_DRIVERS_PATH}")).await.unwrap();
        let initial = next_snapshot(&mut ws).await;
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].id, a.id);

        // Client frames are ignored
        ws.send(Message::Text("hello".to_string())).await.unwrap();

        registry.update_status(&a.id, false).unwrap();
        hub.on_availability_changed().await;
        assert!(next_snapshot(&mut ws).await.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_path_rejected() {
        let (_registry, _hub, addr, _tx) = start().await;
        assert!(connect_async(format!("ws://{addr}/ws/other")).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_unsubscribes() {
        let (_registry, hub, addr, _tx) = start().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}{AVAILABLE_DRIVERS_PATH}")).await.unwrap();
        next_snapshot(&mut ws).await;
        assert_eq!(hub.observer_count(), 1);

        ws.close(None).await.unwrap();
        for _ in 0..100 {
            if hub.observer_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.observer_count(), 0);
    }
}
