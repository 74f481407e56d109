//! RPC server - driver and trip services over JSON/HTTP
//!
//! One hyper http1 listener per service. Routing is a pure function of
//! (method, path, query, body) so it can be exercised without sockets.

use crate::domain::error::DispatchError;
use crate::domain::types::{DriverId, Location, TripId};
use crate::infra::metrics::Metrics;
use crate::io::prometheus::{health_response, metrics_response};
use crate::io::rpc::{
    query_param, status_for, validate_location, ErrorBody, RegisterDriverRequest, UpdateStatusRequest,
};
use crate::services::orchestrator::{TripOrchestrator, TripRequest};
use crate::services::registry::DriverRegistry;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

const MAX_BODY_BYTES: usize = 64 * 1024;

/// The service a listener fronts
#[derive(Clone)]
pub enum RpcService {
    Driver(Arc<DriverRegistry>),
    Trip(Arc<TripOrchestrator>),
}

impl RpcService {
    pub fn name(&self) -> &'static str {
        match self {
            RpcService::Driver(_) => "driver",
            RpcService::Trip(_) => "trip",
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

fn error_response(err: &DispatchError) -> Response<Full<Bytes>> {
    json_response(status_for(err), &ErrorBody::from(err))
}

fn bad_request(detail: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(StatusCode::BAD_REQUEST, &ErrorBody::bad_request(detail))
}

fn not_found() -> Response<Full<Bytes>> {
    json_response(StatusCode::NOT_FOUND, &ErrorBody { code: "no_route".to_string(), detail: String::new() })
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, Response<Full<Bytes>>> {
    serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid body: {e}")))
}

fn parse_coordinate(query: &str, key: &str) -> Result<Option<f64>, Response<Full<Bytes>>> {
    match query_param(query, key) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| bad_request(format!("invalid {key}: {raw}"))),
    }
}

/// Route one request
pub async fn route(
    service: &RpcService,
    metrics: &Metrics,
    method: &Method,
    path: &str,
    query: &str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        (&Method::GET, ["metrics"]) => return metrics_response(metrics, service.name()),
        (&Method::GET, ["health"]) => return health_response(),
        _ => {}
    }

    metrics.record_rpc_request();
    let result = match service {
        RpcService::Driver(registry) => driver_route(registry, method, &segments, query, &body),
        RpcService::Trip(orchestrator) => trip_route(orchestrator, method, &segments, &body).await,
    };
    result.unwrap_or_else(|response| response)
}

type RouteResult = Result<Response<Full<Bytes>>, Response<Full<Bytes>>>;

fn driver_route(
    registry: &DriverRegistry,
    method: &Method,
    segments: &[&str],
    query: &str,
    body: &[u8],
) -> RouteResult {
    match (method, segments) {
        (&Method::POST, ["drivers"]) => {
            let req: RegisterDriverRequest = parse_body(body)?;
            let location = Location::new(req.lat, req.lon);
            validate_location(location).map_err(bad_request)?;
            if req.name.trim().is_empty() {
                return Err(bad_request("name must not be empty"));
            }
            Ok(json_response(StatusCode::CREATED, &registry.register(&req.name, location)))
        }
        (&Method::GET, ["drivers", "available"]) => {
            let lat = parse_coordinate(query, "lat")?;
            let lon = parse_coordinate(query, "lon")?;
            let drivers = match (lat, lon) {
                (Some(lat), Some(lon)) => {
                    let origin = Location::new(lat, lon);
                    validate_location(origin).map_err(bad_request)?;
                    registry.find_closest_available(origin)
                }
                (None, None) => registry.available(),
                _ => return Err(bad_request("lat and lon must be given together")),
            };
            Ok(json_response(StatusCode::OK, &drivers))
        }
        (&Method::GET, ["drivers", id]) => registry
            .get_by_id(&DriverId::from(*id))
            .map(|d| json_response(StatusCode::OK, &d))
            .map_err(|e| error_response(&e)),
        (&Method::PUT, ["drivers", id, "status"]) => {
            let req: UpdateStatusRequest = parse_body(body)?;
            let id = DriverId::from(*id);
            let result = match &req.trip_id {
                Some(trip_id) => registry.apply_trip_status(&id, trip_id, req.available).map(|_| ()),
                None => registry.update_status(&id, req.available),
            };
            result.map(|()| json_response(StatusCode::OK, &req)).map_err(|e| error_response(&e))
        }
        _ => Err(not_found()),
    }
}

async fn trip_route(
    orchestrator: &TripOrchestrator,
    method: &Method,
    segments: &[&str],
    body: &[u8],
) -> RouteResult {
    match (method, segments) {
        (&Method::POST, ["trips"]) => {
            let req: TripRequest = parse_body(body)?;
            validate_location(req.start()).map_err(bad_request)?;
            validate_location(req.end()).map_err(bad_request)?;
            if req.rider_id.trim().is_empty() {
                return Err(bad_request("rider_id must not be empty"));
            }
            orchestrator
                .create_trip(req)
                .await
                .map(|trip| json_response(StatusCode::CREATED, &trip))
                .map_err(|e| error_response(&e))
        }
        (&Method::PATCH, ["trips", id, "complete"]) => orchestrator
            .complete_trip(&TripId::from(*id))
            .await
            .map(|trip| json_response(StatusCode::OK, &trip))
            .map_err(|e| error_response(&e)),
        (&Method::GET, ["trips", id]) => orchestrator
            .get_trip(&TripId::from(*id))
            .map(|trip| json_response(StatusCode::OK, &trip))
            .map_err(|e| error_response(&e)),
        _ => Err(not_found()),
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    service: RpcService,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return Ok(bad_request(format!("unreadable body: {e}"))),
    };

    let response = route(&service, &metrics, &method, &path, &query, body).await;
    debug!(service = %service.name(), method = %method, path = %path, status = %response.status().as_u16(), "rpc_request");
    Ok(response)
}

/// Bind the listener; failure here is fatal at startup
pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await
}

/// Serve RPC requests until shutdown
pub async fn serve(
    listener: TcpListener,
    service: RpcService,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = service.name();
    info!(service = %name, addr = ?listener.local_addr().ok(), "rpc_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let service = service.clone();
                        let metrics = metrics.clone();

                        tokio::spawn(async move {
                            let handler = service_fn(move |req| {
                                handle_request(req, service.clone(), metrics.clone())
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, handler)
                                .await
                            {
                                error!(error = %e, "rpc_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "rpc_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(service = %name, "rpc_server_shutdown");
                    return;
                }
            }
        }
    }
}
