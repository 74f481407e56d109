//! Prometheus metrics HTTP endpoint
//!
//! Exposes dispatch metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server. The RPC servers expose the same text on
//! their own /metrics route; this standalone server is for processes (the
//! gateway) that have no RPC listener.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with service label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    service: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{service=\"{service}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    service: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{service=\"{service}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{service=\"{service}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{service=\"{service}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{service=\"{service}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(metrics: &Metrics, service: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_driver_metrics(&mut output, service, &summary);
    write_trip_metrics(&mut output, service, &summary);
    write_saga_metrics(&mut output, service, &summary);
    write_event_metrics(&mut output, service, &summary);
    write_hub_metrics(&mut output, service, &summary);

    output
}

fn write_driver_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "dispatch_drivers_registered_total",
        "Drivers registered",
        MetricType::Counter,
        service,
        summary.drivers_registered,
    );
    write_metric(
        output,
        "dispatch_status_updates_total",
        "Driver availability writes",
        MetricType::Counter,
        service,
        summary.status_updates,
    );
}

fn write_trip_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    let counters = [
        ("dispatch_trips_created_total", "Trips created", summary.trips_created),
        ("dispatch_trips_completed_total", "Trips completed", summary.trips_completed),
        ("dispatch_no_driver_total", "Trip requests rejected with no available driver", summary.no_driver_total),
        ("dispatch_reservation_failures_total", "Driver reservations that failed", summary.reservation_failures),
        ("dispatch_pricing_failures_total", "Pricing oracle failures", summary.pricing_failures),
        ("dispatch_release_failures_total", "Trip completions that could not free the driver", summary.release_failures),
        ("dispatch_rpc_requests_total", "RPC requests served", summary.rpc_requests),
    ];
    for (name, help, val) in counters {
        write_metric(output, name, help, MetricType::Counter, service, val);
    }
}

fn write_saga_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    write_histogram(
        output,
        "dispatch_saga_latency_ms",
        "Booking saga latency in milliseconds",
        service,
        &summary.saga_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.saga_sum_ms,
    );
    write_metric(
        output,
        "dispatch_saga_latency_p99_ms",
        "99th percentile booking saga latency",
        MetricType::Gauge,
        service,
        summary.saga_p99_ms,
    );
    write_metric(
        output,
        "dispatch_compensations_total",
        "Drivers released after a failed booking",
        MetricType::Counter,
        service,
        summary.compensations_total,
    );
    write_metric(
        output,
        "dispatch_releases_dead_lettered_total",
        "Compensating releases that exhausted their retries",
        MetricType::Counter,
        service,
        summary.releases_dead_lettered,
    );
    write_metric(
        output,
        "dispatch_dead_letters_recovered_total",
        "Dead-lettered releases that later succeeded",
        MetricType::Counter,
        service,
        summary.dead_letters_recovered,
    );
}

fn write_event_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "dispatch_events_published_total",
        "Events published to the bus",
        MetricType::Counter,
        service,
        summary.events_published,
    );
    write_metric(
        output,
        "dispatch_publish_failures_total",
        "Events that could not be published",
        MetricType::Counter,
        service,
        summary.publish_failures,
    );
    write_metric(
        output,
        "dispatch_events_consumed_total",
        "Events applied by consumers",
        MetricType::Counter,
        service,
        summary.events_consumed,
    );
    write_metric(
        output,
        "dispatch_events_malformed_total",
        "Events dropped as malformed",
        MetricType::Counter,
        service,
        summary.events_malformed,
    );
}

fn write_hub_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "dispatch_observers",
        "Connected real-time observers",
        MetricType::Gauge,
        service,
        summary.observers_connected,
    );
    write_metric(
        output,
        "dispatch_observers_evicted_total",
        "Observers evicted after a failed push",
        MetricType::Counter,
        service,
        summary.observers_evicted,
    );
    write_metric(
        output,
        "dispatch_broadcasts_total",
        "Availability snapshots broadcast",
        MetricType::Counter,
        service,
        summary.broadcasts_total,
    );
}

/// Plain-text response for /metrics
pub fn metrics_response(metrics: &Metrics, service: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(format_prometheus_metrics(metrics, service))))
        .expect("static response should not fail")
}

/// Response for /health
pub fn health_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .body(Full::new(Bytes::from(format!("ok {}", env!("GIT_HASH")))))
        .expect("static response should not fail")
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    service: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => Ok(metrics_response(&metrics, &service)),
        (&Method::GET, "/health") => Ok(health_response()),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    service: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let service = Arc::new(service);

    info!(port = %port, service = %service, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let service = service.clone();

                        tokio::spawn(async move {
                            let handler = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let service = service.clone();
                                async move { handle_request(req, metrics, service).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, handler)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
