//! Road-distance pricing via an OSRM routing service

use crate::domain::types::Location;
use crate::services::pricing::{FareSchedule, PricingError, PricingOracle};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_OSRM_URL: &str = "http://router.project-osrm.org";

#[derive(Debug, Deserialize)]
struct RouteResponse {
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Debug, Deserialize)]
struct Route {
    /// Meters
    distance: f64,
}

pub struct OsrmPricingOracle {
    base_url: String,
    schedule: FareSchedule,
    client: reqwest::Client,
}

impl OsrmPricingOracle {
    pub fn new(base_url: &str, schedule: FareSchedule, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).http1_only().build()?;
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), schedule, client })
    }

    /// Route URL; OSRM takes lon,lat pairs
    pub fn route_url(&self, start: Location, end: Location) -> String {
        format!(
            "{}/route/v1/car/{},{};{},{}?overview=false",
            self.base_url, start.lon, start.lat, end.lon, end.lat
        )
    }
}

/// Road distance in km from an OSRM route response body
fn distance_km(body: &[u8]) -> Result<f64, PricingError> {
    let response: RouteResponse =
        serde_json::from_slice(body).map_err(|e| PricingError::Request(e.to_string()))?;
    let route = response.routes.first().ok_or(PricingError::NoRoute)?;
    Ok(route.distance / 1000.0)
}

#[async_trait]
impl PricingOracle for OsrmPricingOracle {
    async fn quote(&self, start: Location, end: Location) -> Result<f64, PricingError> {
        let url = self.route_url(start, end);
        let response = self.client.get(&url).send().await.map_err(|e| PricingError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PricingError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(|e| PricingError::Request(e.to_string()))?;
        let km = distance_km(&body)?;
        debug!(distance_km = %km, "osrm_route_distance");
        self.schedule.fare(km)
    }
}
