//! RPC clients for the driver and trip services
//!
//! `RemoteDriverDirectory` is how the trip orchestrator and the gateway reach a
//! registry in another process. Non-2xx responses are mapped back onto the same
//! `DispatchError` variant the server produced.

use crate::domain::error::{DispatchError, DispatchResult};
use crate::domain::types::{Driver, DriverId, Location, Trip, TripId};
use crate::io::rpc::{ErrorBody, RegisterDriverRequest, UpdateStatusRequest};
use crate::services::directory::{AvailabilitySource, DriverDirectory};
use crate::services::orchestrator::TripRequest;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

fn transport(e: reqwest::Error) -> DispatchError {
    DispatchError::Transport(e.to_string())
}

/// Decode a success body, or rebuild the server's error
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> DispatchResult<T> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.map_err(transport);
    }

    let body = response.bytes().await.map_err(transport)?;
    match serde_json::from_slice::<ErrorBody>(&body) {
        Ok(err) => Err(err.into_error()),
        Err(_) => Err(DispatchError::Transport(format!("unexpected status {}", status.as_u16()))),
    }
}

fn build_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(timeout).http1_only().build()
}

/// Driver service over HTTP
pub struct RemoteDriverDirectory {
    base_url: String,
    client: reqwest::Client,
}

impl RemoteDriverDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), client: build_client(timeout)? })
    }

    pub async fn register(&self, name: &str, location: Location) -> DispatchResult<Driver> {
        let req = RegisterDriverRequest { name: name.to_string(), lat: location.lat, lon: location.lon };
        let response =
            self.client.post(format!("{}/drivers", self.base_url)).json(&req).send().await.map_err(transport)?;
        decode(response).await
    }

    pub async fn get(&self, id: &DriverId) -> DispatchResult<Driver> {
        let response =
            self.client.get(format!("{}/drivers/{}", self.base_url, id)).send().await.map_err(transport)?;
        decode(response).await
    }

    async fn put_status(&self, id: &DriverId, req: UpdateStatusRequest) -> DispatchResult<()> {
        let response = self
            .client
            .put(format!("{}/drivers/{}/status", self.base_url, id))
            .json(&req)
            .send()
            .await
            .map_err(transport)?;
        let _: UpdateStatusRequest = decode(response).await?;
        debug!(driver_id = %id, available = %req.available, trip_id = ?req.trip_id, "remote_status_updated");
        Ok(())
    }
}

#[async_trait]
impl AvailabilitySource for RemoteDriverDirectory {
    async fn list_available(&self) -> DispatchResult<Vec<Driver>> {
        let response =
            self.client.get(format!("{}/drivers/available", self.base_url)).send().await.map_err(transport)?;
        decode(response).await
    }
}

#[async_trait]
impl DriverDirectory for RemoteDriverDirectory {
    async fn find_available(&self, origin: Location) -> DispatchResult<Vec<Driver>> {
        let response = self
            .client
            .get(format!("{}/drivers/available", self.base_url))
            .query(&[("lat", origin.lat), ("lon", origin.lon)])
            .send()
            .await
            .map_err(transport)?;
        decode(response).await
    }

    async fn update_status(&self, id: &DriverId, available: bool) -> DispatchResult<()> {
        self.put_status(id, UpdateStatusRequest { available, trip_id: None }).await
    }

    async fn update_for_trip(&self, id: &DriverId, trip_id: &TripId, available: bool) -> DispatchResult<()> {
        self.put_status(id, UpdateStatusRequest { available, trip_id: Some(trip_id.clone()) }).await
    }
}

/// Trip service over HTTP
pub struct TripClient {
    base_url: String,
    client: reqwest::Client,
}

impl TripClient {
    pub fn new(base_url: &str, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), client: build_client(timeout)? })
    }

    pub async fn create_trip(&self, request: &TripRequest) -> DispatchResult<Trip> {
        let response =
            self.client.post(format!("{}/trips", self.base_url)).json(request).send().await.map_err(transport)?;
        decode(response).await
    }

    pub async fn complete_trip(&self, id: &TripId) -> DispatchResult<Trip> {
        let response = self
            .client
            .patch(format!("{}/trips/{}/complete", self.base_url, id))
            .send()
            .await
            .map_err(transport)?;
        decode(response).await
    }

    pub async fn get_trip(&self, id: &TripId) -> DispatchResult<Trip> {
        let response =
            self.client.get(format!("{}/trips/{}", self.base_url, id)).send().await.map_err(transport)?;
        decode(response).await
    }
}
