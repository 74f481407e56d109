//! Dispatch control CLI
//!
//! Talks to running driver/trip services over their RPC surfaces and tails the
//! gateway's live feed.
//!
//! Usage:
//!   cargo run --bin dispatchctl -- register --name Ana --lat 44.81 --lon 20.46
//!   cargo run --bin dispatchctl -- available --lat 44.80 --lon 20.45
//!   cargo run --bin dispatchctl -- create-trip --rider r-1 --from 44.80,20.45 --to 44.78,20.48
//!   cargo run --bin dispatchctl -- complete-trip <trip-id>
//!   cargo run --bin dispatchctl -- watch

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use ride_dispatch::domain::types::{Driver, DriverId, Location, TripId};
use ride_dispatch::io::ws_gateway::AVAILABLE_DRIVERS_PATH;
use ride_dispatch::io::{RemoteDriverDirectory, TripClient};
use ride_dispatch::services::{AvailabilitySource, DriverDirectory, TripRequest};
use serde::Serialize;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "dispatchctl")]
#[command(about = "Ride dispatch control - drive the RPC services from the shell")]
struct Args {
    /// Driver service base URL
    #[arg(long, default_value = "http://127.0.0.1:50051")]
    driver_url: String,

    /// Trip service base URL
    #[arg(long, default_value = "http://127.0.0.1:50052")]
    trip_url: String,

    /// Gateway websocket base URL
    #[arg(long, default_value = "ws://127.0.0.1:8080")]
    gateway_url: String,

    /// Per-request timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a driver (starts available)
    Register {
        #[arg(long)]
        name: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },
    /// Show one driver
    Driver { id: String },
    /// List available drivers, nearest first when a position is given
    Available {
        #[arg(long, allow_hyphen_values = true, requires = "lon")]
        lat: Option<f64>,
        #[arg(long, allow_hyphen_values = true, requires = "lat")]
        lon: Option<f64>,
    },
    /// Set a driver's availability
    Status {
        id: String,
        #[arg(long, action = clap::ArgAction::Set)]
        available: bool,
    },
    /// Book a trip
    CreateTrip {
        #[arg(long)]
        rider: String,
        /// Pickup as `lat,lon`
        #[arg(long, value_parser = parse_location, allow_hyphen_values = true)]
        from: Location,
        /// Drop-off as `lat,lon`
        #[arg(long, value_parser = parse_location, allow_hyphen_values = true)]
        to: Location,
    },
    /// Complete a trip and free its driver
    CompleteTrip { id: String },
    /// Show one trip
    Trip { id: String },
    /// Stream available-driver snapshots from the gateway
    Watch,
}

fn parse_location(s: &str) -> Result<Location, String> {
    let (lat, lon) = s.split_once(',').ok_or_else(|| format!("expected lat,lon, got {s:?}"))?;
    let lat = lat.trim().parse::<f64>().map_err(|e| format!("bad latitude: {e}"))?;
    let lon = lon.trim().parse::<f64>().map_err(|e| format!("bad longitude: {e}"))?;
    Ok(Location::new(lat, lon))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let timeout = Duration::from_millis(args.timeout_ms);

    match args.command {
        Command::Register { name, lat, lon } => {
            let drivers = RemoteDriverDirectory::new(&args.driver_url, timeout)?;
            print_json(&drivers.register(&name, Location::new(lat, lon)).await?)
        }
        Command::Driver { id } => {
            let drivers = RemoteDriverDirectory::new(&args.driver_url, timeout)?;
            print_json(&drivers.get(&DriverId::from(id.as_str())).await?)
        }
        Command::Available { lat, lon } => {
            let drivers = RemoteDriverDirectory::new(&args.driver_url, timeout)?;
            let list = match (lat, lon) {
                (Some(lat), Some(lon)) => drivers.find_available(Location::new(lat, lon)).await?,
                _ => drivers.list_available().await?,
            };
            print_json(&list)
        }
        Command::Status { id, available } => {
            let drivers = RemoteDriverDirectory::new(&args.driver_url, timeout)?;
            let id = DriverId::from(id.as_str());
            drivers.update_status(&id, available).await?;
            print_json(&drivers.get(&id).await?)
        }
        Command::CreateTrip { rider, from, to } => {
            let trips = TripClient::new(&args.trip_url, timeout)?;
            print_json(&trips.create_trip(&TripRequest::new(&rider, from, to)).await?)
        }
        Command::CompleteTrip { id } => {
            let trips = TripClient::new(&args.trip_url, timeout)?;
            print_json(&trips.complete_trip(&TripId::from(id.as_str())).await?)
        }
        Command::Trip { id } => {
            let trips = TripClient::new(&args.trip_url, timeout)?;
            print_json(&trips.get_trip(&TripId::from(id.as_str())).await?)
        }
        Command::Watch => watch(&args.gateway_url).await,
    }
}

async fn watch(gateway_url: &str) -> anyhow::Result<()> {
    let url = format!("{}{}", gateway_url.trim_end_matches('/'), AVAILABLE_DRIVERS_PATH);
    let (mut ws, _) = connect_async(url.as_str()).await?;
    eprintln!("connected to {url}");

    while let Some(frame) = ws.next().await {
        match frame? {
            Message::Text(text) => {
                let drivers: Vec<Driver> = serde_json::from_str(&text)?;
                let ids: Vec<String> = drivers.iter().map(|d| d.id.to_string()).collect();
                println!("{} available: {}", drivers.len(), ids.join(", "));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
