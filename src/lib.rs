//! Ride dispatch library
//!
//! Driver registry, trip booking saga, event bridge and real-time hub.
//! Exposes modules for integration testing and binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
