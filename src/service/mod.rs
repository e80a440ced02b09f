//! Domain services: the stateful actuator/sensor logic behind `SET`/`GET`.
//!
//! A service is shared between both cores. Core B drives it through
//! [`DomainService::ready`] and [`DomainService::poll`]; core A calls
//! [`DomainService::is_ready`] and [`DomainService::handle_command`] from the
//! dispatcher. Implementations guard their own state.

mod thermostat;

use std::time::Instant;

use serde_json::Value;

pub use thermostat::{
    FixedSensor, Reading, Sensor, Thermostat, ThermostatSettings, ThermostatState, MAX_TARGET, MIN_TARGET,
};

use crate::error::Result;
use crate::protocol::Command;

/// A domain service the dispatcher forwards commands into.
pub trait DomainService: Send + Sync + 'static {
    /// Discriminator reported in `INFO` (1 = thermostat, 2 = desk).
    fn service_type(&self) -> u8;

    /// Whether commands are accepted at all.
    fn is_ready(&self) -> bool;

    /// Execute a domain command. Must not block for long.
    fn handle_command(&self, command: Command, body: &Value) -> Result<Value>;

    /// One-time start-up on core B.
    fn ready(&self) {}

    /// One control-loop step on core B.
    fn poll(&self, _now: Instant) {}
}
