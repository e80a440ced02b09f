//! Reference thermostat service.
//!
//! Holds a target temperature (clamped to 10..=38), a unit flag and a winter
//! flag. In winter mode it heats while the reading is below target and stops
//! once the reading reaches target + 1 °C. Settings survive reboots through
//! the durable store; every visible change is published to all clients.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::DomainService;
use crate::broadcast::BroadcastSlot;
use crate::error::{HomewireError, Result};
use crate::protocol::Command;
use crate::store::{DurableRecord, DurableStore};

pub const SERVICE_TYPE: u8 = 1;
pub const MIN_TARGET: f64 = 10.0;
pub const MAX_TARGET: f64 = 38.0;
const HYSTERESIS: f64 = 1.0;

/// How often the sensor is sampled.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(300);

/// How often the heating decision is re-evaluated.
const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Persisted settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermostatSettings {
    pub target_temperature: f64,
    pub celsius: bool,
    pub winter: bool,
}

impl Default for ThermostatSettings {
    fn default() -> Self {
        Self {
            target_temperature: MIN_TARGET,
            celsius: true,
            winter: false,
        }
    }
}

/// Full state returned by `GET`/`SET` and published on change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThermostatState {
    pub target_temperature: f64,
    pub temperature: f64,
    pub celsius: bool,
    pub winter: bool,
    pub humidity: i32,
    pub heating: bool,
}

/// One sensor sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: i32,
}

/// Temperature/humidity source.
pub trait Sensor: Send + Sync {
    fn sample(&self) -> Option<Reading>;
}

/// Sensor returning a settable constant; the host stand-in for real hardware.
#[derive(Debug)]
pub struct FixedSensor(Mutex<Reading>);

impl FixedSensor {
    pub fn new(temperature: f64, humidity: i32) -> Self {
        Self(Mutex::new(Reading {
            temperature,
            humidity,
        }))
    }

    pub fn set(&self, reading: Reading) {
        *self.0.lock() = reading;
    }
}

impl Sensor for FixedSensor {
    fn sample(&self) -> Option<Reading> {
        Some(*self.0.lock())
    }
}

impl<S: Sensor + ?Sized> Sensor for Arc<S> {
    fn sample(&self) -> Option<Reading> {
        (**self).sample()
    }
}

#[derive(Debug)]
struct Inner {
    ready: bool,
    settings: ThermostatSettings,
    temperature: f64,
    humidity: i32,
    heating: bool,
    last_sample: Option<Instant>,
    last_check: Option<Instant>,
}

impl Inner {
    fn state(&self) -> ThermostatState {
        ThermostatState {
            target_temperature: self.settings.target_temperature,
            temperature: self.temperature,
            celsius: self.settings.celsius,
            winter: self.settings.winter,
            humidity: self.humidity,
            heating: self.heating,
        }
    }

    fn sample(&mut self, sensor: &dyn Sensor, now: Instant) {
        self.last_sample = Some(now);
        match sensor.sample() {
            Some(reading) => {
                self.temperature = reading.temperature;
                self.humidity = reading.humidity;
            }
            None => tracing::warn!("Thermostat sensor returned no reading"),
        }
    }

    /// Re-evaluate heating with hysteresis.
    fn evaluate(&mut self) -> bool {
        let target = self.settings.target_temperature;
        self.heating = if !self.settings.winter {
            false
        } else if !self.heating {
            self.temperature < target
        } else {
            self.temperature < target + HYSTERESIS
        };
        self.heating
    }
}

/// Thermostat service.
pub struct Thermostat {
    inner: Mutex<Inner>,
    sensor: Box<dyn Sensor>,
    store: Option<Arc<DurableStore>>,
    broadcast: Option<Arc<BroadcastSlot>>,
}

impl std::fmt::Debug for Thermostat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thermostat")
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl Thermostat {
    pub fn new(sensor: impl Sensor + 'static) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ready: false,
                settings: ThermostatSettings::default(),
                temperature: 0.0,
                humidity: 0,
                heating: false,
                last_sample: None,
                last_check: None,
            }),
            sensor: Box::new(sensor),
            store: None,
            broadcast: None,
        }
    }

    /// Persist settings through `store`, restoring any saved settings now.
    pub fn with_store(mut self, store: Arc<DurableStore>) -> Self {
        match store.read().to_value::<ThermostatSettings>() {
            Ok(Some(mut settings)) => {
                settings.target_temperature = clamp_target(settings.target_temperature);
                tracing::info!(?settings, "Restored thermostat settings");
                self.inner.get_mut().settings = settings;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Stored thermostat settings unreadable: {}", e),
        }
        self.store = Some(store);
        self
    }

    /// Publish state changes to `slot`.
    pub fn with_broadcast(mut self, slot: Arc<BroadcastSlot>) -> Self {
        self.broadcast = Some(slot);
        self
    }

    pub fn settings(&self) -> ThermostatSettings {
        self.inner.lock().settings.clone()
    }

    pub fn state(&self) -> ThermostatState {
        self.inner.lock().state()
    }

    fn apply(&self, body: &Value) -> Result<ThermostatState> {
        let fields = match body {
            Value::Object(fields) => fields.clone(),
            Value::Null => Map::new(),
            _ => return Err(HomewireError::Service("SET body must be an object".into())),
        };

        let mut inner = self.inner.lock();
        let mut settings = inner.settings.clone();

        if let Some(value) = fields.get("target_temperature") {
            let target = value
                .as_f64()
                .ok_or_else(|| HomewireError::Service("target_temperature must be a number".into()))?;
            settings.target_temperature = clamp_target(target);
        }
        if let Some(value) = fields.get("celsius") {
            settings.celsius = value
                .as_bool()
                .ok_or_else(|| HomewireError::Service("celsius must be a boolean".into()))?;
        }
        if let Some(value) = fields.get("winter") {
            settings.winter = value
                .as_bool()
                .ok_or_else(|| HomewireError::Service("winter must be a boolean".into()))?;
        }

        let changed = settings != inner.settings;
        inner.settings = settings.clone();
        inner.evaluate();
        let state = inner.state();
        drop(inner);

        if changed {
            if let Some(store) = &self.store {
                store.update(DurableRecord::from_value(&settings)?);
            }
            self.publish(&state);
        }
        Ok(state)
    }

    fn publish(&self, state: &ThermostatState) {
        let Some(slot) = &self.broadcast else {
            return;
        };
        match serde_json::to_value(state) {
            Ok(value) => {
                slot.publish(value);
            }
            Err(e) => tracing::warn!("Failed to encode thermostat state: {}", e),
        }
    }
}

impl DomainService for Thermostat {
    fn service_type(&self) -> u8 {
        SERVICE_TYPE
    }

    fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    fn handle_command(&self, command: Command, body: &Value) -> Result<Value> {
        let state = match command {
            Command::Query => self.state(),
            Command::Configure => self.apply(body)?,
            _ => return Ok(Value::Object(Map::new())),
        };
        Ok(serde_json::to_value(state)?)
    }

    fn ready(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.sample(self.sensor.as_ref(), now);
        inner.last_check = Some(now);
        inner.evaluate();
        inner.ready = true;
        tracing::info!("Thermostat ready");
    }

    fn poll(&self, now: Instant) {
        let mut inner = self.inner.lock();
        if !inner.ready {
            return;
        }

        let before = inner.state();

        if inner
            .last_sample
            .map_or(true, |t| now.saturating_duration_since(t) >= SAMPLE_INTERVAL)
        {
            inner.sample(self.sensor.as_ref(), now);
        }
        if inner
            .last_check
            .map_or(true, |t| now.saturating_duration_since(t) >= CHECK_INTERVAL)
        {
            inner.last_check = Some(now);
            inner.evaluate();
        }

        let after = inner.state();
        drop(inner);

        if after != before {
            self.publish(&after);
        }
    }
}

fn clamp_target(t: f64) -> f64 {
    if t.is_nan() {
        return MIN_TARGET;
    }
    t.clamp(MIN_TARGET, MAX_TARGET)
}
