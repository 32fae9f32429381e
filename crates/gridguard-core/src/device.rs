//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Consumer scheduling and load-balancing control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Capabilities the scheduler expects from device adapters.
//!
//! Commands are fire-and-forget: a successful return only means the command
//! was handed to the device. The next telemetry read is the source of truth.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use gridguard_common::Timestamp;

use crate::consumer::ConsumerState;

/// Error reported by device adapters when a command cannot be delivered.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("command `{command}` failed on `{device}`: {reason}")]
    CommandFailed {
        device: String,
        command: &'static str,
        reason: String,
    },
    #[error("device `{0}` is unavailable")]
    Unavailable(String),
}

/// Switchable load.
pub trait ConsumerDevice: Send + Sync + Debug {
    /// Measured draw in watts. `None` keeps the last known value.
    fn current_load(&self) -> Option<f64>;
    fn is_running(&self) -> bool;
    /// Device-specific view on what the consumer wants right now.
    fn desired_state(&self, now: Timestamp) -> ConsumerState;
    fn turn_on(&self) -> Result<(), DeviceError>;
    fn turn_off(&self) -> Result<(), DeviceError>;
}

/// Continuous current modulation, e.g. an EV charger or the car behind it.
pub trait CurrentControl: Send + Sync + Debug {
    fn present_current(&self) -> Option<f64>;
    fn set_current(&self, amps: f64) -> Result<(), DeviceError>;
    fn minimum_current(&self) -> f64;
    fn maximum_current(&self) -> f64;
}

pub trait BatteryControl: Send + Sync + Debug {
    fn set_charge_enabled(&self, enabled: bool) -> Result<(), DeviceError>;
    fn set_discharge_enabled(&self, enabled: bool) -> Result<(), DeviceError>;
}

/// Named on/off signal gating a time window.
pub trait BinaryCondition: Send + Sync + Debug {
    fn is_active(&self) -> bool;
}

/// Adapters backing one configured consumer.
#[derive(Debug, Clone)]
pub struct DeviceBinding {
    pub device: Arc<dyn ConsumerDevice>,
    /// Required for dynamic consumers.
    pub charger: Option<Arc<dyn CurrentControl>>,
    /// Downstream device that also accepts current commands.
    pub vehicle: Option<Arc<dyn CurrentControl>>,
}

impl DeviceBinding {
    pub fn switch(device: Arc<dyn ConsumerDevice>) -> Self {
        Self {
            device,
            charger: None,
            vehicle: None,
        }
    }

    pub fn dynamic(device: Arc<dyn ConsumerDevice>, charger: Arc<dyn CurrentControl>) -> Self {
        Self {
            device,
            charger: Some(charger),
            vehicle: None,
        }
    }

    pub fn with_vehicle(mut self, vehicle: Arc<dyn CurrentControl>) -> Self {
        self.vehicle = Some(vehicle);
        self
    }
}

/// Everything the scheduler needs from the outside world, keyed by configured name.
#[derive(Debug, Clone, Default)]
pub struct SiteBindings {
    pub consumers: HashMap<String, DeviceBinding>,
    pub conditions: HashMap<String, Arc<dyn BinaryCondition>>,
    pub battery: Option<Arc<dyn BatteryControl>>,
}

impl SiteBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, name: impl Into<String>, binding: DeviceBinding) -> Self {
        self.consumers.insert(name.into(), binding);
        self
    }

    pub fn condition(mut self, name: impl Into<String>, condition: Arc<dyn BinaryCondition>) -> Self {
        self.conditions.insert(name.into(), condition);
        self
    }

    pub fn battery(mut self, control: Arc<dyn BatteryControl>) -> Self {
        self.battery = Some(control);
        self
    }
}
