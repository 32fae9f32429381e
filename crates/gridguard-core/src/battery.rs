//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Consumer scheduling and load-balancing control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use gridguard_common::{AllowBatteryPower, BatteryConfig};
use tracing::{info, warn};

use crate::consumer::EnergyConsumer;
use crate::device::BatteryControl;

/// Site battery and the flags the coordinator drives.
#[derive(Debug)]
pub struct Battery {
    pub capacity_wh: f64,
    pub max_charge_power: f64,
    pub max_discharge_power: f64,
    control: Arc<dyn BatteryControl>,
    charge_enabled: bool,
    discharge_enabled: bool,
}

impl Battery {
    pub fn new(config: &BatteryConfig, control: Arc<dyn BatteryControl>) -> Self {
        Self {
            capacity_wh: config.capacity_wh,
            max_charge_power: config.max_charge_power,
            max_discharge_power: config.max_discharge_power,
            control,
            charge_enabled: true,
            discharge_enabled: true,
        }
    }

    pub fn charge_enabled(&self) -> bool {
        self.charge_enabled
    }

    pub fn discharge_enabled(&self) -> bool {
        self.discharge_enabled
    }

    fn set_discharge_enabled(&mut self, enabled: bool) -> bool {
        match self.control.set_discharge_enabled(enabled) {
            Ok(()) => {
                self.discharge_enabled = enabled;
                true
            }
            Err(err) => {
                warn!(error = %err, enabled, "battery discharge command failed");
                false
            }
        }
    }
}

/// Grants or revokes battery discharge for the whole site.
#[derive(Debug, Default)]
pub struct BatteryCoordinator {
    battery: Option<Battery>,
}

impl BatteryCoordinator {
    pub fn new(battery: Option<Battery>) -> Self {
        Self { battery }
    }

    pub fn battery(&self) -> Option<&Battery> {
        self.battery.as_ref()
    }

    /// Discharge is permitted unless a running dynamic consumer refuses battery power.
    pub fn discharge_permitted(consumers: &[EnergyConsumer]) -> bool {
        !consumers.iter().any(|consumer| {
            consumer.is_running()
                && consumer
                    .dynamic()
                    .is_some_and(|dynamic| dynamic.allow_battery_power() == AllowBatteryPower::No)
        })
    }

    /// Apply the permission. Returns the new flag when a command was sent.
    pub fn update(&mut self, consumers: &[EnergyConsumer]) -> Option<bool> {
        let battery = self.battery.as_mut()?;
        let permitted = Self::discharge_permitted(consumers);
        if permitted == battery.discharge_enabled() {
            return None;
        }
        if battery.set_discharge_enabled(permitted) {
            info!(discharge = permitted, "battery discharge permission changed");
            Some(permitted)
        } else {
            None
        }
    }
}
