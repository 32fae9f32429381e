//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulated household telemetry and device adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};

use gridguard_common::{BatteryConfig, DynamicConfig, Timestamp};
use gridguard_core::{
    BatteryControl, BinaryCondition, ConsumerDevice, ConsumerState, CurrentControl, DeviceError,
};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct SwitchState {
    on: bool,
    desired: ConsumerState,
}

/// Smart plug with a fixed appliance behind it.
#[derive(Debug)]
pub struct SimulatedSocket {
    name: String,
    rated_load: f64,
    state: Mutex<SwitchState>,
}

impl SimulatedSocket {
    pub fn new(name: impl Into<String>, rated_load: f64) -> Self {
        Self {
            name: name.into(),
            rated_load,
            state: Mutex::new(SwitchState {
                on: false,
                desired: ConsumerState::NeedsEnergy,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_desired(&self, desired: ConsumerState) {
        self.state.lock().desired = desired;
    }

    pub fn is_on(&self) -> bool {
        self.state.lock().on
    }

    /// Power drawn right now.
    pub fn draw(&self) -> f64 {
        if self.is_on() {
            self.rated_load
        } else {
            0.0
        }
    }

    fn switch(&self, on: bool) {
        self.state.lock().on = on;
        debug!(device = %self.name, on, "simulated socket switched");
    }
}

impl ConsumerDevice for SimulatedSocket {
    fn current_load(&self) -> Option<f64> {
        Some(self.draw())
    }

    fn is_running(&self) -> bool {
        self.is_on()
    }

    fn desired_state(&self, _now: Timestamp) -> ConsumerState {
        self.state.lock().desired
    }

    fn turn_on(&self) -> Result<(), DeviceError> {
        self.switch(true);
        Ok(())
    }

    fn turn_off(&self) -> Result<(), DeviceError> {
        self.switch(false);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct ChargerState {
    on: bool,
    amps: f64,
    desired: ConsumerState,
}

/// EV charger with a car that always accepts the offered current.
#[derive(Debug)]
pub struct SimulatedCharger {
    name: String,
    voltage: f64,
    minimum_current: f64,
    maximum_current: f64,
    state: Mutex<ChargerState>,
}

impl SimulatedCharger {
    pub fn new(name: impl Into<String>, config: &DynamicConfig) -> Self {
        Self {
            name: name.into(),
            voltage: config.voltage,
            minimum_current: config.minimum_current,
            maximum_current: config.maximum_current,
            state: Mutex::new(ChargerState {
                on: false,
                amps: config.minimum_current,
                desired: ConsumerState::NeedsEnergy,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_desired(&self, desired: ConsumerState) {
        self.state.lock().desired = desired;
    }

    pub fn is_on(&self) -> bool {
        self.state.lock().on
    }

    pub fn amps(&self) -> f64 {
        self.state.lock().amps
    }

    pub fn draw(&self) -> f64 {
        let state = *self.state.lock();
        if state.on {
            state.amps * self.voltage
        } else {
            0.0
        }
    }
}

impl ConsumerDevice for SimulatedCharger {
    fn current_load(&self) -> Option<f64> {
        Some(self.draw())
    }

    fn is_running(&self) -> bool {
        self.is_on()
    }

    fn desired_state(&self, _now: Timestamp) -> ConsumerState {
        self.state.lock().desired
    }

    fn turn_on(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.on = true;
        // sessions start at the minimum and are raised by balancing
        state.amps = self.minimum_current;
        debug!(device = %self.name, "simulated charger on");
        Ok(())
    }

    fn turn_off(&self) -> Result<(), DeviceError> {
        self.state.lock().on = false;
        debug!(device = %self.name, "simulated charger off");
        Ok(())
    }
}

impl CurrentControl for SimulatedCharger {
    fn present_current(&self) -> Option<f64> {
        let state = *self.state.lock();
        state.on.then_some(state.amps)
    }

    fn set_current(&self, amps: f64) -> Result<(), DeviceError> {
        if !(self.minimum_current..=self.maximum_current).contains(&amps) {
            return Err(DeviceError::CommandFailed {
                device: self.name.clone(),
                command: "set_current",
                reason: format!(
                    "{amps} A outside [{}, {}]",
                    self.minimum_current, self.maximum_current
                ),
            });
        }
        self.state.lock().amps = amps;
        Ok(())
    }

    fn minimum_current(&self) -> f64 {
        self.minimum_current
    }

    fn maximum_current(&self) -> f64 {
        self.maximum_current
    }
}

#[derive(Debug, Clone, Copy)]
struct BatteryState {
    stored_wh: f64,
    charge_enabled: bool,
    discharge_enabled: bool,
}

/// Battery flows for one simulation step, both non-negative.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatteryFlow {
    pub charge: f64,
    pub discharge: f64,
}

/// Home battery that covers import and soaks up export within its limits.
#[derive(Debug)]
pub struct SimulatedBattery {
    capacity_wh: f64,
    max_charge_power: f64,
    max_discharge_power: f64,
    state: Mutex<BatteryState>,
}

impl SimulatedBattery {
    pub fn new(config: &BatteryConfig) -> Self {
        Self {
            capacity_wh: config.capacity_wh,
            max_charge_power: config.max_charge_power,
            max_discharge_power: config.max_discharge_power,
            state: Mutex::new(BatteryState {
                stored_wh: config.capacity_wh / 2.0,
                charge_enabled: true,
                discharge_enabled: true,
            }),
        }
    }

    pub fn discharge_enabled(&self) -> bool {
        self.state.lock().discharge_enabled
    }

    pub fn charge_enabled(&self) -> bool {
        self.state.lock().charge_enabled
    }

    pub fn stored_wh(&self) -> f64 {
        self.state.lock().stored_wh
    }

    /// Settle `net` watts of household demand (negative is surplus) for `hours`.
    pub fn exchange(&self, net: f64, hours: f64) -> BatteryFlow {
        let mut state = self.state.lock();
        let mut flow = BatteryFlow::default();
        if hours <= 0.0 {
            return flow;
        }
        if net > 0.0 && state.discharge_enabled {
            let available = state.stored_wh / hours;
            flow.discharge = net.min(self.max_discharge_power).min(available);
            state.stored_wh -= flow.discharge * hours;
        } else if net < 0.0 && state.charge_enabled {
            let room = (self.capacity_wh - state.stored_wh) / hours;
            flow.charge = (-net).min(self.max_charge_power).min(room);
            state.stored_wh += flow.charge * hours;
        }
        flow
    }
}

impl BatteryControl for SimulatedBattery {
    fn set_charge_enabled(&self, enabled: bool) -> Result<(), DeviceError> {
        self.state.lock().charge_enabled = enabled;
        Ok(())
    }

    fn set_discharge_enabled(&self, enabled: bool) -> Result<(), DeviceError> {
        self.state.lock().discharge_enabled = enabled;
        debug!(enabled, "simulated battery discharge switched");
        Ok(())
    }
}

/// Binary condition toggled from outside, e.g. "car plugged in".
#[derive(Debug)]
pub struct SimulatedCondition(AtomicBool);

impl SimulatedCondition {
    pub fn new(active: bool) -> Self {
        Self(AtomicBool::new(active))
    }

    pub fn set(&self, active: bool) {
        self.0.store(active, Ordering::Relaxed);
    }
}

impl BinaryCondition for SimulatedCondition {
    fn is_active(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
