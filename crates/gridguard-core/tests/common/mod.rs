//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Consumer scheduling and load-balancing control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, TimeZone};
use gridguard_common::{AppConfig, ConsumerConfig, ConsumerKind, DynamicConfig, Timestamp};
use gridguard_core::{
    BatteryControl, ConsumerDevice, ConsumerState, CurrentControl, DeviceBinding, DeviceError,
    SiteBindings,
};
use parking_lot::Mutex;

pub fn noon() -> Timestamp {
    Local
        .with_ymd_and_hms(2024, 6, 3, 12, 0, 0)
        .single()
        .expect("unambiguous local time")
}

pub fn secs(seconds: i64) -> chrono::TimeDelta {
    chrono::TimeDelta::seconds(seconds)
}

/// On/off load drawing its rated power while switched on.
#[derive(Debug)]
pub struct FakeSwitch {
    pub rated_load: f64,
    pub running: Mutex<bool>,
    pub desired: Mutex<ConsumerState>,
    pub fail_commands: Mutex<bool>,
    /// Accept stop commands without acting on them.
    pub ignore_stop: Mutex<bool>,
    pub stop_calls: Mutex<usize>,
}

impl FakeSwitch {
    pub fn new(rated_load: f64, desired: ConsumerState) -> Arc<Self> {
        Arc::new(Self {
            rated_load,
            running: Mutex::new(false),
            desired: Mutex::new(desired),
            fail_commands: Mutex::new(false),
            ignore_stop: Mutex::new(false),
            stop_calls: Mutex::new(0),
        })
    }

    pub fn running(rated_load: f64) -> Arc<Self> {
        let switch = Self::new(rated_load, ConsumerState::NeedsEnergy);
        *switch.running.lock() = true;
        switch
    }

    pub fn is_on(&self) -> bool {
        *self.running.lock()
    }

    pub fn want(&self, state: ConsumerState) {
        *self.desired.lock() = state;
    }

    fn command(&self, on: bool) -> Result<(), DeviceError> {
        if *self.fail_commands.lock() {
            return Err(DeviceError::Unavailable("fake switch".into()));
        }
        *self.running.lock() = on;
        Ok(())
    }
}

impl ConsumerDevice for FakeSwitch {
    fn current_load(&self) -> Option<f64> {
        Some(if self.is_on() { self.rated_load } else { 0.0 })
    }

    fn is_running(&self) -> bool {
        self.is_on()
    }

    fn desired_state(&self, _now: Timestamp) -> ConsumerState {
        *self.desired.lock()
    }

    fn turn_on(&self) -> Result<(), DeviceError> {
        self.command(true)
    }

    fn turn_off(&self) -> Result<(), DeviceError> {
        *self.stop_calls.lock() += 1;
        if *self.ignore_stop.lock() {
            return Ok(());
        }
        self.command(false)
    }
}

/// Charger whose draw is its current times the voltage.
#[derive(Debug)]
pub struct FakeCharger {
    pub running: Mutex<bool>,
    pub amps: Mutex<f64>,
    pub voltage: f64,
}

impl FakeCharger {
    pub fn running_at(amps: f64) -> Arc<Self> {
        Arc::new(Self {
            running: Mutex::new(true),
            amps: Mutex::new(amps),
            voltage: 230.0,
        })
    }

    pub fn amps(&self) -> f64 {
        *self.amps.lock()
    }
}

impl ConsumerDevice for FakeCharger {
    fn current_load(&self) -> Option<f64> {
        Some(if *self.running.lock() {
            self.amps() * self.voltage
        } else {
            0.0
        })
    }

    fn is_running(&self) -> bool {
        *self.running.lock()
    }

    fn desired_state(&self, _now: Timestamp) -> ConsumerState {
        ConsumerState::NeedsEnergy
    }

    fn turn_on(&self) -> Result<(), DeviceError> {
        *self.running.lock() = true;
        Ok(())
    }

    fn turn_off(&self) -> Result<(), DeviceError> {
        *self.running.lock() = false;
        Ok(())
    }
}

impl CurrentControl for FakeCharger {
    fn present_current(&self) -> Option<f64> {
        Some(self.amps())
    }

    fn set_current(&self, amps: f64) -> Result<(), DeviceError> {
        *self.amps.lock() = amps;
        Ok(())
    }

    fn minimum_current(&self) -> f64 {
        6.0
    }

    fn maximum_current(&self) -> f64 {
        16.0
    }
}

#[derive(Debug, Default)]
pub struct FakeBattery {
    pub discharge_enabled: Mutex<Option<bool>>,
}

impl BatteryControl for FakeBattery {
    fn set_charge_enabled(&self, _enabled: bool) -> Result<(), DeviceError> {
        Ok(())
    }

    fn set_discharge_enabled(&self, enabled: bool) -> Result<(), DeviceError> {
        *self.discharge_enabled.lock() = Some(enabled);
        Ok(())
    }
}

/// Config without cooldown unless a test wants one.
pub fn config(consumers: Vec<(&str, ConsumerConfig)>) -> AppConfig {
    let mut config = AppConfig::default();
    config.scheduler.minimum_change_interval = Duration::ZERO;
    for (name, consumer) in consumers {
        config.consumers.insert(name.to_string(), consumer);
    }
    config
}

pub fn dynamic_config(dynamic: DynamicConfig) -> ConsumerConfig {
    let mut consumer = ConsumerConfig::fixed(-1400.0, 200.0, 3680.0);
    consumer.kind = ConsumerKind::Dynamic;
    consumer.dynamic = Some(dynamic);
    consumer
}

pub fn switch_binding(switch: &Arc<FakeSwitch>) -> DeviceBinding {
    DeviceBinding::switch(switch.clone())
}

pub fn charger_binding(charger: &Arc<FakeCharger>) -> DeviceBinding {
    DeviceBinding::dynamic(charger.clone(), charger.clone())
}

pub fn bindings(entries: Vec<(&str, DeviceBinding)>) -> SiteBindings {
    entries
        .into_iter()
        .fold(SiteBindings::new(), |site, (name, binding)| site.bind(name, binding))
}
