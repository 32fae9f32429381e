//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulated household telemetry and device adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{anyhow, Result};
use gridguard_common::{AppConfig, ConsumerKind, Timestamp};
use gridguard_core::{DeviceBinding, GridReading, SiteBindings};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::info;

use crate::devices::{SimulatedBattery, SimulatedCharger, SimulatedCondition, SimulatedSocket};
use crate::household::HouseholdSimulator;

/// Every simulated device of a configured site plus the household around them.
#[derive(Debug)]
pub struct SimulatedSite {
    sockets: IndexMap<String, Arc<SimulatedSocket>>,
    chargers: IndexMap<String, Arc<SimulatedCharger>>,
    conditions: IndexMap<String, Arc<SimulatedCondition>>,
    battery: Option<Arc<SimulatedBattery>>,
    household: Mutex<HouseholdSimulator>,
}

impl SimulatedSite {
    /// Create one simulated device per configured consumer and the bindings that expose them.
    ///
    /// Fixed consumers get a socket drawing their peak load; dynamic consumers
    /// get a charger with the configured current bounds. Every condition named
    /// by a time window starts active.
    pub fn build(config: &AppConfig) -> Result<(Self, SiteBindings)> {
        let mut bindings = SiteBindings::new();
        let mut sockets = IndexMap::new();
        let mut chargers = IndexMap::new();
        let mut conditions = IndexMap::new();

        for (name, consumer) in &config.consumers {
            match consumer.kind {
                ConsumerKind::Fixed => {
                    let socket = Arc::new(SimulatedSocket::new(name.clone(), consumer.peak_load));
                    bindings = bindings.bind(name.clone(), DeviceBinding::switch(socket.clone()));
                    sockets.insert(name.clone(), socket);
                }
                ConsumerKind::Dynamic => {
                    let dynamic = consumer
                        .dynamic
                        .as_ref()
                        .ok_or_else(|| anyhow!("consumer '{name}' is dynamic but has no dynamic section"))?;
                    let charger = Arc::new(SimulatedCharger::new(name.clone(), dynamic));
                    bindings = bindings.bind(
                        name.clone(),
                        DeviceBinding::dynamic(charger.clone(), charger.clone()),
                    );
                    chargers.insert(name.clone(), charger);
                }
            }
            for condition in consumer.time_windows.iter().filter_map(|window| window.condition.as_ref()) {
                if !conditions.contains_key(condition) {
                    let simulated = Arc::new(SimulatedCondition::new(true));
                    bindings = bindings.condition(condition.clone(), simulated.clone());
                    conditions.insert(condition.clone(), simulated);
                }
            }
        }

        let battery = config.battery.as_ref().map(|battery| Arc::new(SimulatedBattery::new(battery)));
        if let Some(battery) = &battery {
            bindings = bindings.battery(battery.clone());
        }

        let household = HouseholdSimulator::new(&config.simulation, config.grid.demand_interval_minutes)?;
        info!(
            sockets = sockets.len(),
            chargers = chargers.len(),
            conditions = conditions.len(),
            battery = battery.is_some(),
            "simulated site built"
        );
        Ok((
            Self {
                sockets,
                chargers,
                conditions,
                battery,
                household: Mutex::new(household),
            },
            bindings,
        ))
    }

    pub fn socket(&self, name: &str) -> Option<&Arc<SimulatedSocket>> {
        self.sockets.get(name)
    }

    pub fn charger(&self, name: &str) -> Option<&Arc<SimulatedCharger>> {
        self.chargers.get(name)
    }

    pub fn condition(&self, name: &str) -> Option<&Arc<SimulatedCondition>> {
        self.conditions.get(name)
    }

    pub fn battery(&self) -> Option<&Arc<SimulatedBattery>> {
        self.battery.as_ref()
    }

    /// Combined draw of every simulated consumer.
    pub fn consumer_load(&self) -> f64 {
        let sockets: f64 = self.sockets.values().map(|socket| socket.draw()).sum();
        let chargers: f64 = self.chargers.values().map(|charger| charger.draw()).sum();
        sockets + chargers
    }

    /// Next grid reading, including whatever the scheduler switched on.
    pub fn sample(&self, now: Timestamp) -> GridReading {
        let consumer_load = self.consumer_load();
        self.household
            .lock()
            .sample(now, consumer_load, self.battery.as_deref())
    }
}
