//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Consumer scheduling and load-balancing control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use gridguard_common::{AllowBatteryPower, BalancingMethod, Timestamp};
use gridguard_persistence::StateStore;
use serde::{Deserialize, Serialize};

use crate::consumer::ConsumerState;
use crate::error::Result;

/// Consumer fields carried across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerSnapshot {
    pub state: ConsumerState,
    pub started_at: Option<Timestamp>,
    pub last_run: Option<Timestamp>,
    #[serde(default)]
    pub balancing_method: Option<BalancingMethod>,
    #[serde(default)]
    pub balance_on_behalf_of: Option<String>,
    #[serde(default)]
    pub allow_battery_power: Option<AllowBatteryPower>,
}

impl ConsumerSnapshot {
    pub fn key(consumer: &str) -> String {
        format!("consumer.{consumer}")
    }

    pub fn save(&self, store: &dyn StateStore, consumer: &str) -> Result<()> {
        let blob = serde_json::to_value(self)?;
        store.save_state(&Self::key(consumer), &blob)?;
        Ok(())
    }

    pub fn load(store: &dyn StateStore, consumer: &str) -> Result<Option<Self>> {
        match store.load_state(&Self::key(consumer))? {
            Some(blob) => Ok(Some(serde_json::from_value(blob)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::tests::{noon, FakeDevice};
    use crate::consumer::EnergyConsumer;
    use crate::device::DeviceBinding;
    use chrono::TimeDelta;
    use gridguard_common::ConsumerConfig;
    use gridguard_persistence::MemoryStateStore;
    use std::collections::HashMap;
    use std::time::Duration;

    fn boiler(device: std::sync::Arc<FakeDevice>) -> EnergyConsumer {
        let mut config = ConsumerConfig::fixed(-1000.0, 200.0, 2000.0);
        config.maximum_runtime = Some(Duration::from_secs(3600));
        EnergyConsumer::from_config("boiler", &config, &DeviceBinding::switch(device), &HashMap::new())
            .expect("valid consumer")
    }

    #[test]
    fn restored_consumer_matches_saved_one() {
        let store = MemoryStateStore::new();
        let device = FakeDevice::new(ConsumerState::NeedsEnergy);
        let mut original = boiler(device.clone());
        *device.running.lock() = true;
        original.refresh(noon());
        original.snapshot().save(&store, "boiler").unwrap();

        let mut restored = boiler(FakeDevice::new(ConsumerState::NeedsEnergy));
        let snapshot = ConsumerSnapshot::load(&store, "boiler").unwrap().unwrap();
        restored.restore(&snapshot, noon() + TimeDelta::minutes(5));

        let a = original.snapshot();
        let b = restored.snapshot();
        assert_eq!((a.state, a.started_at, a.last_run), (b.state, b.started_at, b.last_run));
        assert_eq!(restored.stop_deadline(), Some(noon() + TimeDelta::hours(1)));
    }

    #[test]
    fn restart_after_runtime_stops_immediately() {
        let store = MemoryStateStore::new();
        ConsumerSnapshot {
            state: ConsumerState::Running,
            started_at: Some(noon()),
            last_run: None,
            balancing_method: None,
            balance_on_behalf_of: None,
            allow_battery_power: None,
        }
        .save(&store, "boiler")
        .unwrap();

        let device = FakeDevice::new(ConsumerState::NeedsEnergy);
        *device.running.lock() = true;
        let mut consumer = boiler(device.clone());
        let later = noon() + TimeDelta::hours(2);
        let snapshot = ConsumerSnapshot::load(&store, "boiler").unwrap().unwrap();
        consumer.restore(&snapshot, later);

        assert!(consumer.stop_if_past_runtime(later));
        assert!(!*device.running.lock());
    }

    #[test]
    fn missing_snapshot_is_none() {
        let store = MemoryStateStore::new();
        assert!(ConsumerSnapshot::load(&store, "nobody").unwrap().is_none());
    }
}
