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
use std::time::Duration;

use gridguard_common::time::elapsed_at_least;
use gridguard_common::{
    AllowBatteryPower, BalancingMethod, DynamicConfig, Timestamp, ALL_CONSUMER_GROUPS,
};
use tracing::{debug, info, warn};

use crate::balancing::{self, BalancingInputs};
use crate::device::CurrentControl;
use crate::grid::GridMonitor;

/// Result of one rebalance: the committed current and the resulting change in watts.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RebalanceOutcome {
    pub new_current: f64,
    pub net_power_change: f64,
}

impl RebalanceOutcome {
    pub const UNCHANGED: RebalanceOutcome = RebalanceOutcome {
        new_current: 0.0,
        net_power_change: 0.0,
    };

    pub fn is_unchanged(&self) -> bool {
        *self == Self::UNCHANGED
    }
}

/// Continuous current modulation attached to an energy consumer.
#[derive(Debug)]
pub struct DynamicLoad {
    balancing_method: BalancingMethod,
    minimum_current: f64,
    maximum_current: f64,
    minimum_rebalancing_interval: Duration,
    balance_on_behalf_of: Option<String>,
    allow_battery_power: AllowBatteryPower,
    voltage: f64,
    charger: Arc<dyn CurrentControl>,
    vehicle: Option<Arc<dyn CurrentControl>>,
    last_current_change: Option<Timestamp>,
}

impl DynamicLoad {
    pub fn new(
        config: &DynamicConfig,
        charger: Arc<dyn CurrentControl>,
        vehicle: Option<Arc<dyn CurrentControl>>,
    ) -> Self {
        Self {
            balancing_method: config.balancing_method,
            minimum_current: config.minimum_current,
            maximum_current: config.maximum_current,
            minimum_rebalancing_interval: config.minimum_rebalancing_interval,
            balance_on_behalf_of: config.balance_on_behalf_of.clone(),
            allow_battery_power: config.allow_battery_power,
            voltage: config.voltage,
            charger,
            vehicle,
            last_current_change: None,
        }
    }

    pub fn balancing_method(&self) -> BalancingMethod {
        self.balancing_method
    }

    pub fn set_balancing_method(&mut self, method: BalancingMethod) {
        self.balancing_method = method;
    }

    pub fn balance_on_behalf_of(&self) -> Option<&str> {
        self.balance_on_behalf_of.as_deref()
    }

    pub fn set_balance_on_behalf_of(&mut self, group: Option<String>) {
        self.balance_on_behalf_of = group;
    }

    pub fn allow_battery_power(&self) -> AllowBatteryPower {
        self.allow_battery_power
    }

    pub fn set_allow_battery_power(&mut self, allow: AllowBatteryPower) {
        self.allow_battery_power = allow;
    }

    pub fn voltage(&self) -> f64 {
        self.voltage
    }

    pub fn last_current_change(&self) -> Option<Timestamp> {
        self.last_current_change
    }

    /// Whether this consumer's slack counts for a consumer in `groups`.
    pub fn balances_for(&self, groups: &[String]) -> bool {
        match self.balance_on_behalf_of.as_deref() {
            Some(ALL_CONSUMER_GROUPS) => true,
            Some(group) => groups.iter().any(|g| g == group),
            None => false,
        }
    }

    /// Method actually applied. A critical need or `MaxPower` always balances near the peak.
    pub fn effective_method(&self, critical: bool) -> BalancingMethod {
        if critical || self.allow_battery_power == AllowBatteryPower::MaxPower {
            BalancingMethod::NearPeak
        } else {
            self.balancing_method
        }
    }

    /// A current change is still settling.
    pub fn is_rebalancing(&self, now: Timestamp) -> bool {
        self.last_current_change
            .is_some_and(|at| !elapsed_at_least(at, now, self.minimum_rebalancing_interval))
    }

    /// Bounds of the effective throttle. A current-controlled vehicle brings its own.
    pub fn current_bounds(&self) -> (f64, f64) {
        match &self.vehicle {
            Some(vehicle) => (vehicle.minimum_current(), vehicle.maximum_current()),
            None => (self.minimum_current, self.maximum_current),
        }
    }

    /// Power this consumer could shed without stopping. Callers clamp at zero.
    pub fn releasable_power(&self, current_load: f64) -> f64 {
        let (minimum, _) = self.current_bounds();
        current_load - minimum * self.voltage
    }

    /// Steer the current towards the active balancing method's set point.
    ///
    /// `total_net_change` is the power already added or removed by earlier
    /// rebalances in the same cycle.
    pub fn rebalance(
        &mut self,
        consumer: &str,
        grid: &GridMonitor,
        total_net_change: f64,
        critical: bool,
        now: Timestamp,
    ) -> RebalanceOutcome {
        if self.is_rebalancing(now) {
            return RebalanceOutcome::UNCHANGED;
        }

        let throttle = Arc::clone(self.vehicle.as_ref().unwrap_or(&self.charger));
        let Some(present) = throttle.present_current() else {
            debug!(consumer, "present current unknown, rebalance skipped");
            return RebalanceOutcome::UNCHANGED;
        };

        let window = self.minimum_rebalancing_interval;
        let (usage, average_usage) = match self.allow_battery_power {
            AllowBatteryPower::No => (
                grid.current_load_minus_batteries(),
                grid.average_load_minus_batteries_since(window, now),
            ),
            AllowBatteryPower::Yes | AllowBatteryPower::MaxPower => {
                (grid.current_load(), grid.average_load_since(window, now))
            }
        };
        let inputs = BalancingInputs {
            usage: usage + total_net_change,
            average_usage: average_usage + total_net_change,
            voltage: self.voltage,
            peak_load: grid.peak_load(),
            average_demand: grid.current_average_demand(),
            remaining_interval_minutes: grid.remaining_minutes_in_demand_interval(now),
            interval_minutes: f64::from(grid.demand_interval_minutes()),
        };
        let method = self.effective_method(critical);
        let adjustment = balancing::adjustment(method, &inputs);

        let (minimum, maximum) = self.current_bounds();
        let new_current = clamp_current(present - adjustment, minimum, maximum);
        if (new_current - present).abs() < f64::EPSILON {
            return RebalanceOutcome::UNCHANGED;
        }

        if let Err(err) = throttle.set_current(new_current) {
            warn!(consumer, error = %err, amps = new_current, "current change failed");
            return RebalanceOutcome::UNCHANGED;
        }
        if self.vehicle.is_some() && self.charger.present_current() != Some(self.maximum_current) {
            if let Err(err) = self.charger.set_current(self.maximum_current) {
                warn!(consumer, error = %err, "charger could not be opened to its maximum");
            }
        }

        self.last_current_change = Some(now);
        let net_power_change = (new_current - present) * self.voltage;
        info!(
            consumer,
            method = ?method,
            from_a = present,
            to_a = new_current,
            net_w = net_power_change,
            "current rebalanced"
        );
        RebalanceOutcome {
            new_current,
            net_power_change,
        }
    }
}

fn clamp_current(value: f64, minimum: f64, maximum: f64) -> f64 {
    value.min(maximum).max(minimum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceError;
    use crate::grid::GridReading;
    use chrono::{Local, TimeDelta, TimeZone};
    use gridguard_common::GridConfig;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct FakeCurrent {
        amps: Mutex<Option<f64>>,
        bounds: (f64, f64),
    }

    impl FakeCurrent {
        fn new(amps: f64, bounds: (f64, f64)) -> Arc<Self> {
            Arc::new(Self {
                amps: Mutex::new(Some(amps)),
                bounds,
            })
        }

        fn amps(&self) -> Option<f64> {
            *self.amps.lock()
        }
    }

    impl CurrentControl for FakeCurrent {
        fn present_current(&self) -> Option<f64> {
            *self.amps.lock()
        }

        fn set_current(&self, amps: f64) -> Result<(), DeviceError> {
            *self.amps.lock() = Some(amps);
            Ok(())
        }

        fn minimum_current(&self) -> f64 {
            self.bounds.0
        }

        fn maximum_current(&self) -> f64 {
            self.bounds.1
        }
    }

    fn noon() -> Timestamp {
        Local
            .with_ymd_and_hms(2024, 6, 3, 12, 0, 0)
            .single()
            .expect("unambiguous local time")
    }

    fn grid_with(reading: GridReading) -> GridMonitor {
        let mut grid = GridMonitor::new(&GridConfig::default());
        grid.apply(&reading, noon());
        grid
    }

    #[test]
    fn second_rebalance_within_interval_is_a_no_op() {
        let charger = FakeCurrent::new(10.0, (6.0, 16.0));
        let mut load = DynamicLoad::new(&DynamicConfig::default(), charger.clone(), None);
        let grid = grid_with(GridReading::net(0.0, 500.0));

        let first = load.rebalance("car", &grid, 0.0, false, noon());
        assert_eq!(first.new_current, 12.0);
        assert_eq!(first.net_power_change, 460.0);
        assert_eq!(charger.amps(), Some(12.0));

        let second = load.rebalance("car", &grid, 0.0, false, noon() + TimeDelta::seconds(10));
        assert!(second.is_unchanged());
        assert!(load.is_rebalancing(noon() + TimeDelta::seconds(29)));
        assert!(!load.is_rebalancing(noon() + TimeDelta::seconds(30)));
    }

    #[test]
    fn vehicle_becomes_the_throttle() {
        let charger = FakeCurrent::new(10.0, (6.0, 16.0));
        let vehicle = FakeCurrent::new(8.0, (5.0, 13.0));
        let mut load = DynamicLoad::new(
            &DynamicConfig::default(),
            charger.clone(),
            Some(vehicle.clone() as Arc<dyn CurrentControl>),
        );
        let grid = grid_with(GridReading::net(1000.0, 0.0));

        let outcome = load.rebalance("car", &grid, 0.0, false, noon());
        assert_eq!(outcome.new_current, 5.0);
        assert_eq!(outcome.net_power_change, -690.0);
        assert_eq!(vehicle.amps(), Some(5.0));
        assert_eq!(charger.amps(), Some(16.0));
        assert_eq!(load.releasable_power(2300.0), 2300.0 - 5.0 * 230.0);
    }

    #[test]
    fn critical_need_balances_near_peak() {
        let reading = GridReading::net(2400.0, 0.0);
        let charger = FakeCurrent::new(10.0, (6.0, 16.0));
        let mut load = DynamicLoad::new(&DynamicConfig::default(), charger.clone(), None);
        assert!(load.rebalance("car", &grid_with(reading), 0.0, true, noon()).is_unchanged());

        let outcome = load.rebalance("car", &grid_with(reading), 0.0, false, noon());
        assert_eq!(outcome.new_current, 6.0);
    }

    #[test]
    fn battery_disallowed_reads_load_without_discharge() {
        let reading = GridReading {
            import_power: Some(0.0),
            export_power: Some(0.0),
            battery_charge_power: Some(0.0),
            battery_discharge_power: Some(1000.0),
            ..GridReading::default()
        };

        let charger = FakeCurrent::new(10.0, (6.0, 16.0));
        let mut with_battery = DynamicLoad::new(&DynamicConfig::default(), charger, None);
        assert!(with_battery
            .rebalance("car", &grid_with(reading), 0.0, false, noon())
            .is_unchanged());

        let config = DynamicConfig {
            allow_battery_power: AllowBatteryPower::No,
            ..DynamicConfig::default()
        };
        let charger = FakeCurrent::new(10.0, (6.0, 16.0));
        let mut without_battery = DynamicLoad::new(&config, charger, None);
        let outcome = without_battery.rebalance("car", &grid_with(reading), 0.0, false, noon());
        assert_eq!(outcome.new_current, 6.0);
        assert_eq!(outcome.net_power_change, -920.0);
    }

    #[test]
    fn earlier_changes_in_the_cycle_count() {
        let charger = FakeCurrent::new(10.0, (6.0, 16.0));
        let mut load = DynamicLoad::new(&DynamicConfig::default(), charger, None);
        let grid = grid_with(GridReading::net(0.0, 500.0));
        // another consumer already took the surplus
        assert!(load.rebalance("car", &grid, 500.0, false, noon()).is_unchanged());
    }

    #[test]
    fn balance_group_matching() {
        let charger = FakeCurrent::new(10.0, (6.0, 16.0));
        let mut load = DynamicLoad::new(&DynamicConfig::default(), charger, None);
        let groups = vec!["heating".to_string()];
        assert!(!load.balances_for(&groups));
        load.set_balance_on_behalf_of(Some("heating".into()));
        assert!(load.balances_for(&groups));
        load.set_balance_on_behalf_of(Some(ALL_CONSUMER_GROUPS.into()));
        assert!(load.balances_for(&[]));
    }
}
