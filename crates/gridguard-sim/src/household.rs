//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulated household telemetry and device adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::f64::consts::PI;

use anyhow::{Context, Result};
use chrono::{NaiveDate, TimeDelta, Timelike};
use gridguard_common::{SimulationConfig, Timestamp};
use gridguard_core::GridReading;
use rand::prelude::*;
use rand_distr::Normal;

use crate::devices::SimulatedBattery;

const SOLAR_NOON_HOUR: f64 = 13.0;
const SOLAR_SPREAD_HOURS: f64 = 2.5;
const SUNRISE_HOUR: f64 = 6.0;
const SUNSET_HOUR: f64 = 20.0;
/// Longest step credited to the battery, so a stalled loop does not drain it at once.
const MAX_STEP_HOURS: f64 = 1.0 / 60.0;

#[derive(Debug, Default)]
struct DemandInterval {
    key: Option<(NaiveDate, u32)>,
    sum: f64,
    count: u32,
}

impl DemandInterval {
    fn record(&mut self, key: (NaiveDate, u32), import: f64) -> f64 {
        if self.key != Some(key) {
            self.key = Some(key);
            self.sum = 0.0;
            self.count = 0;
        }
        self.sum += import;
        self.count += 1;
        self.sum / f64::from(self.count)
    }
}

/// Household base load plus solar production, with seeded gaussian noise.
#[derive(Debug)]
pub struct HouseholdSimulator {
    base_load: f64,
    solar_peak: f64,
    rng: StdRng,
    noise: Normal<f64>,
    demand_interval_minutes: u32,
    demand: DemandInterval,
    last_sample: Option<Timestamp>,
}

impl HouseholdSimulator {
    pub fn new(config: &SimulationConfig, demand_interval_minutes: u32) -> Result<Self> {
        let noise = Normal::new(0.0, config.noise_sigma)
            .with_context(|| format!("invalid noise sigma {}", config.noise_sigma))?;
        Ok(Self {
            base_load: config.base_load,
            solar_peak: config.solar_peak,
            rng: StdRng::seed_from_u64(config.seed),
            noise,
            demand_interval_minutes: demand_interval_minutes.max(1),
            demand: DemandInterval::default(),
            last_sample: None,
        })
    }

    /// Clear-sky production at `at`: a bell curve around early afternoon.
    pub fn solar_production(&self, at: Timestamp) -> f64 {
        let hour = f64::from(at.hour()) + f64::from(at.minute()) / 60.0;
        if !(SUNRISE_HOUR..=SUNSET_HOUR).contains(&hour) {
            return 0.0;
        }
        let offset = (hour - SOLAR_NOON_HOUR) / SOLAR_SPREAD_HOURS;
        self.solar_peak * (-0.5 * offset * offset).exp()
    }

    /// Produce the next grid reading for `consumer_load` watts of controlled devices.
    pub fn sample(
        &mut self,
        now: Timestamp,
        consumer_load: f64,
        battery: Option<&SimulatedBattery>,
    ) -> GridReading {
        let hours = self
            .last_sample
            .map(|last| (now - last).num_milliseconds() as f64 / 3_600_000.0)
            .unwrap_or(0.0)
            .clamp(0.0, MAX_STEP_HOURS);
        self.last_sample = Some(now);

        let forecast_now = self.solar_production(now);
        let forecast_30m = self.solar_production(now + TimeDelta::minutes(30));
        // passing clouds only ever reduce production
        let cloud = self.noise.sample(&mut self.rng).abs() * 4.0;
        let solar = (forecast_now - cloud).max(0.0);
        let appliance_cycle =
            0.5 * self.base_load * (2.0 * PI * f64::from(now.minute()) / 60.0).sin();
        let household =
            (self.base_load + appliance_cycle + self.noise.sample(&mut self.rng)).max(0.0);

        let net = household + consumer_load - solar;
        let flow = battery.map(|battery| battery.exchange(net, hours)).unwrap_or_default();
        let grid = net + flow.charge - flow.discharge;
        let import = grid.max(0.0);
        let export = (-grid).max(0.0);

        let minute_of_day = now.hour() * 60 + now.minute();
        let key = (now.date_naive(), minute_of_day / self.demand_interval_minutes);
        let average_demand = self.demand.record(key, import);

        GridReading {
            import_power: Some(import),
            export_power: Some(export),
            battery_charge_power: battery.map(|_| flow.charge),
            battery_discharge_power: battery.map(|_| flow.discharge),
            peak_threshold: None,
            average_demand: Some(average_demand),
            solar_production: Some(solar),
            solar_forecast_now: Some(forecast_now),
            solar_forecast_30m: Some(forecast_30m),
        }
    }
}
