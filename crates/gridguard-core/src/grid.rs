//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Consumer scheduling and load-balancing control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::time::Duration;

use chrono::Timelike;
use gridguard_common::time::to_time_delta;
use gridguard_common::{GridConfig, LoadTimeFrame, Timestamp};
use tracing::trace;

/// Smallest remaining demand-interval length used by the quarter-peak budget.
const MIN_REMAINING_INTERVAL_MINUTES: f64 = 0.5;

/// One telemetry update. Every field is optional: `None` means "no new value".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GridReading {
    pub import_power: Option<f64>,
    pub export_power: Option<f64>,
    pub battery_charge_power: Option<f64>,
    pub battery_discharge_power: Option<f64>,
    pub peak_threshold: Option<f64>,
    pub average_demand: Option<f64>,
    pub solar_production: Option<f64>,
    pub solar_forecast_now: Option<f64>,
    pub solar_forecast_30m: Option<f64>,
}

impl GridReading {
    /// Import/export pair, the most common update.
    pub fn net(import_power: f64, export_power: f64) -> Self {
        Self {
            import_power: Some(import_power),
            export_power: Some(export_power),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct History {
    capacity: usize,
    samples: VecDeque<(Timestamp, f64)>,
}

impl History {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, at: Timestamp, value: f64) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((at, value));
    }

    fn average_since(&self, since: Timestamp) -> Option<f64> {
        let (sum, count) = self
            .samples
            .iter()
            .rev()
            .take_while(|(at, _)| *at >= since)
            .fold((0.0, 0usize), |(sum, count), (_, value)| (sum + value, count + 1));
        (count > 0).then(|| sum / count as f64)
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Aggregates grid and battery telemetry into the load figures the scheduler uses.
#[derive(Debug)]
pub struct GridMonitor {
    minimum_peak_load: f64,
    demand_interval_minutes: u32,
    import_power: Option<f64>,
    export_power: Option<f64>,
    battery_charge_power: Option<f64>,
    battery_discharge_power: Option<f64>,
    peak_threshold: Option<f64>,
    average_demand: Option<f64>,
    solar_production: Option<f64>,
    solar_forecast_now: Option<f64>,
    solar_forecast_30m: Option<f64>,
    load_history: History,
    load_minus_batteries_history: History,
}

impl GridMonitor {
    pub fn new(config: &GridConfig) -> Self {
        let capacity = config.history_capacity.max(1);
        Self {
            minimum_peak_load: config.minimum_peak_load,
            demand_interval_minutes: config.demand_interval_minutes.max(1),
            import_power: None,
            export_power: None,
            battery_charge_power: None,
            battery_discharge_power: None,
            peak_threshold: None,
            average_demand: None,
            solar_production: None,
            solar_forecast_now: None,
            solar_forecast_30m: None,
            load_history: History::new(capacity),
            load_minus_batteries_history: History::new(capacity),
        }
    }

    /// Merge a reading. Missing values keep the last valid one.
    ///
    /// Returns whether any load-relevant metric changed, in which case a sample
    /// is appended to the history.
    pub fn apply(&mut self, reading: &GridReading, now: Timestamp) -> bool {
        let mut load_changed = false;
        load_changed |= merge(&mut self.import_power, reading.import_power);
        load_changed |= merge(&mut self.export_power, reading.export_power);
        load_changed |= merge(&mut self.battery_charge_power, reading.battery_charge_power);
        load_changed |= merge(&mut self.battery_discharge_power, reading.battery_discharge_power);
        merge(&mut self.peak_threshold, reading.peak_threshold);
        merge(&mut self.average_demand, reading.average_demand);
        merge(&mut self.solar_production, reading.solar_production);
        merge(&mut self.solar_forecast_now, reading.solar_forecast_now);
        merge(&mut self.solar_forecast_30m, reading.solar_forecast_30m);

        let has_sample = reading.import_power.is_some()
            || reading.export_power.is_some()
            || reading.battery_charge_power.is_some()
            || reading.battery_discharge_power.is_some();
        if has_sample {
            self.load_history.push(now, self.current_load());
            self.load_minus_batteries_history
                .push(now, self.current_load_minus_batteries());
            trace!(
                load_w = self.current_load(),
                samples = self.load_history.len(),
                "grid sample recorded"
            );
        }
        load_changed
    }

    pub fn current_load(&self) -> f64 {
        self.import_power.unwrap_or(0.0) - self.export_power.unwrap_or(0.0)
    }

    pub fn current_load_minus_batteries(&self) -> f64 {
        self.current_load() - self.battery_charge_power.unwrap_or(0.0)
            + self.battery_discharge_power.unwrap_or(0.0)
    }

    /// Monthly peak-demand threshold, never below the configured floor.
    pub fn peak_load(&self) -> f64 {
        self.peak_threshold
            .unwrap_or(self.minimum_peak_load)
            .max(self.minimum_peak_load)
    }

    pub fn current_average_demand(&self) -> f64 {
        self.average_demand.unwrap_or(0.0)
    }

    pub fn battery_charge_power(&self) -> f64 {
        self.battery_charge_power.unwrap_or(0.0)
    }

    pub fn battery_discharge_power(&self) -> f64 {
        self.battery_discharge_power.unwrap_or(0.0)
    }

    /// Mean load over the trailing window; the instantaneous value when the window is empty.
    pub fn average_load_since(&self, window: Duration, now: Timestamp) -> f64 {
        self.load_history
            .average_since(now - to_time_delta(window))
            .unwrap_or_else(|| self.current_load())
    }

    pub fn average_load_minus_batteries_since(&self, window: Duration, now: Timestamp) -> f64 {
        self.load_minus_batteries_history
            .average_since(now - to_time_delta(window))
            .unwrap_or_else(|| self.current_load_minus_batteries())
    }

    /// Load estimate for one configured load time frame.
    ///
    /// Forecast frames swap measured solar production for the forecast and
    /// fall back to the instantaneous load when either value is unknown.
    pub fn load_for_frame(&self, frame: LoadTimeFrame, now: Timestamp) -> f64 {
        let current = self.current_load_minus_batteries();
        let forecast = match frame {
            LoadTimeFrame::Now => return current,
            LoadTimeFrame::Last30Seconds
            | LoadTimeFrame::LastMinute
            | LoadTimeFrame::Last2Minutes
            | LoadTimeFrame::Last5Minutes => {
                return match frame.window() {
                    Some(window) => self.average_load_minus_batteries_since(window, now),
                    None => current,
                };
            }
            LoadTimeFrame::SolarForecastNow => self.solar_forecast_now,
            LoadTimeFrame::SolarForecast30Minutes => self.solar_forecast_30m,
        };
        match (self.solar_production, forecast) {
            (Some(production), Some(forecast)) => current + production - forecast,
            _ => current,
        }
    }

    pub fn demand_interval_minutes(&self) -> u32 {
        self.demand_interval_minutes
    }

    /// Minutes left in the current demand billing interval, floored at half a minute.
    pub fn remaining_minutes_in_demand_interval(&self, now: Timestamp) -> f64 {
        let interval_secs = self.demand_interval_minutes * 60;
        let elapsed = (now.minute() * 60 + now.second()) % interval_secs;
        let remaining = f64::from(interval_secs - elapsed) / 60.0;
        remaining.max(MIN_REMAINING_INTERVAL_MINUTES)
    }
}

fn merge(slot: &mut Option<f64>, value: Option<f64>) -> bool {
    match value {
        Some(value) if value.is_finite() => {
            let changed = *slot != Some(value);
            *slot = Some(value);
            changed
        }
        _ => false,
    }
}
