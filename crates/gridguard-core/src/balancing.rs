//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Consumer scheduling and load-balancing control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Current adjustment per balancing method.
//!
//! A positive adjustment means "draw less": the new current is the present
//! current minus the adjustment. Each method has a dead band inside which the
//! adjustment is zero so the charger does not hunt around its set point.

use gridguard_common::BalancingMethod;

/// Figures a balancing method works from, all in watts unless noted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalancingInputs {
    /// Net grid usage right now, corrected by this cycle's earlier changes.
    pub usage: f64,
    /// Net grid usage averaged over the rebalancing interval, same correction.
    pub average_usage: f64,
    pub voltage: f64,
    /// Monthly peak-demand threshold.
    pub peak_load: f64,
    /// Average demand of the running billing interval.
    pub average_demand: f64,
    pub remaining_interval_minutes: f64,
    pub interval_minutes: f64,
}

/// Signed current adjustment in amps.
pub fn adjustment(method: BalancingMethod, inputs: &BalancingInputs) -> f64 {
    let v = inputs.voltage;
    let amps = match method {
        BalancingMethod::SolarOnly => dead_band(inputs.average_usage / v, -1.15, 0.20, f64::ceil),
        BalancingMethod::SolarSurplus => {
            dead_band(inputs.average_usage / v + 1.0, -1.15, 0.20, f64::ceil)
        }
        BalancingMethod::MidPoint => dead_band(inputs.average_usage / v, -0.70, 0.70, f64::round),
        BalancingMethod::SolarPreferred => {
            dead_band(inputs.average_usage / v, -0.20, 1.15, f64::floor)
        }
        BalancingMethod::MidPeak => dead_band(
            (inputs.average_usage - inputs.peak_load / 2.0) / v,
            -0.70,
            0.70,
            f64::round,
        ),
        BalancingMethod::NearPeak => {
            dead_band((inputs.usage - inputs.peak_load) / v, -1.20, 0.0, f64::ceil)
        }
        BalancingMethod::MaximizeQuarterPeak => {
            let budget = quarter_peak_budget(inputs);
            ((inputs.usage - budget) / v).ceil()
        }
    };
    // normalise -0.0
    amps + 0.0
}

/// Load the rest of the billing interval may average without raising the monthly peak.
pub fn quarter_peak_budget(inputs: &BalancingInputs) -> f64 {
    inputs.interval_minutes / inputs.remaining_interval_minutes
        * (inputs.peak_load - inputs.average_demand)
}

fn dead_band(ratio: f64, low: f64, high: f64, round: fn(f64) -> f64) -> f64 {
    if ratio > low && ratio < high {
        0.0
    } else {
        round(ratio)
    }
}
