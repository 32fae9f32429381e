//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulated household telemetry and device adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Simulated site used by the daemon when no real devices are attached.
//!
//! The household produces grid readings from a base load, a solar bell curve
//! and gaussian noise. Device adapters keep their state in memory and feed
//! their draw back into the next reading, so scheduler decisions show up in
//! the telemetry one tick later.

pub mod devices;
pub mod household;
pub mod site;

pub use devices::{
    BatteryFlow, SimulatedBattery, SimulatedCharger, SimulatedCondition, SimulatedSocket,
};
pub use household::HouseholdSimulator;
pub use site::SimulatedSite;
