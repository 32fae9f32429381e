//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the gridguard workspace.
//! This crate exposes configuration loading, logging initialisation and the
//! clock abstraction consumed by the scheduler and the daemon.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AllowBatteryPower, AppConfig, BalancingMethod, BatteryConfig, ConsumerConfig, ConsumerKind,
    DynamicConfig, GridConfig, LoadTimeFrame, LoggingConfig, PersistenceConfig, SchedulerConfig,
    SimulationConfig, TimeWindowConfig, ALL_CONSUMER_GROUPS,
};
pub use logging::{init_tracing, LogFormat};
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
