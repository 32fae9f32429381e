//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Consumer scheduling and load-balancing control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Core control loop for gridguard.
//!
//! The [`scheduler::Scheduler`] owns every [`consumer::EnergyConsumer`], the
//! [`grid::GridMonitor`] and the [`battery::BatteryCoordinator`], and runs one
//! synchronous guard cycle at a time. [`service::GuardService`] wraps it in a
//! tokio task fed by a message channel.

pub mod balancing;
pub mod battery;
pub mod consumer;
pub mod device;
pub mod dynamic;
pub mod error;
pub mod events;
pub mod grid;
pub mod scheduler;
pub mod service;
pub mod snapshot;

pub use battery::{Battery, BatteryCoordinator};
pub use consumer::{ConsumerState, EnergyConsumer};
pub use device::{
    BatteryControl, BinaryCondition, ConsumerDevice, CurrentControl, DeviceBinding, DeviceError,
    SiteBindings,
};
pub use dynamic::{DynamicLoad, RebalanceOutcome};
pub use error::{CoreError, Result};
pub use events::{ConsumerStateChanged, TimerRequest};
pub use grid::{GridMonitor, GridReading};
pub use scheduler::{CycleReport, Scheduler};
pub use service::{GuardHandle, GuardService, SchedulerMessage};
pub use snapshot::ConsumerSnapshot;
