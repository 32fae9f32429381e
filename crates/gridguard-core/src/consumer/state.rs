//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Consumer scheduling and load-balancing control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of an energy consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConsumerState {
    #[default]
    Off,
    NeedsEnergy,
    CriticallyNeedsEnergy,
    Running,
}

impl ConsumerState {
    /// Waiting for admission.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            ConsumerState::NeedsEnergy | ConsumerState::CriticallyNeedsEnergy
        )
    }

    /// Admission priority, higher goes first.
    pub fn admission_rank(self) -> u8 {
        match self {
            ConsumerState::CriticallyNeedsEnergy => 2,
            ConsumerState::NeedsEnergy => 1,
            ConsumerState::Off | ConsumerState::Running => 0,
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConsumerState::Off => "off",
            ConsumerState::NeedsEnergy => "needs_energy",
            ConsumerState::CriticallyNeedsEnergy => "critically_needs_energy",
            ConsumerState::Running => "running",
        };
        f.write_str(label)
    }
}
