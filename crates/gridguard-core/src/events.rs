//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Consumer scheduling and load-balancing control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use gridguard_common::Timestamp;
use serde::Serialize;

use crate::consumer::ConsumerState;

/// Published whenever a consumer's lifecycle state moves.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerStateChanged {
    pub consumer: String,
    pub state: ConsumerState,
    pub at: Timestamp,
}

/// Auto-stop timer bookkeeping requested by a guard cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum TimerRequest {
    Arm { consumer: String, at: Timestamp },
    Cancel { consumer: String },
}

impl TimerRequest {
    pub fn consumer(&self) -> &str {
        match self {
            TimerRequest::Arm { consumer, .. } | TimerRequest::Cancel { consumer } => consumer,
        }
    }
}
