//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Consumer scheduling and load-balancing control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use gridguard_common::{ConsumerConfig, LoadTimeFrame, Timestamp};

use super::window::TimeWindow;
use crate::device::BinaryCondition;

/// Thresholds and timing rules for one consumer.
#[derive(Debug, Clone)]
pub struct ConsumerPolicy {
    /// Projected load the site must stay below for a start.
    pub switch_on_load: f64,
    /// Projected load above which the consumer is stopped.
    pub switch_off_load: f64,
    /// Draw reserved for the consumer once it runs.
    pub peak_load: f64,
    pub minimum_runtime: Option<Duration>,
    pub maximum_runtime: Option<Duration>,
    pub minimum_timeout: Option<Duration>,
    pub maximum_timeout: Option<Duration>,
    pub time_windows: Vec<TimeWindow>,
    pub load_time_frames_on_start: Vec<LoadTimeFrame>,
    pub load_time_frames_on_stop: Vec<LoadTimeFrame>,
}

impl ConsumerPolicy {
    pub fn from_config(
        config: &ConsumerConfig,
        conditions: &HashMap<String, Arc<dyn BinaryCondition>>,
    ) -> Result<Self, String> {
        let time_windows = config
            .time_windows
            .iter()
            .map(|window| TimeWindow::from_config(window, conditions))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            switch_on_load: config.switch_on_load,
            switch_off_load: config.switch_off_load,
            peak_load: config.peak_load,
            minimum_runtime: config.minimum_runtime,
            maximum_runtime: config.maximum_runtime,
            minimum_timeout: config.minimum_timeout,
            maximum_timeout: config.maximum_timeout,
            time_windows,
            load_time_frames_on_start: config.load_time_frames_on_start.clone(),
            load_time_frames_on_stop: config.load_time_frames_on_stop.clone(),
        })
    }

    /// No windows means no restriction.
    pub fn in_time_window(&self, now: Timestamp) -> bool {
        self.time_windows.is_empty() || self.time_windows.iter().any(|w| w.is_active(now))
    }

    /// Longest time left among the active windows. `None` when unbounded.
    pub fn window_remaining(&self, now: Timestamp) -> Option<TimeDelta> {
        let mut longest: Option<TimeDelta> = None;
        for window in self.time_windows.iter().filter(|w| w.is_active(now)) {
            let remaining = window.remaining(now)?;
            longest = Some(longest.map_or(remaining, |current| current.max(remaining)));
        }
        longest
    }
}
