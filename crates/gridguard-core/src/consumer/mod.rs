//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Consumer scheduling and load-balancing control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Energy consumers and their admission/eviction predicates.

pub mod policy;
pub mod state;
pub mod window;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gridguard_common::time::{elapsed_at_least, to_time_delta};
use gridguard_common::{ConsumerConfig, ConsumerKind, Timestamp};
use tracing::{debug, info, warn};

pub use policy::ConsumerPolicy;
pub use state::ConsumerState;
pub use window::TimeWindow;

use crate::device::{BinaryCondition, ConsumerDevice, DeviceBinding};
use crate::dynamic::DynamicLoad;
use crate::error::{CoreError, Result};
use crate::snapshot::ConsumerSnapshot;

/// Consumer flavour, chosen by the configured `kind`.
#[derive(Debug)]
pub enum ConsumerVariant {
    Fixed,
    Dynamic(DynamicLoad),
}

/// Lifecycle change observed while refreshing a consumer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    /// The device reported running; `deadline` is the automatic stop time.
    Started { deadline: Option<Timestamp> },
    Stopped,
    Changed,
}

/// One controllable load.
///
/// State only moves through [`EnergyConsumer::refresh`], which follows what
/// the device reports. The scheduler requests starts and stops; it never sets
/// `Running` itself.
#[derive(Debug)]
pub struct EnergyConsumer {
    name: String,
    groups: Vec<String>,
    policy: ConsumerPolicy,
    device: Arc<dyn ConsumerDevice>,
    variant: ConsumerVariant,
    state: ConsumerState,
    desired: ConsumerState,
    critical: bool,
    started_at: Option<Timestamp>,
    last_run: Option<Timestamp>,
    current_load: f64,
    stop_deadline: Option<Timestamp>,
    /// When the last accepted stop command was sent, until the device reports stopped.
    stop_requested_at: Option<Timestamp>,
}

impl EnergyConsumer {
    pub fn new(
        name: impl Into<String>,
        groups: Vec<String>,
        policy: ConsumerPolicy,
        device: Arc<dyn ConsumerDevice>,
        variant: ConsumerVariant,
    ) -> Self {
        Self {
            name: name.into(),
            groups,
            policy,
            device,
            variant,
            state: ConsumerState::Off,
            desired: ConsumerState::Off,
            critical: false,
            started_at: None,
            last_run: None,
            current_load: 0.0,
            stop_deadline: None,
            stop_requested_at: None,
        }
    }

    /// Build a consumer from configuration and its bound adapters.
    ///
    /// A dynamic consumer without a dynamic section or without a
    /// current-controlled charger is rejected here, never at runtime.
    pub fn from_config(
        name: &str,
        config: &ConsumerConfig,
        binding: &DeviceBinding,
        conditions: &HashMap<String, Arc<dyn BinaryCondition>>,
    ) -> Result<Self> {
        let policy = ConsumerPolicy::from_config(config, conditions)
            .map_err(|reason| CoreError::invalid(name, reason))?;
        let variant = match config.kind {
            ConsumerKind::Fixed => ConsumerVariant::Fixed,
            ConsumerKind::Dynamic => {
                let dynamic = config.dynamic.as_ref().ok_or_else(|| {
                    CoreError::invalid(name, "dynamic consumer without a dynamic section")
                })?;
                let charger = binding.charger.clone().ok_or_else(|| {
                    CoreError::invalid(name, "dynamic consumer without a current-controlled charger")
                })?;
                ConsumerVariant::Dynamic(DynamicLoad::new(dynamic, charger, binding.vehicle.clone()))
            }
        };
        Ok(Self::new(
            name,
            config.groups.clone(),
            policy,
            binding.device.clone(),
            variant,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn policy(&self) -> &ConsumerPolicy {
        &self.policy
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn desired_state(&self) -> ConsumerState {
        self.desired
    }

    pub fn is_running(&self) -> bool {
        self.state == ConsumerState::Running
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    pub fn started_at(&self) -> Option<Timestamp> {
        self.started_at
    }

    pub fn last_run(&self) -> Option<Timestamp> {
        self.last_run
    }

    /// Last known measured draw.
    pub fn current_load(&self) -> f64 {
        self.current_load
    }

    pub fn peak_load(&self) -> f64 {
        self.policy.peak_load
    }

    pub fn stop_deadline(&self) -> Option<Timestamp> {
        self.stop_deadline
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested_at.is_some()
    }

    /// Forget a stop request the device has not acted on within `retry_after`,
    /// so the next decision can send it again. Returns whether it expired.
    pub fn expire_stop_request(&mut self, now: Timestamp, retry_after: Duration) -> bool {
        let Some(requested_at) = self.stop_requested_at else {
            return false;
        };
        if !self.is_running() || !elapsed_at_least(requested_at, now, retry_after) {
            return false;
        }
        warn!(consumer = %self.name, "device still running after stop request");
        self.stop_requested_at = None;
        true
    }

    pub fn dynamic(&self) -> Option<&DynamicLoad> {
        match &self.variant {
            ConsumerVariant::Dynamic(dynamic) => Some(dynamic),
            ConsumerVariant::Fixed => None,
        }
    }

    pub fn dynamic_mut(&mut self) -> Option<&mut DynamicLoad> {
        match &mut self.variant {
            ConsumerVariant::Dynamic(dynamic) => Some(dynamic),
            ConsumerVariant::Fixed => None,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.variant, ConsumerVariant::Dynamic(_))
    }

    /// Re-read the device and move the lifecycle accordingly.
    pub fn refresh(&mut self, now: Timestamp) -> Option<Transition> {
        if let Some(load) = self.device.current_load().filter(|load| load.is_finite()) {
            self.current_load = load;
        }

        let mut desired = self.device.desired_state(now);
        if desired == ConsumerState::NeedsEnergy && self.maximum_timeout_elapsed(now) {
            debug!(consumer = %self.name, "maximum timeout elapsed, escalating");
            desired = ConsumerState::CriticallyNeedsEnergy;
        }
        self.desired = desired;
        self.critical = desired == ConsumerState::CriticallyNeedsEnergy;

        let next = if self.device.is_running() {
            ConsumerState::Running
        } else if desired == ConsumerState::Running {
            ConsumerState::NeedsEnergy
        } else {
            desired
        };
        self.set_state(next, now)
    }

    pub(crate) fn set_state(&mut self, next: ConsumerState, now: Timestamp) -> Option<Transition> {
        let previous = self.state;
        if previous == next {
            return None;
        }
        self.state = next;
        debug!(consumer = %self.name, from = %previous, to = %next, "state changed");
        match (previous, next) {
            (_, ConsumerState::Running) => {
                self.started(now);
                Some(Transition::Started {
                    deadline: self.stop_deadline,
                })
            }
            (ConsumerState::Running, _) => {
                self.stopped(now);
                Some(Transition::Stopped)
            }
            _ => Some(Transition::Changed),
        }
    }

    fn started(&mut self, now: Timestamp) {
        self.started_at = Some(now);
        self.stop_requested_at = None;
        self.stop_deadline = self.run_time(now).map(|left| now + to_time_delta(left));
    }

    fn stopped(&mut self, now: Timestamp) {
        self.last_run = Some(now);
        self.started_at = None;
        self.stop_deadline = None;
        self.stop_requested_at = None;
    }

    fn maximum_timeout_elapsed(&self, now: Timestamp) -> bool {
        match (self.policy.maximum_timeout, self.last_run) {
            (Some(timeout), Some(last_run)) => elapsed_at_least(last_run, now, timeout),
            _ => false,
        }
    }

    pub fn can_start(&self, now: Timestamp) -> bool {
        if matches!(self.state, ConsumerState::Running | ConsumerState::Off) {
            return false;
        }
        if !self.policy.in_time_window(now) {
            return false;
        }
        if let (Some(timeout), Some(last_run)) = (self.policy.minimum_timeout, self.last_run) {
            if !elapsed_at_least(last_run, now, timeout) {
                return false;
            }
        }
        true
    }

    pub fn can_force_stop(&self, now: Timestamp) -> bool {
        if self.critical {
            return false;
        }
        if let (Some(runtime), Some(started_at)) = (self.policy.minimum_runtime, self.started_at) {
            if !elapsed_at_least(started_at, now, runtime) {
                return false;
            }
        }
        match &self.variant {
            ConsumerVariant::Dynamic(dynamic) => !dynamic.is_rebalancing(now),
            ConsumerVariant::Fixed => true,
        }
    }

    /// Emergency variant that ignores the minimum runtime.
    pub fn can_force_stop_on_peak_load(&self, _now: Timestamp) -> bool {
        self.is_running() && !self.critical
    }

    /// Remaining permitted runtime: the lesser of the maximum runtime and the
    /// time left in the active window. `None` is unconstrained.
    pub fn run_time(&self, now: Timestamp) -> Option<Duration> {
        let by_runtime = self.policy.maximum_runtime.map(|maximum| {
            let end = self.started_at.unwrap_or(now) + to_time_delta(maximum);
            (end - now).to_std().unwrap_or(Duration::ZERO)
        });
        let by_window = self
            .policy
            .window_remaining(now)
            .map(|left| left.to_std().unwrap_or(Duration::ZERO));
        match (by_runtime, by_window) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Request a stop when the runtime budget or the armed deadline has passed.
    pub fn stop_if_past_runtime(&mut self, now: Timestamp) -> bool {
        if !self.is_running() || self.stop_requested() {
            return false;
        }
        let runtime_spent = match (self.policy.maximum_runtime, self.started_at) {
            (Some(maximum), Some(started_at)) => elapsed_at_least(started_at, now, maximum),
            _ => false,
        };
        let deadline_passed = self.stop_deadline.is_some_and(|deadline| now >= deadline);
        if !(runtime_spent || deadline_passed) {
            return false;
        }
        info!(consumer = %self.name, "permitted runtime elapsed");
        self.request_stop("runtime elapsed", now)
    }

    /// Ask the device to start. Failures are logged and reported as `false`.
    pub fn request_start(&mut self) -> bool {
        match self.device.turn_on() {
            Ok(()) => true,
            Err(err) => {
                warn!(consumer = %self.name, error = %err, "start command failed");
                false
            }
        }
    }

    /// Ask the device to stop. Failures are logged and reported as `false`.
    pub fn request_stop(&mut self, reason: &str, now: Timestamp) -> bool {
        match self.device.turn_off() {
            Ok(()) => {
                debug!(consumer = %self.name, reason, "stop requested");
                self.stop_requested_at = Some(now);
                true
            }
            Err(err) => {
                warn!(consumer = %self.name, error = %err, reason, "stop command failed");
                false
            }
        }
    }

    pub fn snapshot(&self) -> ConsumerSnapshot {
        let dynamic = self.dynamic();
        ConsumerSnapshot {
            state: self.state,
            started_at: self.started_at,
            last_run: self.last_run,
            balancing_method: dynamic.map(DynamicLoad::balancing_method),
            balance_on_behalf_of: dynamic
                .and_then(DynamicLoad::balance_on_behalf_of)
                .map(str::to_string),
            allow_battery_power: dynamic.map(DynamicLoad::allow_battery_power),
        }
    }

    /// Reapply persisted state without emitting transitions.
    pub fn restore(&mut self, snapshot: &ConsumerSnapshot, now: Timestamp) {
        self.state = snapshot.state;
        self.started_at = snapshot.started_at;
        self.last_run = snapshot.last_run;
        self.stop_deadline = if self.is_running() {
            self.run_time(now).map(|left| now + to_time_delta(left))
        } else {
            None
        };
        if let Some(dynamic) = self.dynamic_mut() {
            if let Some(method) = snapshot.balancing_method {
                dynamic.set_balancing_method(method);
            }
            dynamic.set_balance_on_behalf_of(snapshot.balance_on_behalf_of.clone());
            if let Some(allow) = snapshot.allow_battery_power {
                dynamic.set_allow_battery_power(allow);
            }
        }
    }
}
