//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Consumer scheduling and load-balancing control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! One guard cycle: rebalance, admit, evict, battery permission.
//!
//! Every decision in a cycle works from a single [`Projection`]. Admissions
//! add their peak load to it and evictions remove their measured load, so a
//! later decision in the same cycle always sees the earlier ones.

use std::sync::Arc;
use std::time::Duration;

use gridguard_common::time::elapsed_at_least;
use gridguard_common::{
    AllowBatteryPower, AppConfig, BalancingMethod, LoadTimeFrame, Timestamp,
};
use gridguard_persistence::StateStore;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::battery::{Battery, BatteryCoordinator};
use crate::consumer::{ConsumerState, EnergyConsumer, Transition};
use crate::device::SiteBindings;
use crate::error::{CoreError, Result};
use crate::events::{ConsumerStateChanged, TimerRequest};
use crate::grid::{GridMonitor, GridReading};
use crate::snapshot::ConsumerSnapshot;

const EVENT_CAPACITY: usize = 64;

/// What a guard cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Consumers asked to start, in admission order.
    pub started: Vec<String>,
    /// Consumers asked to stop, in eviction order.
    pub stopped: Vec<String>,
    /// Dynamic consumers whose current changed, with the new current.
    pub rebalanced: Vec<(String, f64)>,
    pub dynamic_net_change: f64,
    /// New discharge permission when it changed.
    pub battery_discharge: Option<bool>,
    pub cooldown_active: bool,
    pub timers: Vec<TimerRequest>,
}

impl CycleReport {
    pub fn changed(&self) -> bool {
        !self.started.is_empty() || !self.stopped.is_empty()
    }
}

/// Owns every consumer plus the grid and battery view. Not thread-safe on its
/// own; the guard service serialises access behind a mutex.
#[derive(Debug)]
pub struct Scheduler {
    consumers: Vec<EnergyConsumer>,
    grid: GridMonitor,
    battery: BatteryCoordinator,
    store: Option<Arc<dyn StateStore>>,
    events: broadcast::Sender<ConsumerStateChanged>,
    minimum_change_interval: Duration,
    /// A stop the device ignored for this long is sent again.
    stop_retry_after: Duration,
    last_change: Option<Timestamp>,
    pending_timers: Vec<TimerRequest>,
}

impl Scheduler {
    /// Build the scheduler. Every configured consumer needs a bound device.
    pub fn new(config: &AppConfig, bindings: &SiteBindings) -> Result<Self> {
        let mut consumers = Vec::with_capacity(config.consumers.len());
        for (name, consumer_config) in &config.consumers {
            let binding = bindings
                .consumers
                .get(name)
                .ok_or_else(|| CoreError::invalid(name, "no device bound"))?;
            consumers.push(EnergyConsumer::from_config(
                name,
                consumer_config,
                binding,
                &bindings.conditions,
            )?);
        }

        let battery = match (&config.battery, &bindings.battery) {
            (Some(battery), Some(control)) => Some(Battery::new(battery, control.clone())),
            (None, None) => None,
            (Some(_), None) => {
                return Err(CoreError::invalid("battery", "configured battery has no control bound"))
            }
            (None, Some(_)) => {
                return Err(CoreError::invalid(
                    "battery",
                    "battery control bound without a [battery] section",
                ))
            }
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        info!(
            consumers = consumers.len(),
            battery = battery.is_some(),
            "scheduler built"
        );
        Ok(Self {
            consumers,
            grid: GridMonitor::new(&config.grid),
            battery: BatteryCoordinator::new(battery),
            store: None,
            events,
            minimum_change_interval: config.scheduler.minimum_change_interval,
            stop_retry_after: config.scheduler.guard_interval,
            last_change: None,
            pending_timers: Vec::new(),
        })
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsumerStateChanged> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<ConsumerStateChanged> {
        self.events.clone()
    }

    pub fn consumers(&self) -> &[EnergyConsumer] {
        &self.consumers
    }

    pub fn consumer(&self, name: &str) -> Option<&EnergyConsumer> {
        self.consumers.iter().find(|consumer| consumer.name() == name)
    }

    pub fn grid(&self) -> &GridMonitor {
        &self.grid
    }

    pub fn battery(&self) -> &BatteryCoordinator {
        &self.battery
    }

    pub fn apply_telemetry(&mut self, reading: &GridReading, now: Timestamp) -> bool {
        self.grid.apply(reading, now)
    }

    pub fn cooldown_active(&self, now: Timestamp) -> bool {
        self.last_change
            .is_some_and(|at| !elapsed_at_least(at, now, self.minimum_change_interval))
    }

    /// Reload persisted consumer state and stop anything that overran its runtime
    /// while the process was down. Returns how many consumers were restored.
    pub fn restore_state(&mut self, now: Timestamp) -> usize {
        let Some(store) = self.store.clone() else {
            return 0;
        };
        let mut restored = 0;
        for consumer in &mut self.consumers {
            match ConsumerSnapshot::load(store.as_ref(), consumer.name()) {
                Ok(Some(snapshot)) => {
                    consumer.restore(&snapshot, now);
                    restored += 1;
                    if consumer.stop_if_past_runtime(now) {
                        info!(consumer = %consumer.name(), "stopped after restart, runtime elapsed");
                    } else if let Some(at) = consumer.stop_deadline() {
                        self.pending_timers.push(TimerRequest::Arm {
                            consumer: consumer.name().to_string(),
                            at,
                        });
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(consumer = %consumer.name(), error = %err, "persisted state ignored");
                }
            }
        }
        info!(restored, "consumer state restored");
        restored
    }

    pub fn set_balancing_method(&mut self, consumer: &str, method: BalancingMethod) -> Result<()> {
        self.update_dynamic(consumer, |dynamic| dynamic.set_balancing_method(method))
    }

    pub fn set_balance_on_behalf_of(&mut self, consumer: &str, group: Option<String>) -> Result<()> {
        self.update_dynamic(consumer, |dynamic| dynamic.set_balance_on_behalf_of(group))
    }

    pub fn set_allow_battery_power(&mut self, consumer: &str, allow: AllowBatteryPower) -> Result<()> {
        self.update_dynamic(consumer, |dynamic| dynamic.set_allow_battery_power(allow))
    }

    fn update_dynamic<F>(&mut self, name: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut crate::dynamic::DynamicLoad),
    {
        let consumer = self
            .consumers
            .iter_mut()
            .find(|consumer| consumer.name() == name)
            .ok_or_else(|| CoreError::UnknownConsumer(name.to_string()))?;
        let dynamic = consumer
            .dynamic_mut()
            .ok_or_else(|| CoreError::NotDynamic(name.to_string()))?;
        update(dynamic);
        info!(consumer = %name, "dynamic settings changed");
        persist(self.store.as_deref(), consumer);
        Ok(())
    }

    /// Handle an auto-stop timer firing.
    pub fn expire_runtime(&mut self, name: &str, now: Timestamp) -> Result<bool> {
        let consumer = self
            .consumers
            .iter_mut()
            .find(|consumer| consumer.name() == name)
            .ok_or_else(|| CoreError::UnknownConsumer(name.to_string()))?;
        let stopped = consumer.stop_if_past_runtime(now);
        if stopped {
            self.last_change = Some(now);
        }
        Ok(stopped)
    }

    /// Run one guard cycle.
    pub fn run_cycle(&mut self, now: Timestamp) -> CycleReport {
        let mut report = CycleReport::default();
        self.refresh_consumers(now);

        for consumer in &mut self.consumers {
            consumer.expire_stop_request(now, self.stop_retry_after);
            if consumer.stop_if_past_runtime(now) {
                report.stopped.push(consumer.name().to_string());
            }
        }

        let consumers = &mut self.consumers;
        let grid = &self.grid;

        let mut dynamic_net_change = 0.0;
        for consumer in consumers.iter_mut() {
            if !consumer.is_running() || consumer.stop_requested() {
                continue;
            }
            let name = consumer.name().to_string();
            let critical = consumer.is_critical();
            let Some(dynamic) = consumer.dynamic_mut() else {
                continue;
            };
            let outcome = dynamic.rebalance(&name, grid, dynamic_net_change, critical, now);
            if !outcome.is_unchanged() {
                dynamic_net_change += outcome.net_power_change;
                report.rebalanced.push((name, outcome.new_current));
            }
        }
        report.dynamic_net_change = dynamic_net_change;

        let mut touched: Vec<bool> = consumers.iter().map(EnergyConsumer::stop_requested).collect();
        let mut projection = Projection {
            grid,
            now,
            dynamic_net_change,
            committed: 0.0,
            ramp_reserve: ramp_reserve(consumers),
        };
        let cooldown = self
            .last_change
            .is_some_and(|at| !elapsed_at_least(at, now, self.minimum_change_interval));
        report.cooldown_active = cooldown;

        if cooldown {
            debug!("change cooldown active, admission and eviction skipped");
        } else {
            for state in [ConsumerState::CriticallyNeedsEnergy, ConsumerState::NeedsEnergy] {
                admission_pass(consumers, &mut projection, &mut touched, state, &mut report);
            }
        }

        stop_unwanted(consumers, &mut projection, &mut touched, &mut report);
        if !cooldown {
            let order = eviction_order(consumers, &touched);
            evict_above_switch_off(consumers, &order, &mut projection, &mut touched, &mut report);
            evict_above_peak(consumers, &order, &mut projection, &mut touched, &mut report);
        }

        report.battery_discharge = self.battery.update(&self.consumers);

        if report.changed() {
            self.last_change = Some(now);
        }
        report.timers = std::mem::take(&mut self.pending_timers);
        report
    }

    fn refresh_consumers(&mut self, now: Timestamp) {
        for consumer in &mut self.consumers {
            let Some(transition) = consumer.refresh(now) else {
                continue;
            };
            let name = consumer.name().to_string();
            match transition {
                Transition::Started { deadline } => {
                    info!(consumer = %name, load_w = consumer.current_load(), "consumer running");
                    if let Some(at) = deadline {
                        self.pending_timers.push(TimerRequest::Arm {
                            consumer: name.clone(),
                            at,
                        });
                    }
                }
                Transition::Stopped => {
                    info!(consumer = %name, "consumer stopped");
                    self.pending_timers.push(TimerRequest::Cancel {
                        consumer: name.clone(),
                    });
                }
                Transition::Changed => {}
            }
            // no subscribers is fine
            let _ = self.events.send(ConsumerStateChanged {
                consumer: name,
                state: consumer.state(),
                at: now,
            });
            persist(self.store.as_deref(), consumer);
        }
    }
}

fn persist(store: Option<&dyn StateStore>, consumer: &EnergyConsumer) {
    let Some(store) = store else {
        return;
    };
    if let Err(err) = consumer.snapshot().save(store, consumer.name()) {
        warn!(consumer = %consumer.name(), error = %err, "consumer state not persisted");
    }
}

/// Running load estimate shared by every decision of one cycle.
struct Projection<'a> {
    grid: &'a GridMonitor,
    now: Timestamp,
    dynamic_net_change: f64,
    /// Peak loads admitted minus loads evicted so far.
    committed: f64,
    /// Headroom kept for running consumers still ramping towards their peak.
    ramp_reserve: f64,
}

impl Projection<'_> {
    fn load(&self, frame: LoadTimeFrame) -> f64 {
        self.grid.load_for_frame(frame, self.now) + self.dynamic_net_change + self.committed
    }

    fn reserved(&self, frame: LoadTimeFrame) -> f64 {
        self.load(frame) + self.ramp_reserve
    }
}

fn ramp_reserve(consumers: &[EnergyConsumer]) -> f64 {
    consumers
        .iter()
        .filter(|consumer| consumer.is_running())
        .map(|consumer| (consumer.peak_load() - consumer.current_load()).max(0.0))
        .sum()
}

/// Slack of running dynamic consumers balancing on behalf of `target`'s groups,
/// corrected by the whole cycle's rebalancing and floored at zero.
fn releasable_for(consumers: &[EnergyConsumer], target: usize, dynamic_net_change: f64) -> f64 {
    let groups = consumers[target].groups();
    let slack: f64 = consumers
        .iter()
        .enumerate()
        .filter(|(index, consumer)| *index != target && consumer.is_running())
        .filter_map(|(_, consumer)| {
            let dynamic = consumer.dynamic()?;
            dynamic
                .balances_for(groups)
                .then(|| dynamic.releasable_power(consumer.current_load()).max(0.0))
        })
        .sum();
    (slack + dynamic_net_change).max(0.0)
}

fn total_dynamic_slack(consumers: &[EnergyConsumer], dynamic_net_change: f64) -> f64 {
    let slack: f64 = consumers
        .iter()
        .filter(|consumer| consumer.is_running())
        .filter_map(|consumer| {
            consumer
                .dynamic()
                .map(|dynamic| dynamic.releasable_power(consumer.current_load()).max(0.0))
        })
        .sum();
    (slack + dynamic_net_change).max(0.0)
}

/// The instantaneous and one-minute estimates always gate a start; configured
/// frames are checked on top of them.
fn start_frames(configured: &[LoadTimeFrame]) -> Vec<LoadTimeFrame> {
    let mut frames = vec![LoadTimeFrame::Now, LoadTimeFrame::LastMinute];
    for &frame in configured {
        if !frames.contains(&frame) {
            frames.push(frame);
        }
    }
    frames
}

fn admission_pass(
    consumers: &mut [EnergyConsumer],
    projection: &mut Projection<'_>,
    touched: &mut [bool],
    state: ConsumerState,
    report: &mut CycleReport,
) {
    let peak = projection.grid.peak_load();
    for index in 0..consumers.len() {
        if touched[index] {
            continue;
        }
        let admit = {
            let consumer = &consumers[index];
            if consumer.state() != state || !consumer.can_start(projection.now) {
                continue;
            }
            let releasable = releasable_for(consumers, index, projection.dynamic_net_change);
            let policy = consumer.policy();
            start_frames(&policy.load_time_frames_on_start).into_iter().all(|frame| {
                let passes = if state == ConsumerState::CriticallyNeedsEnergy {
                    projection.reserved(frame) - releasable + consumer.peak_load() < peak
                } else if consumer.is_dynamic() {
                    projection.load(frame) - releasable < policy.switch_on_load
                } else {
                    projection.reserved(frame) - releasable < policy.switch_on_load
                };
                debug!(
                    consumer = %consumer.name(),
                    frame = ?frame,
                    load_w = projection.load(frame),
                    releasable_w = releasable,
                    passes,
                    "start frame evaluated"
                );
                passes
            })
        };
        if !admit {
            continue;
        }

        let consumer = &mut consumers[index];
        if consumer.request_start() {
            info!(
                consumer = %consumer.name(),
                state = %state,
                peak_w = consumer.peak_load(),
                "consumer admitted"
            );
            projection.committed += consumer.peak_load();
            touched[index] = true;
            report.started.push(consumer.name().to_string());
        }
    }
}

/// Consumers whose device no longer wants energy are stopped regardless of load.
fn stop_unwanted(
    consumers: &mut [EnergyConsumer],
    projection: &mut Projection<'_>,
    touched: &mut [bool],
    report: &mut CycleReport,
) {
    for (index, consumer) in consumers.iter_mut().enumerate() {
        if touched[index] || !consumer.is_running() || consumer.desired_state() != ConsumerState::Off {
            continue;
        }
        if consumer.request_stop("no longer needed", projection.now) {
            info!(consumer = %consumer.name(), "consumer stopped, device wants off");
            projection.committed -= consumer.current_load();
            touched[index] = true;
            report.stopped.push(consumer.name().to_string());
        }
    }
}

/// Running, undecided consumers by descending switch-off load.
fn eviction_order(consumers: &[EnergyConsumer], touched: &[bool]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..consumers.len())
        .filter(|&index| !touched[index] && consumers[index].is_running())
        .collect();
    order.sort_by(|&a, &b| {
        consumers[b]
            .policy()
            .switch_off_load
            .total_cmp(&consumers[a].policy().switch_off_load)
    });
    order
}

fn evict_above_switch_off(
    consumers: &mut [EnergyConsumer],
    order: &[usize],
    projection: &mut Projection<'_>,
    touched: &mut [bool],
    report: &mut CycleReport,
) {
    for &index in order {
        if touched[index] {
            continue;
        }
        let evict = {
            let consumer = &consumers[index];
            if !consumer.can_force_stop(projection.now) {
                continue;
            }
            let releasable = releasable_for(consumers, index, projection.dynamic_net_change);
            let threshold = consumer.policy().switch_off_load;
            consumer
                .policy()
                .load_time_frames_on_stop
                .iter()
                .all(|&frame| projection.load(frame) - releasable > threshold)
        };
        if !evict {
            continue;
        }

        let consumer = &mut consumers[index];
        if consumer.request_stop("above switch-off load", projection.now) {
            info!(
                consumer = %consumer.name(),
                switch_off_w = consumer.policy().switch_off_load,
                load_w = projection.load(LoadTimeFrame::Now),
                "consumer evicted"
            );
            projection.committed -= consumer.current_load();
            touched[index] = true;
            report.stopped.push(consumer.name().to_string());
        }
    }
}

fn evict_above_peak(
    consumers: &mut [EnergyConsumer],
    order: &[usize],
    projection: &mut Projection<'_>,
    touched: &mut [bool],
    report: &mut CycleReport,
) {
    let peak = projection.grid.peak_load();
    if projection.load(LoadTimeFrame::Now) <= peak {
        return;
    }
    if total_dynamic_slack(consumers, projection.dynamic_net_change) > 0.0 {
        debug!("above peak but dynamic consumers can still release power");
        return;
    }
    let dynamic_adjusted = projection.dynamic_net_change != 0.0;
    for &index in order {
        if projection.load(LoadTimeFrame::Now) <= peak {
            break;
        }
        let consumer = &mut consumers[index];
        if touched[index] || !consumer.can_force_stop_on_peak_load(projection.now) {
            continue;
        }
        if dynamic_adjusted && consumer.is_dynamic() {
            continue;
        }
        if consumer.request_stop("peak load exceeded", projection.now) {
            warn!(
                consumer = %consumer.name(),
                load_w = projection.load(LoadTimeFrame::Now),
                peak_w = peak,
                "emergency stop to protect peak"
            );
            projection.committed -= consumer.current_load();
            touched[index] = true;
            report.stopped.push(consumer.name().to_string());
        }
    }
}
