//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Consumer scheduling and load-balancing control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use gridguard_common::{AllowBatteryPower, BalancingMethod, Clock, SchedulerConfig, Timestamp};
use gridguard_rt::{Debouncer, RateLimiter, TimerRegistry};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::events::{ConsumerStateChanged, TimerRequest};
use crate::grid::GridReading;
use crate::scheduler::{CycleReport, Scheduler};

const INPUT_CAPACITY: usize = 256;
const REPORT_CAPACITY: usize = 16;

/// Inputs accepted by the guard service.
#[derive(Debug, Clone)]
pub enum SchedulerMessage {
    Telemetry(GridReading),
    /// A device adapter observed a change worth a fresh cycle.
    ConsumerChanged(String),
    /// Auto-stop timer fired.
    RuntimeExpired(String),
    SetBalancingMethod {
        consumer: String,
        method: BalancingMethod,
    },
    SetBalanceOnBehalfOf {
        consumer: String,
        group: Option<String>,
    },
    SetAllowBatteryPower {
        consumer: String,
        allow: AllowBatteryPower,
    },
    /// Request a cycle.
    Trigger,
}

/// Spawns the guard loop around a [`Scheduler`].
#[derive(Debug)]
pub struct GuardService;

impl GuardService {
    /// Restore persisted state and start the loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(scheduler: Scheduler, config: &SchedulerConfig, clock: Arc<dyn Clock>) -> GuardHandle {
        let events = scheduler.event_sender();
        let scheduler = Arc::new(Mutex::new(scheduler));
        scheduler.lock().restore_state(clock.now());

        let (input_tx, mut input_rx) = mpsc::channel(INPUT_CAPACITY);
        let (report_tx, _) = broadcast::channel(REPORT_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

        let cycle = Arc::new(GuardCycle {
            scheduler: scheduler.clone(),
            clock,
            timers: TimerRegistry::new(),
            input: input_tx.clone(),
            reports: report_tx.clone(),
        });
        let guard_interval = config.guard_interval;
        let debounce = config.debounce;

        let task = tokio::spawn(async move {
            let debounced = cycle.clone();
            let mut debouncer = Debouncer::new(debounce, move || debounced.run());
            let mut limiter = RateLimiter::new(guard_interval);
            info!(
                guard_interval_ms = guard_interval.as_millis() as u64,
                debounce_ms = debounce.as_millis() as u64,
                "guard service started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = limiter.tick() => debouncer.trigger(),
                    message = input_rx.recv() => match message {
                        Some(message) => cycle.handle(message, &debouncer),
                        None => break,
                    },
                }
            }

            debouncer.shutdown();
            cycle.timers.cancel_all();
            info!("guard service stopped");
        });

        GuardHandle {
            input: input_tx,
            events,
            reports: report_tx,
            shutdown: shutdown_tx,
            scheduler,
            task,
        }
    }
}

struct GuardCycle {
    scheduler: Arc<Mutex<Scheduler>>,
    clock: Arc<dyn Clock>,
    timers: TimerRegistry<String>,
    input: mpsc::Sender<SchedulerMessage>,
    reports: broadcast::Sender<CycleReport>,
}

impl GuardCycle {
    /// One debounced cycle. A cycle that finds the scheduler busy is skipped, not queued.
    fn run(&self) {
        let Some(mut scheduler) = self.scheduler.try_lock() else {
            warn!("guard cycle skipped, scheduler busy");
            return;
        };
        let now = self.clock.now();
        let report = scheduler.run_cycle(now);
        drop(scheduler);

        for request in &report.timers {
            self.apply_timer(request, now);
        }
        if report.changed() {
            info!(
                started = ?report.started,
                stopped = ?report.stopped,
                net_w = report.dynamic_net_change,
                "guard cycle changed consumers"
            );
        }
        let _ = self.reports.send(report);
    }

    fn apply_timer(&self, request: &TimerRequest, now: Timestamp) {
        match request {
            TimerRequest::Arm { consumer, at } => {
                let delay = (*at - now).to_std().unwrap_or(Duration::ZERO);
                let input = self.input.clone();
                let name = consumer.clone();
                self.timers.arm(consumer.clone(), delay, move || {
                    if let Err(err) = input.try_send(SchedulerMessage::RuntimeExpired(name)) {
                        warn!(error = %err, "runtime expiry not delivered");
                    }
                });
                debug!(consumer = %consumer, delay_s = delay.as_secs(), "auto-stop armed");
            }
            TimerRequest::Cancel { consumer } => {
                if self.timers.cancel(consumer) {
                    debug!(consumer = %consumer, "auto-stop cancelled");
                }
            }
        }
    }

    fn handle(&self, message: SchedulerMessage, debouncer: &Debouncer) {
        let now = self.clock.now();
        let outcome = match message {
            SchedulerMessage::Telemetry(reading) => {
                self.scheduler.lock().apply_telemetry(&reading, now);
                return;
            }
            SchedulerMessage::ConsumerChanged(consumer) => {
                debug!(consumer = %consumer, "consumer change signalled");
                Ok(())
            }
            SchedulerMessage::RuntimeExpired(consumer) => {
                let expired = self.scheduler.lock().expire_runtime(&consumer, now);
                expired.map(|_| ())
            }
            SchedulerMessage::SetBalancingMethod { consumer, method } => {
                self.scheduler.lock().set_balancing_method(&consumer, method)
            }
            SchedulerMessage::SetBalanceOnBehalfOf { consumer, group } => {
                self.scheduler.lock().set_balance_on_behalf_of(&consumer, group)
            }
            SchedulerMessage::SetAllowBatteryPower { consumer, allow } => {
                self.scheduler.lock().set_allow_battery_power(&consumer, allow)
            }
            SchedulerMessage::Trigger => Ok(()),
        };
        match outcome {
            Ok(()) => debouncer.trigger(),
            Err(err) => warn!(error = %err, "scheduler message rejected"),
        }
    }
}

/// Lifecycle handle for a running guard service.
#[derive(Debug)]
pub struct GuardHandle {
    input: mpsc::Sender<SchedulerMessage>,
    events: broadcast::Sender<ConsumerStateChanged>,
    reports: broadcast::Sender<CycleReport>,
    shutdown: broadcast::Sender<()>,
    scheduler: Arc<Mutex<Scheduler>>,
    task: JoinHandle<()>,
}

impl GuardHandle {
    pub fn sender(&self) -> mpsc::Sender<SchedulerMessage> {
        self.input.clone()
    }

    pub async fn send(&self, message: SchedulerMessage) -> Result<()> {
        self.input
            .send(message)
            .await
            .map_err(|_| CoreError::ServiceStopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsumerStateChanged> {
        self.events.subscribe()
    }

    pub fn subscribe_reports(&self) -> broadcast::Receiver<CycleReport> {
        self.reports.subscribe()
    }

    pub fn scheduler(&self) -> Arc<Mutex<Scheduler>> {
        self.scheduler.clone()
    }

    /// Stop the loop, drop pending debounced work and cancel every timer.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task.await?;
        info!("guard service shutdown complete");
        Ok(())
    }
}
