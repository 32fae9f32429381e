//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Consumer scheduling and load-balancing control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use gridguard_common::{BalancingMethod, ConsumerConfig, DynamicConfig, SchedulerConfig, SystemClock};
use gridguard_core::{
    ConsumerState, CycleReport, GridReading, GuardHandle, GuardService, Scheduler, SchedulerMessage,
    SiteBindings,
};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

fn service_config() -> SchedulerConfig {
    SchedulerConfig {
        guard_interval: Duration::from_millis(20),
        debounce: Duration::ZERO,
        minimum_change_interval: Duration::ZERO,
    }
}

fn spawn(consumers: Vec<(&str, ConsumerConfig)>, site: SiteBindings) -> GuardHandle {
    let scheduler = Scheduler::new(&config(consumers), &site).expect("scheduler builds");
    GuardService::spawn(scheduler, &service_config(), Arc::new(SystemClock))
}

async fn report_where<F>(reports: &mut broadcast::Receiver<CycleReport>, matches: F) -> CycleReport
where
    F: Fn(&CycleReport) -> bool,
{
    timeout(WAIT, async {
        loop {
            match reports.recv().await {
                Ok(report) if matches(&report) => return report,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("report channel closed"),
            }
        }
    })
    .await
    .expect("matching report before timeout")
}

async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached before timeout");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn surplus_admits_waiting_consumer() {
    let boiler = FakeSwitch::new(1500.0, ConsumerState::NeedsEnergy);
    let handle = spawn(
        vec![("boiler", ConsumerConfig::fixed(-1000.0, 200.0, 1500.0))],
        bindings(vec![("boiler", switch_binding(&boiler))]),
    );
    let mut reports = handle.subscribe_reports();
    let mut events = handle.subscribe();

    handle
        .send(SchedulerMessage::Telemetry(GridReading::net(0.0, 3000.0)))
        .await
        .unwrap();
    handle.send(SchedulerMessage::Trigger).await.unwrap();

    let report = report_where(&mut reports, |report| !report.started.is_empty()).await;
    assert_eq!(report.started, vec!["boiler".to_string()]);
    assert!(boiler.is_on());

    let running = timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if event.state == ConsumerState::Running => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("running event before timeout");
    assert_eq!(running.consumer, "boiler");

    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn settings_messages_reach_the_scheduler() {
    let car = FakeCharger::running_at(10.0);
    let handle = spawn(
        vec![("car", dynamic_config(DynamicConfig::default()))],
        bindings(vec![("car", charger_binding(&car))]),
    );

    // unknown consumer is rejected without stopping the loop
    handle
        .send(SchedulerMessage::SetBalancingMethod {
            consumer: "garage".into(),
            method: BalancingMethod::NearPeak,
        })
        .await
        .unwrap();
    handle
        .send(SchedulerMessage::SetBalancingMethod {
            consumer: "car".into(),
            method: BalancingMethod::NearPeak,
        })
        .await
        .unwrap();

    let scheduler = handle.scheduler();
    eventually(|| {
        scheduler
            .lock()
            .consumer("car")
            .and_then(|consumer| consumer.dynamic())
            .is_some_and(|dynamic| dynamic.balancing_method() == BalancingMethod::NearPeak)
    })
    .await;

    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runtime_limit_stops_consumer() {
    let boiler = FakeSwitch::new(1500.0, ConsumerState::NeedsEnergy);
    let mut consumer = ConsumerConfig::fixed(-1000.0, 200.0, 1500.0);
    consumer.maximum_runtime = Some(Duration::from_millis(300));
    consumer.minimum_timeout = Some(Duration::from_secs(3600));
    let handle = spawn(
        vec![("boiler", consumer)],
        bindings(vec![("boiler", switch_binding(&boiler))]),
    );
    let mut reports = handle.subscribe_reports();

    handle
        .send(SchedulerMessage::Telemetry(GridReading::net(0.0, 3000.0)))
        .await
        .unwrap();
    report_where(&mut reports, |report| !report.started.is_empty()).await;
    assert!(boiler.is_on());

    eventually(|| !boiler.is_on()).await;
    let scheduler = handle.scheduler();
    eventually(|| {
        scheduler
            .lock()
            .consumer("boiler")
            .is_some_and(|consumer| consumer.last_run().is_some())
    })
    .await;

    // minimum timeout keeps it off
    sleep(Duration::from_millis(100)).await;
    assert!(!boiler.is_on());

    handle.shutdown().await.unwrap();
}

// single-threaded so the loop only runs while this test awaits
#[tokio::test(flavor = "current_thread")]
async fn busy_scheduler_skips_the_cycle_without_replaying_it() {
    let boiler = FakeSwitch::new(1500.0, ConsumerState::NeedsEnergy);
    let scheduler = Scheduler::new(
        &config(vec![("boiler", ConsumerConfig::fixed(-1000.0, 200.0, 1500.0))]),
        &bindings(vec![("boiler", switch_binding(&boiler))]),
    )
    .expect("scheduler builds");
    let slow_ticks = SchedulerConfig {
        guard_interval: Duration::from_secs(3600),
        ..service_config()
    };
    let handle = GuardService::spawn(scheduler, &slow_ticks, Arc::new(SystemClock));
    let mut reports = handle.subscribe_reports();

    let shared = handle.scheduler();
    let held = shared.lock();
    handle.send(SchedulerMessage::Trigger).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(matches!(reports.try_recv(), Err(TryRecvError::Empty)));

    drop(held);
    sleep(Duration::from_millis(100)).await;
    assert!(matches!(reports.try_recv(), Err(TryRecvError::Empty)));

    handle.send(SchedulerMessage::Trigger).await.unwrap();
    report_where(&mut reports, |_| true).await;

    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_closes_the_input() {
    let boiler = FakeSwitch::new(1500.0, ConsumerState::Off);
    let handle = spawn(
        vec![("boiler", ConsumerConfig::fixed(-1000.0, 200.0, 1500.0))],
        bindings(vec![("boiler", switch_binding(&boiler))]),
    );
    let sender = handle.sender();

    handle.shutdown().await.unwrap();
    assert!(sender.send(SchedulerMessage::Trigger).await.is_err());
}
