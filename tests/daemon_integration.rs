//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Integration and validation tests for the gridguard stack."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Local, TimeZone};
use gridguard_common::{AppConfig, ManualClock};
use gridguard_persistence::{JsonFileStateStore, StateStore};
use gridguardd::{open_store, Daemon};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;

fn fast_example(state_dir: &Path) -> AppConfig {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/gridguard.toml");
    let mut config = AppConfig::from_path(&path).expect("example config loads");
    config.scheduler.guard_interval = Duration::from_millis(20);
    config.scheduler.debounce = Duration::ZERO;
    config.scheduler.minimum_change_interval = Duration::ZERO;
    config.persistence.directory = state_dir.to_path_buf();
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simulated_midday_surplus_starts_consumers_and_persists_state() -> Result<()> {
    let state_dir = tempfile::tempdir()?;
    let config = fast_example(state_dir.path());
    // Monday, early afternoon: every window is open and the sun is up
    let midday = Local
        .with_ymd_and_hms(2024, 6, 3, 13, 0, 0)
        .single()
        .expect("unambiguous local time");
    let clock = Arc::new(ManualClock::new(midday));

    let daemon = Daemon::start(&config, open_store(&config.persistence)?, clock)?;
    let mut reports = daemon.guard().subscribe_reports();
    let report = timeout(Duration::from_secs(5), async {
        loop {
            match reports.recv().await {
                Ok(report) if !report.started.is_empty() => return report,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("report channel closed"),
            }
        }
    })
    .await?;
    assert_eq!(report.started.first().map(String::as_str), Some("dishwasher"));
    assert!(daemon
        .site()
        .socket("dishwasher")
        .is_some_and(|socket| socket.is_on()));

    daemon.shutdown().await?;

    let store = JsonFileStateStore::open(state_dir.path())?;
    assert!(store.load_state("consumer.dishwasher")?.is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_is_prompt() -> Result<()> {
    let state_dir = tempfile::tempdir()?;
    let mut config = fast_example(state_dir.path());
    config.persistence.enabled = false;
    let clock = Arc::new(ManualClock::new(Local::now()));

    let daemon = Daemon::start(&config, open_store(&config.persistence)?, clock)?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    timeout(Duration::from_secs(2), daemon.shutdown()).await??;
    Ok(())
}
