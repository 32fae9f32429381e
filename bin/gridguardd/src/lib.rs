//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Daemon wiring for the gridguard load scheduler."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Wiring shared by the `gridguardd` binary and the workspace integration tests.

use std::sync::Arc;

use anyhow::{Context, Result};
use gridguard_common::{AppConfig, Clock, PersistenceConfig};
use gridguard_core::{GuardHandle, GuardService, Scheduler, SchedulerMessage};
use gridguard_persistence::{JsonFileStateStore, MemoryStateStore, StateStore};
use gridguard_rt::RateLimiter;
use gridguard_sim::SimulatedSite;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Open the configured state store. A disabled store still keeps state for the process lifetime.
pub fn open_store(config: &PersistenceConfig) -> Result<Arc<dyn StateStore>> {
    if !config.enabled {
        info!("persistence disabled, keeping consumer state in memory");
        return Ok(Arc::new(MemoryStateStore::new()));
    }
    let store = JsonFileStateStore::open(&config.directory).with_context(|| {
        format!("unable to open state directory {}", config.directory.display())
    })?;
    info!(directory = %store.directory().display(), "file state store opened");
    Ok(Arc::new(store))
}

/// Running daemon: guard service, simulated telemetry feed and event logger.
#[derive(Debug)]
pub struct Daemon {
    guard: GuardHandle,
    site: Arc<SimulatedSite>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Build the simulated site, the scheduler and start every task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &AppConfig, store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let (site, bindings) = SimulatedSite::build(config).context("unable to build simulated site")?;
        let site = Arc::new(site);
        let scheduler = Scheduler::new(config, &bindings)
            .context("invalid consumer configuration")?
            .with_store(store);
        let guard = GuardService::spawn(scheduler, &config.scheduler, clock.clone());
        let (shutdown, _) = broadcast::channel(1);

        let telemetry = spawn_telemetry(
            site.clone(),
            guard.sender(),
            clock,
            RateLimiter::new(config.scheduler.guard_interval),
            shutdown.subscribe(),
        );
        let events = spawn_event_log(&guard, shutdown.subscribe());
        info!(consumers = config.consumers.len(), "daemon started");

        Ok(Self {
            guard,
            site,
            shutdown,
            tasks: vec![telemetry, events],
        })
    }

    pub fn guard(&self) -> &GuardHandle {
        &self.guard
    }

    pub fn site(&self) -> &Arc<SimulatedSite> {
        &self.site
    }

    /// Stop the feed tasks first, then the guard service.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        for result in futures::future::join_all(self.tasks).await {
            if let Err(err) = result {
                warn!(error = %err, "daemon task ended abnormally");
            }
        }
        self.guard.shutdown().await?;
        info!("daemon stopped");
        Ok(())
    }
}

fn spawn_telemetry(
    site: Arc<SimulatedSite>,
    sender: tokio::sync::mpsc::Sender<SchedulerMessage>,
    clock: Arc<dyn Clock>,
    mut limiter: RateLimiter,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = limiter.tick() => {
                    let reading = site.sample(clock.now());
                    debug!(
                        import_w = reading.import_power.unwrap_or_default(),
                        export_w = reading.export_power.unwrap_or_default(),
                        "simulated reading"
                    );
                    if sender.send(SchedulerMessage::Telemetry(reading)).await.is_err() {
                        warn!("guard service gone, telemetry feed stopping");
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_event_log(guard: &GuardHandle, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
    let mut events = guard.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => match event {
                    Ok(event) => info!(consumer = %event.consumer, state = %event.state, "consumer state changed"),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "state events dropped"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}
