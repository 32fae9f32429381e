//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the guard loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::trace;

type Action = Arc<dyn Fn() + Send + Sync>;

/// Coalesces bursts of triggers into a single execution.
///
/// Every trigger restarts the quiet period; the action runs once the period
/// elapses without another trigger. A zero delay runs the action synchronously
/// inside [`Debouncer::trigger`].
///
/// A non-zero delay spawns a tokio task, so construction must happen inside a runtime.
pub struct Debouncer {
    delay: Duration,
    action: Action,
    trigger_tx: Option<mpsc::UnboundedSender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Debouncer {
    pub fn new<F>(delay: Duration, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let action: Action = Arc::new(action);
        if delay.is_zero() {
            return Self {
                delay,
                action,
                trigger_tx: None,
                task: None,
            };
        }

        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel::<()>();
        let task_action = action.clone();
        let task = tokio::spawn(async move {
            while trigger_rx.recv().await.is_some() {
                loop {
                    tokio::select! {
                        _ = sleep(delay) => {
                            task_action();
                            break;
                        }
                        next = trigger_rx.recv() => {
                            if next.is_none() {
                                return;
                            }
                            trace!("debounce deadline reset");
                        }
                    }
                }
            }
        });

        Self {
            delay,
            action,
            trigger_tx: Some(trigger_tx),
            task: Some(task),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn trigger(&self) {
        match &self.trigger_tx {
            Some(tx) => {
                let _ = tx.send(());
            }
            None if self.task.is_none() && self.delay.is_zero() => (self.action)(),
            None => {}
        }
    }

    /// Drop any pending execution and stop accepting triggers.
    pub fn shutdown(&mut self) {
        self.trigger_tx.take();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.delay = Duration::MAX;
    }
}

impl fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debouncer")
            .field("delay", &self.delay)
            .field("running", &self.task.is_some())
            .finish()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn zero_delay_runs_synchronously() {
        let (count, action) = counter();
        let debouncer = Debouncer::new(Duration::ZERO, action);
        debouncer.trigger();
        debouncer.trigger();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn burst_collapses_into_one_execution() {
        let (count, action) = counter();
        let debouncer = Debouncer::new(Duration::from_millis(40), action);
        for _ in 0..5 {
            debouncer.trigger();
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        sleep(Duration::from_millis(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_discards_pending_trigger() {
        let (count, action) = counter();
        let mut debouncer = Debouncer::new(Duration::from_millis(30), action);
        debouncer.trigger();
        debouncer.shutdown();
        sleep(Duration::from_millis(80)).await;
        debouncer.trigger();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
