//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the guard loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

/// Keyed one-shot timers. Arming a key replaces (and aborts) its previous timer.
#[derive(Debug)]
pub struct TimerRegistry<K>
where
    K: Eq + Hash + Clone + Debug,
{
    timers: Mutex<HashMap<K, JoinHandle<()>>>,
}

impl<K> Default for TimerRegistry<K>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self {
            timers: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> TimerRegistry<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `on_fire` after `delay` unless the key is re-armed or cancelled first.
    pub fn arm<F>(&self, key: K, delay: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            on_fire();
        });
        let mut timers = self.timers.lock();
        timers.retain(|_, existing| !existing.is_finished());
        if let Some(previous) = timers.insert(key.clone(), handle) {
            previous.abort();
            debug!(timer = ?key, "timer replaced");
        }
    }

    pub fn cancel(&self, key: &K) -> bool {
        match self.timers.lock().remove(key) {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let drained: Vec<(K, JoinHandle<()>)> = self.timers.lock().drain().collect();
        for (key, handle) in drained {
            handle.abort();
            debug!(timer = ?key, "timer cancelled");
        }
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.timers
            .lock()
            .get(key)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn armed_count(&self) -> usize {
        self.timers
            .lock()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

impl<K> Drop for TimerRegistry<K>
where
    K: Eq + Hash + Clone + Debug,
{
    fn drop(&mut self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rearming_leaves_no_orphan() {
        let fired = Arc::new(AtomicUsize::new(0));
        let registry = TimerRegistry::new();

        let first = fired.clone();
        registry.arm("boiler", Duration::from_millis(30), move || {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = fired.clone();
        registry.arm("boiler", Duration::from_millis(60), move || {
            second.fetch_add(10, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
        assert!(!registry.is_armed(&"boiler"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_all_stops_pending_timers() {
        let fired = Arc::new(AtomicUsize::new(0));
        let registry = TimerRegistry::new();
        for key in ["a", "b", "c"] {
            let fired = fired.clone();
            registry.arm(key, Duration::from_millis(40), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(registry.armed_count(), 3);
        assert!(registry.cancel(&"a"));
        registry.cancel_all();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(registry.armed_count(), 0);
    }
}
