//! Cancellable periodic background tasks

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A group of periodic tasks sharing one shutdown signal
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Run `tick` every `interval` until [`shutdown`](Self::shutdown).
    /// The first run happens one interval after spawning.
    pub fn spawn_periodic<F, Fut>(&self, name: &str, interval: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut stop = self.shutdown.subscribe();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => tick().await,
                    changed = stop.changed() => {
                        if changed.is_err() {
                            debug!("{} lost its shutdown signal", task_name);
                            break;
                        }
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("{} stopped", task_name);
        });

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|(_, h)| !h.is_finished());
        handles.push((name.to_string(), handle));
    }

    /// Number of tasks still running
    pub fn running(&self) -> usize {
        let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// Signal every task to stop and wait up to `grace` for each; stragglers are aborted.
    /// The group can be reused afterwards.
    pub async fn shutdown(&self, grace: Duration) {
        let handles: Vec<(String, JoinHandle<()>)> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();

        self.shutdown.send_replace(true);
        for (name, mut handle) in handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("{} did not stop within {:?}, aborting", name, grace);
                handle.abort();
            }
        }
        self.shutdown.send_replace(false);
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_periodic_task_runs_and_stops() {
        let tasks = BackgroundTasks::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        tasks.spawn_periodic("counter", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        sleep(Duration::from_millis(60)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);
        assert_eq!(tasks.running(), 1);

        tasks.shutdown(Duration::from_millis(100)).await;
        assert_eq!(tasks.running(), 0);
        let after = count.load(Ordering::SeqCst);
        sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_slow_task_is_aborted() {
        let tasks = BackgroundTasks::new();
        tasks.spawn_periodic("sleeper", Duration::from_millis(5), || async {
            sleep(Duration::from_secs(60)).await;
        });
        sleep(Duration::from_millis(20)).await;

        let started = tokio::time::Instant::now();
        tasks.shutdown(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(tasks.running(), 0);
    }

    #[tokio::test]
    async fn test_reusable_after_shutdown() {
        let tasks = BackgroundTasks::new();
        tasks.shutdown(Duration::from_millis(10)).await;

        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        tasks.spawn_periodic("again", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        sleep(Duration::from_millis(50)).await;
        assert!(count.load(Ordering::SeqCst) >= 1);
        tasks.shutdown(Duration::from_millis(100)).await;
    }
}
