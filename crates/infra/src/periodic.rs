//! Fixed-interval background runner for maintenance jobs (reconciliation,
//! cache audit).

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, Instrument};

#[derive(Debug, Clone)]
pub struct PeriodicConfig {
    /// Name for logging
    pub name: String,
    pub interval: Duration,
    /// Run once right after spawning instead of waiting a full interval.
    pub run_immediately: bool,
}

impl PeriodicConfig {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            run_immediately: false,
        }
    }

    pub fn run_immediately(mut self) -> Self {
        self.run_immediately = true;
        self
    }
}

/// Runner statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PeriodicStats {
    pub runs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_duration_ms: u64,
}

/// Handle to control a running periodic task.
#[derive(Debug)]
pub struct PeriodicHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
    trigger: Arc<Notify>,
    stats: Arc<Mutex<PeriodicStats>>,
}

impl PeriodicHandle {
    /// Run the job now, without waiting for the next tick.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn stats(&self) -> PeriodicStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Stop after the current run (if any) finishes.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for PeriodicHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Spawn `job` on the current tokio runtime, once per `config.interval`.
///
/// A failing run is logged and counted; the schedule continues.
pub fn spawn_periodic<F, Fut, T, E>(config: PeriodicConfig, mut job: F) -> PeriodicHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send,
    T: std::fmt::Debug + Send,
    E: Display + Send,
{
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let trigger = Arc::new(Notify::new());
    let stats = Arc::new(Mutex::new(PeriodicStats::default()));

    let span = tracing::info_span!("periodic", task = %config.name);
    let task_trigger = trigger.clone();
    let task_stats = stats.clone();

    let join = tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if !config.run_immediately {
                // first tick completes immediately
                ticker.tick().await;
            }
            info!(interval_secs = config.interval.as_secs(), "periodic task started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {}
                    _ = task_trigger.notified() => debug!("triggered manually"),
                }

                let started = Instant::now();
                let result = job().await;
                let elapsed = started.elapsed();

                if let Ok(mut s) = task_stats.lock() {
                    s.runs += 1;
                    s.last_run_at = Some(Utc::now());
                    s.last_duration_ms = elapsed.as_millis() as u64;
                    match &result {
                        Ok(_) => {
                            s.succeeded += 1;
                            s.last_error = None;
                        }
                        Err(e) => {
                            s.failed += 1;
                            s.last_error = Some(e.to_string());
                        }
                    }
                }

                match result {
                    Ok(output) => debug!(?output, duration_ms = elapsed.as_millis() as u64, "run finished"),
                    Err(e) => error!(error = %e, "run failed"),
                }
            }

            info!("periodic task stopped");
        }
        .instrument(span),
    );

    PeriodicHandle {
        shutdown: Some(shutdown_tx),
        join: Some(join),
        trigger,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn runs_on_schedule_and_counts_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handle = spawn_periodic(
            PeriodicConfig::new("test", Duration::from_millis(10)).run_immediately(),
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { if n % 2 == 0 { Ok(n) } else { Err(format!("odd run {n}")) } }
            },
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        let stats = handle.stats();
        handle.shutdown().await;

        assert!(stats.runs >= 2, "{stats:?}");
        assert_eq!(stats.runs, stats.succeeded + stats.failed);
        assert!(stats.failed >= 1);
        assert!(stats.last_run_at.is_some());
    }

    #[tokio::test]
    async fn trigger_runs_before_the_interval_elapses() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handle = spawn_periodic(PeriodicConfig::new("test", Duration::from_secs(3600)), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(()) }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        handle.trigger();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        handle.shutdown().await;
    }
}
