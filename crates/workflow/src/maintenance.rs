//! Memory index maintenance: one supervised repeating timer per namespace.
//!
//! Each registered namespace gets a loop that fires every `interval` and asks
//! the retrieval backend to reindex it. A cycle that is still running when
//! the next one is due makes that next one a skip, never a queued run.

use chrono::Utc;
use homunculus_core::event::{DomainEvent, EventBus};
use homunculus_core::memory::RetrievalBackend;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// How a maintenance cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    Failed,
    /// Another cycle for the namespace was still running.
    Skipped,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

struct Job {
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Clears the overlap flag even if the cycle future is dropped mid-flight.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
struct CycleRunner {
    backend: Arc<dyn RetrievalBackend>,
    timeout: Duration,
    events: Option<Arc<EventBus>>,
}

impl CycleRunner {
    async fn run(&self, namespace: &str, running: &Arc<AtomicBool>) -> CycleOutcome {
        let started = Instant::now();
        let outcome = if running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(namespace, "Maintenance cycle still running, skipping this one");
            CycleOutcome::Skipped
        } else {
            let _guard = RunningGuard(running.clone());
            match tokio::time::timeout(self.timeout, self.backend.reindex(namespace)).await {
                Ok(Ok(())) => CycleOutcome::Completed,
                Ok(Err(e)) => {
                    warn!(namespace, error = %e, "Maintenance cycle failed");
                    CycleOutcome::Failed
                }
                Err(_) => {
                    warn!(
                        namespace,
                        timeout_secs = self.timeout.as_secs(),
                        "Maintenance cycle timed out"
                    );
                    CycleOutcome::Failed
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        if outcome == CycleOutcome::Completed {
            info!(namespace, duration_ms, "Memory index maintenance completed");
        }
        if let Some(events) = &self.events {
            events.publish(DomainEvent::MaintenanceCycle {
                namespace: namespace.to_string(),
                outcome: outcome.as_str().to_string(),
                duration_ms,
                timestamp: Utc::now(),
            });
        }
        outcome
    }
}

pub struct MaintenanceScheduler {
    runner: CycleRunner,
    interval: Duration,
    jobs: RwLock<HashMap<String, Job>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl MaintenanceScheduler {
    pub fn new(backend: Arc<dyn RetrievalBackend>, interval: Duration, cycle_timeout: Duration) -> Self {
        Self {
            runner: CycleRunner {
                backend,
                timeout: cycle_timeout,
                events: None,
            },
            interval,
            jobs: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.runner.events = Some(events);
        self
    }

    /// Start the repeating timer for `namespace`. The first cycle runs right
    /// away. Returns `false` if the namespace was already registered.
    pub async fn register(&self, namespace: &str) -> bool {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(namespace) {
            return false;
        }

        let cancel = self.shutdown.child_token();
        let running = Arc::new(AtomicBool::new(false));
        let handle = self.tracker.spawn(Self::run_loop(
            self.runner.clone(),
            namespace.to_string(),
            self.interval,
            cancel.clone(),
            running.clone(),
        ));

        info!(namespace, interval_secs = self.interval.as_secs(), "Maintenance scheduled");
        jobs.insert(
            namespace.to_string(),
            Job {
                cancel,
                running,
                handle,
            },
        );
        true
    }

    /// Stop the timer for `namespace` and wait for its loop to exit, so no
    /// cycle for it is running once this returns.
    pub async fn unregister(&self, namespace: &str) -> bool {
        let Some(job) = self.jobs.write().await.remove(namespace) else {
            return false;
        };
        job.cancel.cancel();
        if let Err(e) = job.handle.await {
            warn!(namespace, error = %e, "Maintenance loop ended abnormally");
        }
        info!(namespace, "Maintenance unscheduled");
        true
    }

    /// Run one cycle now, honouring the overlap guard.
    pub async fn run_once(&self, namespace: &str) -> CycleOutcome {
        let running = self
            .jobs
            .read()
            .await
            .get(namespace)
            .map(|job| job.running.clone());
        match running {
            Some(running) => self.runner.run(namespace, &running).await,
            None => {
                debug!(namespace, "Namespace not registered for maintenance");
                CycleOutcome::Skipped
            }
        }
    }

    pub async fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancel every loop and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.jobs.write().await.clear();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Maintenance scheduler stopped");
    }

    async fn run_loop(
        runner: CycleRunner,
        namespace: String,
        period: Duration,
        cancel: CancellationToken,
        running: Arc<AtomicBool>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = runner.run(&namespace, &running) => {}
                    }
                }
            }
        }
        debug!(namespace = %namespace, "Maintenance loop exited");
    }
}
