//! Periodic runner
//!
//! Runs an ingest job at a fixed interval, one run at a time. A run that
//! outlasts the interval delays the next one; missed ticks are skipped, never
//! queued. A failed run is logged and the schedule carries on.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::error::Result;
use crate::pipeline::{IngestPipeline, RunStats};

/// A unit of work the scheduler can repeat
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    async fn run_once(&self) -> Result<RunStats>;
}

#[async_trait]
impl ScheduledJob for IngestPipeline {
    async fn run_once(&self) -> Result<RunStats> {
        self.run().await
    }
}

/// Fixed-interval, non-overlapping scheduler
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    interval: Duration,
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run `job` immediately and then every interval until `shutdown`
    /// resolves. An in-flight run is allowed to finish. Returns the number of
    /// runs attempted.
    pub async fn run_until<F>(&self, job: &dyn ScheduledJob, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(interval_secs = self.interval.as_secs(), "Scheduler started");
        let mut runs = 0;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(runs, "Shutdown requested, scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    runs += 1;
                    if let Err(e) = job.run_once().await {
                        error!(run = runs, error = %e, "Ingest run failed, waiting for next interval");
                    }
                }
            }
        }

        runs
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingJob {
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        run_time: Duration,
    }

    #[async_trait]
    impl ScheduledJob for CountingJob {
        async fn run_once(&self) -> Result<RunStats> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.run_time).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if call == 0 {
                Err(IngestError::fetch(Some(500), "Internal Server Error"))
            } else {
                Ok(RunStats::default())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_run_does_not_stop_schedule() {
        let job = CountingJob::default();
        let scheduler = Scheduler::new(Duration::from_secs(10));

        let runs = scheduler
            .run_until(&job, tokio::time::sleep(Duration::from_secs(25)))
            .await;

        assert_eq!(runs, 3);
        assert_eq!(job.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_never_overlap() {
        let job = CountingJob {
            run_time: Duration::from_secs(15),
            ..CountingJob::default()
        };
        let scheduler = Scheduler::new(Duration::from_secs(10));

        let runs = scheduler
            .run_until(&job, tokio::time::sleep(Duration::from_secs(60)))
            .await;

        assert!(runs >= 2);
        assert_eq!(job.max_active.load(Ordering::SeqCst), 1);
    }
}
