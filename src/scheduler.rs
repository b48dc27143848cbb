//! Periodic task runner.
//!
//! Each registered job gets its own interval loop. The first tick fires
//! immediately, so every job runs once at startup. A job is never run twice
//! at the same time: a tick that arrives while the previous run is still in
//! flight is skipped. Job failures are logged and do not stop the loop.
//! Stopping the scheduler waits for runs that are already in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::JobError;

/// Period used when a job is registered with a zero period.
pub const MIN_PERIOD: Duration = Duration::from_secs(1);

/// A unit of periodic work.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<(), JobError>;
}

/// Clears the in-flight flag when a run ends, including by panic.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<(Duration, Arc<dyn ScheduledJob>)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` now and then every `period`. A zero period is raised to
    /// [`MIN_PERIOD`].
    #[must_use]
    pub fn every(mut self, period: Duration, job: Arc<dyn ScheduledJob>) -> Self {
        let period = if period.is_zero() {
            warn!(
                job = job.name(),
                min_period = ?MIN_PERIOD,
                "zero period requested, using minimum"
            );
            MIN_PERIOD
        } else {
            period
        };
        self.jobs.push((period, job));
        self
    }

    /// Spawn one timer loop per job.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, _) = broadcast::channel(1);
        let loops = self
            .jobs
            .into_iter()
            .map(|(period, job)| {
                info!(job = job.name(), period_secs = period.as_secs(), "scheduling job");
                tokio::spawn(run_loop(period, job, shutdown_tx.subscribe()))
            })
            .collect();
        SchedulerHandle { shutdown_tx, loops }
    }
}

async fn run_loop(
    period: Duration,
    job: Arc<dyn ScheduledJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let in_flight = Arc::new(AtomicBool::new(false));
    let mut current: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if in_flight.swap(true, Ordering::AcqRel) {
                    warn!(job = job.name(), "previous run still in flight, skipping tick");
                    continue;
                }
                let guard = InFlightGuard(Arc::clone(&in_flight));
                let job = Arc::clone(&job);
                current = Some(tokio::spawn(async move {
                    let _guard = guard;
                    debug!(job = job.name(), "job started");
                    match job.run().await {
                        Ok(()) => debug!(job = job.name(), "job finished"),
                        Err(e) => error!(job = job.name(), error = %e, "job failed"),
                    }
                }));
            }
            _ = shutdown_rx.recv() => {
                info!(job = job.name(), "scheduler loop shutting down");
                break;
            }
        }
    }

    if let Some(run) = current {
        if !run.is_finished() {
            info!(job = job.name(), "waiting for in-flight run");
        }
        if let Err(e) = run.await {
            error!(job = job.name(), error = %e, "job run ended abnormally");
        }
    }
}

/// Running scheduler; dropping it leaves the loops running.
pub struct SchedulerHandle {
    shutdown_tx: broadcast::Sender<()>,
    loops: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop all timer loops and wait for runs already in flight.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.loops {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler loop ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{advance, sleep};

    /// Counts runs; optionally sleeps or fails.
    struct CountingJob {
        runs: AtomicUsize,
        finished: AtomicUsize,
        work: Duration,
        fail: bool,
    }

    impl CountingJob {
        fn new(work: Duration, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                work,
                fail,
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }

        fn finished(&self) -> usize {
            self.finished.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ScheduledJob for CountingJob {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if !self.work.is_zero() {
                sleep(self.work).await;
            }
            self.finished.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(JobError::SyncAborted("boom".into()));
            }
            Ok(())
        }
    }

    /// Let spawned tasks make progress without moving the paused clock.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_immediately_then_on_interval() {
        let job = CountingJob::new(Duration::ZERO, false);
        let handle = Scheduler::new()
            .every(Duration::from_secs(300), job.clone())
            .start();

        settle().await;
        assert_eq!(job.runs(), 1);

        advance(Duration::from_secs(299)).await;
        settle().await;
        assert_eq!(job.runs(), 1);

        advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(job.runs(), 2);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_tick_is_skipped() {
        // each run takes 1.5 periods
        let job = CountingJob::new(Duration::from_secs(15), false);
        let handle = Scheduler::new()
            .every(Duration::from_secs(10), job.clone())
            .start();

        settle().await;
        assert_eq!(job.runs(), 1);

        // tick at t=10 arrives mid-run: skipped
        advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(job.runs(), 1);

        // run ends at t=15
        advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(job.runs(), 1);

        // next tick at t=20 proceeds
        advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(job.runs(), 2);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_schedule() {
        let failing = CountingJob::new(Duration::ZERO, true);
        let healthy = CountingJob::new(Duration::ZERO, false);
        let handle = Scheduler::new()
            .every(Duration::from_secs(5), failing.clone())
            .every(Duration::from_secs(60), healthy.clone())
            .start();

        settle().await;
        for _ in 0..12 {
            advance(Duration::from_secs(5)).await;
            settle().await;
        }
        assert_eq!(failing.runs(), 13);
        assert_eq!(healthy.runs(), 2);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_loops() {
        let job = CountingJob::new(Duration::ZERO, false);
        let handle = Scheduler::new()
            .every(Duration::from_secs(1), job.clone())
            .start();
        settle().await;
        handle.stop().await;

        let runs = job.runs();
        advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(job.runs(), runs);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_run() {
        let job = CountingJob::new(Duration::from_secs(30), false);
        let handle = Scheduler::new()
            .every(Duration::from_secs(60), job.clone())
            .start();
        settle().await;
        assert_eq!(job.runs(), 1);
        assert_eq!(job.finished(), 0);

        handle.stop().await;
        assert_eq!(job.finished(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_is_raised_to_minimum() {
        let job = CountingJob::new(Duration::ZERO, false);
        let handle = Scheduler::new().every(Duration::ZERO, job.clone()).start();
        settle().await;
        assert_eq!(job.runs(), 1);

        advance(MIN_PERIOD).await;
        settle().await;
        assert_eq!(job.runs(), 2);

        handle.stop().await;
    }
}
