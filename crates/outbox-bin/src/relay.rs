//! Relay loop: periodic polling plus bounded concurrent dispatch.

use outbox_config_and_utils::{RetryConfig, WorkerConfig};
use outbox_delivery::{Claimer, Dispatcher, RelayResult, RetryPolicy};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Base delay between tries of a dispatch that hit a storage error.
const JOB_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Build the delivery retry policy from configuration.
pub fn retry_policy(retry: &RetryConfig) -> RetryPolicy {
    RetryPolicy {
        max_attempts: retry.max_attempts,
        backoff_base: Duration::from_secs(retry.base_backoff_seconds),
        backoff_max: Duration::from_secs(retry.max_backoff_seconds),
        stale_after: Duration::from_secs(retry.stale_processing_seconds),
    }
}

/// Loop settings.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub poll_interval: Duration,
    pub batch_limit: usize,
    pub concurrency: usize,
    pub job_retries: u32,
    pub job_retry_delay: Duration,
}

impl RelaySettings {
    pub fn from_config(worker: &WorkerConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(worker.poll_interval_ms.max(1)),
            batch_limit: worker.batch_limit.max(1),
            concurrency: worker.concurrency.max(1),
            job_retries: worker.job_retries,
            job_retry_delay: JOB_RETRY_DELAY,
        }
    }
}

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub ticks: u64,
    pub claimed: u64,
    pub jobs_finished: u64,
}

/// Ticks the claimer and fans claimed events out to dispatch tasks.
pub struct RelayLoop {
    claimer: Claimer,
    dispatcher: Dispatcher,
    settings: RelaySettings,
    permits: Arc<Semaphore>,
}

impl RelayLoop {
    pub fn new(claimer: Claimer, dispatcher: Dispatcher, settings: RelaySettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.concurrency));
        Self {
            claimer,
            dispatcher,
            settings,
            permits,
        }
    }

    /// Run until `shutdown` resolves, then wait for in-flight jobs.
    pub async fn run<F>(&self, shutdown: F) -> RelayStats
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut jobs = JoinSet::new();
        let mut stats = RelayStats::default();

        info!(
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            batch_limit = self.settings.batch_limit,
            concurrency = self.settings.concurrency,
            "Relay loop started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(in_flight = jobs.len(), "Relay loop received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    stats.ticks += 1;
                    stats.claimed += self.tick(&mut jobs).await as u64;
                }
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    record_join(joined, &mut stats);
                }
            }
        }

        while let Some(joined) = jobs.join_next().await {
            record_join(joined, &mut stats);
        }

        info!(
            ticks = stats.ticks,
            claimed = stats.claimed,
            jobs = stats.jobs_finished,
            "Relay loop stopped"
        );
        stats
    }

    /// One recovery-and-claim pass, dispatching every claimed event before
    /// returning.
    pub async fn poll_and_dispatch(&self, limit: usize) -> RelayResult<Vec<i64>> {
        let ids = self.claimer.poll(limit).await?;

        let mut jobs = JoinSet::new();
        for &id in &ids {
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };
            self.spawn_job(&mut jobs, id, permit);
        }
        let mut stats = RelayStats::default();
        while let Some(joined) = jobs.join_next().await {
            record_join(joined, &mut stats);
        }
        Ok(ids)
    }

    /// Claim no more rows than there are idle workers, then start a job
    /// for each. Returns the number claimed.
    async fn tick(&self, jobs: &mut JoinSet<()>) -> usize {
        let mut permits = Vec::new();
        while permits.len() < self.settings.batch_limit {
            match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }
        if permits.is_empty() {
            debug!("All workers busy; skipping poll");
            return 0;
        }

        match self.claimer.poll(permits.len()).await {
            Ok(ids) => {
                let claimed = ids.len();
                // Unused permits go back to the semaphore on drop
                for (id, permit) in ids.into_iter().zip(permits) {
                    self.spawn_job(jobs, id, permit);
                }
                claimed
            }
            Err(e) => {
                warn!(error = %e, "Poll failed; retrying next tick");
                0
            }
        }
    }

    /// Start a job holding `permit` until the row is resolved.
    fn spawn_job(&self, jobs: &mut JoinSet<()>, id: i64, permit: OwnedSemaphorePermit) {
        let dispatcher = self.dispatcher.clone();
        let retries = self.settings.job_retries;
        let retry_delay = self.settings.job_retry_delay;

        jobs.spawn(async move {
            let _permit = permit;

            // The dispatch runs in its own task so a panic surfaces here as a
            // JoinError instead of tearing down the loop.
            let worker = dispatcher.clone();
            let handle = tokio::spawn(async move {
                run_job(&worker, id, retries, retry_delay).await;
            });

            if let Err(e) = handle.await {
                let message = format!("dispatch task failed: {}", e);
                error!(event_id = id, error = %e, "Dispatch task crashed");
                report_failure(&dispatcher, id, &message).await;
            }
        });
    }
}

/// Dispatch one event, retrying storage errors before giving up.
async fn run_job(dispatcher: &Dispatcher, id: i64, retries: u32, retry_delay: Duration) {
    let mut tries: u32 = 0;
    loop {
        match dispatcher.dispatch(id).await {
            Ok(outcome) => {
                debug!(event_id = id, outcome = %outcome, "Dispatch finished");
                return;
            }
            Err(e) if tries < retries => {
                tries += 1;
                warn!(
                    event_id = id,
                    try_number = tries,
                    error = %e,
                    "Dispatch failed, retrying"
                );
                sleep(retry_delay.saturating_mul(tries)).await;
            }
            Err(e) => {
                error!(event_id = id, tries, error = %e, "Dispatch failed, giving up");
                report_failure(dispatcher, id, &e.to_string()).await;
                return;
            }
        }
    }
}

async fn report_failure(dispatcher: &Dispatcher, id: i64, message: &str) {
    match dispatcher.report_job_failure(id, message).await {
        Ok(resolution) => {
            debug!(event_id = id, resolution = ?resolution, "Job failure recorded");
        }
        Err(e) => {
            // Stale recovery picks the row up later
            error!(event_id = id, error = %e, "Could not record job failure");
        }
    }
}

fn record_join(joined: Result<(), tokio::task::JoinError>, stats: &mut RelayStats) {
    stats.jobs_finished += 1;
    if let Err(e) = joined {
        error!(error = %e, "Job supervisor task failed");
    }
}
