//! Background jobs driven by fixed intervals.

use super::Services;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSchedule {
    pub settlement_every: Duration,
    pub payouts_every: Duration,
    pub sweep_every: Duration,
    /// Age after which an `initiated` payment is queried at the gateway.
    pub stale_after: chrono::Duration,
}

impl Default for JobSchedule {
    fn default() -> Self {
        Self {
            settlement_every: Duration::from_secs(15 * 60),
            payouts_every: Duration::from_secs(60),
            sweep_every: Duration::from_secs(60),
            stale_after: chrono::Duration::minutes(5),
        }
    }
}

/// Owns the periodic tasks and stops them together.
pub struct JobSupervisor {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl JobSupervisor {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Runs `task` immediately and then every `interval` until shutdown.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, interval: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => task().await,
                }
            }
            debug!(job = name, "Job stopped");
        });
        info!(job = name, ?interval, "Job scheduled");
        self.handles.push(handle);
    }

    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Job task panicked");
            }
        }
    }
}

impl Default for JobSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for JobSupervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Starts settlement catch-up, payout passes and the stale-payment sweep.
pub fn start(services: &Services, schedule: JobSchedule) -> JobSupervisor {
    let mut supervisor = JobSupervisor::new();

    let settlement = services.settlement.clone();
    supervisor.spawn("settlement", schedule.settlement_every, move || {
        let settlement = settlement.clone();
        async move {
            if let Err(e) = settlement.settle_outstanding().await {
                error!(error = %e, "Scheduled settlement failed");
            }
        }
    });

    let payouts = services.payouts.clone();
    supervisor.spawn("payouts", schedule.payouts_every, move || {
        let payouts = payouts.clone();
        async move {
            if let Err(e) = payouts.run_due().await {
                error!(error = %e, "Payout pass failed");
            }
        }
    });

    let reconciler = services.reconciler.clone();
    let stale_after = schedule.stale_after;
    supervisor.spawn("stale-sweep", schedule.sweep_every, move || {
        let reconciler = reconciler.clone();
        async move {
            if let Err(e) = reconciler.sweep_stale(stale_after).await {
                error!(error = %e, "Stale payment sweep failed");
            }
        }
    });

    supervisor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_job_runs_on_each_tick_until_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut supervisor = JobSupervisor::new();
        let counter = runs.clone();
        supervisor.spawn("count", Duration::from_millis(20), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(70)).await;
        supervisor.shutdown().await;
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "ran {seen} times");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }
}
