//! Drift-compensated polling loop.
//!
//! Each round measures how long its ticks took and sleeps for whatever is
//! left of the interval, never less than a small floor, so a slow node
//! stretches the period instead of causing a burst of back-to-back polls.

use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ScheduleMode;
use crate::poller::NodePoller;
use crate::rpc::JsonRpc;

/// Delay before the next round: the remainder of `interval` after
/// `elapsed`, but at least `floor`.
pub fn next_delay(interval: Duration, elapsed: Duration, floor: Duration) -> Duration {
    interval.saturating_sub(elapsed).max(floor)
}

/// Drives a set of node pollers until cancelled.
pub struct Scheduler<C> {
    pollers: Vec<NodePoller<C>>,
    mode: ScheduleMode,
    interval: Duration,
    min_delay: Duration,
}

impl<C: JsonRpc + 'static> Scheduler<C> {
    pub fn new(
        pollers: Vec<NodePoller<C>>,
        mode: ScheduleMode,
        interval: Duration,
        min_delay: Duration,
    ) -> Self {
        Self {
            pollers,
            mode,
            interval,
            min_delay,
        }
    }

    /// Runs the loop on a background task.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Runs until `cancel` fires. A tick in flight at cancellation is
    /// dropped; store updates are synchronous, so none is left half-applied.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            nodes = self.pollers.len(),
            mode = ?self.mode,
            interval = ?self.interval,
            "scheduler started",
        );

        match self.mode {
            ScheduleMode::Shared => {
                run_shared(self.pollers, self.interval, self.min_delay, cancel).await;
            }
            ScheduleMode::PerNode => {
                let handles: Vec<_> = self
                    .pollers
                    .into_iter()
                    .map(|poller| {
                        tokio::spawn(run_shared(
                            vec![poller],
                            self.interval,
                            self.min_delay,
                            cancel.clone(),
                        ))
                    })
                    .collect();

                for result in join_all(handles).await {
                    if let Err(e) = result {
                        error!(error = %e, "node polling task failed");
                    }
                }
            }
        }

        info!("scheduler stopped");
    }
}

/// Ticks every poller concurrently each round and waits for the slowest.
async fn run_shared<C: JsonRpc>(
    mut pollers: Vec<NodePoller<C>>,
    interval: Duration,
    min_delay: Duration,
    cancel: CancellationToken,
) {
    loop {
        let started = Instant::now();

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = join_all(pollers.iter_mut().map(|p| p.tick())) => {}
        }

        let elapsed = started.elapsed();
        if elapsed > interval {
            debug!(elapsed = ?elapsed, interval = ?interval, "poll round overran interval");
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(next_delay(interval, elapsed, min_delay)) => {}
        }
    }
}
