#![forbid(unsafe_code)]

use crate::queue::{QueryQueue, ReapReport};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Polling loop of one worker process: sweep, then dispatch pending work.
pub struct Worker {
    queue: QueryQueue,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(queue: QueryQueue) -> Self {
        let poll_interval = queue.config().poll_interval;
        Self {
            queue,
            poll_interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            queue = %self.queue.name(),
            process_uid = %self.queue.process_uid(),
            poll_ms = self.poll_interval.as_millis() as u64,
            "Worker started"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }
        info!(queue = %self.queue.name(), "Worker stopped");
    }

    pub async fn tick(&self) {
        match self.queue.reap().await {
            Ok(report) if report != ReapReport::default() => {
                debug!(
                    queue = %self.queue.name(),
                    orphaned = report.orphaned,
                    requeued = report.requeued,
                    failed = report.failed,
                    expired_results = report.expired_results,
                    "Reaper pass"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(queue = %self.queue.name(), error = %err, "Reaper pass failed"),
        }
        if let Err(err) = self.queue.reconcile_queue().await {
            warn!(queue = %self.queue.name(), error = %err, "Reconcile failed");
        }
    }
}
