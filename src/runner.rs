use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::processor::Processor;
use crate::queue::Queue;
use crate::worker::Worker;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(60);

/// The worker runtime: polls a [`Queue`] with a fleet of workers and
/// dispatches claimed items to a [`Processor`].
///
/// Alongside the workers, one maintenance task periodically returns
/// expired leases to the pending pool, so items claimed by crashed
/// consumers become claimable again without operator involvement.
pub struct Runner<P: Processor> {
    queue: Queue,
    processor: Arc<P>,
    context: P::Context,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    reclaim_interval: Duration,
    shutdown_when_queue_empty: bool,
}

impl<P: Processor> fmt::Debug for Runner<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("queue", &self.queue)
            .field("num_workers", &self.num_workers)
            .field("poll_interval", &self.poll_interval)
            .field("jitter", &self.jitter)
            .field("reclaim_interval", &self.reclaim_interval)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<P: Processor> Runner<P> {
    /// Create a runner processing `queue` with `processor`.
    pub fn new(queue: Queue, processor: P, context: P::Context) -> Self {
        Self {
            queue,
            processor: Arc::new(processor),
            context,
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
            shutdown_when_queue_empty: false,
        }
    }

    /// Set the number of worker tasks.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often idle workers poll for new items.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to poll intervals.
    ///
    /// Jitter reduces thundering-herd effects when multiple workers poll
    /// simultaneously. The actual jitter applied is a random value between
    /// zero and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set how often expired leases are swept back to the pending pool.
    pub fn reclaim_interval(mut self, reclaim_interval: Duration) -> Self {
        self.reclaim_interval = reclaim_interval;
        self
    }

    /// Shut the workers down once the queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Start the workers and the lease-reclaim maintenance task.
    ///
    /// This returns a [`RunHandle`] which can be used to wait for the
    /// workers to shut down.
    pub fn start(&self) -> RunHandle {
        let mut handles = Vec::new();
        for i in 1..=self.num_workers {
            let name = format!("queue-worker-{i}");
            info!(worker.name = %name, "Starting worker…");

            let worker = Worker {
                queue: self.queue.clone(),
                context: self.context.clone(),
                processor: self.processor.clone(),
                shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                poll_interval: self.poll_interval,
                jitter: self.jitter,
            };

            let span = info_span!("worker", worker.name = %name);
            let handle = tokio::spawn(async move { worker.run().instrument(span).await });

            handles.push(handle);
        }

        let maintenance = start_maintenance(self.queue.clone(), self.reclaim_interval);

        RunHandle {
            handles,
            maintenance,
        }
    }
}

/// Periodically return expired leases to the pending pool. The first sweep
/// runs immediately, picking up items abandoned before this process
/// started.
fn start_maintenance(queue: Queue, interval: Duration) -> AbortHandle {
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match queue.reclaim_expired_leases(queue.release()).await {
                Ok(0) => {}
                Ok(count) => debug!(count, "Reclaimed expired leases"),
                Err(error) => warn!("Failed to reclaim expired leases: {error}"),
            }
        }
    });
    task.abort_handle()
}

/// Handle to a running queue-processing system.
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    maintenance: AbortHandle,
}

impl RunHandle {
    /// Wait for every worker to shut down, then stop the maintenance task.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Queue worker task panicked");
            }
        });
        self.maintenance.abort();
    }
}
