use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bson::oid::ObjectId;
use futures_util::FutureExt;
use rand::Rng;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info_span, trace, warn};

use crate::processor::Processor;
use crate::queue::Queue;
use crate::util::try_to_extract_panic_info;

pub(crate) struct Worker<P: Processor> {
    pub(crate) queue: Queue,
    pub(crate) context: P::Context,
    pub(crate) processor: Arc<P>,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
}

impl<P: Processor> Worker<P> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Claim and process items forever, or until the queue is empty if
    /// `shutdown_when_queue_empty` is set.
    pub(crate) async fn run(&self) {
        loop {
            match self.run_next_item().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No claimable items found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No claimable items found. Polling again in {sleep_duration:?}…");
                    sleep(sleep_duration).await;
                }
                Err(error) => {
                    error!("Failed to process item: {error}");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Claim the next item and run the processor on it.
    ///
    /// Returns:
    /// - `Ok(Some(id))` if an item was claimed and acknowledged
    /// - `Ok(None)` if nothing was claimable
    /// - `Err(...)` if claiming or acknowledging failed
    async fn run_next_item(&self) -> crate::errors::Result<Option<ObjectId>> {
        trace!("Looking for the next claimable item…");

        let Some(item) = self.queue.claim().await? else {
            return Ok(None);
        };

        let span = info_span!("item", item.id = %item.id);
        let id = item.id;

        let context = self.context.clone();
        let result = AssertUnwindSafe(self.processor.process(item.message, context))
            .catch_unwind()
            .instrument(span.clone())
            .await
            .map_err(|panic| try_to_extract_panic_info(&*panic))
            // TODO: Replace with flatten() once that stabilizes
            .and_then(std::convert::identity);

        let _enter = span.enter();
        match result {
            Ok(()) => {
                debug!("Completing item…");
                self.queue.complete(id).await?;
            }
            Err(error) => {
                warn!("Failed to process item: {error}");
                self.queue.fail(id).await?;
            }
        }

        Ok(Some(id))
    }
}
