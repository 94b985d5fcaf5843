use bson::Bson;
use std::future::Future;

/// Consumer-side handler for claimed queue items.
///
/// The payload arrives exactly as it was enqueued; decoding it is the
/// processor's business. Returning an error, or panicking, records a
/// failed attempt against the item and consumes one retry.
pub trait Processor: Send + Sync + 'static {
    /// The application data provided to every processing attempt.
    type Context: Clone + Send + Sync + 'static;

    /// Process one claimed payload.
    fn process(
        &self,
        message: Bson,
        ctx: Self::Context,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}
