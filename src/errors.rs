use bson::oid::ObjectId;

/// Convenience alias for results produced by queue operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the queue engine and the store adapter.
///
/// An empty queue is not an error: [`Queue::claim`](crate::Queue::claim)
/// signals it with `Ok(None)`.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The message payload was empty or absent.
    #[error("message payload must not be empty")]
    EmptyMessage,

    /// An operate-by-id call did not match any stored item.
    #[error("no queue item found for id {0}")]
    NotFound(ObjectId),

    /// The store was unreachable or refused the connection.
    #[error("failed to connect to the document store")]
    Connection(#[source] mongodb::error::Error),

    /// Any other store-level failure, propagated unchanged. The engine does
    /// not retry store calls; retry policy belongs to the caller.
    #[error(transparent)]
    Store(#[from] mongodb::error::Error),
}
