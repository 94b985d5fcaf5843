use std::fmt;
use std::time::Duration;

use bson::oid::ObjectId;
use bson::{Bson, DateTime};
use mongodb::Collection;
use tracing::{debug, instrument};

use crate::errors::{Error, Result};
use crate::schema::{ClaimedItem, DEFAULT_PRIORITY, QueueItem};
use crate::storage::{self, Store};

/// Name of the backing collection.
const DEFAULT_COLLECTION: &str = "queue";

/// Lease duration after which a claim counts as abandoned.
const DEFAULT_RELEASE: Duration = Duration::from_secs(30);

/// Failures after which an item is dead-lettered.
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Retention window for completed items before store-side expiry.
const DEFAULT_RETENTION: Duration = Duration::from_secs(604_800);

/// Tunables for a [`Queue`].
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub(crate) collection: String,
    pub(crate) release: Duration,
    pub(crate) max_retries: u32,
    pub(crate) retention: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            collection: DEFAULT_COLLECTION.into(),
            release: DEFAULT_RELEASE,
            max_retries: DEFAULT_MAX_RETRIES,
            retention: DEFAULT_RETENTION,
        }
    }
}

impl QueueOptions {
    /// Set the name of the backing collection (default `"queue"`).
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collection = name.into();
        self
    }

    /// Set the lease duration before a locked item may be reclaimed
    /// (default 30 seconds).
    pub fn release(mut self, release: Duration) -> Self {
        self.release = release;
        self
    }

    /// Set the number of failures after which an item is dead-lettered
    /// (default 5).
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the retention window for completed items (default 7 days).
    /// Enforced by the store's TTL expiry, not by the engine.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Handle to one durable queue.
///
/// All operations are single atomic writes against the shared collection;
/// the handle is cheap to clone and safe to use from any number of tasks,
/// threads, or processes concurrently. Mutual exclusion is enforced
/// entirely by the store.
#[derive(Clone)]
pub struct Queue {
    collection: Collection<QueueItem>,
    options: QueueOptions,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("collection", &self.collection.name())
            .field("options", &self.options)
            .finish()
    }
}

impl Queue {
    /// Bind a queue to `store`, bootstrapping the collection and its
    /// indexes. Safe to call when both already exist.
    pub async fn bind(store: &Store, options: QueueOptions) -> Result<Self> {
        let collection = storage::ensure_collection(store.database(), &options.collection).await?;
        storage::declare_indexes(&collection, options.retention).await?;
        Ok(Self { collection, options })
    }

    /// The lease duration configured for this queue.
    pub fn release(&self) -> Duration {
        self.options.release
    }

    /// Enqueue `message` at the default priority of 1.
    pub async fn enqueue(&self, message: Bson) -> Result<QueueItem> {
        self.enqueue_with_priority(message, DEFAULT_PRIORITY).await
    }

    /// Enqueue `message`; higher `priority` values are claimed first.
    ///
    /// Returns the stored item, including its assigned identifier. Fails
    /// with [`Error::EmptyMessage`] before touching the store if the
    /// payload carries nothing.
    #[instrument(name = "docq.enqueue", skip(self, message))]
    pub async fn enqueue_with_priority(&self, message: Bson, priority: i32) -> Result<QueueItem> {
        if is_empty_message(&message) {
            return Err(Error::EmptyMessage);
        }
        storage::insert_item(&self.collection, QueueItem::new(message, priority)).await
    }

    /// Atomically claim the next pending item and lock it.
    ///
    /// Items are selected by priority descending, then enqueue time
    /// ascending. `Ok(None)` means nothing is claimable right now; callers
    /// should poll with backoff rather than treat it as an error.
    #[instrument(name = "docq.claim", skip_all)]
    pub async fn claim(&self) -> Result<Option<ClaimedItem>> {
        let Some(item) = storage::claim_next(&self.collection).await? else {
            return Ok(None);
        };
        debug!(item.id = %item.id, "Claimed item");
        Ok(Some(ClaimedItem {
            id: item.id,
            message: item.message,
        }))
    }

    /// Mark an item complete and release its claim.
    ///
    /// No precondition on the current lock state: repeating the call is a
    /// safe no-op that re-stamps the completion time.
    #[instrument(name = "docq.complete", skip(self))]
    pub async fn complete(&self, id: ObjectId) -> Result<()> {
        if storage::set_complete(&self.collection, id).await? {
            Ok(())
        } else {
            Err(Error::NotFound(id))
        }
    }

    /// Record a failed processing attempt: the claim is released and the
    /// retry counter incremented. Once the counter reaches the configured
    /// budget the item is dead-lettered.
    ///
    /// The unlock and the dead-letter write are two separate atomic steps;
    /// in between, another worker may briefly claim the item one more
    /// time. The extra delivery stays within the at-least-once contract.
    #[instrument(name = "docq.fail", skip(self))]
    pub async fn fail(&self, id: ObjectId) -> Result<()> {
        let item = storage::record_failure(&self.collection, id)
            .await?
            .ok_or(Error::NotFound(id))?;

        if item.retries >= self.options.max_retries {
            debug!(retries = item.retries, "Retry budget exhausted, dead-lettering");
            self.mark_dead(id).await?;
        }
        Ok(())
    }

    /// Move an item to the dead-letter state, excluding it from future
    /// claims. Idempotent. Dead items are retained until purged.
    #[instrument(name = "docq.mark_dead", skip(self))]
    pub async fn mark_dead(&self, id: ObjectId) -> Result<()> {
        if storage::set_dead(&self.collection, id).await? {
            Ok(())
        } else {
            Err(Error::NotFound(id))
        }
    }

    /// Return every item that has been locked for longer than `lease` to
    /// the pending pool, and return how many were reclaimed.
    ///
    /// This is the crash-recovery path for workers that claimed an item
    /// and died before acknowledging it. Safe to run repeatedly and from
    /// several processes at once: each call only touches leases that have
    /// actually expired at call time.
    #[instrument(name = "docq.reclaim", skip(self))]
    pub async fn reclaim_expired_leases(&self, lease: Duration) -> Result<u64> {
        let lease_millis = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let cutoff =
            DateTime::from_millis(DateTime::now().timestamp_millis().saturating_sub(lease_millis));
        storage::release_expired(&self.collection, cutoff).await
    }

    /// Delete all completed items, returning the count removed.
    ///
    /// Manual escape hatch; the TTL expiry on `completed_at` is the
    /// primary cleanup path for completed items.
    #[instrument(name = "docq.purge_completed", skip_all)]
    pub async fn purge_completed(&self) -> Result<u64> {
        storage::delete_completed(&self.collection).await
    }

    /// Delete all dead-lettered items, returning the count removed.
    #[instrument(name = "docq.purge_dead", skip_all)]
    pub async fn purge_dead(&self) -> Result<u64> {
        storage::delete_dead(&self.collection).await
    }
}

/// A payload that carries nothing: BSON null/undefined, or an empty
/// string, document, or array.
fn is_empty_message(message: &Bson) -> bool {
    match message {
        Bson::Null | Bson::Undefined => true,
        Bson::String(value) => value.is_empty(),
        Bson::Document(value) => value.is_empty(),
        Bson::Array(value) => value.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::bson;

    #[test]
    fn empty_message_detection() {
        assert!(is_empty_message(&Bson::Null));
        assert!(is_empty_message(&Bson::Undefined));
        assert!(is_empty_message(&bson!("")));
        assert!(is_empty_message(&bson!({})));
        assert!(is_empty_message(&bson!([])));

        assert!(!is_empty_message(&bson!("work")));
        assert!(!is_empty_message(&bson!({ "kind": "email" })));
        assert!(!is_empty_message(&bson!([1, 2, 3])));
        assert!(!is_empty_message(&bson!(0)));
        assert!(!is_empty_message(&bson!(false)));
    }

    #[test]
    fn options_default_to_the_documented_values() {
        let options = QueueOptions::default();

        assert_eq!(options.collection, "queue");
        assert_eq!(options.release, Duration::from_secs(30));
        assert_eq!(options.max_retries, 5);
        assert_eq!(options.retention, Duration::from_secs(604_800));
    }
}
