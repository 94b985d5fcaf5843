//! Store adapter: connection handle, collection bootstrap, index
//! declaration, and the raw operations the engine issues.
//!
//! Everything here is a single driver call with no business logic; the
//! lifecycle rules live in [`crate::queue`].

use std::fmt;
use std::time::Duration;

use bson::oid::ObjectId;
use bson::{DateTime, Document, doc};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, Database, IndexModel};

use crate::errors::{Error, Result};
use crate::schema::QueueItem;

/// Database used when the connection string does not name one.
const DEFAULT_DATABASE: &str = "docq";

/// Interval between keep-alive checks against the server topology.
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_millis(20_000);

/// Server error code raised when the collection already exists.
const NAMESPACE_EXISTS: i32 = 48;

/// Connection parameters for [`Store::connect`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    keep_alive: Duration,
    server_selection_timeout: Option<Duration>,
    database: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            keep_alive: DEFAULT_KEEP_ALIVE,
            server_selection_timeout: None,
            database: None,
        }
    }
}

impl StoreOptions {
    /// Set the interval between keep-alive checks (default 20 seconds).
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set how long to wait for a usable server before giving up.
    pub fn server_selection_timeout(mut self, timeout: Duration) -> Self {
        self.server_selection_timeout = Some(timeout);
        self
    }

    /// Set the database name, overriding the one in the connection string.
    pub fn database(mut self, name: impl Into<String>) -> Self {
        self.database = Some(name.into());
        self
    }
}

/// Explicit connection handle to the backing document store.
///
/// All queues derive from a `Store`; the connection is established in
/// [`Store::connect`] and torn down in [`Store::close`]. The driver
/// re-establishes dropped connections on its own.
#[derive(Clone)]
pub struct Store {
    client: Client,
    database: Database,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("database", &self.database.name())
            .finish()
    }
}

impl Store {
    /// Connect to `uri` and verify that the target is reachable.
    ///
    /// Unreachable or unauthorized targets fail here with
    /// [`Error::Connection`] rather than on the first queue operation.
    pub async fn connect(uri: &str, options: StoreOptions) -> Result<Self> {
        let mut client_options = ClientOptions::parse(uri).await.map_err(Error::Connection)?;
        client_options.heartbeat_freq = Some(options.keep_alive);
        if let Some(timeout) = options.server_selection_timeout {
            client_options.server_selection_timeout = Some(timeout);
        }

        let client = Client::with_options(client_options).map_err(Error::Connection)?;
        let database = match options.database {
            Some(name) => client.database(&name),
            None => client
                .default_database()
                .unwrap_or_else(|| client.database(DEFAULT_DATABASE)),
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(Error::Connection)?;

        Ok(Self { client, database })
    }

    /// Handle to the underlying database, for introspection and tests.
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Shut the connection down, draining in-flight operations.
    pub async fn close(self) {
        self.client.shutdown().await;
    }
}

/// Resolve the queue collection, creating it on first use. Idempotent.
pub(crate) async fn ensure_collection(
    database: &Database,
    name: &str,
) -> Result<Collection<QueueItem>> {
    if let Err(error) = database.create_collection(name).await {
        match *error.kind {
            ErrorKind::Command(ref command_error) if command_error.code == NAMESPACE_EXISTS => {}
            _ => return Err(error.into()),
        }
    }
    Ok(database.collection(name))
}

/// Declare the indexes backing the claim predicate and completed-item
/// expiry. Safe to call when the indexes already exist.
pub(crate) async fn declare_indexes(
    collection: &Collection<QueueItem>,
    retention: Duration,
) -> Result<()> {
    collection.create_index(claim_order_index()).await?;
    collection.create_index(completed_ttl_index(retention)).await?;
    Ok(())
}

/// Composite index covering the claim predicate and its sort order.
fn claim_order_index() -> IndexModel {
    IndexModel::builder()
        .keys(doc! { "locked": 1, "complete": 1, "dead": 1, "priority": -1, "created_at": 1 })
        .options(IndexOptions::builder().name("claim_order".to_string()).build())
        .build()
}

/// TTL index expiring completed items after the retention window.
/// Documents without `completed_at` never expire.
fn completed_ttl_index(retention: Duration) -> IndexModel {
    IndexModel::builder()
        .keys(doc! { "completed_at": 1 })
        .options(
            IndexOptions::builder()
                .name("completed_ttl".to_string())
                .expire_after(retention)
                .build(),
        )
        .build()
}

/// Predicate matching items eligible for claiming.
fn claimable() -> Document {
    doc! { "locked": false, "complete": false, "dead": false }
}

/// Persist a new item.
pub(crate) async fn insert_item(
    collection: &Collection<QueueItem>,
    item: QueueItem,
) -> Result<QueueItem> {
    collection.insert_one(&item).await?;
    Ok(item)
}

/// Atomically claim the next eligible item: highest priority first, oldest
/// first within a priority tier.
///
/// Selection and lock are one conditional update, so concurrent callers
/// can never receive the same document.
pub(crate) async fn claim_next(collection: &Collection<QueueItem>) -> Result<Option<QueueItem>> {
    let update = doc! { "$set": { "locked": true, "locked_at": DateTime::now() } };
    let item = collection
        .find_one_and_update(claimable(), update)
        .sort(doc! { "priority": -1, "created_at": 1, "_id": 1 })
        .return_document(ReturnDocument::After)
        .await?;
    Ok(item)
}

/// Stamp an item complete, releasing any claim on it. Returns whether the
/// id matched a document.
pub(crate) async fn set_complete(
    collection: &Collection<QueueItem>,
    id: ObjectId,
) -> Result<bool> {
    let update = doc! {
        "$set": { "locked": false, "complete": true, "completed_at": DateTime::now() },
    };
    let result = collection.update_one(doc! { "_id": id }, update).await?;
    Ok(result.matched_count > 0)
}

/// Release an item's claim and count the failure, returning the updated
/// document so the caller sees the new retry count.
pub(crate) async fn record_failure(
    collection: &Collection<QueueItem>,
    id: ObjectId,
) -> Result<Option<QueueItem>> {
    let update = doc! {
        "$set": { "locked": false },
        "$unset": { "locked_at": "" },
        "$inc": { "retries": 1 },
    };
    let item = collection
        .find_one_and_update(doc! { "_id": id }, update)
        .return_document(ReturnDocument::After)
        .await?;
    Ok(item)
}

/// Set the dead-letter flag. Returns whether the id matched a document.
pub(crate) async fn set_dead(collection: &Collection<QueueItem>, id: ObjectId) -> Result<bool> {
    let update = doc! { "$set": { "dead": true } };
    let result = collection.update_one(doc! { "_id": id }, update).await?;
    Ok(result.matched_count > 0)
}

/// Return every item whose lease started at or before `cutoff` to the
/// pending pool. Returns the number of items released.
pub(crate) async fn release_expired(
    collection: &Collection<QueueItem>,
    cutoff: DateTime,
) -> Result<u64> {
    let filter = doc! { "locked": true, "locked_at": { "$lte": cutoff } };
    let update = doc! { "$set": { "locked": false }, "$unset": { "locked_at": "" } };
    let result = collection.update_many(filter, update).await?;
    Ok(result.modified_count)
}

/// Delete all completed items, returning the count removed.
pub(crate) async fn delete_completed(collection: &Collection<QueueItem>) -> Result<u64> {
    let result = collection.delete_many(doc! { "complete": true }).await?;
    Ok(result.deleted_count)
}

/// Delete all dead-lettered items, returning the count removed.
pub(crate) async fn delete_dead(collection: &Collection<QueueItem>) -> Result<u64> {
    let result = collection.delete_many(doc! { "dead": true }).await?;
    Ok(result.deleted_count)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn claim_index_covers_predicate_and_sort() {
        let index = claim_order_index();

        let keys: Vec<_> = index.keys.keys().collect();
        assert_eq!(keys, ["locked", "complete", "dead", "priority", "created_at"]);
        assert_eq!(index.keys.get_i32("priority").unwrap(), -1);
        assert_eq!(index.keys.get_i32("created_at").unwrap(), 1);

        let options = index.options.unwrap();
        assert_eq!(options.name.as_deref(), Some("claim_order"));
        assert!(options.expire_after.is_none());
    }

    #[test]
    fn completed_index_expires_after_retention() {
        let retention = Duration::from_secs(604_800);
        let index = completed_ttl_index(retention);

        assert_eq!(index.keys.get_i32("completed_at").unwrap(), 1);

        let options = index.options.unwrap();
        assert_eq!(options.name.as_deref(), Some("completed_ttl"));
        assert_eq!(options.expire_after, Some(retention));
    }

    #[test]
    fn claimable_predicate_excludes_every_non_pending_state() {
        let predicate = claimable();

        assert!(!predicate.get_bool("locked").unwrap());
        assert!(!predicate.get_bool("complete").unwrap());
        assert!(!predicate.get_bool("dead").unwrap());
    }
}
