//! Queue document definitions.
//!
//! One BSON document per enqueued item. The lifecycle flags (`locked`,
//! `complete`, `dead`) describe exactly one effective state at any instant;
//! [`QueueItem::state`] derives it with the documented precedence.

use bson::oid::ObjectId;
use bson::{Bson, DateTime};
use serde::{Deserialize, Serialize};

/// Priority assigned to items enqueued without an explicit one.
pub const DEFAULT_PRIORITY: i32 = 1;

/// A single queued item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique identifier, generated on enqueue; immutable.
    #[serde(rename = "_id")]
    pub id: ObjectId,
    /// Producer-supplied payload; never interpreted by the engine.
    pub message: Bson,
    /// Higher priorities are claimed first.
    pub priority: i32,
    /// Enqueue timestamp; immutable.
    pub created_at: DateTime,
    /// True while a worker holds a claim on this item.
    pub locked: bool,
    /// When the current claim was taken; absent while unlocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime>,
    /// Number of recorded processing failures.
    pub retries: u32,
    /// Terminal success flag.
    pub complete: bool,
    /// Completion timestamp; set iff `complete`. Drives store-side expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime>,
    /// Terminal failure flag, set once the retry budget is exhausted.
    pub dead: bool,
}

impl QueueItem {
    /// Build a fresh pending item around `message`.
    pub(crate) fn new(message: Bson, priority: i32) -> Self {
        Self {
            id: ObjectId::new(),
            message,
            priority,
            created_at: DateTime::now(),
            locked: false,
            locked_at: None,
            retries: 0,
            complete: false,
            completed_at: None,
            dead: false,
        }
    }

    /// The effective lifecycle state derived from the flag fields.
    pub fn state(&self) -> ItemState {
        if self.dead {
            ItemState::Dead
        } else if self.complete {
            ItemState::Complete
        } else if self.locked {
            ItemState::Locked
        } else {
            ItemState::Pending
        }
    }
}

/// The four effective lifecycle states of a [`QueueItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Eligible for claiming.
    Pending,
    /// Claimed by a worker whose lease has not expired.
    Locked,
    /// Finished successfully; retained until store-side expiry.
    Complete,
    /// Retry budget exhausted; retained until purged explicitly.
    Dead,
}

/// The caller-facing slice of a claimed item.
///
/// Internal bookkeeping fields stay internal; completing or failing the
/// item only needs its identifier.
#[derive(Debug, Clone)]
pub struct ClaimedItem {
    /// Identifier to pass back to complete or fail the item.
    pub id: ObjectId,
    /// The opaque payload supplied at enqueue time.
    pub message: Bson,
}
