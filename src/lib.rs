#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod errors;
mod processor;
mod queue;
mod runner;
/// Queue document definitions.
pub mod schema;
mod storage;
mod util;
mod worker;

/// Re-export of the BSON crate used for payloads and identifiers.
pub use bson;

/// Error type shared by all queue operations.
pub use self::errors::{Error, Result};
/// The trait consumer processes implement to handle claimed items.
pub use self::processor::Processor;
/// The queue lifecycle engine and its configuration.
pub use self::queue::{Queue, QueueOptions};
/// The worker runtime that polls a queue and dispatches to a processor.
pub use self::runner::{RunHandle, Runner};
/// The document store connection handle and its configuration.
pub use self::storage::{Store, StoreOptions};
