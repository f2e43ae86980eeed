//! Saved-link synchronisation.
//!
//! Clients keep their own copy of the saved-links collection and push their
//! changes here. The collection lives in a single JSON object in the bucket
//! and is only ever rewritten through [`SyncCoordinator`], which uses
//! conditional writes instead of a lock so any number of server instances
//! can sync at the same time without losing updates.

mod coordinator;
pub mod error;
mod record;

pub use crate::coordinator::{
    Backoff, DEFAULT_MAX_RETRIES, SAVED_LINKS_KEY, Sleeper, SyncCoordinator, SyncRequest, SyncResponse, TokioSleeper,
};
pub use crate::record::{SavedLinkRecord, merge, parse_timestamp};
