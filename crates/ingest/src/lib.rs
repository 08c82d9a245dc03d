//! Transport event ingestion for Perch.
//!
//! The [`IngestPipeline`] subscribes to `transport.**` on the event bus and
//! dispatches each event to its handler in [`handlers`]. Handlers write
//! through the shared [`EntityStore`](perch_store::EntityStore) held by the
//! [`BotContext`], hand new inbound messages to the [`TaskBatcher`], and
//! request group metadata from the [`GroupEnricher`] without awaiting it.

pub mod batcher;
pub mod changes;
pub mod context;
pub mod enrich;
pub mod error;
pub mod handlers;
pub mod pipeline;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use batcher::{BatchTask, TaskBatcher};
pub use changes::ChangeFeed;
pub use context::BotContext;
pub use enrich::{GroupEnricher, GroupMetadataFetcher, StaticGroupFetcher};
pub use error::{FetchError, IngestError};
pub use pipeline::IngestPipeline;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
