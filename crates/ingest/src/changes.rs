use std::sync::Arc;

use perch_core::event::{Channel, Event, EventBus, EventPayload, EventSource};
use perch_core::StoreChange;
use perch_store::EntityStore;
use tracing::{debug, trace};

use crate::error::IngestError;

const CHANNEL: &str = "plugin.store.changed";
const SOURCE: &str = "perch-ingest";

/// Drains the store's priority queue and republishes each batch as a
/// `plugin.store.changed` event, highest tier first.
pub struct ChangeFeed {
    store: Arc<EntityStore>,
    bus: Arc<dyn EventBus>,
    max_batch: usize,
}

impl ChangeFeed {
    pub const DEFAULT_MAX_BATCH: usize = 256;

    pub fn new(store: Arc<EntityStore>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            store,
            bus,
            max_batch: Self::DEFAULT_MAX_BATCH,
        }
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    /// Publish everything currently queued. Returns the number of changes.
    pub fn publish_pending(&self) -> Result<usize, IngestError> {
        let mut total = 0;
        loop {
            let changes = self.store.queue().drain(self.max_batch);
            if changes.is_empty() {
                return Ok(total);
            }
            total += changes.len();
            self.publish(changes)?;
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<(), IngestError> {
        debug!(max_batch = self.max_batch, "change feed started");
        loop {
            let changes = self.store.queue().recv(self.max_batch).await;
            self.publish(changes)?;
        }
    }

    fn publish(&self, changes: Vec<StoreChange>) -> Result<(), IngestError> {
        trace!(count = changes.len(), "publishing store changes");
        let event = Event::new(
            Channel::new(CHANNEL)?,
            EventSource::System(SOURCE.to_string()),
            EventPayload::StoreChanged { changes },
        );
        self.bus.publish(event)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use perch_core::event::BroadcastEventBus;
    use perch_core::model::{Chat, PresenceData, PresenceKind, PresenceRecord};
    use perch_core::Tier;
    use std::time::Duration;

    fn setup() -> (Arc<EntityStore>, Arc<BroadcastEventBus>, ChangeFeed) {
        let store = Arc::new(EntityStore::default());
        let bus = Arc::new(BroadcastEventBus::default());
        let feed = ChangeFeed::new(store.clone(), bus.clone()).with_max_batch(2);
        (store, bus, feed)
    }

    #[tokio::test]
    async fn publishes_pending_changes_in_batches() {
        let (store, bus, feed) = setup();
        let mut sub = bus.subscribe("plugin.store.**").unwrap();

        store.set_chat(Chat::new("1"));
        store.set_chat(Chat::new("2"));
        store.set_chat(Chat::new("3"));
        assert_eq!(feed.publish_pending().unwrap(), 3);
        assert!(store.queue().is_empty());

        let first = tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .expect("should receive event");
        assert_matches!(first.payload, EventPayload::StoreChanged { ref changes } if changes.len() == 2);
        let second = tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .expect("should receive event");
        assert_matches!(second.payload, EventPayload::StoreChanged { ref changes } if changes.len() == 1);
    }

    #[tokio::test]
    async fn run_forwards_core_changes_first() {
        let (store, bus, feed) = setup();
        let mut sub = bus.subscribe("plugin.store.changed").unwrap();

        store.set_presence(PresenceRecord {
            id: "1".into(),
            chat_id: "1".into(),
            presence: PresenceData {
                last_known_presence: PresenceKind::Available,
                last_seen: None,
            },
            updated_at: chrono::Utc::now(),
        });
        store.set_chat(Chat::new("1"));
        let handle = tokio::spawn(Arc::new(feed).run());

        let event = tokio::time::timeout(Duration::from_millis(200), sub.recv())
            .await
            .expect("timed out")
            .expect("should receive event");
        let EventPayload::StoreChanged { changes } = event.payload else {
            panic!("expected store change payload");
        };
        assert_eq!(changes[0].tier(), Tier::Core);
        assert_eq!(changes[1].tier(), Tier::Aux);
        handle.abort();
    }
}
