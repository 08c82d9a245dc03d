//! Group metadata enrichment.
//!
//! Group chats arrive without participant lists; the metadata is fetched from
//! the transport in a spawned task and merged into the store when it lands.
//! Each request makes one attempt. A failure leaves the chat pending until the
//! next event that asks for it again. Concurrent requests for the same group
//! share one fetch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use perch_core::jid;
use perch_core::model::{Chat, GroupMetadata};
use perch_core::WriteKind;
use perch_store::{keys, EntityStore};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::error::FetchError;
use crate::lock;

/// Fetches group metadata from the transport.
pub trait GroupMetadataFetcher: Send + Sync + 'static {
    fn fetch_group_metadata<'a>(
        &'a self,
        group_id: &'a str,
    ) -> BoxFuture<'a, Result<GroupMetadata, FetchError>>;
}

/// Serves metadata from a fixed set of groups. Used for replays, where there
/// is no live transport to ask.
#[derive(Debug, Default)]
pub struct StaticGroupFetcher {
    groups: RwLock<HashMap<String, GroupMetadata>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl StaticGroupFetcher {
    pub fn new(groups: impl IntoIterator<Item = GroupMetadata>) -> Self {
        let fetcher = Self::default();
        for group in groups {
            fetcher.insert(group);
        }
        fetcher
    }

    /// Delay every response, to keep fetches in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn insert(&self, group: GroupMetadata) {
        let id = jid::normalize(&group.id);
        self.groups
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, group);
    }

    /// Number of fetches served so far, successful or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl GroupMetadataFetcher for StaticGroupFetcher {
    fn fetch_group_metadata<'a>(
        &'a self,
        group_id: &'a str,
    ) -> BoxFuture<'a, Result<GroupMetadata, FetchError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.groups
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(&jid::normalize(group_id))
                .cloned()
                .ok_or_else(|| FetchError::NotFound(group_id.to_string()))
        })
    }
}

struct InFlight {
    groups: Arc<Mutex<HashSet<String>>>,
    group_id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.groups).remove(&self.group_id);
    }
}

pub struct GroupEnricher {
    store: Arc<EntityStore>,
    fetcher: Arc<dyn GroupMetadataFetcher>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    tasks: Mutex<JoinSet<()>>,
}

impl GroupEnricher {
    pub fn new(store: Arc<EntityStore>, fetcher: Arc<dyn GroupMetadataFetcher>) -> Self {
        Self {
            store,
            fetcher,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Spawn a metadata fetch for `group_id`. Returns `false` without spawning
    /// when the id is not a group or a fetch for it is already running.
    pub fn request(&self, group_id: &str) -> bool {
        let group_id = jid::normalize(group_id);
        if !jid::is_group(&group_id) {
            return false;
        }
        if !lock(&self.in_flight).insert(group_id.clone()) {
            trace!(group = %group_id, "metadata fetch already in flight");
            return false;
        }

        let guard = InFlight {
            groups: self.in_flight.clone(),
            group_id: group_id.clone(),
        };
        let store = self.store.clone();
        let fetcher = self.fetcher.clone();

        let mut tasks = lock(&self.tasks);
        while tasks.try_join_next().is_some() {}
        let task_group_id = group_id.clone();
        tasks.spawn(async move {
            let group_id = task_group_id;
            let _guard = guard;
            match fetcher.fetch_group_metadata(&group_id).await {
                Ok(metadata) => apply_metadata(&store, &group_id, metadata),
                Err(error) => {
                    debug!(group = %group_id, error = %error, "group metadata fetch failed");
                }
            }
        });
        debug!(group = %group_id, "requested group metadata");
        true
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Wait for every spawned fetch to finish.
    pub async fn settle(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *lock(&self.tasks));
            if tasks.is_empty() {
                return;
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(error) = result {
                    warn!(error = %error, "group metadata task failed");
                }
            }
        }
    }
}

/// Merge fetched metadata into the group's chat, if it exists, and write the
/// group entity.
pub(crate) fn apply_metadata(store: &EntityStore, group_id: &str, mut metadata: GroupMetadata) {
    metadata.id = group_id.to_string();
    for participant in metadata.participants.iter_mut() {
        participant.id = jid::normalize(&participant.id);
    }

    store.modify(&keys::chat(group_id), WriteKind::Group, |chat: &mut Chat| {
        chat.subject = Some(metadata.subject.clone());
        chat.metadata = Some(metadata.clone());
    });
    debug!(
        group = %group_id,
        participants = metadata.participants.len(),
        "group metadata resolved"
    );
    store.set_group_metadata(metadata);
}

#[cfg(test)]
mod tests {
    use super::*;
    use perch_test_support::builders;

    fn setup(fetcher: StaticGroupFetcher) -> (Arc<EntityStore>, Arc<StaticGroupFetcher>, GroupEnricher) {
        let store = Arc::new(EntityStore::default());
        let fetcher = Arc::new(fetcher);
        let enricher = GroupEnricher::new(store.clone(), fetcher.clone());
        (store, fetcher, enricher)
    }

    #[tokio::test]
    async fn successful_fetch_resolves_pending_chat() {
        let group = builders::group_metadata("1203@g.us", "Crew", &["1:2@s.whatsapp.net"]);
        let (store, _fetcher, enricher) = setup(StaticGroupFetcher::new([group]));
        store.set_chat(Chat::new("1203@g.us"));

        assert!(enricher.request("1203@g.us"));
        enricher.settle().await;

        let chat = store.chat("1203@g.us").unwrap();
        assert!(!chat.is_pending_metadata());
        assert_eq!(chat.subject.as_deref(), Some("Crew"));
        let metadata = store.group_metadata("1203@g.us").unwrap();
        assert_eq!(metadata.participants[0].id, "1@s.whatsapp.net");
        assert_eq!(enricher.in_flight(), 0);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_chat_pending() {
        let (store, fetcher, enricher) = setup(StaticGroupFetcher::default());
        store.set_chat(Chat::new("1203@g.us"));

        assert!(enricher.request("1203@g.us"));
        enricher.settle().await;

        assert!(store.chat("1203@g.us").unwrap().is_pending_metadata());
        assert!(store.group_metadata("1203@g.us").is_none());
        assert_eq!(fetcher.calls(), 1);

        assert!(enricher.request("1203@g.us"));
        enricher.settle().await;
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_fetch() {
        let group = builders::group_metadata("1203@g.us", "Crew", &[]);
        let (_store, fetcher, enricher) =
            setup(StaticGroupFetcher::new([group]).with_delay(Duration::from_millis(20)));

        assert!(enricher.request("1203@g.us"));
        assert!(!enricher.request("1203@g.us"));
        assert_eq!(enricher.in_flight(), 1);
        enricher.settle().await;

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(enricher.in_flight(), 0);
    }

    #[tokio::test]
    async fn non_group_ids_are_ignored() {
        let (_store, fetcher, enricher) = setup(StaticGroupFetcher::default());
        assert!(!enricher.request("1@s.whatsapp.net"));
        enricher.settle().await;
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn metadata_for_unknown_chat_only_writes_group() {
        let group = builders::group_metadata("1203@g.us", "Crew", &[]);
        let (store, _fetcher, enricher) = setup(StaticGroupFetcher::new([group]));
        enricher.request("1203@g.us");
        enricher.settle().await;
        assert!(store.chat("1203@g.us").is_none());
        assert!(store.group_metadata("1203@g.us").is_some());
    }
}
