use std::sync::{Arc, PoisonError, RwLock};

use perch_core::config::Config;
use perch_core::event::{ConnectionState, EventBus};
use perch_core::jid;
use perch_core::model::OwnIdentity;
use perch_store::{EntityStore, HysteresisWindow};
use tokio::sync::watch;
use tracing::info;

use crate::batcher::TaskBatcher;
use crate::enrich::{GroupEnricher, GroupMetadataFetcher};

/// Everything a handler needs, built once at startup and shared by reference.
pub struct BotContext {
    store: Arc<EntityStore>,
    bus: Arc<dyn EventBus>,
    batcher: TaskBatcher,
    enricher: GroupEnricher,
    own_identity: RwLock<Option<OwnIdentity>>,
    connection: watch::Sender<ConnectionState>,
    message_window: HysteresisWindow,
    quoted_window: HysteresisWindow,
}

impl BotContext {
    pub fn new(
        config: &Config,
        store: Arc<EntityStore>,
        bus: Arc<dyn EventBus>,
        fetcher: Arc<dyn GroupMetadataFetcher>,
    ) -> Self {
        let own_identity = config.account.id.as_deref().map(|id| OwnIdentity {
            id: jid::normalize(id),
            lid: jid::normalize_opt(config.account.lid.as_deref()),
            name: None,
        });
        let (connection, _) = watch::channel(ConnectionState::Close);

        Self {
            enricher: GroupEnricher::new(store.clone(), fetcher),
            store,
            bus,
            batcher: TaskBatcher::new(config.ingest.batch_size),
            own_identity: RwLock::new(own_identity),
            connection,
            message_window: config.ingest.message_window.into(),
            quoted_window: config.ingest.quoted_window.into(),
        }
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn batcher(&self) -> &TaskBatcher {
        &self.batcher
    }

    pub fn enricher(&self) -> &GroupEnricher {
        &self.enricher
    }

    pub fn message_window(&self) -> HysteresisWindow {
        self.message_window
    }

    pub fn quoted_window(&self) -> HysteresisWindow {
        self.quoted_window
    }

    pub fn own_identity(&self) -> Option<OwnIdentity> {
        self.own_identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_own_identity(&self, identity: OwnIdentity) {
        info!(id = %identity.id, lid = ?identity.lid, "own identity updated");
        *self
            .own_identity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(identity);
    }

    /// Whether `id` names the bot's own account, in either identity form.
    pub fn is_self(&self, id: &str) -> bool {
        let guard = self
            .own_identity
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(own) = guard.as_ref() else {
            return false;
        };
        let id = jid::normalize(id);
        id == own.id || own.lid.as_deref() == Some(id.as_str())
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// Returns whether the state changed.
    pub fn set_connection_state(&self, state: ConnectionState) -> bool {
        self.connection.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }
}
