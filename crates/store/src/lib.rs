//! In-memory projection of transport state.
//!
//! Entities live in a sharded map keyed by namespaced strings (see
//! [`entity::keys`]). A write to one key holds that key's shard lock for its
//! whole duration, so readers observe it either entirely or not at all. Every
//! write is also recorded in the [`PriorityQueue`] under its [`WriteKind`]'s
//! tier for consumers that want to follow store changes.
//!
//! Typed accessors normalize identifiers before computing keys.

pub mod alias;
pub mod entity;
pub mod queue;
pub mod window;

use std::collections::{BTreeMap, BTreeSet};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use globset::Glob;
use perch_core::config::QueueConfig;
use perch_core::jid;
use perch_core::model::{CallOffer, Chat, Contact, GroupMetadata, Message, PresenceRecord};
use perch_core::{PerchError, StoreChange, WriteKind};
use serde::Serialize;
use tracing::{debug, trace};

pub use alias::AliasMap;
pub use entity::{keys, Blocklist, Entity, EntityKind, EntityPayload};
pub use queue::{PriorityQueue, QueueStats};
pub use window::HysteresisWindow;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid key pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("failed to serialize store snapshot: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for PerchError {
    fn from(error: StoreError) -> Self {
        PerchError::Store(error.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub entities: BTreeMap<EntityKind, usize>,
    pub blocklisted: usize,
    pub aliases: usize,
    pub queue: QueueStats,
}

impl StoreStats {
    pub fn count(&self, kind: EntityKind) -> usize {
        self.entities.get(&kind).copied().unwrap_or(0)
    }
}

pub struct EntityStore {
    entities: DashMap<String, Entity>,
    queue: PriorityQueue,
    aliases: AliasMap,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new(PriorityQueue::default())
    }
}

impl EntityStore {
    pub fn new(queue: PriorityQueue) -> Self {
        Self {
            entities: DashMap::new(),
            queue,
            aliases: AliasMap::new(),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(PriorityQueue::from_config(config))
    }

    pub fn queue(&self) -> &PriorityQueue {
        &self.queue
    }

    pub fn aliases(&self) -> &AliasMap {
        &self.aliases
    }

    // ── Generic key operations ──────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<Entity> {
        self.entities.get(key).map(|entry| entry.value().clone())
    }

    /// One slot per requested key, `None` for misses.
    pub fn mget<K: AsRef<str>>(&self, keys: &[K]) -> Vec<Option<Entity>> {
        keys.iter().map(|key| self.get(key.as_ref())).collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entities.contains_key(key)
    }

    /// Keys matching a glob pattern, sorted.
    pub fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let matcher = Glob::new(pattern)
            .map_err(|error| StoreError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: error.to_string(),
            })?
            .compile_matcher();

        let mut keys: Vec<String> = self
            .entities
            .iter()
            .filter(|entry| matcher.is_match(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entities
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Replace the value at `key` whole.
    pub fn atomic_set(&self, key: impl Into<String>, entity: Entity, kind: WriteKind) {
        let key = key.into();
        trace!(key = %key, kind = ?kind, "set");
        self.entities.insert(key.clone(), entity);
        self.queue.push(StoreChange::set(key, kind));
    }

    /// Returns whether the key existed.
    pub fn del(&self, key: &str, kind: WriteKind) -> bool {
        let removed = self.entities.remove(key).is_some();
        if removed {
            trace!(key, kind = ?kind, "deleted");
            self.queue.push(StoreChange::delete(key, kind));
        }
        removed
    }

    /// Delete every key starting with `prefix`. Returns how many were removed.
    pub fn del_prefix(&self, prefix: &str, kind: WriteKind) -> usize {
        let removed = self
            .keys_with_prefix(prefix)
            .into_iter()
            .filter(|key| self.del(key, kind))
            .count();
        if removed > 0 {
            debug!(prefix, removed, "deleted by prefix");
        }
        removed
    }

    /// Delete `key` only if `predicate` holds for its current value, checked
    /// under the shard lock.
    pub fn del_if<P>(&self, key: &str, kind: WriteKind, predicate: P) -> bool
    where
        P: FnOnce(&Entity) -> bool,
    {
        let removed = self
            .entities
            .remove_if(key, |_, entity| predicate(entity))
            .is_some();
        if removed {
            trace!(key, kind = ?kind, "deleted");
            self.queue.push(StoreChange::delete(key, kind));
        }
        removed
    }

    /// Read-modify-write of one key under its shard lock. `f` receives the
    /// current value and returns the new one; `None` deletes the key. `f`
    /// must not call back into the store.
    pub fn update<F>(&self, key: &str, kind: WriteKind, f: F) -> Option<Entity>
    where
        F: FnOnce(Option<Entity>) -> Option<Entity>,
    {
        let (next, change) = match self.entities.entry(key.to_string()) {
            Entry::Occupied(mut entry) => match f(Some(entry.get().clone())) {
                Some(next) => {
                    entry.insert(next.clone());
                    (Some(next), Some(StoreChange::set(key, kind)))
                }
                None => {
                    entry.remove();
                    (None, Some(StoreChange::delete(key, kind)))
                }
            },
            Entry::Vacant(entry) => match f(None) {
                Some(next) => {
                    entry.insert(next.clone());
                    (Some(next), Some(StoreChange::set(key, kind)))
                }
                None => (None, None),
            },
        };

        if let Some(change) = change {
            self.queue.push(change);
        }
        next
    }

    pub fn get_as<T: EntityPayload>(&self, key: &str) -> Option<T> {
        let entry = self.entities.get(key)?;
        T::from_entity(entry.value()).cloned()
    }

    /// Apply `f` to the value at `key`, starting from `init()` when the key is
    /// absent or holds another kind of entity. Returns the updated value.
    pub fn upsert_with<T, I, F>(&self, key: &str, kind: WriteKind, init: I, f: F) -> T
    where
        T: EntityPayload,
        I: FnOnce() -> T,
        F: FnOnce(&mut T),
    {
        let value = match self.entities.entry(key.to_string()) {
            Entry::Occupied(mut entry) => match T::from_entity_mut(entry.get_mut()) {
                Some(value) => {
                    f(value);
                    value.clone()
                }
                None => {
                    let mut value = init();
                    f(&mut value);
                    entry.insert(value.clone().into_entity());
                    value
                }
            },
            Entry::Vacant(entry) => {
                let mut value = init();
                f(&mut value);
                entry.insert(value.clone().into_entity());
                value
            }
        };

        self.queue.push(StoreChange::set(key, kind));
        value
    }

    /// Apply `f` only if `key` already holds a `T`.
    pub fn modify<T, F>(&self, key: &str, kind: WriteKind, f: F) -> Option<T>
    where
        T: EntityPayload,
        F: FnOnce(&mut T),
    {
        let value = {
            let mut entry = self.entities.get_mut(key)?;
            let value = T::from_entity_mut(entry.value_mut())?;
            f(value);
            value.clone()
        };

        self.queue.push(StoreChange::set(key, kind));
        Some(value)
    }

    // ── Chats ───────────────────────────────────────────────────────

    pub fn chat(&self, id: &str) -> Option<Chat> {
        self.get_as(&keys::chat(&jid::normalize(id)))
    }

    pub fn set_chat(&self, mut chat: Chat) {
        chat.id = jid::normalize(&chat.id);
        self.atomic_set(keys::chat(&chat.id), Entity::Chat(chat), WriteKind::Chat);
    }

    /// Delete a chat and every message stored under it.
    pub fn delete_chat(&self, id: &str) -> bool {
        let id = jid::normalize(id);
        let removed = self.del(&keys::chat(&id), WriteKind::ChatDelete);
        self.del_prefix(&keys::message_prefix(&id), WriteKind::ChatDelete);
        removed
    }

    pub fn all_chats(&self) -> Vec<Chat> {
        self.all_of(EntityKind::Chat)
    }

    // ── Contacts ────────────────────────────────────────────────────

    pub fn contact(&self, id: &str) -> Option<Contact> {
        self.get_as(&keys::contact(&jid::normalize(id)))
    }

    pub fn set_contact(&self, mut contact: Contact) {
        contact.id = jid::normalize(&contact.id);
        self.atomic_set(
            keys::contact(&contact.id),
            Entity::Contact(contact),
            WriteKind::Contact,
        );
    }

    pub fn delete_contact(&self, id: &str) -> bool {
        self.del(&keys::contact(&jid::normalize(id)), WriteKind::Contact)
    }

    pub fn all_contacts(&self) -> Vec<Contact> {
        self.all_of(EntityKind::Contact)
    }

    // ── Messages ────────────────────────────────────────────────────

    pub fn message(&self, chat_id: &str, message_id: &str) -> Option<Message> {
        self.get_as(&keys::message(&jid::normalize(chat_id), message_id))
    }

    pub fn set_message(&self, mut message: Message) {
        message.key.remote_jid = jid::normalize(&message.key.remote_jid);
        message.key.participant = jid::normalize_opt(message.key.participant.as_deref());
        let key = keys::message(&message.key.remote_jid, &message.key.id);
        self.atomic_set(key, Entity::Message(message), WriteKind::Message);
    }

    pub fn delete_message(&self, chat_id: &str, message_id: &str) -> bool {
        self.del(
            &keys::message(&jid::normalize(chat_id), message_id),
            WriteKind::Message,
        )
    }

    /// The last `limit` messages of a chat by timestamp, oldest first.
    pub fn chat_messages(&self, chat_id: &str, limit: usize) -> Vec<Message> {
        let prefix = keys::message_prefix(&jid::normalize(chat_id));
        let mut messages: Vec<Message> = self
            .entities
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .filter_map(|entry| Message::from_entity(entry.value()).cloned())
            .collect();
        messages.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.key.id.cmp(&b.key.id))
        });
        let skip = messages.len().saturating_sub(limit);
        messages.split_off(skip)
    }

    // ── Groups ──────────────────────────────────────────────────────

    pub fn group_metadata(&self, id: &str) -> Option<GroupMetadata> {
        self.get_as(&keys::group(&jid::normalize(id)))
    }

    pub fn set_group_metadata(&self, mut metadata: GroupMetadata) {
        metadata.id = jid::normalize(&metadata.id);
        self.atomic_set(
            keys::group(&metadata.id),
            Entity::Group(metadata),
            WriteKind::Group,
        );
    }

    pub fn delete_group_metadata(&self, id: &str) -> bool {
        self.del(&keys::group(&jid::normalize(id)), WriteKind::Group)
    }

    // ── Presence ────────────────────────────────────────────────────

    pub fn presence(&self, id: &str) -> Option<PresenceRecord> {
        self.get_as(&keys::presence(&jid::normalize(id)))
    }

    pub fn set_presence(&self, mut record: PresenceRecord) {
        record.id = jid::normalize(&record.id);
        record.chat_id = jid::normalize(&record.chat_id);
        self.atomic_set(
            keys::presence(&record.id),
            Entity::Presence(record),
            WriteKind::Presence,
        );
    }

    pub fn delete_presence(&self, id: &str) -> bool {
        self.del(&keys::presence(&jid::normalize(id)), WriteKind::Presence)
    }

    // ── Calls ───────────────────────────────────────────────────────

    pub fn call(&self, id: &str) -> Option<CallOffer> {
        self.get_as(&keys::call(id))
    }

    pub fn set_call(&self, mut call: CallOffer) {
        call.chat_id = jid::normalize(&call.chat_id);
        call.from = jid::normalize(&call.from);
        self.atomic_set(keys::call(&call.id), Entity::Call(call), WriteKind::Call);
    }

    pub fn delete_call(&self, id: &str) -> bool {
        self.del(&keys::call(id), WriteKind::Call)
    }

    // ── Blocklist ───────────────────────────────────────────────────

    /// Blocked identifiers, sorted.
    pub fn blocklist(&self) -> Vec<String> {
        self.get_as::<Blocklist>(keys::BLOCKLIST)
            .map(|blocklist| blocklist.ids.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn set_blocklist<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: BTreeSet<String> = ids
            .into_iter()
            .map(|id| jid::normalize(id.as_ref()))
            .collect();
        self.atomic_set(
            keys::BLOCKLIST,
            Entity::Blocklist(Blocklist { ids }),
            WriteKind::Blocklist,
        );
    }

    // ── Identity aliases ────────────────────────────────────────────

    pub fn record_alias(&self, a: &str, b: &str) -> bool {
        self.aliases.record(a, b)
    }

    /// The other known form (linked or phone number) of `id`.
    pub fn resolve_alias(&self, id: &str) -> Option<String> {
        self.aliases.resolve(id)
    }

    // ── Introspection ───────────────────────────────────────────────

    fn all_of<T: EntityPayload>(&self, kind: EntityKind) -> Vec<T> {
        let mut found: Vec<(String, T)> = self
            .entities
            .iter()
            .filter(|entry| entry.value().kind() == kind)
            .filter_map(|entry| {
                T::from_entity(entry.value()).map(|value| (entry.key().clone(), value.clone()))
            })
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found.into_iter().map(|(_, value)| value).collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            queue: self.queue.stats(),
            aliases: self.aliases.len(),
            ..StoreStats::default()
        };
        for entry in self.entities.iter() {
            *stats.entities.entry(entry.value().kind()).or_default() += 1;
            if let Entity::Blocklist(blocklist) = entry.value() {
                stats.blocklisted = blocklist.ids.len();
            }
        }
        stats
    }

    /// Every entity as pretty JSON, keyed and sorted by store key.
    pub fn snapshot_json(&self) -> Result<String, StoreError> {
        let snapshot: BTreeMap<String, Entity> = self
            .entities
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};
    use perch_core::model::{MessageContent, MessageKey};
    use perch_core::{ChangeOp, Tier};
    use std::sync::Arc;

    fn message(chat: &str, id: &str, second: u32) -> Message {
        Message {
            key: MessageKey {
                remote_jid: chat.into(),
                from_me: false,
                id: id.into(),
                participant: None,
            },
            push_name: None,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, second).unwrap(),
            content: MessageContent::Text { body: id.into() },
            context: None,
            status: None,
            reactions: vec![],
            receipts: vec![],
            edited: false,
            reconstructed: false,
        }
    }

    #[test]
    fn atomic_set_then_get_reads_back() {
        let store = EntityStore::default();
        let chat = Chat::new("1@s.whatsapp.net");
        store.atomic_set("chat:1@s.whatsapp.net", Entity::Chat(chat.clone()), WriteKind::Chat);
        assert_eq!(store.get("chat:1@s.whatsapp.net"), Some(Entity::Chat(chat)));
        assert_eq!(store.queue().len_for(Tier::Core), 1);
    }

    #[test]
    fn missing_keys_are_none() {
        let store = EntityStore::default();
        assert_eq!(store.get("chat:nobody"), None);
        assert!(!store.del("chat:nobody", WriteKind::ChatDelete));
        assert!(store.queue().is_empty());
        assert!(store.chat("nobody").is_none());
    }

    #[test]
    fn mget_keeps_slot_count() {
        let store = EntityStore::default();
        store.set_chat(Chat::new("1"));
        let found = store.mget(&["chat:1@s.whatsapp.net", "chat:2@s.whatsapp.net"]);
        assert_eq!(found.len(), 2);
        assert!(found[0].is_some());
        assert!(found[1].is_none());
    }

    #[test]
    fn typed_accessors_normalize_ids() {
        let store = EntityStore::default();
        store.set_chat(Chat::new("15551234567:4"));
        let chat = store.chat("15551234567@s.whatsapp.net").unwrap();
        assert_eq!(chat.id, "15551234567@s.whatsapp.net");
        assert!(store.contains("chat:15551234567@s.whatsapp.net"));
    }

    #[test]
    fn keys_matches_glob() {
        let store = EntityStore::default();
        store.set_message(message("1@s.whatsapp.net", "a", 1));
        store.set_message(message("1@s.whatsapp.net", "b", 2));
        store.set_message(message("2@s.whatsapp.net", "c", 3));
        store.set_chat(Chat::new("1@s.whatsapp.net"));

        let keys = store.keys("message:1@s.whatsapp.net:*").unwrap();
        assert_eq!(
            keys,
            vec!["message:1@s.whatsapp.net:a", "message:1@s.whatsapp.net:b"]
        );
        assert_eq!(store.keys("chat:*").unwrap().len(), 1);
        assert_matches!(store.keys("chat:[").unwrap_err(), StoreError::InvalidPattern { .. });
    }

    #[test]
    fn delete_chat_cascades_to_messages() {
        let store = EntityStore::default();
        store.set_chat(Chat::new("1@s.whatsapp.net"));
        store.set_message(message("1@s.whatsapp.net", "a", 1));
        store.set_message(message("1@s.whatsapp.net", "b", 2));
        store.set_message(message("2@s.whatsapp.net", "c", 3));

        assert!(store.delete_chat("1"));
        assert!(store.chat("1@s.whatsapp.net").is_none());
        assert!(store.chat_messages("1@s.whatsapp.net", 10).is_empty());
        assert_eq!(store.chat_messages("2@s.whatsapp.net", 10).len(), 1);
        assert_eq!(store.queue().len_for(Tier::Noise), 3);
    }

    #[test]
    fn chat_messages_returns_newest_in_order() {
        let store = EntityStore::default();
        for (id, second) in [("c", 3), ("a", 1), ("d", 4), ("b", 2)] {
            store.set_message(message("1@s.whatsapp.net", id, second));
        }
        let ids: Vec<_> = store
            .chat_messages("1@s.whatsapp.net", 2)
            .into_iter()
            .map(|m| m.key.id)
            .collect();
        assert_eq!(ids, vec!["c", "d"]);
    }

    #[test]
    fn del_if_checks_current_value() {
        let store = EntityStore::default();
        store.set_message(message("1@s.whatsapp.net", "a", 1));
        let key = keys::message("1@s.whatsapp.net", "a");
        let reconstructed =
            |entity: &Entity| matches!(entity, Entity::Message(m) if m.reconstructed);

        assert!(!store.del_if(&key, WriteKind::Message, reconstructed));
        assert!(store.contains(&key));

        store.modify(&key, WriteKind::Message, |m: &mut Message| m.reconstructed = true);
        assert!(store.del_if(&key, WriteKind::Message, reconstructed));
        assert!(!store.contains(&key));
    }

    #[test]
    fn update_can_create_modify_and_delete() {
        let store = EntityStore::default();
        let created = store.update("blocklist", WriteKind::Blocklist, |current| {
            assert!(current.is_none());
            Some(Entity::Blocklist(Blocklist::default()))
        });
        assert!(created.is_some());

        let removed = store.update("blocklist", WriteKind::Blocklist, |_| None);
        assert!(removed.is_none());
        assert!(!store.contains("blocklist"));

        let changes = store.queue().drain(10);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].op, ChangeOp::Delete);
    }

    #[test]
    fn upsert_with_creates_then_mutates() {
        let store = EntityStore::default();
        let key = keys::chat("1@s.whatsapp.net");
        let init = || Chat::new("1@s.whatsapp.net");
        store.upsert_with(&key, WriteKind::Chat, init, |chat: &mut Chat| {
            chat.unread_count = Some(1)
        });
        let chat = store.upsert_with(&key, WriteKind::Chat, init, |chat: &mut Chat| {
            chat.unread_count = Some(chat.unread_count.unwrap_or(0) + 1)
        });
        assert_eq!(chat.unread_count, Some(2));
        assert_eq!(store.chat("1@s.whatsapp.net").unwrap().unread_count, Some(2));
    }

    #[test]
    fn modify_skips_missing_entities() {
        let store = EntityStore::default();
        let result = store.modify(&keys::chat("1@s.whatsapp.net"), WriteKind::Presence, |chat: &mut Chat| {
            chat.name = Some("x".into())
        });
        assert!(result.is_none());
        assert!(store.is_empty());
        assert!(store.queue().is_empty());
    }

    #[test]
    fn concurrent_updates_to_one_key_are_not_lost() {
        let store = Arc::new(EntityStore::default());
        let key = keys::chat("1@s.whatsapp.net");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store.upsert_with(
                            &key,
                            WriteKind::Chat,
                            || Chat::new("1@s.whatsapp.net"),
                            |chat: &mut Chat| {
                                chat.unread_count = Some(chat.unread_count.unwrap_or(0) + 1)
                            },
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.chat("1@s.whatsapp.net").unwrap().unread_count, Some(800));
    }

    #[test]
    fn blocklist_is_normalized_and_sorted() {
        let store = EntityStore::default();
        store.set_blocklist(["2", "1:5@s.whatsapp.net", "1"]);
        assert_eq!(
            store.blocklist(),
            vec!["1@s.whatsapp.net", "2@s.whatsapp.net"]
        );
    }

    #[test]
    fn stats_count_entities_by_kind() {
        let store = EntityStore::default();
        store.set_chat(Chat::new("1"));
        store.set_chat(Chat::new("2"));
        store.set_contact(Contact::new("1"));
        store.set_blocklist(["3"]);
        let stats = store.stats();
        assert_eq!(stats.count(EntityKind::Chat), 2);
        assert_eq!(stats.count(EntityKind::Contact), 1);
        assert_eq!(stats.count(EntityKind::Message), 0);
        assert_eq!(stats.blocklisted, 1);
        assert_eq!(stats.queue.core, 4);
    }

    #[test]
    fn snapshot_serializes_every_entity() {
        let store = EntityStore::default();
        store.set_chat(Chat::new("1"));
        store.set_blocklist(["2"]);
        let json = store.snapshot_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["chat:1@s.whatsapp.net"]["kind"], "chat");
        assert_eq!(value["blocklist"]["value"]["ids"][0], "2@s.whatsapp.net");
    }

    #[test]
    fn aliases_resolve_only_on_request() {
        let store = EntityStore::default();
        store.set_contact(Contact::new("15551234567"));
        assert!(store.record_alias("15551234567", "77@lid"));
        assert!(store.contact("77@lid").is_none());
        assert_eq!(
            store.resolve_alias("77@lid").as_deref(),
            Some("15551234567@s.whatsapp.net")
        );
    }
}
