//! History replay.
//!
//! A history set arrives after (re)connecting and rebuilds the projections.
//! Chats are written first as minimal projections, then contacts, then
//! messages. Windows are trimmed once per chat after the whole set, and
//! metadata for group chats still pending is requested last. Nothing here
//! waits on a fetch.

use std::collections::BTreeSet;

use perch_core::jid;
use perch_core::model::{Chat, Contact, Message};
use perch_core::WriteKind;
use tracing::info;

use super::messages::{ingest_message, trim_windows, IngestOptions};
use super::{chats, contacts, skip_item};
use crate::context::BotContext;

pub fn history_set(
    ctx: &BotContext,
    chat_list: &[Chat],
    contact_list: &[Contact],
    message_list: &[Message],
    is_latest: bool,
) {
    let mut groups = BTreeSet::new();

    for chat in chat_list {
        match chats::merge_chat(ctx, &chat.projection(), WriteKind::HistorySync) {
            Ok(merged) if merged.is_group() => {
                groups.insert(merged.id);
            }
            Ok(_) => {}
            Err(error) => skip_item("chat", Err(error)),
        }
    }

    for contact in contact_list {
        skip_item("contact", contacts::merge_contact(ctx, contact));
    }

    let mut touched = BTreeSet::new();
    let mut ingested = 0;
    for message in message_list {
        match ingest_message(ctx, message.clone(), IngestOptions::HISTORY, &mut touched) {
            Ok(_) => ingested += 1,
            Err(error) => skip_item("message", Err(error)),
        }
    }
    trim_windows(ctx, &touched);
    groups.extend(touched.into_iter().filter(|id| jid::is_group(id)));

    let requested = groups
        .iter()
        .filter(|id| {
            ctx.store()
                .chat(id)
                .is_some_and(|chat| chat.is_pending_metadata())
        })
        .filter(|id| ctx.enricher().request(id))
        .count();

    info!(
        chats = chat_list.len(),
        contacts = contact_list.len(),
        messages = ingested,
        requested,
        is_latest,
        "history synced"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{harness_with_groups, ALICE, GROUP};
    use perch_core::event::TransportEvent;
    use perch_test_support::{builders, fixtures};

    fn fixture() -> (Vec<Chat>, Vec<Contact>, Vec<Message>, bool) {
        match fixtures::transport_event("history-set.json") {
            TransportEvent::HistorySet {
                chats,
                contacts,
                messages,
                is_latest,
            } => (chats, contacts, messages, is_latest),
            other => panic!("unexpected event {}", other.channel_name()),
        }
    }

    #[tokio::test]
    async fn replays_fixture_without_unread_increments() {
        let h = harness_with_groups(fixtures::groups("groups.json"));
        let (chats, contacts, messages, is_latest) = fixture();
        history_set(&h.ctx, &chats, &contacts, &messages, is_latest);
        h.ctx.enricher().settle().await;

        let direct = h.store().chat(ALICE).unwrap();
        let original = chats.iter().find(|c| jid::normalize(&c.id) == ALICE).unwrap();
        assert_eq!(direct.unread_count, original.unread_count);
        assert!(direct.messages.contains(&"H1".to_string()));
        assert!(!direct.messages.contains(&"H2".to_string()));

        let group = h.store().chat(GROUP).unwrap();
        assert_eq!(group.subject.as_deref(), Some("Climbing crew"));
        assert!(!group.is_pending_metadata());
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.store().all_contacts().len(), 2);
    }

    #[tokio::test]
    async fn replay_is_idempotent() {
        let h = harness_with_groups(fixtures::groups("groups.json"));
        let (chats, contacts, messages, is_latest) = fixture();
        history_set(&h.ctx, &chats, &contacts, &messages, is_latest);
        h.ctx.enricher().settle().await;
        let first = h.store().snapshot_json().unwrap();

        history_set(&h.ctx, &chats, &contacts, &messages, is_latest);
        h.ctx.enricher().settle().await;
        assert_eq!(h.store().snapshot_json().unwrap(), first);
    }

    #[tokio::test]
    async fn large_history_is_trimmed_once() {
        let h = harness_with_groups(Vec::new());
        let messages = builders::inbound_burst(ALICE, 40);
        history_set(&h.ctx, &[builders::chat(ALICE)], &[], &messages, true);

        let chat = h.store().chat(ALICE).unwrap();
        assert_eq!(chat.messages.len(), 15);
        assert_eq!(chat.messages.first().map(String::as_str), Some("m25"));
        assert_eq!(chat.unread_count, None);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_group_pending() {
        let h = harness_with_groups(Vec::new());
        history_set(&h.ctx, &[builders::chat(GROUP)], &[], &[], false);
        h.ctx.enricher().settle().await;

        assert!(h.store().chat(GROUP).unwrap().is_pending_metadata());
        assert_eq!(h.fetcher.calls(), 1);
    }
}
