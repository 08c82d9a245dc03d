use perch_core::jid;
use perch_core::model::{Chat, Merge};
use perch_core::WriteKind;
use perch_store::keys;
use tracing::{debug, trace};

use super::{require, skip_item};
use crate::context::BotContext;
use crate::error::IngestError;

/// Merge each chat over what the store holds, creating unknown ones.
pub fn upsert(ctx: &BotContext, chats: &[Chat]) {
    for chat in chats {
        match merge_chat(ctx, chat, WriteKind::Chat) {
            Ok(merged) => request_if_pending(ctx, &merged),
            Err(error) => skip_item("chat", Err(error)),
        }
    }
    debug!(count = chats.len(), "chats upserted");
}

/// Merge each chat into an existing entry; updates for unknown chats are
/// dropped.
pub fn update(ctx: &BotContext, chats: &[Chat]) {
    for chat in chats {
        skip_item("chat", update_chat(ctx, chat));
    }
}

pub fn delete(ctx: &BotContext, ids: &[String]) {
    for id in ids {
        if ctx.store().delete_chat(id) {
            debug!(chat = %jid::normalize(id), "chat deleted");
        }
    }
}

/// Merge `chat` over the stored entry, creating it if absent. Returns the
/// merged chat.
pub(crate) fn merge_chat(
    ctx: &BotContext,
    chat: &Chat,
    kind: WriteKind,
) -> Result<Chat, IngestError> {
    require(&chat.id, "chat", "id")?;
    let id = jid::normalize(&chat.id);
    let mut incoming = chat.clone();
    incoming.id = id.clone();

    Ok(ctx.store().upsert_with(
        &keys::chat(&id),
        kind,
        || Chat::new(id.clone()),
        |existing: &mut Chat| existing.merge(incoming),
    ))
}

fn update_chat(ctx: &BotContext, chat: &Chat) -> Result<(), IngestError> {
    require(&chat.id, "chat", "id")?;
    let id = jid::normalize(&chat.id);
    let incoming = chat.clone();

    match ctx
        .store()
        .modify(&keys::chat(&id), WriteKind::Chat, |existing: &mut Chat| {
            existing.merge(incoming)
        }) {
        Some(merged) => request_if_pending(ctx, &merged),
        None => trace!(chat = %id, "update for unknown chat"),
    }
    Ok(())
}

fn request_if_pending(ctx: &BotContext, chat: &Chat) {
    if chat.is_pending_metadata() {
        ctx.enricher().request(&chat.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{harness, harness_with_groups, ALICE, GROUP};
    use crate::handlers::messages;
    use perch_core::event::UpsertKind;
    use perch_test_support::builders;

    #[tokio::test]
    async fn upsert_merges_present_fields_only() {
        let h = harness();
        let mut first = builders::chat("15550000001");
        first.name = Some("Alice".into());
        first.unread_count = Some(3);
        upsert(&h.ctx, &[first]);

        let mut second = builders::chat(ALICE);
        second.archived = Some(true);
        upsert(&h.ctx, &[second]);

        let chat = h.store().chat(ALICE).unwrap();
        assert_eq!(chat.name.as_deref(), Some("Alice"));
        assert_eq!(chat.unread_count, Some(3));
        assert_eq!(chat.archived, Some(true));
    }

    #[tokio::test]
    async fn merge_keeps_windows() {
        let h = harness();
        messages::upsert(&h.ctx, &builders::inbound_burst(ALICE, 2), UpsertKind::Append);
        let mut patch = builders::chat(ALICE);
        patch.unread_count = Some(0);
        update(&h.ctx, &[patch]);

        let chat = h.store().chat(ALICE).unwrap();
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.unread_count, Some(0));
    }

    #[tokio::test]
    async fn update_ignores_unknown_chats() {
        let h = harness();
        update(&h.ctx, &[builders::chat(ALICE)]);
        assert!(h.store().chat(ALICE).is_none());
    }

    #[tokio::test]
    async fn pending_group_chat_triggers_fetch() {
        let h = harness_with_groups(vec![builders::group_metadata(GROUP, "Crew", &[])]);
        upsert(&h.ctx, &[builders::chat(GROUP)]);
        h.ctx.enricher().settle().await;
        assert!(!h.store().chat(GROUP).unwrap().is_pending_metadata());

        upsert(&h.ctx, &[builders::chat(GROUP)]);
        h.ctx.enricher().settle().await;
        assert_eq!(h.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn delete_removes_chat_and_messages() {
        let h = harness();
        messages::upsert(&h.ctx, &builders::inbound_burst(ALICE, 3), UpsertKind::Append);
        delete(&h.ctx, &["15550000001:9".to_string()]);
        assert!(h.store().chat(ALICE).is_none());
        assert!(h.store().chat_messages(ALICE, 10).is_empty());
    }
}
