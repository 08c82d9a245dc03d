//! Group metadata events.
//!
//! Known metadata is kept in two places: the `group:<id>` entity and the
//! `metadata` field of the group's chat. Both are updated together. When an
//! event needs metadata that has not been fetched yet, a fetch is requested
//! instead of guessing.

use perch_core::jid;
use perch_core::model::{Chat, GroupMetadata, GroupUpdate, ParticipantAction};
use perch_core::WriteKind;
use perch_store::keys;
use tracing::{debug, trace};

use super::{require, skip_item};
use crate::context::BotContext;
use crate::error::IngestError;

pub fn upsert(ctx: &BotContext, groups: &[GroupMetadata]) {
    for group in groups {
        skip_item("group", upsert_group(ctx, group));
    }
}

pub fn update(ctx: &BotContext, updates: &[GroupUpdate]) {
    for update in updates {
        skip_item("group", update_group(ctx, update));
    }
}

pub fn participants_update(
    ctx: &BotContext,
    id: &str,
    participants: &[String],
    action: ParticipantAction,
) {
    if let Err(error) = require(id, "group", "id") {
        skip_item("group", Err(error));
        return;
    }
    let id = jid::normalize(id);
    let participants: Vec<String> = participants.iter().map(|p| jid::normalize(p)).collect();

    let applied = ctx.store().modify(
        &keys::group(&id),
        WriteKind::Group,
        |metadata: &mut GroupMetadata| metadata.apply_participants(&participants, action),
    );

    match applied {
        Some(metadata) => {
            debug!(
                group = %id,
                action = ?action,
                count = participants.len(),
                "group participants updated"
            );
            mirror_to_chat(ctx, &id, metadata, false);
        }
        None => {
            trace!(group = %id, "participants update for group without metadata");
            ctx.enricher().request(&id);
        }
    }
}

fn upsert_group(ctx: &BotContext, group: &GroupMetadata) -> Result<(), IngestError> {
    require(&group.id, "group", "id")?;
    let mut metadata = group.clone();
    metadata.id = jid::normalize(&metadata.id);
    for participant in metadata.participants.iter_mut() {
        participant.id = jid::normalize(&participant.id);
    }
    let id = metadata.id.clone();

    ctx.store().set_group_metadata(metadata.clone());
    mirror_to_chat(ctx, &id, metadata, true);
    debug!(group = %id, "group upserted");
    Ok(())
}

fn update_group(ctx: &BotContext, update: &GroupUpdate) -> Result<(), IngestError> {
    require(&update.id, "group", "id")?;
    let id = jid::normalize(&update.id);
    let patch = update.clone();

    let applied = ctx.store().modify(
        &keys::group(&id),
        WriteKind::Group,
        |metadata: &mut GroupMetadata| metadata.apply_update(patch),
    );
    match applied {
        Some(metadata) => mirror_to_chat(ctx, &id, metadata, false),
        None => {
            trace!(group = %id, "update for group without metadata");
            ctx.enricher().request(&id);
        }
    }
    Ok(())
}

/// Copy metadata onto the group's chat. Creates the chat only when `create`.
fn mirror_to_chat(ctx: &BotContext, id: &str, metadata: GroupMetadata, create: bool) {
    let key = keys::chat(id);
    let apply = |chat: &mut Chat| {
        chat.subject = Some(metadata.subject.clone());
        chat.metadata = Some(metadata.clone());
    };
    if create {
        ctx.store()
            .upsert_with(&key, WriteKind::Group, || Chat::new(id), apply);
    } else {
        ctx.store().modify(&key, WriteKind::Group, apply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::chats;
    use crate::handlers::testing::{harness, harness_with_groups, ALICE, BOB, GROUP};
    use perch_test_support::builders;

    #[tokio::test]
    async fn upsert_writes_group_and_chat() {
        let h = harness();
        upsert(
            &h.ctx,
            &[builders::group_metadata(GROUP, "Crew", &["15550000001:1"])],
        );

        let group = h.store().group_metadata(GROUP).unwrap();
        assert_eq!(group.participants[0].id, ALICE);
        let chat = h.store().chat(GROUP).unwrap();
        assert_eq!(chat.subject.as_deref(), Some("Crew"));
        assert!(!chat.is_pending_metadata());
    }

    #[tokio::test]
    async fn update_applies_to_known_metadata() {
        let h = harness();
        upsert(&h.ctx, &[builders::group_metadata(GROUP, "Crew", &[])]);
        update(
            &h.ctx,
            &[GroupUpdate {
                id: GROUP.into(),
                subject: Some("Crew 2".into()),
                announce: Some(true),
                ..GroupUpdate::default()
            }],
        );

        let group = h.store().group_metadata(GROUP).unwrap();
        assert_eq!(group.subject, "Crew 2");
        assert_eq!(group.announce, Some(true));
        assert_eq!(h.store().chat(GROUP).unwrap().subject.as_deref(), Some("Crew 2"));
        assert_eq!(h.fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn update_for_unknown_group_fetches() {
        let h = harness_with_groups(vec![builders::group_metadata(GROUP, "Fetched", &[])]);
        chats::upsert(&h.ctx, &[builders::chat(GROUP)]);
        h.ctx.enricher().settle().await;
        h.store().delete_group_metadata(GROUP);

        update(
            &h.ctx,
            &[GroupUpdate {
                id: GROUP.into(),
                subject: Some("Ignored".into()),
                ..GroupUpdate::default()
            }],
        );
        h.ctx.enricher().settle().await;
        assert_eq!(h.store().group_metadata(GROUP).unwrap().subject, "Fetched");
        assert_eq!(h.fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn participant_actions_apply_to_known_metadata() {
        let h = harness();
        upsert(&h.ctx, &[builders::group_metadata(GROUP, "Crew", &[ALICE])]);

        participants_update(&h.ctx, GROUP, &["15550000002:2".into()], ParticipantAction::Add);
        participants_update(&h.ctx, GROUP, &[BOB.into()], ParticipantAction::Promote);
        participants_update(&h.ctx, GROUP, &[ALICE.into()], ParticipantAction::Remove);

        let group = h.store().group_metadata(GROUP).unwrap();
        assert_eq!(group.participants.len(), 1);
        assert!(group.is_admin(BOB));
        let chat_metadata = h.store().chat(GROUP).unwrap().metadata.unwrap();
        assert_eq!(chat_metadata, group);
    }

    #[tokio::test]
    async fn participants_for_pending_group_trigger_fetch() {
        let h = harness_with_groups(vec![builders::group_metadata(GROUP, "Crew", &[ALICE, BOB])]);
        participants_update(&h.ctx, GROUP, &[BOB.into()], ParticipantAction::Add);
        h.ctx.enricher().settle().await;

        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.store().group_metadata(GROUP).unwrap().participants.len(), 2);
    }
}
