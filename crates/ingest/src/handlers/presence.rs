use std::collections::BTreeMap;

use chrono::Utc;
use perch_core::jid;
use perch_core::model::{Chat, PresenceData, PresenceRecord};
use perch_core::WriteKind;
use perch_store::keys;
use tracing::trace;

use super::{require, skip_item};
use crate::context::BotContext;

/// One `presence:<participant>` write per participant, plus the chat's
/// `presences` map when the chat is already known.
pub fn presence_update(ctx: &BotContext, id: &str, presences: &BTreeMap<String, PresenceData>) {
    if let Err(error) = require(id, "presence", "id") {
        skip_item("presence", Err(error));
        return;
    }
    let chat_id = jid::normalize(id);
    let now = Utc::now();
    let store = ctx.store();

    let mut observed = BTreeMap::new();
    for (participant, presence) in presences {
        let participant = jid::normalize(participant);
        store.set_presence(PresenceRecord {
            id: participant.clone(),
            chat_id: chat_id.clone(),
            presence: presence.clone(),
            updated_at: now,
        });
        observed.insert(participant, presence.clone());
    }

    let count = observed.len();
    let denormalized = store
        .modify(&keys::chat(&chat_id), WriteKind::Presence, |chat: &mut Chat| {
            chat.presences.extend(observed)
        })
        .is_some();
    trace!(chat = %chat_id, count, denormalized, "presence updated");
}
