use perch_core::event::BlocklistAction;
use perch_core::jid;
use perch_core::WriteKind;
use perch_store::{keys, Blocklist, Entity};
use tracing::debug;

use crate::context::BotContext;

/// Replace the blocklist.
pub fn set(ctx: &BotContext, ids: &[String]) {
    ctx.store().set_blocklist(ids);
    debug!(count = ids.len(), "blocklist replaced");
}

/// Add or remove ids in a single write.
pub fn update(ctx: &BotContext, ids: &[String], action: BlocklistAction) {
    let ids: Vec<String> = ids.iter().map(|id| jid::normalize(id)).collect();
    let updated = ctx
        .store()
        .update(keys::BLOCKLIST, WriteKind::Blocklist, |current| {
            let mut blocklist = match current {
                Some(Entity::Blocklist(blocklist)) => blocklist,
                _ => Blocklist::default(),
            };
            match action {
                BlocklistAction::Add => blocklist.ids.extend(ids),
                BlocklistAction::Remove => blocklist.ids.retain(|id| !ids.contains(id)),
            }
            Some(Entity::Blocklist(blocklist))
        });

    let size = match updated {
        Some(Entity::Blocklist(blocklist)) => blocklist.ids.len(),
        _ => 0,
    };
    debug!(action = ?action, size, "blocklist updated");
}
