//! One handler per transport event type.
//!
//! Handlers normalize identifiers before touching the store and are idempotent
//! under replay. A malformed item is logged and skipped; the rest of the event
//! still applies.

pub mod blocklist;
pub mod calls;
pub mod chats;
pub mod connection;
pub mod contacts;
pub mod groups;
pub mod history;
pub mod messages;
pub mod presence;

use perch_core::event::TransportEvent;
use tracing::warn;

use crate::context::BotContext;
use crate::error::IngestError;

/// Apply one transport event to the store.
pub fn dispatch(ctx: &BotContext, event: &TransportEvent) {
    match event {
        TransportEvent::ConnectionUpdate {
            state,
            last_disconnect,
        } => connection::connection_update(ctx, *state, last_disconnect.as_deref()),
        TransportEvent::CredentialsUpdate { me } => {
            skip_on_error(event, connection::credentials_update(ctx, me))
        }
        TransportEvent::HistorySet {
            chats,
            contacts,
            messages,
            is_latest,
        } => history::history_set(ctx, chats, contacts, messages, *is_latest),
        TransportEvent::MessagesUpsert { messages, kind } => {
            messages::upsert(ctx, messages, *kind)
        }
        TransportEvent::MessagesUpdate { updates } => messages::update(ctx, updates),
        TransportEvent::MessagesDelete(delete) => messages::delete(ctx, delete),
        TransportEvent::MessagesReaction { reactions } => messages::react(ctx, reactions),
        TransportEvent::ReceiptUpdate { receipts } => messages::receipts(ctx, receipts),
        TransportEvent::ChatsSet { chats } | TransportEvent::ChatsUpsert { chats } => {
            chats::upsert(ctx, chats)
        }
        TransportEvent::ChatsUpdate { chats } => chats::update(ctx, chats),
        TransportEvent::ChatsDelete { ids } => chats::delete(ctx, ids),
        TransportEvent::PresenceUpdate { id, presences } => {
            presence::presence_update(ctx, id, presences)
        }
        TransportEvent::ContactsSet { contacts } | TransportEvent::ContactsUpsert { contacts } => {
            contacts::upsert(ctx, contacts)
        }
        TransportEvent::ContactsUpdate { contacts } => contacts::update(ctx, contacts),
        TransportEvent::GroupsUpsert { groups } => groups::upsert(ctx, groups),
        TransportEvent::GroupsUpdate { updates } => groups::update(ctx, updates),
        TransportEvent::GroupParticipantsUpdate {
            id,
            participants,
            action,
        } => groups::participants_update(ctx, id, participants, *action),
        TransportEvent::Call { calls } => calls::calls(ctx, calls),
        TransportEvent::BlocklistSet { ids } => blocklist::set(ctx, ids),
        TransportEvent::BlocklistUpdate { ids, action } => blocklist::update(ctx, ids, *action),
    }
}

fn skip_on_error(event: &TransportEvent, result: Result<(), IngestError>) {
    if let Err(error) = result {
        warn!(channel = event.channel_name(), error = %error, "skipping malformed event");
    }
}

/// Log and drop a per-item failure.
pub(crate) fn skip_item(entity: &'static str, result: Result<(), IngestError>) {
    if let Err(error) = result {
        warn!(entity, error = %error, "skipping malformed item");
    }
}

pub(crate) fn require(
    value: &str,
    entity: &'static str,
    field: &'static str,
) -> Result<(), IngestError> {
    if value.trim().is_empty() {
        Err(IngestError::MissingField { entity, field })
    } else {
        Ok(())
    }
}
