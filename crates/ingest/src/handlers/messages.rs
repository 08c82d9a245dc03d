//! Message upsert, update, delete, reaction and receipt handling.
//!
//! Upserted messages are written under `message:<chat>:<id>` and entered into
//! the parent chat's window. Quoted messages carried in reply context are
//! cached as minimal reconstructed messages and tracked in the chat's quoted
//! window. Both windows are trimmed once per chat after the whole event has
//! been applied; evicted entries take their message entities with them.
//!
//! Self-sent and sender-key-distribution messages are stored but never enter
//! a window, so nothing evicts them: their `message:` entities accumulate for
//! the life of the process, and `chat_messages` is unbounded for the bot's
//! own outbound traffic. They leave the store only through an explicit
//! message or chat delete.

use std::collections::BTreeSet;

use perch_core::event::{
    Channel, Event, EventPayload, EventSource, MessageReceipt, MessageUpdate, MessagesDelete,
    UpsertKind,
};
use perch_core::jid;
use perch_core::model::{Chat, ContextInfo, Merge, Message, MessageContent, MessageKey, Reaction};
use perch_core::WriteKind;
use perch_store::{keys, Entity};
use tracing::{debug, trace};

use super::{require, skip_item};
use crate::context::BotContext;
use crate::error::IngestError;

const RECEIVED_CHANNEL: &str = "plugin.message.received";
const SOURCE: &str = "perch-ingest";

/// How [`ingest_message`] treats one message.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IngestOptions {
    /// Count new inbound messages as unread.
    pub count_unread: bool,
    /// Request metadata for a pending group chat right away.
    pub enrich: bool,
}

impl IngestOptions {
    pub const LIVE: IngestOptions = IngestOptions {
        count_unread: true,
        enrich: true,
    };
    pub const HISTORY: IngestOptions = IngestOptions {
        count_unread: false,
        enrich: false,
    };
}

pub(crate) struct Ingested {
    pub message: Message,
    pub is_new: bool,
}

impl Ingested {
    /// Whether command plugins should see this message.
    fn is_dispatchable(&self) -> bool {
        self.is_new
            && !self.message.key.from_me
            && !matches!(
                self.message.content,
                MessageContent::SenderKeyDistribution { .. } | MessageContent::Protocol { .. }
            )
    }
}

pub fn upsert(ctx: &BotContext, messages: &[Message], kind: UpsertKind) {
    let mut touched = BTreeSet::new();
    let mut dispatched = 0;

    for message in messages {
        match ingest_message(ctx, message.clone(), IngestOptions::LIVE, &mut touched) {
            Ok(ingested) => {
                if kind == UpsertKind::Notify && ingested.is_dispatchable() {
                    dispatch_received(ctx, ingested.message);
                    dispatched += 1;
                }
            }
            Err(error) => skip_item("message", Err(error)),
        }
    }

    trim_windows(ctx, &touched);
    debug!(
        count = messages.len(),
        kind = ?kind,
        chats = touched.len(),
        dispatched,
        "messages upserted"
    );
}

/// Write one message and update its chat. The caller trims the windows of
/// every chat recorded in `touched` once it has applied all its messages.
pub(crate) fn ingest_message(
    ctx: &BotContext,
    mut message: Message,
    options: IngestOptions,
    touched: &mut BTreeSet<String>,
) -> Result<Ingested, IngestError> {
    require(&message.key.remote_jid, "message", "remoteJid")?;
    require(&message.key.id, "message", "id")?;

    message.key.remote_jid = jid::normalize(&message.key.remote_jid);
    message.key.participant = jid::normalize_opt(message.key.participant.as_deref());
    message.key.from_me = message.key.from_me || ctx.is_self(message.sender());

    let store = ctx.store();
    let chat_id = message.key.remote_jid.clone();
    let key = keys::message(&chat_id, &message.key.id);

    let mut is_new = true;
    let incoming = message.clone();
    let stored = store.update(&key, WriteKind::Message, |current| {
        let next = match current {
            Some(Entity::Message(mut existing)) => {
                is_new = existing.reconstructed;
                existing.merge(incoming);
                existing
            }
            _ => incoming,
        };
        Some(Entity::Message(next))
    });
    if let Some(Entity::Message(stored)) = stored {
        message = stored;
    }

    if let Some(context) = message.context.as_ref() {
        if let Some(quote) = reconstruct_quote(ctx, &message, context) {
            cache_quote(ctx, quote, touched);
        }
    }

    let from_me = message.key.from_me;
    let enters_window = !from_me && !message.content.is_sender_key_distribution();
    let unread = options.count_unread && is_new && !from_me;
    let window = ctx.message_window();
    let timestamp = message.timestamp;
    let message_id = message.key.id.clone();

    let chat = store.upsert_with(
        &keys::chat(&chat_id),
        WriteKind::Chat,
        || Chat::new(chat_id.clone()),
        |chat: &mut Chat| {
            chat.conversation_timestamp = chat.conversation_timestamp.max(Some(timestamp));
            if unread {
                chat.unread_count = Some(chat.unread_count.unwrap_or(0) + 1);
            }
            if enters_window {
                window.append(&mut chat.messages, &message_id);
            }
        },
    );
    touched.insert(chat_id.clone());

    if options.enrich && chat.is_pending_metadata() {
        ctx.enricher().request(&chat_id);
    }

    trace!(chat = %chat_id, id = %message_id, is_new, from_me, "message ingested");
    Ok(Ingested { message, is_new })
}

/// A minimal message rebuilt from reply context, if the context names one.
fn reconstruct_quote(ctx: &BotContext, quoting: &Message, context: &ContextInfo) -> Option<Message> {
    let stanza_id = context.stanza_id.as_deref().filter(|id| !id.trim().is_empty())?;
    let content = context.quoted_message.clone()?;
    let remote_jid = context
        .remote_jid
        .as_deref()
        .map(jid::normalize)
        .unwrap_or_else(|| quoting.key.remote_jid.clone());
    let participant = jid::normalize_opt(context.participant.as_deref());
    let from_me = participant
        .as_deref()
        .is_some_and(|participant| ctx.is_self(participant));

    Some(Message {
        key: MessageKey {
            remote_jid,
            from_me,
            id: stanza_id.to_string(),
            participant,
        },
        push_name: None,
        timestamp: quoting.timestamp,
        content,
        context: None,
        status: None,
        reactions: Vec::new(),
        receipts: Vec::new(),
        edited: false,
        reconstructed: true,
    })
}

fn cache_quote(ctx: &BotContext, quote: Message, touched: &mut BTreeSet<String>) {
    let store = ctx.store();
    let chat_id = quote.key.remote_jid.clone();
    let quote_id = quote.key.id.clone();
    let key = keys::message(&chat_id, &quote_id);
    if store.contains(&key) {
        return;
    }

    let mut inserted = false;
    store.update(&key, WriteKind::Message, |current| match current {
        Some(existing) => Some(existing),
        None => {
            inserted = true;
            Some(Entity::Message(quote))
        }
    });
    if !inserted {
        return;
    }

    let window = ctx.quoted_window();
    store.upsert_with(
        &keys::chat(&chat_id),
        WriteKind::Chat,
        || Chat::new(chat_id.clone()),
        |chat: &mut Chat| {
            window.append(&mut chat.quoted, &quote_id);
        },
    );
    touched.insert(chat_id.clone());
    trace!(chat = %chat_id, id = %quote_id, "cached quoted message");
}

/// Trim the message and quoted windows of each chat, deleting evicted
/// messages. Evicted quotes are deleted only while still reconstructed, so a
/// quote whose real message has since arrived survives.
pub(crate) fn trim_windows(ctx: &BotContext, chats: &BTreeSet<String>) {
    let store = ctx.store();
    let message_window = ctx.message_window();
    let quoted_window = ctx.quoted_window();

    for chat_id in chats {
        let Some(chat) = store.chat(chat_id) else {
            continue;
        };
        if chat.messages.len() <= message_window.cap() && chat.quoted.len() <= quoted_window.cap()
        {
            continue;
        }

        let mut evicted = Vec::new();
        let mut evicted_quotes = Vec::new();
        store.modify(&keys::chat(chat_id), WriteKind::Chat, |chat: &mut Chat| {
            evicted = message_window.trim(&mut chat.messages);
            evicted_quotes = quoted_window.trim(&mut chat.quoted);
        });

        for id in &evicted {
            store.del(&keys::message(chat_id, id), WriteKind::Message);
        }
        let quotes_removed = evicted_quotes
            .iter()
            .filter(|id| {
                store.del_if(&keys::message(chat_id, id), WriteKind::Message, |entity| {
                    matches!(entity, Entity::Message(message) if message.reconstructed)
                })
            })
            .count();

        debug!(
            chat = %chat_id,
            evicted = evicted.len(),
            quotes = quotes_removed,
            "trimmed chat windows"
        );
    }
}

fn dispatch_received(ctx: &BotContext, message: Message) {
    let bus = ctx.bus().clone();
    ctx.batcher().enqueue(async move {
        let event = Event::new(
            Channel::new(RECEIVED_CHANNEL)?,
            EventSource::System(SOURCE.to_string()),
            EventPayload::MessageReceived { message },
        );
        bus.publish(event)?;
        Ok(())
    });
}

pub fn update(ctx: &BotContext, updates: &[MessageUpdate]) {
    for update in updates {
        let key = message_key(&update.key);
        let patch = update.update.clone();
        let applied = ctx
            .store()
            .modify(&key, WriteKind::Message, |message: &mut Message| {
                message.apply_patch(patch)
            });
        if applied.is_none() {
            trace!(key = %key, "update for unknown message");
        }
    }
}

pub fn delete(ctx: &BotContext, delete: &MessagesDelete) {
    let store = ctx.store();
    match delete {
        MessagesDelete::Keys { keys } => {
            let removed = keys
                .iter()
                .filter(|key| store.del(&message_key(key), WriteKind::Message))
                .count();
            debug!(requested = keys.len(), removed, "messages deleted");
        }
        MessagesDelete::All { jid: chat_id } => {
            let chat_id = jid::normalize(chat_id);
            let removed = store.del_prefix(&keys::message_prefix(&chat_id), WriteKind::Message);
            store.modify(&keys::chat(&chat_id), WriteKind::Chat, |chat: &mut Chat| {
                chat.messages.clear();
                chat.quoted.clear();
            });
            debug!(chat = %chat_id, removed, "cleared chat messages");
        }
    }
}

pub fn react(ctx: &BotContext, reactions: &[Reaction]) {
    for reaction in reactions {
        let mut reaction = reaction.clone();
        reaction.sender = jid::normalize(&reaction.sender);
        let key = message_key(&reaction.key);
        let applied = ctx
            .store()
            .modify(&key, WriteKind::Reaction, |message: &mut Message| {
                message.apply_reaction(reaction)
            });
        if applied.is_none() {
            trace!(key = %key, "reaction to unknown message");
        }
    }
}

pub fn receipts(ctx: &BotContext, receipts: &[MessageReceipt]) {
    for receipt in receipts {
        let mut update = receipt.receipt.clone();
        update.user_jid = jid::normalize(&update.user_jid);
        let key = message_key(&receipt.key);
        let applied = ctx
            .store()
            .modify(&key, WriteKind::Receipt, |message: &mut Message| {
                message.apply_receipt(update)
            });
        if applied.is_none() {
            trace!(key = %key, "receipt for unknown message");
        }
    }
}

fn message_key(key: &MessageKey) -> String {
    keys::message(&jid::normalize(&key.remote_jid), &key.id)
}
