use perch_core::jid;
use perch_core::model::{Contact, Merge};
use perch_core::WriteKind;
use perch_store::keys;
use tracing::{debug, trace};

use super::{require, skip_item};
use crate::context::BotContext;
use crate::error::IngestError;

pub fn upsert(ctx: &BotContext, contacts: &[Contact]) {
    for contact in contacts {
        skip_item("contact", merge_contact(ctx, contact));
    }
    debug!(count = contacts.len(), "contacts upserted");
}

/// Updates for unknown contacts are dropped.
pub fn update(ctx: &BotContext, contacts: &[Contact]) {
    for contact in contacts {
        skip_item("contact", update_contact(ctx, contact));
    }
}

pub(crate) fn merge_contact(ctx: &BotContext, contact: &Contact) -> Result<(), IngestError> {
    let incoming = normalized(contact)?;
    let id = incoming.id.clone();
    record_aliases(ctx, &incoming);
    ctx.store().upsert_with(
        &keys::contact(&id),
        WriteKind::Contact,
        || Contact::new(id.clone()),
        |existing: &mut Contact| existing.merge(incoming),
    );
    Ok(())
}

fn update_contact(ctx: &BotContext, contact: &Contact) -> Result<(), IngestError> {
    let incoming = normalized(contact)?;
    let id = incoming.id.clone();
    record_aliases(ctx, &incoming);
    let merged = ctx
        .store()
        .modify(&keys::contact(&id), WriteKind::Contact, |existing: &mut Contact| {
            existing.merge(incoming)
        });
    if merged.is_none() {
        trace!(contact = %id, "update for unknown contact");
    }
    Ok(())
}

fn normalized(contact: &Contact) -> Result<Contact, IngestError> {
    require(&contact.id, "contact", "id")?;
    let mut contact = contact.clone();
    contact.id = jid::normalize(&contact.id);
    contact.lid = jid::normalize_opt(contact.lid.as_deref());
    contact.phone_number = jid::normalize_opt(contact.phone_number.as_deref());
    Ok(contact)
}

/// Record every linked/phone-number pair the contact reveals. Pairs without
/// exactly one linked form are ignored by the alias map.
fn record_aliases(ctx: &BotContext, contact: &Contact) {
    let forms = [
        Some(contact.id.as_str()),
        contact.lid.as_deref(),
        contact.phone_number.as_deref(),
    ];
    for (i, a) in forms.iter().enumerate() {
        for b in &forms[i + 1..] {
            if let (Some(a), Some(b)) = (a, b) {
                ctx.store().record_alias(a, b);
            }
        }
    }
}
