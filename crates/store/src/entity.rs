use std::collections::BTreeSet;

use perch_core::model::{CallOffer, Chat, Contact, GroupMetadata, Message, PresenceRecord};
use serde::{Deserialize, Serialize};

/// The set of blocked identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Blocklist {
    pub ids: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum Entity {
    Chat(Chat),
    Contact(Contact),
    Message(Message),
    Group(GroupMetadata),
    Presence(PresenceRecord),
    Call(CallOffer),
    Blocklist(Blocklist),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Chat,
    Contact,
    Message,
    Group,
    Presence,
    Call,
    Blocklist,
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Chat(_) => EntityKind::Chat,
            Entity::Contact(_) => EntityKind::Contact,
            Entity::Message(_) => EntityKind::Message,
            Entity::Group(_) => EntityKind::Group,
            Entity::Presence(_) => EntityKind::Presence,
            Entity::Call(_) => EntityKind::Call,
            Entity::Blocklist(_) => EntityKind::Blocklist,
        }
    }
}

/// A typed payload that can be stored as an [`Entity`].
pub trait EntityPayload: Clone + Sized {
    fn into_entity(self) -> Entity;
    fn from_entity(entity: &Entity) -> Option<&Self>;
    fn from_entity_mut(entity: &mut Entity) -> Option<&mut Self>;
}

macro_rules! entity_payload {
    ($variant:ident, $ty:ty) => {
        impl EntityPayload for $ty {
            fn into_entity(self) -> Entity {
                Entity::$variant(self)
            }

            fn from_entity(entity: &Entity) -> Option<&Self> {
                match entity {
                    Entity::$variant(value) => Some(value),
                    _ => None,
                }
            }

            fn from_entity_mut(entity: &mut Entity) -> Option<&mut Self> {
                match entity {
                    Entity::$variant(value) => Some(value),
                    _ => None,
                }
            }
        }
    };
}

entity_payload!(Chat, Chat);
entity_payload!(Contact, Contact);
entity_payload!(Message, Message);
entity_payload!(Group, GroupMetadata);
entity_payload!(Presence, PresenceRecord);
entity_payload!(Call, CallOffer);
entity_payload!(Blocklist, Blocklist);

/// Store key construction. Callers pass canonical identifiers.
pub mod keys {
    pub const BLOCKLIST: &str = "blocklist";

    pub fn chat(id: &str) -> String {
        format!("chat:{id}")
    }

    pub fn contact(id: &str) -> String {
        format!("contact:{id}")
    }

    pub fn message(chat_id: &str, message_id: &str) -> String {
        format!("message:{chat_id}:{message_id}")
    }

    /// Prefix shared by every message key of one chat.
    pub fn message_prefix(chat_id: &str) -> String {
        format!("message:{chat_id}:")
    }

    pub fn group(id: &str) -> String {
        format!("group:{id}")
    }

    pub fn presence(id: &str) -> String {
        format!("presence:{id}")
    }

    pub fn call(id: &str) -> String {
        format!("call:{id}")
    }
}
