//! Typed payloads carried by transport events and held by the entity store.
//!
//! Optional fields model "absent from this event" so that update events can be
//! shallow-merged over what the store already knows: a field present in the
//! incoming value wins, an absent one leaves the stored value alone.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shallow merge of an incoming value over a stored one.
pub trait Merge {
    fn merge(&mut self, patch: Self);
}

fn take_some<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

// ── Messages ─────────────────────────────────────────────────────────

/// Addresses one message within one chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    /// Chat the message belongs to
    pub remote_jid: String,

    /// Whether the bot's own account sent it
    #[serde(default)]
    pub from_me: bool,

    /// Transport-assigned message ID
    pub id: String,

    /// Sender inside a group chat
    #[serde(default)]
    pub participant: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Media {
        media: MediaKind,
        #[serde(default)]
        caption: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
    },
    /// Group sender-key distribution; protocol plumbing, never user content.
    SenderKeyDistribution {
        group_id: String,
    },
    Protocol {
        kind: String,
    },
    Other {
        kind: String,
    },
}

impl MessageContent {
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text { body } => Some(body),
            MessageContent::Media { caption, .. } => caption.as_deref(),
            _ => None,
        }
    }

    pub fn is_sender_key_distribution(&self) -> bool {
        matches!(self, MessageContent::SenderKeyDistribution { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

/// Reply context attached to a message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    /// ID of the quoted message
    #[serde(default)]
    pub stanza_id: Option<String>,

    /// Author of the quoted message
    #[serde(default)]
    pub participant: Option<String>,

    /// Chat of the quoted message when it differs from the replying chat
    #[serde(default)]
    pub remote_jid: Option<String>,

    #[serde(default)]
    pub quoted_message: Option<MessageContent>,

    #[serde(default)]
    pub mentioned_jids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageStatus {
    Pending,
    ServerAck,
    DeliveryAck,
    Read,
    Played,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReceiptKind {
    Delivered,
    Read,
    Played,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub user_jid: String,
    pub kind: ReceiptKind,
    pub timestamp: DateTime<Utc>,
}

/// A reaction sent by `sender` to the message addressed by `key`. An empty or
/// missing `text` retracts the sender's previous reaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub key: MessageKey,
    pub sender: String,
    #[serde(default)]
    pub text: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Reaction {
    pub fn is_removal(&self) -> bool {
        self.text.as_deref().map_or(true, str::is_empty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub key: MessageKey,

    #[serde(default)]
    pub push_name: Option<String>,

    pub timestamp: DateTime<Utc>,

    pub content: MessageContent,

    #[serde(default)]
    pub context: Option<ContextInfo>,

    #[serde(default)]
    pub status: Option<MessageStatus>,

    #[serde(default)]
    pub reactions: Vec<Reaction>,

    #[serde(default)]
    pub receipts: Vec<Receipt>,

    #[serde(default)]
    pub edited: bool,

    /// Rebuilt from a quote's context rather than received directly.
    #[serde(default)]
    pub reconstructed: bool,
}

impl Message {
    /// Sender of the message: the group participant if set, else the chat.
    pub fn sender(&self) -> &str {
        self.key
            .participant
            .as_deref()
            .unwrap_or(&self.key.remote_jid)
    }

    /// Apply a reaction, replacing any earlier reaction by the same sender.
    pub fn apply_reaction(&mut self, reaction: Reaction) {
        self.reactions.retain(|r| r.sender != reaction.sender);
        if !reaction.is_removal() {
            self.reactions.push(reaction);
        }
    }

    /// Record a receipt, keeping one entry per user and receipt kind.
    pub fn apply_receipt(&mut self, receipt: Receipt) {
        self.receipts
            .retain(|r| !(r.user_jid == receipt.user_jid && r.kind == receipt.kind));
        self.receipts.push(receipt);
    }
}

/// Fields a message-update event may change.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePatch {
    #[serde(default)]
    pub status: Option<MessageStatus>,

    /// Replacement content for an edited message
    #[serde(default)]
    pub content: Option<MessageContent>,

    #[serde(default)]
    pub push_name: Option<String>,
}

impl Merge for Message {
    fn merge(&mut self, patch: Self) {
        take_some(&mut self.push_name, patch.push_name);
        take_some(&mut self.context, patch.context);
        take_some(&mut self.status, patch.status);
        self.timestamp = patch.timestamp;
        self.content = patch.content;
        self.edited |= patch.edited;
        self.reconstructed = patch.reconstructed;
        if !patch.reactions.is_empty() {
            self.reactions = patch.reactions;
        }
        if !patch.receipts.is_empty() {
            self.receipts = patch.receipts;
        }
    }
}

impl Message {
    pub fn apply_patch(&mut self, patch: MessagePatch) {
        take_some(&mut self.status, patch.status);
        take_some(&mut self.push_name, patch.push_name);
        if let Some(content) = patch.content {
            self.content = content;
            self.edited = true;
        }
    }
}

// ── Chats ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Group subject
    #[serde(default)]
    pub subject: Option<String>,

    #[serde(default)]
    pub conversation_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub unread_count: Option<u32>,

    #[serde(default)]
    pub archived: Option<bool>,

    /// When the chat was pinned
    #[serde(default)]
    pub pinned: Option<DateTime<Utc>>,

    /// End of the mute period
    #[serde(default)]
    pub mute_end_time: Option<DateTime<Utc>>,

    /// Resolved group metadata; absent while pending.
    #[serde(default)]
    pub metadata: Option<GroupMetadata>,

    /// Last known presence per participant.
    #[serde(default)]
    pub presences: BTreeMap<String, PresenceData>,

    /// Recent inbound message IDs, oldest first.
    #[serde(default)]
    pub messages: Vec<String>,

    /// IDs of quoted messages reconstructed from reply context, oldest first.
    #[serde(default)]
    pub quoted: Vec<String>,
}

impl Chat {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn is_group(&self) -> bool {
        crate::jid::is_group(&self.id)
    }

    /// A group chat whose metadata has not been fetched yet.
    pub fn is_pending_metadata(&self) -> bool {
        self.is_group() && self.metadata.is_none()
    }

    /// The part of a history chat written before any enrichment.
    pub fn projection(&self) -> Chat {
        Chat {
            id: self.id.clone(),
            name: self.name.clone(),
            subject: self.subject.clone(),
            conversation_timestamp: self.conversation_timestamp,
            unread_count: self.unread_count,
            archived: self.archived,
            pinned: self.pinned,
            mute_end_time: self.mute_end_time,
            ..Chat::default()
        }
    }
}

/// Merges transport-owned fields only; windows and presences are maintained by
/// the ingestion handlers and survive chat updates.
impl Merge for Chat {
    fn merge(&mut self, patch: Self) {
        take_some(&mut self.name, patch.name);
        take_some(&mut self.subject, patch.subject);
        take_some(&mut self.conversation_timestamp, patch.conversation_timestamp);
        take_some(&mut self.unread_count, patch.unread_count);
        take_some(&mut self.archived, patch.archived);
        take_some(&mut self.pinned, patch.pinned);
        take_some(&mut self.mute_end_time, patch.mute_end_time);
        take_some(&mut self.metadata, patch.metadata);
    }
}

// ── Contacts ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,

    /// Linked identifier for this contact, when known
    #[serde(default)]
    pub lid: Option<String>,

    /// Phone-number identifier for this contact, when known
    #[serde(default)]
    pub phone_number: Option<String>,

    /// Name saved in the address book
    #[serde(default)]
    pub name: Option<String>,

    /// Name the contact chose for themself
    #[serde(default)]
    pub notify: Option<String>,

    #[serde(default)]
    pub verified_name: Option<String>,

    #[serde(default)]
    pub img_url: Option<String>,
}

impl Contact {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .or(self.notify.as_deref())
            .or(self.verified_name.as_deref())
    }
}

impl Merge for Contact {
    fn merge(&mut self, patch: Self) {
        take_some(&mut self.lid, patch.lid);
        take_some(&mut self.phone_number, patch.phone_number);
        take_some(&mut self.name, patch.name);
        take_some(&mut self.notify, patch.notify);
        take_some(&mut self.verified_name, patch.verified_name);
        take_some(&mut self.img_url, patch.img_url);
    }
}

// ── Groups ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AdminRole {
    Admin,
    SuperAdmin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupParticipant {
    pub id: String,
    #[serde(default)]
    pub admin: Option<AdminRole>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMetadata {
    pub id: String,

    pub subject: String,

    #[serde(default)]
    pub owner: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub creation: Option<DateTime<Utc>>,

    #[serde(default)]
    pub participants: Vec<GroupParticipant>,

    /// Only admins may send messages
    #[serde(default)]
    pub announce: Option<bool>,

    /// Only admins may edit group info
    #[serde(default)]
    pub restrict: Option<bool>,
}

impl GroupMetadata {
    pub fn participant(&self, id: &str) -> Option<&GroupParticipant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn is_admin(&self, id: &str) -> bool {
        self.participant(id).is_some_and(|p| p.admin.is_some())
    }

    /// Apply a membership change. Adding an existing participant or removing
    /// an absent one is a no-op.
    pub fn apply_participants(&mut self, ids: &[String], action: ParticipantAction) {
        match action {
            ParticipantAction::Add => {
                for id in ids {
                    if self.participant(id).is_none() {
                        self.participants.push(GroupParticipant {
                            id: id.clone(),
                            admin: None,
                        });
                    }
                }
            }
            ParticipantAction::Remove => {
                self.participants.retain(|p| !ids.contains(&p.id));
            }
            ParticipantAction::Promote | ParticipantAction::Demote => {
                let role = match action {
                    ParticipantAction::Promote => Some(AdminRole::Admin),
                    _ => None,
                };
                for participant in self.participants.iter_mut() {
                    if ids.contains(&participant.id) {
                        participant.admin = role;
                    }
                }
            }
        }
    }
}

/// Fields a group-update event may change.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupUpdate {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub announce: Option<bool>,
    #[serde(default)]
    pub restrict: Option<bool>,
}

impl GroupMetadata {
    pub fn apply_update(&mut self, update: GroupUpdate) {
        if let Some(subject) = update.subject {
            self.subject = subject;
        }
        take_some(&mut self.description, update.description);
        take_some(&mut self.owner, update.owner);
        take_some(&mut self.announce, update.announce);
        take_some(&mut self.restrict, update.restrict);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
}

// ── Presence ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PresenceKind {
    Available,
    Unavailable,
    Composing,
    Recording,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceData {
    pub last_known_presence: PresenceKind,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Presence of one participant as last observed in one chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub id: String,
    pub chat_id: String,
    pub presence: PresenceData,
    pub updated_at: DateTime<Utc>,
}

// ── Calls ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallStatus {
    Offer,
    Ringing,
    Timeout,
    Reject,
    Accept,
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOffer {
    pub id: String,
    pub chat_id: String,
    pub from: String,
    pub status: CallStatus,
    #[serde(default)]
    pub is_video: bool,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub group_jid: Option<String>,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub offline: bool,
}

impl Merge for CallOffer {
    /// Status updates for a call keep the original offer's date and flags.
    fn merge(&mut self, patch: Self) {
        self.status = patch.status;
        self.offline = patch.offline;
        take_some(&mut self.group_jid, patch.group_jid);
    }
}

// ── Identity ─────────────────────────────────────────────────────────

/// The bot's own account, from the credentials.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnIdentity {
    pub id: String,
    #[serde(default)]
    pub lid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}
