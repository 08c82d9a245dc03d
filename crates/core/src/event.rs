//! The in-process event bus and the events that travel on it.
//!
//! Channel names are dotted lowercase paths whose first segment selects one
//! of three domains. Each domain is its own broadcast channel, so a flood of
//! transport events never pushes system events out of a subscriber's buffer.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::change::StoreChange;
use crate::error::EventBusError;
use crate::model::{
    CallOffer, Chat, Contact, GroupMetadata, GroupUpdate, Message, MessageKey, MessagePatch,
    OwnIdentity, ParticipantAction, PresenceData, Reaction, Receipt,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    System,
    Transport,
    Plugin,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::System, Domain::Transport, Domain::Plugin];

    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "system" => Some(Domain::System),
            "transport" => Some(Domain::Transport),
            "plugin" => Some(Domain::Plugin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Domain::System => "system",
            Domain::Transport => "transport",
            Domain::Plugin => "plugin",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// A validated channel name such as `transport.messages.upsert`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    /// Non-empty `[a-z0-9]` segments joined by dots, starting with a known
    /// domain.
    pub fn is_valid(name: &str) -> bool {
        let known_domain = name.split('.').next().and_then(Domain::from_segment).is_some();
        known_domain
            && name.split('.').all(|segment| {
                !segment.is_empty()
                    && segment
                        .bytes()
                        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
            })
    }

    pub fn domain(&self) -> Domain {
        self.0
            .split('.')
            .next()
            .and_then(Domain::from_segment)
            .unwrap_or(Domain::System)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Channel {
    type Error = EventBusError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Channel::new(name)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// Envelope around every payload on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub channel: Channel,
    pub timestamp: DateTime<Utc>,
    pub id: Uuid,
    pub source: EventSource,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            source,
            payload,
        }
    }

    /// Wrap a transport event under its canonical channel.
    pub fn transport(event: TransportEvent) -> Self {
        Self::new(
            event.channel(),
            EventSource::Transport,
            EventPayload::Transport(event),
        )
    }
}

/// Who published an event. `System` carries the publishing component's name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "component", rename_all = "camelCase")]
pub enum EventSource {
    System(String),
    Transport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── System events ──────────────────────────────────────────────
    StartupComplete,
    ShutdownRequested {
        reason: String,
    },

    // ── Transport events ───────────────────────────────────────────
    Transport(TransportEvent),

    // ── Plugin dispatch ────────────────────────────────────────────
    /// A new inbound message, ready for command plugins.
    MessageReceived {
        message: Message,
    },
    /// Store writes drained from the priority queue, highest tier first.
    StoreChanged {
        changes: Vec<StoreChange>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Close,
}

/// `Notify` upserts are live messages; `Append` ones are catch-up the bot
/// should store but not act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpsertKind {
    Notify,
    Append,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpdate {
    pub key: MessageKey,
    pub update: MessagePatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceipt {
    pub key: MessageKey,
    pub receipt: Receipt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "camelCase")]
pub enum MessagesDelete {
    /// Specific messages
    Keys { keys: Vec<MessageKey> },
    /// Every message in one chat
    All { jid: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlocklistAction {
    Add,
    Remove,
}

/// Events delivered by the messaging transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum TransportEvent {
    ConnectionUpdate {
        state: ConnectionState,
        #[serde(default)]
        last_disconnect: Option<String>,
    },
    CredentialsUpdate {
        me: OwnIdentity,
    },
    HistorySet {
        #[serde(default)]
        chats: Vec<Chat>,
        #[serde(default)]
        contacts: Vec<Contact>,
        #[serde(default)]
        messages: Vec<Message>,
        #[serde(default)]
        is_latest: bool,
    },
    MessagesUpsert {
        messages: Vec<Message>,
        kind: UpsertKind,
    },
    MessagesUpdate {
        updates: Vec<MessageUpdate>,
    },
    MessagesDelete(MessagesDelete),
    MessagesReaction {
        reactions: Vec<Reaction>,
    },
    ReceiptUpdate {
        receipts: Vec<MessageReceipt>,
    },
    ChatsSet {
        chats: Vec<Chat>,
    },
    ChatsUpsert {
        chats: Vec<Chat>,
    },
    ChatsUpdate {
        chats: Vec<Chat>,
    },
    ChatsDelete {
        ids: Vec<String>,
    },
    PresenceUpdate {
        id: String,
        presences: BTreeMap<String, PresenceData>,
    },
    ContactsSet {
        contacts: Vec<Contact>,
    },
    ContactsUpsert {
        contacts: Vec<Contact>,
    },
    ContactsUpdate {
        contacts: Vec<Contact>,
    },
    GroupsUpsert {
        groups: Vec<GroupMetadata>,
    },
    GroupsUpdate {
        updates: Vec<GroupUpdate>,
    },
    GroupParticipantsUpdate {
        id: String,
        participants: Vec<String>,
        action: ParticipantAction,
    },
    Call {
        calls: Vec<CallOffer>,
    },
    BlocklistSet {
        ids: Vec<String>,
    },
    BlocklistUpdate {
        ids: Vec<String>,
        action: BlocklistAction,
    },
}

impl TransportEvent {
    pub fn channel_name(&self) -> &'static str {
        match self {
            TransportEvent::ConnectionUpdate { .. } => "transport.connection.update",
            TransportEvent::CredentialsUpdate { .. } => "transport.creds.update",
            TransportEvent::HistorySet { .. } => "transport.history.set",
            TransportEvent::MessagesUpsert { .. } => "transport.messages.upsert",
            TransportEvent::MessagesUpdate { .. } => "transport.messages.update",
            TransportEvent::MessagesDelete(_) => "transport.messages.delete",
            TransportEvent::MessagesReaction { .. } => "transport.messages.reaction",
            TransportEvent::ReceiptUpdate { .. } => "transport.receipt.update",
            TransportEvent::ChatsSet { .. } => "transport.chats.set",
            TransportEvent::ChatsUpsert { .. } => "transport.chats.upsert",
            TransportEvent::ChatsUpdate { .. } => "transport.chats.update",
            TransportEvent::ChatsDelete { .. } => "transport.chats.delete",
            TransportEvent::PresenceUpdate { .. } => "transport.presence.update",
            TransportEvent::ContactsSet { .. } => "transport.contacts.set",
            TransportEvent::ContactsUpsert { .. } => "transport.contacts.upsert",
            TransportEvent::ContactsUpdate { .. } => "transport.contacts.update",
            TransportEvent::GroupsUpsert { .. } => "transport.groups.upsert",
            TransportEvent::GroupsUpdate { .. } => "transport.groups.update",
            TransportEvent::GroupParticipantsUpdate { .. } => {
                "transport.group.participants.update"
            }
            TransportEvent::Call { .. } => "transport.call",
            TransportEvent::BlocklistSet { .. } => "transport.blocklist.set",
            TransportEvent::BlocklistUpdate { .. } => "transport.blocklist.update",
        }
    }

    pub fn channel(&self) -> Channel {
        Channel(self.channel_name().to_string())
    }
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError>;
}

/// One tokio broadcast channel per [`Domain`].
#[derive(Clone)]
pub struct BroadcastEventBus {
    capacity: usize,
    senders: [broadcast::Sender<Event>; 3],
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        Self {
            capacity,
            senders: Domain::ALL.map(|_| broadcast::channel(capacity).0),
        }
    }

    /// Events each domain buffers before slow subscribers start lagging.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn sender(&self, domain: Domain) -> &broadcast::Sender<Event> {
        &self.senders[domain.index()]
    }

    /// Domains a pattern can match. A glob in the first segment spans all of
    /// them; otherwise the segment must name a domain.
    fn domains_for(pattern: &str) -> Result<Vec<Domain>, EventBusError> {
        let first = pattern.split('.').next().unwrap_or_default();
        if first.contains(['*', '?', '[', ']', '{', '}', '!']) {
            return Ok(Domain::ALL.to_vec());
        }
        Domain::from_segment(first)
            .map(|domain| vec![domain])
            .ok_or_else(|| EventBusError::InvalidPattern(pattern.to_string()))
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    /// Never fails for lack of subscribers; the event is simply dropped.
    fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let _ = self.sender(event.channel.domain()).send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let mut receivers: [Option<broadcast::Receiver<Event>>; 3] = [None, None, None];
        for domain in Self::domains_for(pattern)? {
            receivers[domain.index()] = Some(self.sender(domain).subscribe());
        }
        Ok(EventSubscription { matcher, receivers })
    }
}

/// A glob-filtered view over one or more domain channels.
#[derive(Debug)]
pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: [Option<broadcast::Receiver<Event>>; 3],
}

impl EventSubscription {
    /// Next matching event. Lag on any domain is reported once as
    /// [`EventBusError::Lagged`] and the subscription stays usable.
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            let [system, transport, plugin] = &mut self.receivers;
            let received = tokio::select! {
                result = next_from(system.as_mut()) => result,
                result = next_from(transport.as_mut()) => result,
                result = next_from(plugin.as_mut()) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => continue,
                Err(RecvError::Closed) => return Err(EventBusError::ChannelClosed),
                Err(RecvError::Lagged(missed)) => return Err(EventBusError::Lagged(missed)),
            }
        }
    }
}

async fn next_from(receiver: Option<&mut broadcast::Receiver<Event>>) -> Result<Event, RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
