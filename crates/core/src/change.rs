//! Entity store write kinds and their priority tiers.

use serde::{Deserialize, Serialize};

/// Processing priority of a store write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Tier {
    /// Identity and content state; never dropped or coalesced
    Core,
    /// Ephemeral signals such as presence and receipts
    Aux,
    /// Low-value notifications
    Noise,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Core, Tier::Aux, Tier::Noise];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Core => "core",
            Tier::Aux => "aux",
            Tier::Noise => "noise",
        }
    }
}

/// What caused a store write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteKind {
    Connection,
    Credentials,
    HistorySync,
    Message,
    Chat,
    Contact,
    Group,
    Call,
    Blocklist,
    Presence,
    Receipt,
    Reaction,
    ChatDelete,
}

impl WriteKind {
    pub fn tier(self) -> Tier {
        match self {
            WriteKind::Connection
            | WriteKind::Credentials
            | WriteKind::HistorySync
            | WriteKind::Message
            | WriteKind::Chat
            | WriteKind::Contact
            | WriteKind::Group
            | WriteKind::Call
            | WriteKind::Blocklist => Tier::Core,
            WriteKind::Presence | WriteKind::Receipt | WriteKind::Reaction => Tier::Aux,
            WriteKind::ChatDelete => Tier::Noise,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeOp {
    Set,
    Delete,
}

/// One recorded store write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreChange {
    pub key: String,
    pub kind: WriteKind,
    pub op: ChangeOp,
}

impl StoreChange {
    pub fn set(key: impl Into<String>, kind: WriteKind) -> Self {
        Self {
            key: key.into(),
            kind,
            op: ChangeOp::Set,
        }
    }

    pub fn delete(key: impl Into<String>, kind: WriteKind) -> Self {
        Self {
            key: key.into(),
            kind,
            op: ChangeOp::Delete,
        }
    }

    pub fn tier(&self) -> Tier {
        self.kind.tier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_follow_write_kind() {
        for kind in [
            WriteKind::Connection,
            WriteKind::Credentials,
            WriteKind::HistorySync,
            WriteKind::Message,
            WriteKind::Chat,
            WriteKind::Contact,
            WriteKind::Group,
            WriteKind::Call,
            WriteKind::Blocklist,
        ] {
            assert_eq!(kind.tier(), Tier::Core, "{kind:?}");
        }
        assert_eq!(WriteKind::Presence.tier(), Tier::Aux);
        assert_eq!(WriteKind::Receipt.tier(), Tier::Aux);
        assert_eq!(WriteKind::Reaction.tier(), Tier::Aux);
        assert_eq!(WriteKind::ChatDelete.tier(), Tier::Noise);
    }
}
