pub mod fixtures {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    use perch_core::event::TransportEvent;
    use perch_core::model::GroupMetadata;

    pub fn root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("tests")
            .join("fixtures")
    }

    pub fn path(relative: impl AsRef<Path>) -> PathBuf {
        root().join(relative.as_ref())
    }

    pub fn read(relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(path(relative))
    }

    pub fn transport(name: &str) -> String {
        read_or_panic(Path::new("transport").join(name))
    }

    pub fn config(name: &str) -> String {
        read_or_panic(Path::new("config").join(name))
    }

    /// A single transport event stored as JSON.
    pub fn transport_event(name: &str) -> TransportEvent {
        let json = transport(name);
        serde_json::from_str(&json)
            .unwrap_or_else(|error| panic!("fixture {name} is not a transport event: {error}"))
    }

    /// Transport events stored one per line.
    pub fn transport_events(name: &str) -> Vec<TransportEvent> {
        transport(name)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(index, line)| {
                serde_json::from_str(line).unwrap_or_else(|error| {
                    panic!("fixture {name} line {}: {error}", index + 1)
                })
            })
            .collect()
    }

    pub fn groups(name: &str) -> Vec<GroupMetadata> {
        let json = transport(name);
        serde_json::from_str(&json)
            .unwrap_or_else(|error| panic!("fixture {name} is not a group list: {error}"))
    }

    fn read_or_panic(relative: impl AsRef<Path>) -> String {
        let relative = relative.as_ref();
        read(relative).unwrap_or_else(|error| {
            panic!(
                "failed to read fixture {}: {error}",
                relative.to_string_lossy()
            )
        })
    }
}

/// Builders for transport payloads with fixed, ordered timestamps.
pub mod builders {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use perch_core::event::{TransportEvent, UpsertKind};
    use perch_core::model::{
        Chat, Contact, ContextInfo, GroupMetadata, GroupParticipant, Message, MessageContent,
        MessageKey,
    };

    pub fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
            .single()
            .unwrap_or_default()
    }

    pub struct MessageBuilder {
        message: Message,
    }

    impl MessageBuilder {
        pub fn text(chat: &str, id: &str, body: &str) -> Self {
            Self {
                message: Message {
                    key: MessageKey {
                        remote_jid: chat.to_string(),
                        from_me: false,
                        id: id.to_string(),
                        participant: None,
                    },
                    push_name: None,
                    timestamp: base_time(),
                    content: MessageContent::Text {
                        body: body.to_string(),
                    },
                    context: None,
                    status: None,
                    reactions: Vec::new(),
                    receipts: Vec::new(),
                    edited: false,
                    reconstructed: false,
                },
            }
        }

        pub fn from_me(mut self) -> Self {
            self.message.key.from_me = true;
            self
        }

        pub fn participant(mut self, jid: &str) -> Self {
            self.message.key.participant = Some(jid.to_string());
            self
        }

        pub fn push_name(mut self, name: &str) -> Self {
            self.message.push_name = Some(name.to_string());
            self
        }

        pub fn at_second(mut self, seconds: i64) -> Self {
            self.message.timestamp = base_time() + Duration::seconds(seconds);
            self
        }

        pub fn quoting(mut self, stanza_id: &str, author: &str, body: &str) -> Self {
            self.message.context = Some(ContextInfo {
                stanza_id: Some(stanza_id.to_string()),
                participant: Some(author.to_string()),
                quoted_message: Some(MessageContent::Text {
                    body: body.to_string(),
                }),
                ..ContextInfo::default()
            });
            self
        }

        pub fn sender_key_distribution(mut self) -> Self {
            self.message.content = MessageContent::SenderKeyDistribution {
                group_id: self.message.key.remote_jid.clone(),
            };
            self
        }

        pub fn build(self) -> Message {
            self.message
        }
    }

    pub fn text_message(chat: &str, id: &str, body: &str) -> Message {
        MessageBuilder::text(chat, id, body).build()
    }

    /// `count` inbound messages `m0..` one second apart.
    pub fn inbound_burst(chat: &str, count: usize) -> Vec<Message> {
        (0..count)
            .map(|n| {
                MessageBuilder::text(chat, &format!("m{n}"), "hi")
                    .at_second(n as i64)
                    .build()
            })
            .collect()
    }

    pub fn upsert(messages: Vec<Message>) -> TransportEvent {
        TransportEvent::MessagesUpsert {
            messages,
            kind: UpsertKind::Notify,
        }
    }

    pub fn chat(id: &str) -> Chat {
        Chat::new(id)
    }

    pub fn contact(id: &str, name: &str) -> Contact {
        Contact {
            name: Some(name.to_string()),
            ..Contact::new(id)
        }
    }

    pub fn group_metadata(id: &str, subject: &str, participants: &[&str]) -> GroupMetadata {
        GroupMetadata {
            id: id.to_string(),
            subject: subject.to_string(),
            participants: participants
                .iter()
                .map(|participant| GroupParticipant {
                    id: participant.to_string(),
                    admin: None,
                })
                .collect(),
            ..GroupMetadata::default()
        }
    }
}
