//! Canonical participant identifiers.
//!
//! The transport addresses the same participant in several shapes: a phone
//! number with or without the `@s.whatsapp.net` server, with a `:<device>`
//! suffix on the user part, or through an opaque linked identifier on the
//! `@lid` server. Every store key is computed from the normalized form so that
//! two events about the same device-less participant land on the same key.

/// Server used for phone-number identities.
pub const DEFAULT_SERVER: &str = "s.whatsapp.net";
pub const LINKED_SERVER: &str = "lid";
pub const GROUP_SERVER: &str = "g.us";
pub const BROADCAST_SERVER: &str = "broadcast";
pub const NEWSLETTER_SERVER: &str = "newsletter";
pub const STATUS_BROADCAST: &str = "status@broadcast";

/// Normalize a raw identifier to its canonical form.
///
/// Drops any `:<device>` suffix from the user part. A result that already has
/// a server is returned as is; a purely numeric one gets the default server
/// appended; anything else is returned without further changes.
pub fn normalize(raw: &str) -> String {
    let raw = raw.trim();
    let (user, server) = match raw.split_once('@') {
        Some((user, server)) => (user, Some(server)),
        None => (raw, None),
    };
    let user = strip_device(user);

    match server {
        Some(server) => format!("{user}@{server}"),
        None if is_numeric(user) => format!("{user}@{DEFAULT_SERVER}"),
        None => user.to_string(),
    }
}

/// [`normalize`] lifted over a missing identifier.
pub fn normalize_opt(raw: Option<&str>) -> Option<String> {
    raw.map(normalize)
}

fn strip_device(user: &str) -> &str {
    match user.split_once(':') {
        Some((bare, _device)) => bare,
        None => user,
    }
}

fn is_numeric(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// User part of a (possibly raw) identifier, without device suffix.
pub fn user_part(jid: &str) -> &str {
    let user = jid.split_once('@').map_or(jid, |(user, _)| user);
    strip_device(user)
}

pub fn server_part(jid: &str) -> Option<&str> {
    jid.split_once('@').map(|(_, server)| server)
}

pub fn is_group(jid: &str) -> bool {
    server_part(jid) == Some(GROUP_SERVER)
}

pub fn is_linked(jid: &str) -> bool {
    server_part(jid) == Some(LINKED_SERVER)
}

pub fn is_broadcast(jid: &str) -> bool {
    server_part(jid) == Some(BROADCAST_SERVER)
}

pub fn is_status_broadcast(jid: &str) -> bool {
    jid == STATUS_BROADCAST
}

pub fn is_newsletter(jid: &str) -> bool {
    server_part(jid) == Some(NEWSLETTER_SERVER)
}

/// True when both identifiers normalize to the same canonical key.
pub fn are_same_user(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}
