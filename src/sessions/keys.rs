//! Storage key layout.
//!
//! | Key                                          | Holds                  |
//! |----------------------------------------------|------------------------|
//! | `session:{app_name}:{user_id}:{session_id}`  | session header         |
//! | `session_events:{app_name}:{user_id}:{session_id}` | append-only event log |
//!
//! `app_name` and `user_id` are written with `%` as `%25` and `:` as `%3A`, so
//! the first two separators are always real and two different triples never
//! share a key. Names without those characters appear verbatim. The session
//! id is the last segment and is stored as is.
//!
//! Listing scans `session:{app_name}:{user_id or *}:*`. Ids may contain `:`,
//! so scan hits are always re-checked against the decoded header.

use super::traits::SessionKey;

pub const SESSION_PREFIX: &str = "session";
pub const EVENTS_PREFIX: &str = "session_events";

pub fn session_key(key: &SessionKey) -> String {
    format!(
        "{SESSION_PREFIX}:{}:{}:{}",
        encode_part(&key.app_name),
        encode_part(&key.user_id),
        key.session_id
    )
}

pub fn events_key(key: &SessionKey) -> String {
    format!(
        "{EVENTS_PREFIX}:{}:{}:{}",
        encode_part(&key.app_name),
        encode_part(&key.user_id),
        key.session_id
    )
}

fn encode_part(raw: &str) -> String {
    if !raw.contains([':', '%']) {
        return raw.to_string();
    }
    raw.replace('%', "%25").replace(':', "%3A")
}

/// Event log key paired with a session header key found by a scan.
pub fn events_key_for_header(header_key: &str) -> String {
    let rest = header_key
        .strip_prefix(SESSION_PREFIX)
        .unwrap_or(header_key);
    format!("{EVENTS_PREFIX}{rest}")
}

/// Glob pattern matching every session header of an app (and user).
pub fn list_pattern(app_name: &str, user_id: Option<&str>) -> String {
    let user = user_id.map_or_else(|| "*".to_string(), |u| escape_glob(&encode_part(u)));
    format!("{SESSION_PREFIX}:{}:{user}:*", escape_glob(&encode_part(app_name)))
}

/// Escape glob metacharacters so literal key parts match only themselves.
fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
