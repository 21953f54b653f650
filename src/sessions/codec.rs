//! Versioned wire schema for persisted sessions.
//!
//! Every backend stores sessions through these records. A stored document is
//! a JSON object:
//!
//! ```json
//! {
//!   "version": 1,
//!   "app_name": "app1",
//!   "user_id": "alice",
//!   "session_id": "s1",
//!   "state": {},
//!   "created_at": "2025-01-01T00:00:00Z",
//!   "updated_at": "2025-01-01T00:00:00Z",
//!   "events": [
//!     {
//!       "id": "…",
//!       "timestamp": "2025-01-01T00:00:01Z",
//!       "author": "user",
//!       "partial": false,
//!       "actions": { "state_delta": { "topic": "poems" } }
//!     }
//!   ]
//! }
//! ```
//!
//! `state` holds the state the session was created with; the live state is
//! always re-derived by folding `events`. Decoding rejects unknown versions and
//! events without an author instead of filling in defaults.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event_log::fold_state;
use super::traits::{Event, EventActions, Session, SessionKey, StateMap};
use crate::error::{Result, SessionError};

pub const SCHEMA_VERSION: u32 = 1;

/// Full persisted form of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDocument {
    pub version: u32,
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
    /// Initial state supplied at creation.
    pub state: StateMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub events: Vec<EventRecord>,
}

/// Persisted form of one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    #[serde(with = "fixed_width_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    pub actions: ActionsRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionsRecord {
    pub state_delta: StateMap,
}

impl SessionDocument {
    pub fn new(key: &SessionKey, state: StateMap, now: DateTime<Utc>) -> Self {
        Self {
            version: SCHEMA_VERSION,
            app_name: key.app_name.clone(),
            user_id: key.user_id.clone(),
            session_id: key.session_id.clone(),
            state,
            created_at: now,
            updated_at: now,
            events: Vec::new(),
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.app_name, &self.user_id, &self.session_id)
    }

    /// Reject documents this build cannot interpret faithfully.
    pub fn validate(&self) -> Result<()> {
        if self.version != SCHEMA_VERSION {
            return Err(SessionError::Validation(format!(
                "unsupported session schema version {} (expected {SCHEMA_VERSION})",
                self.version
            )));
        }
        for record in &self.events {
            record.validate()?;
        }
        Ok(())
    }

    /// Materialize the live session: initial state folded with every event.
    pub fn into_session(self) -> Session {
        let events: Vec<Event> = self.events.into_iter().map(Event::from).collect();
        let state = fold_state(self.state, &events);
        Session {
            id: self.session_id,
            app_name: self.app_name,
            user_id: self.user_id,
            state,
            events,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl EventRecord {
    pub fn validate(&self) -> Result<()> {
        if self.author.trim().is_empty() {
            return Err(SessionError::Validation(format!(
                "event '{}' has no author",
                self.id
            )));
        }
        if self.id.trim().is_empty() {
            return Err(SessionError::Validation("event has no id".into()));
        }
        Ok(())
    }
}

impl From<&Event> for EventRecord {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id.clone(),
            invocation_id: event.invocation_id.clone(),
            timestamp: event.timestamp,
            author: event.author.clone(),
            partial: event.partial,
            content: event.content.clone(),
            actions: ActionsRecord {
                state_delta: event.actions.state_delta.clone(),
            },
        }
    }
}

impl From<EventRecord> for Event {
    fn from(record: EventRecord) -> Self {
        Self {
            id: record.id,
            invocation_id: record.invocation_id,
            timestamp: record.timestamp,
            author: record.author,
            partial: record.partial,
            content: record.content,
            actions: EventActions {
                state_delta: record.actions.state_delta,
            },
        }
    }
}

pub fn encode_document(document: &SessionDocument) -> Result<String> {
    Ok(serde_json::to_string(document)?)
}

pub fn decode_document(raw: &str) -> Result<SessionDocument> {
    let document: SessionDocument = serde_json::from_str(raw)?;
    document.validate()?;
    Ok(document)
}

pub fn encode_event(record: &EventRecord) -> Result<String> {
    record.validate()?;
    Ok(serde_json::to_string(record)?)
}

pub fn decode_event(raw: &str) -> Result<EventRecord> {
    let record: EventRecord = serde_json::from_str(raw)?;
    record.validate()?;
    Ok(record)
}

/// Encode an initial state map (used by backends that store it apart from
/// the event log).
pub fn encode_state(state: &StateMap) -> Result<String> {
    Ok(serde_json::to_string(state)?)
}

pub fn decode_state(raw: &str) -> Result<StateMap> {
    Ok(serde_json::from_str(raw)?)
}

/// Fixed-width RFC 3339 with nanoseconds, so stored timestamps compare
/// correctly as plain strings.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| SessionError::Validation(format!("stored field '{field}': {e}")))
}

/// Event timestamps are written with [`format_timestamp`] so server-side
/// scripts can order them without parsing.
mod fixed_width_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(*at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| at.with_timezone(&Utc))
            .map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_document() -> SessionDocument {
        let now = Utc::now();
        let mut initial = StateMap::new();
        initial.insert("lang".into(), json!("en"));
        let mut doc = SessionDocument::new(&SessionKey::new("app1", "alice", "s1"), initial, now);
        doc.events.push(EventRecord::from(
            &Event::new("user")
                .with_id("e1")
                .with_timestamp(now)
                .with_content(json!({"text": "write me a poem"}))
                .with_state_delta("topic", json!("poems")),
        ));
        doc.events.push(EventRecord::from(
            &Event::new("poet_agent")
                .with_id("e2")
                .with_invocation_id("inv-1")
                .with_timestamp(now)
                .partial(true)
                .with_state_delta("meta", json!({"counts": [1, 2, {"nested": null}]})),
        ));
        doc
    }

    #[test]
    fn document_round_trip_is_lossless() {
        let doc = sample_document();
        let raw = encode_document(&doc).unwrap();
        let decoded = decode_document(&raw).unwrap();
        assert_eq!(decoded, doc);
        assert_eq!(decoded.into_session(), doc.into_session());
    }

    #[test]
    fn into_session_folds_deltas_over_initial_state() {
        let session = sample_document().into_session();
        assert_eq!(session.state["lang"], json!("en"));
        assert_eq!(session.state["topic"], json!("poems"));
        assert_eq!(session.state["meta"]["counts"][2]["nested"], Value::Null);
        assert_eq!(session.events.len(), 2);
        assert_eq!(session.events[1].author, "poet_agent");
    }

    #[test]
    fn decode_rejects_missing_author() {
        let mut value = serde_json::to_value(sample_document()).unwrap();
        value["events"][0].as_object_mut().unwrap().remove("author");
        let err = decode_document(&value.to_string()).unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
        assert!(err.to_string().contains("author"));
    }

    #[test]
    fn decode_rejects_blank_author() {
        let mut value = serde_json::to_value(sample_document()).unwrap();
        value["events"][1]["author"] = json!("  ");
        let err = decode_document(&value.to_string()).unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
    }

    #[test]
    fn decode_rejects_missing_partial_flag() {
        let mut value = serde_json::to_value(sample_document()).unwrap();
        value["events"][0].as_object_mut().unwrap().remove("partial");
        assert!(decode_document(&value.to_string()).is_err());
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let mut value = serde_json::to_value(sample_document()).unwrap();
        value["version"] = json!(99);
        let err = decode_document(&value.to_string()).unwrap_err();
        assert!(err.to_string().contains("version 99"));
    }

    #[test]
    fn encode_event_refuses_authorless_record() {
        let record = EventRecord::from(&Event::new("").with_id("e1"));
        assert!(matches!(
            encode_event(&record),
            Err(SessionError::Validation(_))
        ));
    }

    #[test]
    fn formatted_timestamps_sort_lexicographically() {
        let early = Utc::now();
        let late = early + chrono::Duration::nanoseconds(1);
        assert!(format_timestamp(late) > format_timestamp(early));
        assert_eq!(parse_timestamp("t", &format_timestamp(early)).unwrap(), early);
        assert!(parse_timestamp("t", "yesterday").is_err());
    }

    #[test]
    fn event_wire_shape_uses_nested_actions() {
        let record = EventRecord::from(
            &Event::new("user")
                .with_id("e1")
                .with_state_delta("k", json!(true)),
        );
        let value: Value = serde_json::from_str(&encode_event(&record).unwrap()).unwrap();
        assert_eq!(value["actions"]["state_delta"]["k"], json!(true));
        assert_eq!(value["partial"], json!(false));
        assert!(value.get("content").is_none());
        assert_eq!(decode_event(&value.to_string()).unwrap(), record);
    }

    #[test]
    fn event_timestamps_are_written_fixed_width() {
        let at = DateTime::parse_from_rfc3339("2025-01-01T00:00:01Z")
            .unwrap()
            .with_timezone(&Utc);
        let record = EventRecord::from(&Event::new("user").with_id("e1").with_timestamp(at));
        let value: Value = serde_json::from_str(&encode_event(&record).unwrap()).unwrap();
        assert_eq!(value["timestamp"], json!("2025-01-01T00:00:01.000000000Z"));
    }
}
