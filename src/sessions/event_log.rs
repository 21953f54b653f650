//! Event validation, normalization, and state derivation shared by all backends.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::traits::{Event, Session, SessionKey, StateMap};
use crate::error::{Result, SessionError};

/// Fold every event's state delta over `initial`, last write wins per key.
pub fn fold_state(mut initial: StateMap, events: &[Event]) -> StateMap {
    for event in events {
        apply_delta(&mut initial, &event.actions.state_delta);
    }
    initial
}

fn apply_delta(state: &mut StateMap, delta: &StateMap) {
    for (key, value) in delta {
        state.insert(key.clone(), value.clone());
    }
}

/// Check an incoming event before anything is written.
pub fn validate_event(event: &Event) -> Result<()> {
    if event.author.trim().is_empty() {
        return Err(SessionError::Validation(
            "event author is required".to_string(),
        ));
    }
    if event.actions.state_delta.keys().any(|k| k.is_empty()) {
        return Err(SessionError::Validation(
            "state delta keys must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Validate and normalize an event against the session it will join.
///
/// Assigns an id when missing and clamps the timestamp so it never precedes
/// the session's newest event.
pub fn prepare_event(session: &Session, mut event: Event) -> Result<Event> {
    validate_event(&event)?;

    if event.id.trim().is_empty() {
        event.id = uuid::Uuid::new_v4().to_string();
    }
    if matches!(event.content, Some(Value::Null)) {
        event.content = None;
    }
    clamp_timestamp(&mut event, session.last_event_at());
    Ok(event)
}

/// Reconcile a prepared event with the log it is about to join.
///
/// Backends call this inside their atomic write with the stored ids and the
/// stored newest timestamp, so a stale caller copy can neither reuse an id nor
/// move time backwards.
pub fn admit_event<'a>(
    key: &SessionKey,
    event: &mut Event,
    stored_ids: impl IntoIterator<Item = &'a str>,
    newest: Option<DateTime<Utc>>,
) -> Result<()> {
    if stored_ids.into_iter().any(|id| id == event.id) {
        return Err(duplicate_event_id(key, &event.id));
    }
    clamp_timestamp(event, newest);
    Ok(())
}

pub fn clamp_timestamp(event: &mut Event, newest: Option<DateTime<Utc>>) {
    if let Some(newest) = newest {
        if event.timestamp < newest {
            event.timestamp = newest;
        }
    }
}

pub fn duplicate_event_id(key: &SessionKey, id: &str) -> SessionError {
    SessionError::Validation(format!(
        "event id '{id}' already exists in session {}/{}/{}",
        key.app_name, key.user_id, key.session_id
    ))
}

/// Fold an already-persisted event into the caller's in-memory session.
pub fn apply_event(session: &mut Session, event: &Event, persisted_at: DateTime<Utc>) {
    apply_delta(&mut session.state, &event.actions.state_delta);
    session.events.push(event.clone());
    if persisted_at > session.updated_at {
        session.updated_at = persisted_at;
    }
}

/// Strip a session down to its listing summary.
pub fn summarize(mut session: Session) -> Session {
    session.events.clear();
    session
}

/// Newest first; ties broken by id so listings are stable.
pub fn sort_summaries(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
