//! In-memory session store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::clock::{Clock, SystemClock};
use super::codec::{decode_document, encode_document, EventRecord, SessionDocument};
use super::event_log::{admit_event, apply_event, prepare_event, sort_summaries, summarize};
use super::options::StoreOptions;
use super::traits::{
    CreateSessionRequest, Event, GetSessionRequest, ListSessionsResponse, Session, SessionKey,
    SessionService,
};
use crate::error::{Result, SessionError};

struct StoredSession {
    /// Encoded [`SessionDocument`], so every read goes through the codec.
    document: String,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredSession {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// An in-memory session store backed by a mutex-protected hash map.
///
/// Appends run under the map lock, so concurrent writers to one session are
/// serialized. Expired entries are dropped when their key is touched and
/// swept whenever sessions are listed.
pub struct InMemorySessionService {
    sessions: Mutex<HashMap<SessionKey, StoredSession>>,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self::with_options(StoreOptions::default())
    }

    pub fn with_options(options: StoreOptions) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            options,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.options.ttl_chrono().map(|ttl| now + ttl)
    }

    fn load_live(&self, key: &SessionKey, now: DateTime<Utc>) -> Option<String> {
        let mut sessions = self.sessions.lock();
        purge_if_expired(&mut sessions, key, now);
        sessions.get(key).map(|stored| stored.document.clone())
    }
}

fn purge_if_expired(
    sessions: &mut HashMap<SessionKey, StoredSession>,
    key: &SessionKey,
    now: DateTime<Utc>,
) {
    if sessions.get(key).is_some_and(|stored| !stored.is_live(now)) {
        sessions.remove(key);
    }
}

impl Default for InMemorySessionService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn create_session(&self, request: CreateSessionRequest) -> Result<Session> {
        let session_id = request
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let key = SessionKey::new(request.app_name, request.user_id, session_id);
        let now = self.clock.now();

        let document = SessionDocument::new(&key, request.state.unwrap_or_default(), now);
        let encoded = encode_document(&document)?;

        let mut sessions = self.sessions.lock();
        purge_if_expired(&mut sessions, &key, now);
        if sessions.contains_key(&key) {
            return Err(SessionError::Conflict {
                app_name: key.app_name,
                user_id: key.user_id,
                session_id: key.session_id,
            });
        }
        sessions.insert(
            key.clone(),
            StoredSession {
                document: encoded,
                expires_at: self.expiry_from(now),
            },
        );
        drop(sessions);

        tracing::debug!(
            backend = "memory",
            app_name = %key.app_name,
            user_id = %key.user_id,
            session_id = %key.session_id,
            "session created"
        );
        Ok(document.into_session())
    }

    async fn get_session(&self, request: GetSessionRequest) -> Result<Option<Session>> {
        let Some(raw) = self.load_live(&request.key(), self.clock.now()) else {
            return Ok(None);
        };
        let mut session = decode_document(&raw)?.into_session();
        request.config.apply(&mut session);
        Ok(Some(session))
    }

    async fn list_sessions(&self, app_name: &str, user_id: Option<&str>) -> ListSessionsResponse {
        let now = self.clock.now();
        let raws: Vec<String> = {
            let mut sessions = self.sessions.lock();
            sessions.retain(|_, stored| stored.is_live(now));
            sessions
                .iter()
                .filter(|(key, _)| {
                    key.app_name == app_name && user_id.map_or(true, |u| key.user_id == u)
                })
                .map(|(_, stored)| stored.document.clone())
                .collect()
        };

        let mut summaries = Vec::with_capacity(raws.len());
        for raw in raws {
            match decode_document(&raw) {
                Ok(document) => summaries.push(summarize(document.into_session())),
                Err(e) => tracing::warn!(backend = "memory", "skipping unreadable session: {e}"),
            }
        }
        sort_summaries(&mut summaries);
        ListSessionsResponse {
            sessions: summaries,
        }
    }

    async fn delete_session(&self, app_name: &str, user_id: &str, session_id: &str) -> Result<()> {
        let key = SessionKey::new(app_name, user_id, session_id);
        self.sessions.lock().remove(&key);
        Ok(())
    }

    async fn append_event(&self, session: &mut Session, event: Event) -> Result<Event> {
        let mut event = prepare_event(session, event)?;
        let key = session.key();
        let now = self.clock.now();

        {
            let mut sessions = self.sessions.lock();
            purge_if_expired(&mut sessions, &key, now);
            let stored = sessions
                .get_mut(&key)
                .ok_or_else(|| SessionError::NotFound {
                    app_name: key.app_name.clone(),
                    user_id: key.user_id.clone(),
                    session_id: key.session_id.clone(),
                })?;

            let mut document = decode_document(&stored.document)?;
            admit_event(
                &key,
                &mut event,
                document.events.iter().map(|r| r.id.as_str()),
                document.events.last().map(|r| r.timestamp),
            )?;
            document.events.push(EventRecord::from(&event));
            if now > document.updated_at {
                document.updated_at = now;
            }
            stored.document = encode_document(&document)?;
            stored.expires_at = self.expiry_from(now);
        }

        apply_event(session, &event, now);
        Ok(event)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
