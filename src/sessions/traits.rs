//! Session storage contract and the types it moves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Ordered key/value state. Insertion order is preserved.
pub type StateMap = serde_json::Map<String, Value>;

/// Composite key identifying a unique session.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

/// A conversation thread with its derived state and full event history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: String,
    pub app_name: String,
    pub user_id: String,
    pub state: StateMap,
    pub events: Vec<Event>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.app_name, &self.user_id, &self.id)
    }

    /// Timestamp of the newest event, if any.
    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        self.events.last().map(|e| e.timestamp)
    }
}

/// Side effects an event carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventActions {
    /// Keys folded into the session state when the event is applied.
    pub state_delta: StateMap,
}

/// One authored unit of conversation activity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Unique within the session. Generated on append when empty.
    pub id: String,
    pub invocation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Who produced the event (`"user"` or an agent name). Must not be blank.
    pub author: String,
    /// Streaming fragment that is not final yet.
    pub partial: bool,
    pub content: Option<Value>,
    pub actions: EventActions,
}

impl Event {
    pub fn new(author: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            invocation_id: None,
            timestamp: Utc::now(),
            author: author.into(),
            partial: false,
            content: None,
            actions: EventActions::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_invocation_id(mut self, invocation_id: impl Into<String>) -> Self {
        self.invocation_id = Some(invocation_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_state_delta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.actions.state_delta.insert(key.into(), value);
        self
    }

    pub fn partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }
}

/// Parameters for [`SessionService::create_session`].
#[derive(Debug, Clone, Default)]
pub struct CreateSessionRequest {
    pub app_name: String,
    pub user_id: String,
    pub state: Option<StateMap>,
    /// Caller-chosen id. Generated when `None` or blank.
    pub session_id: Option<String>,
}

impl CreateSessionRequest {
    pub fn new(app_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_state(mut self, state: StateMap) -> Self {
        self.state = Some(state);
        self
    }
}

/// Narrows the event list returned by [`SessionService::get_session`].
///
/// State is always folded over the complete history; only the returned
/// `events` are trimmed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetSessionConfig {
    /// Keep only the newest N events.
    pub num_recent_events: Option<usize>,
    /// Keep only events at or after this instant.
    pub after_timestamp: Option<DateTime<Utc>>,
}

impl GetSessionConfig {
    pub fn apply(&self, session: &mut Session) {
        if let Some(after) = self.after_timestamp {
            session.events.retain(|e| e.timestamp >= after);
        }
        if let Some(n) = self.num_recent_events {
            let start = session.events.len().saturating_sub(n);
            session.events.drain(..start);
        }
    }
}

/// Parameters for [`SessionService::get_session`].
#[derive(Debug, Clone)]
pub struct GetSessionRequest {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
    pub config: GetSessionConfig,
}

impl GetSessionRequest {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            config: GetSessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GetSessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.app_name, &self.user_id, &self.session_id)
    }
}

/// Session summaries: derived state and timestamps, no events.
///
/// Ordered by `updated_at` descending, then by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<Session>,
}

impl ListSessionsResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }
}

/// Persistent storage for agent conversation sessions.
///
/// Implementations are shared as `Arc<dyn SessionService>` by every
/// concurrent caller for the lifetime of the process.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Persist a new session with no events. A taken id is a conflict.
    async fn create_session(&self, request: CreateSessionRequest) -> Result<Session>;

    /// Load a session with its state folded from the full event history.
    /// `Ok(None)` means the session does not exist or has expired.
    async fn get_session(&self, request: GetSessionRequest) -> Result<Option<Session>>;

    /// Summaries for an app, optionally narrowed to one user.
    ///
    /// Never fails: an unreachable store yields an empty response.
    async fn list_sessions(&self, app_name: &str, user_id: Option<&str>) -> ListSessionsResponse;

    /// Remove a session. Deleting a missing session succeeds.
    async fn delete_session(&self, app_name: &str, user_id: &str, session_id: &str)
        -> Result<()>;

    /// Validate and persist `event`, then fold it into `session`.
    ///
    /// `session` is left untouched when validation or persistence fails.
    async fn append_event(&self, session: &mut Session, event: Event) -> Result<Event>;

    /// The name of this session store implementation.
    fn name(&self) -> &str;
}
