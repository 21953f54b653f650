//! SQLite session store.
//!
//! Two tables mirror the key-value layout: `sessions` holds one header row
//! per session, `session_events` holds the append-only log ordered by `seq`.
//! Appends insert one row and bump the header inside a single immediate
//! transaction. Expiry is an `expires_at` column (unix millis, `NULL` = never)
//! checked on every read.
//!
//! The store timeout bounds the whole call, including the wait for the
//! connection: work that has not committed by the deadline is rolled back, so
//! a caller that sees a timeout never has a write land behind its back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::clock::{Clock, SystemClock};
use super::codec::{
    decode_event, decode_state, encode_event, encode_state, format_timestamp, parse_timestamp,
    EventRecord, SessionDocument,
};
use super::event_log::{
    apply_event, clamp_timestamp, duplicate_event_id, prepare_event, sort_summaries, summarize,
};
use super::options::StoreOptions;
use super::traits::{
    CreateSessionRequest, Event, GetSessionRequest, ListSessionsResponse, Session, SessionKey,
    SessionService,
};
use crate::error::{Result, SessionError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    app_name   TEXT    NOT NULL,
    user_id    TEXT    NOT NULL,
    session_id TEXT    NOT NULL,
    version    INTEGER NOT NULL,
    state      TEXT    NOT NULL,
    created_at TEXT    NOT NULL,
    updated_at TEXT    NOT NULL,
    expires_at INTEGER,
    PRIMARY KEY (app_name, user_id, session_id)
);
CREATE TABLE IF NOT EXISTS session_events (
    app_name   TEXT    NOT NULL,
    user_id    TEXT    NOT NULL,
    session_id TEXT    NOT NULL,
    seq        INTEGER NOT NULL,
    event_id   TEXT    NOT NULL,
    record     TEXT    NOT NULL,
    PRIMARY KEY (app_name, user_id, session_id, seq),
    UNIQUE (app_name, user_id, session_id, event_id)
);
CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions(expires_at);
";

/// Session store backed by a SQLite database file (or a private in-memory
/// database).
pub struct SqliteSessionService {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
}

impl SqliteSessionService {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                SessionError::Configuration(format!(
                    "cannot create directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::init(conn, options)
    }

    /// A private database that lives as long as this value.
    pub fn in_memory(options: StoreOptions) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, options)
    }

    fn init(conn: Connection, options: StoreOptions) -> Result<Self> {
        conn.busy_timeout(options.timeout)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
            options,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn expires_at(&self, now: DateTime<Utc>) -> Option<i64> {
        self.options
            .ttl_chrono()
            .map(|ttl| (now + ttl).timestamp_millis())
    }

    /// Run `f` against the connection on the blocking pool.
    ///
    /// The result is awaited to completion rather than abandoned, so it is
    /// always authoritative. `f` must call [`Deadline::check`] right before
    /// committing a write.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, &Deadline) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let deadline = Deadline::after(operation, self.options.timeout);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .try_lock_until(deadline.at)
                .ok_or_else(|| deadline.expired())?;
            deadline.check()?;
            f(&mut guard, &deadline)
        })
        .await?
    }
}

/// Time budget of one backend call.
struct Deadline {
    operation: &'static str,
    timeout: Duration,
    at: Instant,
}

impl Deadline {
    fn after(operation: &'static str, timeout: Duration) -> Self {
        Self {
            operation,
            timeout,
            at: Instant::now() + timeout,
        }
    }

    fn expired(&self) -> SessionError {
        SessionError::timed_out(self.operation, self.timeout)
    }

    fn check(&self) -> Result<()> {
        if Instant::now() >= self.at {
            return Err(self.expired());
        }
        Ok(())
    }
}

struct HeaderRow {
    version: i64,
    state: String,
    created_at: String,
    updated_at: String,
}

fn load_document(conn: &Connection, key: &SessionKey, now_ms: i64) -> Result<Option<SessionDocument>> {
    let header = conn
        .query_row(
            "SELECT version, state, created_at, updated_at FROM sessions
             WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3
               AND (expires_at IS NULL OR expires_at > ?4)",
            params![key.app_name, key.user_id, key.session_id, now_ms],
            |row| {
                Ok(HeaderRow {
                    version: row.get(0)?,
                    state: row.get(1)?,
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            },
        )
        .optional()?;
    let Some(header) = header else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(
        "SELECT record FROM session_events
         WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3
         ORDER BY seq ASC",
    )?;
    let raws = stmt
        .query_map(params![key.app_name, key.user_id, key.session_id], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let document = SessionDocument {
        version: u32::try_from(header.version).map_err(|_| {
            SessionError::Validation(format!("stored schema version {} is invalid", header.version))
        })?,
        app_name: key.app_name.clone(),
        user_id: key.user_id.clone(),
        session_id: key.session_id.clone(),
        state: decode_state(&header.state)?,
        created_at: parse_timestamp("created_at", &header.created_at)?,
        updated_at: parse_timestamp("updated_at", &header.updated_at)?,
        events: raws
            .iter()
            .map(|raw| decode_event(raw))
            .collect::<Result<Vec<_>>>()?,
    };
    document.validate()?;
    Ok(Some(document))
}

fn delete_rows(conn: &Connection, key: &SessionKey) -> Result<()> {
    conn.execute(
        "DELETE FROM session_events WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3",
        params![key.app_name, key.user_id, key.session_id],
    )?;
    conn.execute(
        "DELETE FROM sessions WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3",
        params![key.app_name, key.user_id, key.session_id],
    )?;
    Ok(())
}

#[async_trait]
impl SessionService for SqliteSessionService {
    async fn create_session(&self, request: CreateSessionRequest) -> Result<Session> {
        let session_id = request
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let key = SessionKey::new(request.app_name, request.user_id, session_id);
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let expires_at = self.expires_at(now);
        let document = SessionDocument::new(&key, request.state.unwrap_or_default(), now);

        let state = encode_state(&document.state)?;
        let stamp = format_timestamp(now);
        let version = i64::from(document.version);
        let row_key = key.clone();
        self.with_conn("create_session", move |conn, deadline| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let expired = tx
                .query_row(
                    "SELECT 1 FROM sessions
                     WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3
                       AND expires_at IS NOT NULL AND expires_at <= ?4",
                    params![row_key.app_name, row_key.user_id, row_key.session_id, now_ms],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if expired {
                delete_rows(&tx, &row_key)?;
            }

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO sessions
                 (app_name, user_id, session_id, version, state, created_at, updated_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)",
                params![
                    row_key.app_name,
                    row_key.user_id,
                    row_key.session_id,
                    version,
                    state,
                    stamp,
                    expires_at
                ],
            )?;
            if inserted == 0 {
                return Err(SessionError::Conflict {
                    app_name: row_key.app_name,
                    user_id: row_key.user_id,
                    session_id: row_key.session_id,
                });
            }
            // Drop any log rows left behind by an interrupted delete.
            tx.execute(
                "DELETE FROM session_events WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3",
                params![row_key.app_name, row_key.user_id, row_key.session_id],
            )?;
            deadline.check()?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        tracing::debug!(
            backend = "sqlite",
            app_name = %key.app_name,
            user_id = %key.user_id,
            session_id = %key.session_id,
            "session created"
        );
        Ok(document.into_session())
    }

    async fn get_session(&self, request: GetSessionRequest) -> Result<Option<Session>> {
        let key = request.key();
        let now_ms = self.clock.now().timestamp_millis();
        let document = self
            .with_conn("get_session", move |conn, _| load_document(conn, &key, now_ms))
            .await?;
        Ok(document.map(|document| {
            let mut session = document.into_session();
            request.config.apply(&mut session);
            session
        }))
    }

    async fn list_sessions(&self, app_name: &str, user_id: Option<&str>) -> ListSessionsResponse {
        let app = app_name.to_string();
        let user = user_id.map(str::to_string);
        let now_ms = self.clock.now().timestamp_millis();

        let listed = self
            .with_conn("list_sessions", move |conn, _| {
                let keys: Vec<SessionKey> = {
                    let mut stmt = conn.prepare(
                        "SELECT app_name, user_id, session_id FROM sessions
                         WHERE app_name = ?1 AND (?2 IS NULL OR user_id = ?2)
                           AND (expires_at IS NULL OR expires_at > ?3)",
                    )?;
                    let rows = stmt.query_map(params![app, user, now_ms], |row| {
                        Ok(SessionKey::new(
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?;
                    rows.collect::<std::result::Result<Vec<_>, _>>()?
                };

                let mut summaries = Vec::with_capacity(keys.len());
                for key in keys {
                    match load_document(conn, &key, now_ms) {
                        Ok(Some(document)) => summaries.push(summarize(document.into_session())),
                        Ok(None) => {}
                        Err(e) => tracing::warn!(
                            backend = "sqlite",
                            session_id = %key.session_id,
                            "skipping unreadable session: {e}"
                        ),
                    }
                }
                Ok(summaries)
            })
            .await;

        match listed {
            Ok(mut sessions) => {
                sort_summaries(&mut sessions);
                ListSessionsResponse { sessions }
            }
            Err(e) => {
                tracing::warn!(backend = "sqlite", app_name, "listing sessions failed: {e}");
                ListSessionsResponse::empty()
            }
        }
    }

    async fn delete_session(&self, app_name: &str, user_id: &str, session_id: &str) -> Result<()> {
        let key = SessionKey::new(app_name, user_id, session_id);
        self.with_conn("delete_session", move |conn, deadline| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            delete_rows(&tx, &key)?;
            deadline.check()?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn append_event(&self, session: &mut Session, event: Event) -> Result<Event> {
        let event = prepare_event(session, event)?;
        let key = session.key();
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let stamp = format_timestamp(now);
        let expires_at = self.expires_at(now);

        let event = self.with_conn("append_event", move |conn, deadline| {
            let mut event = event;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let live = tx
                .query_row(
                    "SELECT 1 FROM sessions
                     WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3
                       AND (expires_at IS NULL OR expires_at > ?4)",
                    params![key.app_name, key.user_id, key.session_id, now_ms],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !live {
                return Err(SessionError::NotFound {
                    app_name: key.app_name,
                    user_id: key.user_id,
                    session_id: key.session_id,
                });
            }

            let taken = tx
                .query_row(
                    "SELECT 1 FROM session_events
                     WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3 AND event_id = ?4",
                    params![key.app_name, key.user_id, key.session_id, event.id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if taken {
                return Err(duplicate_event_id(&key, &event.id));
            }
            let newest = tx
                .query_row(
                    "SELECT record FROM session_events
                     WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3
                     ORDER BY seq DESC LIMIT 1",
                    params![key.app_name, key.user_id, key.session_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .map(|raw| decode_event(&raw))
                .transpose()?
                .map(|record| record.timestamp);
            clamp_timestamp(&mut event, newest);
            let encoded = encode_event(&EventRecord::from(&event))?;

            tx.execute(
                "INSERT INTO session_events (app_name, user_id, session_id, seq, event_id, record)
                 SELECT ?1, ?2, ?3, COALESCE(MAX(seq), 0) + 1, ?4, ?5 FROM session_events
                 WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3",
                params![key.app_name, key.user_id, key.session_id, event.id, encoded],
            )?;
            tx.execute(
                "UPDATE sessions SET updated_at = MAX(updated_at, ?4), expires_at = ?5
                 WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3",
                params![key.app_name, key.user_id, key.session_id, stamp, expires_at],
            )?;
            deadline.check()?;
            tx.commit()?;
            Ok(event)
        })
        .await?;

        apply_event(session, &event, now);
        Ok(event)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}
