//! Redis session store.
//!
//! Layout (see [`super::keys`]):
//! - `session:{app}:{user}:{id}` is a hash holding the session header
//!   (`version`, `app_name`, `user_id`, `session_id`, `state`, `created_at`,
//!   `updated_at`).
//! - `session_events:{app}:{user}:{id}` is a list of encoded event records.
//!
//! Creates and appends run as server-side scripts, so the existence check and
//! the write happen atomically and concurrent appends to one session never
//! overwrite each other. The append script also checks the stored log: a
//! reused event id is refused, and an event older than the newest stored one
//! is sent back to be clamped and retried. Both keys get their expiry refreshed on every write;
//! reads leave it alone.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::collections::HashMap;
use tokio::sync::OnceCell;

use super::codec::{
    decode_event, decode_state, encode_event, encode_state, format_timestamp, parse_timestamp,
    EventRecord, SessionDocument,
};
use super::event_log::{
    apply_event, clamp_timestamp, duplicate_event_id, prepare_event, sort_summaries, summarize,
};
use super::keys::{events_key, events_key_for_header, list_pattern, session_key};
use super::options::StoreOptions;
use super::traits::{
    CreateSessionRequest, Event, GetSessionRequest, ListSessionsResponse, Session, SessionKey,
    SessionService,
};
use crate::error::{Result, SessionError};

const SCAN_BATCH: usize = 200;

const CREATE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('DEL', KEYS[2])
redis.call('HSET', KEYS[1], unpack(ARGV, 2))
local ttl = tonumber(ARGV[1])
if ttl > 0 then
  redis.call('EXPIRE', KEYS[1], ttl)
end
return 1
";

// ARGV: record, updated_at, ttl, event id, event timestamp (fixed width).
const APPEND_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {-1, ''}
end
local stored = redis.call('LRANGE', KEYS[2], 0, -1)
for i = 1, #stored do
  local ok, record = pcall(cjson.decode, stored[i])
  if ok and record.id == ARGV[4] then
    return {-2, ''}
  end
end
if #stored > 0 then
  local ok, last = pcall(cjson.decode, stored[#stored])
  if ok and type(last.timestamp) == 'string' and last.timestamp > ARGV[5] then
    return {-3, last.timestamp}
  end
end
local len = redis.call('RPUSH', KEYS[2], ARGV[1])
local current = redis.call('HGET', KEYS[1], 'updated_at')
if (not current) or ARGV[2] > current then
  redis.call('HSET', KEYS[1], 'updated_at', ARGV[2])
end
local ttl = tonumber(ARGV[3])
if ttl > 0 then
  redis.call('EXPIRE', KEYS[1], ttl)
  redis.call('EXPIRE', KEYS[2], ttl)
end
return {len, ''}
";

const APPEND_NOT_FOUND: i64 = -1;
const APPEND_DUPLICATE_ID: i64 = -2;
const APPEND_STALE_TIMESTAMP: i64 = -3;

/// Session store backed by a Redis server.
///
/// Holds one multiplexed connection, opened on first use and shared by every
/// caller.
pub struct RedisSessionService {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    options: StoreOptions,
    create_script: Script,
    append_script: Script,
}

impl RedisSessionService {
    pub fn new(client: Client, options: StoreOptions) -> Self {
        Self {
            client,
            connection: OnceCell::new(),
            options,
            create_script: Script::new(CREATE_SCRIPT),
            append_script: Script::new(APPEND_SCRIPT),
        }
    }

    /// Build a store from a `redis://` or `rediss://` URL. Does not connect.
    pub fn open(url: &str, options: StoreOptions) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| SessionError::Configuration(format!("invalid redis url: {e}")))?;
        Ok(Self::new(client, options))
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(manager.clone())
    }

    fn ttl_secs(&self) -> u64 {
        self.options.ttl.map_or(0, |ttl| ttl.as_secs().max(1))
    }

    async fn create_inner(&self, document: &SessionDocument) -> Result<()> {
        let key = document.key();
        let header = header_fields(document)?;
        let mut con = self.connection().await?;

        let mut invocation = self.create_script.prepare_invoke();
        invocation
            .key(session_key(&key))
            .key(events_key(&key))
            .arg(self.ttl_secs());
        for (field, value) in &header {
            invocation.arg(*field).arg(value);
        }
        let created: i64 = invocation.invoke_async(&mut con).await?;

        if created == 0 {
            return Err(SessionError::Conflict {
                app_name: key.app_name,
                user_id: key.user_id,
                session_id: key.session_id,
            });
        }
        Ok(())
    }

    async fn load(&self, key: &SessionKey) -> Result<Option<SessionDocument>> {
        let mut con = self.connection().await?;
        let (header, events): (HashMap<String, String>, Vec<String>) = redis::pipe()
            .atomic()
            .hgetall(session_key(key))
            .lrange(events_key(key), 0, -1)
            .query_async(&mut con)
            .await?;

        if header.is_empty() {
            return Ok(None);
        }
        let document = document_from_parts(&header, &events)?;
        if document.key() != *key {
            tracing::warn!(
                backend = "redis",
                session_id = %key.session_id,
                "stored header belongs to a different session; ignoring"
            );
            return Ok(None);
        }
        Ok(Some(document))
    }

    /// Push `event`, clamping its timestamp to the stored newest event and
    /// retrying until the script accepts it.
    async fn append_inner(
        &self,
        key: &SessionKey,
        mut event: Event,
    ) -> Result<(Event, DateTime<Utc>)> {
        let mut con = self.connection().await?;
        loop {
            let encoded = encode_event(&EventRecord::from(&event))?;
            let now = Utc::now();
            let (code, detail): (i64, String) = self
                .append_script
                .prepare_invoke()
                .key(session_key(key))
                .key(events_key(key))
                .arg(encoded)
                .arg(format_timestamp(now))
                .arg(self.ttl_secs())
                .arg(&event.id)
                .arg(format_timestamp(event.timestamp))
                .invoke_async(&mut con)
                .await?;

            match code {
                APPEND_NOT_FOUND => {
                    return Err(SessionError::NotFound {
                        app_name: key.app_name.clone(),
                        user_id: key.user_id.clone(),
                        session_id: key.session_id.clone(),
                    })
                }
                APPEND_DUPLICATE_ID => return Err(duplicate_event_id(key, &event.id)),
                APPEND_STALE_TIMESTAMP => {
                    let newest = parse_timestamp("timestamp", &detail)?;
                    clamp_timestamp(&mut event, Some(newest));
                }
                _ => return Ok((event, now)),
            }
        }
    }

    async fn scan_summaries(&self, app_name: &str, user_id: Option<&str>) -> Result<Vec<Session>> {
        let mut con = self.connection().await?;
        let pattern = list_pattern(app_name, user_id);

        let mut header_keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut con)
                .await?;
            header_keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        header_keys.sort();
        header_keys.dedup();

        let mut summaries = Vec::new();
        for chunk in header_keys.chunks(SCAN_BATCH) {
            let mut pipe = redis::pipe();
            for header_key in chunk {
                pipe.hgetall(header_key)
                    .lrange(events_key_for_header(header_key), 0, -1);
            }
            let replies: Vec<redis::Value> = pipe.query_async(&mut con).await?;

            for pair in replies.chunks(2) {
                let [header, events] = pair else { continue };
                let header: HashMap<String, String> = redis::from_redis_value(header)?;
                let events: Vec<String> = redis::from_redis_value(events)?;
                if header.is_empty() {
                    // Expired between SCAN and read.
                    continue;
                }
                match document_from_parts(&header, &events) {
                    Ok(document)
                        if document.app_name == app_name
                            && user_id.map_or(true, |u| document.user_id == u) =>
                    {
                        summaries.push(summarize(document.into_session()));
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(backend = "redis", "skipping unreadable session: {e}"),
                }
            }
        }
        Ok(summaries)
    }
}

#[async_trait]
impl SessionService for RedisSessionService {
    async fn create_session(&self, request: CreateSessionRequest) -> Result<Session> {
        let session_id = request
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let key = SessionKey::new(request.app_name, request.user_id, session_id);
        let document = SessionDocument::new(&key, request.state.unwrap_or_default(), Utc::now());

        self.options
            .bounded("create_session", self.create_inner(&document))
            .await?;

        tracing::debug!(
            backend = "redis",
            app_name = %key.app_name,
            user_id = %key.user_id,
            session_id = %key.session_id,
            "session created"
        );
        Ok(document.into_session())
    }

    async fn get_session(&self, request: GetSessionRequest) -> Result<Option<Session>> {
        let key = request.key();
        let document = self
            .options
            .bounded("get_session", self.load(&key))
            .await?;
        Ok(document.map(|document| {
            let mut session = document.into_session();
            request.config.apply(&mut session);
            session
        }))
    }

    async fn list_sessions(&self, app_name: &str, user_id: Option<&str>) -> ListSessionsResponse {
        match self
            .options
            .bounded("list_sessions", self.scan_summaries(app_name, user_id))
            .await
        {
            Ok(mut sessions) => {
                sort_summaries(&mut sessions);
                ListSessionsResponse { sessions }
            }
            Err(e) => {
                tracing::warn!(backend = "redis", app_name, "listing sessions failed: {e}");
                ListSessionsResponse::empty()
            }
        }
    }

    async fn delete_session(&self, app_name: &str, user_id: &str, session_id: &str) -> Result<()> {
        let key = SessionKey::new(app_name, user_id, session_id);
        self.options
            .bounded("delete_session", async {
                let mut con = self.connection().await?;
                let _: () = redis::cmd("DEL")
                    .arg(session_key(&key))
                    .arg(events_key(&key))
                    .query_async(&mut con)
                    .await?;
                Ok(())
            })
            .await
    }

    async fn append_event(&self, session: &mut Session, event: Event) -> Result<Event> {
        let event = prepare_event(session, event)?;
        let key = session.key();

        let (event, persisted_at) = self
            .options
            .bounded("append_event", self.append_inner(&key, event))
            .await?;

        apply_event(session, &event, persisted_at);
        Ok(event)
    }

    fn name(&self) -> &str {
        "redis"
    }
}

fn header_fields(document: &SessionDocument) -> Result<Vec<(&'static str, String)>> {
    Ok(vec![
        ("version", document.version.to_string()),
        ("app_name", document.app_name.clone()),
        ("user_id", document.user_id.clone()),
        ("session_id", document.session_id.clone()),
        ("state", encode_state(&document.state)?),
        ("created_at", format_timestamp(document.created_at)),
        ("updated_at", format_timestamp(document.updated_at)),
    ])
}

fn required<'a>(header: &'a HashMap<String, String>, field: &str) -> Result<&'a str> {
    header
        .get(field)
        .map(String::as_str)
        .ok_or_else(|| SessionError::Validation(format!("session header is missing '{field}'")))
}

/// Rebuild a [`SessionDocument`] from the header hash and the raw event list.
fn document_from_parts(
    header: &HashMap<String, String>,
    events: &[String],
) -> Result<SessionDocument> {
    let version = required(header, "version")?
        .parse::<u32>()
        .map_err(|e| SessionError::Validation(format!("session header field 'version': {e}")))?;

    let document = SessionDocument {
        version,
        app_name: required(header, "app_name")?.to_string(),
        user_id: required(header, "user_id")?.to_string(),
        session_id: required(header, "session_id")?.to_string(),
        state: decode_state(required(header, "state")?)?,
        created_at: parse_timestamp("created_at", required(header, "created_at")?)?,
        updated_at: parse_timestamp("updated_at", required(header, "updated_at")?)?,
        events: events
            .iter()
            .map(|raw| decode_event(raw))
            .collect::<Result<Vec<_>>>()?,
    };
    document.validate()?;
    Ok(document)
}
