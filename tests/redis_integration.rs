//! Integration tests against a live Redis server.
//!
//! Skipped unless `AGENT_SESSIONS_TEST_REDIS_URL` is set, e.g.
//!
//! ```text
//! docker run -d -p 6379:6379 redis:7
//! AGENT_SESSIONS_TEST_REDIS_URL=redis://127.0.0.1:6379/15 cargo test --test redis_integration
//! ```

use agent_sessions::sessions::keys;
use agent_sessions::{
    Bootstrap, CreateSessionRequest, Event, GetSessionRequest, SessionError, SessionKey,
    SessionService,
};
use serde_json::json;
use std::sync::Arc;

fn redis_url() -> Option<String> {
    std::env::var("AGENT_SESSIONS_TEST_REDIS_URL")
        .ok()
        .filter(|url| !url.trim().is_empty())
}

fn bind(url: &str) -> Arc<dyn SessionService> {
    Bootstrap::new()
        .finish()
        .unwrap()
        .bind(url)
        .expect("redis uri resolves")
        .service()
}

fn with_query(url: &str, query: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{query}")
}

async fn raw_connection(url: &str) -> redis::aio::MultiplexedConnection {
    redis::Client::open(url)
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap()
}

async fn ttl_of(con: &mut redis::aio::MultiplexedConnection, key: &str) -> i64 {
    redis::cmd("TTL").arg(key).query_async(con).await.unwrap()
}

async fn expire(con: &mut redis::aio::MultiplexedConnection, key: &str, secs: i64) {
    let _: i64 = redis::cmd("EXPIRE")
        .arg(key)
        .arg(secs)
        .query_async(con)
        .await
        .unwrap();
}

/// Unique app name per test so runs never see each other's keys.
fn test_app() -> String {
    format!("it-{}", uuid::Uuid::new_v4().simple())
}

#[tokio::test]
async fn redis_round_trip_and_layout() {
    let Some(url) = redis_url() else {
        eprintln!("AGENT_SESSIONS_TEST_REDIS_URL not set; skipping");
        return;
    };
    let sessions = bind(&url);
    let app = test_app();

    let mut session = sessions
        .create_session(CreateSessionRequest::new(&app, "alice").with_session_id("s1"))
        .await
        .unwrap();
    sessions
        .append_event(&mut session, Event::new("user").with_state_delta("topic", json!("poems")))
        .await
        .unwrap();

    let fetched = sessions
        .get_session(GetSessionRequest::new(&app, "alice", "s1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.state["topic"], json!("poems"));
    assert_eq!(fetched.events, session.events);

    let client = redis::Client::open(url.as_str()).unwrap();
    let mut con = client.get_multiplexed_async_connection().await.unwrap();
    let key = SessionKey::new(&app, "alice", "s1");
    let header_exists: bool = redis::cmd("EXISTS")
        .arg(keys::session_key(&key))
        .query_async(&mut con)
        .await
        .unwrap();
    let log_len: i64 = redis::cmd("LLEN")
        .arg(keys::events_key(&key))
        .query_async(&mut con)
        .await
        .unwrap();
    let ttl: i64 = redis::cmd("TTL")
        .arg(keys::session_key(&key))
        .query_async(&mut con)
        .await
        .unwrap();
    assert!(header_exists);
    assert_eq!(log_len, 1);
    assert!(ttl > 0 && ttl <= 86_400);

    sessions.delete_session(&app, "alice", "s1").await.unwrap();
    assert!(sessions
        .get_session(GetSessionRequest::new(&app, "alice", "s1"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn redis_duplicate_create_conflicts() {
    let Some(url) = redis_url() else {
        return;
    };
    let sessions = bind(&url);
    let app = test_app();
    let request = CreateSessionRequest::new(&app, "alice").with_session_id("s1");
    sessions.create_session(request.clone()).await.unwrap();
    let err = sessions.create_session(request).await.unwrap_err();
    assert!(matches!(err, SessionError::Conflict { .. }));
    sessions.delete_session(&app, "alice", "s1").await.unwrap();
}

#[tokio::test]
async fn redis_list_filters_colon_ids_by_user() {
    let Some(url) = redis_url() else {
        return;
    };
    let sessions = bind(&url);
    let app = test_app();
    sessions
        .create_session(CreateSessionRequest::new(&app, "alice").with_session_id("bob:1"))
        .await
        .unwrap();
    sessions
        .create_session(CreateSessionRequest::new(&app, "bob").with_session_id("1"))
        .await
        .unwrap();

    let alice = sessions.list_sessions(&app, Some("alice")).await;
    assert_eq!(alice.len(), 1);
    assert_eq!(alice.sessions[0].id, "bob:1");
    let bob = sessions.list_sessions(&app, Some("bob")).await;
    assert_eq!(bob.len(), 1);
    assert_eq!(bob.sessions[0].user_id, "bob");

    sessions.delete_session(&app, "alice", "bob:1").await.unwrap();
    sessions.delete_session(&app, "bob", "1").await.unwrap();
}

#[tokio::test]
async fn redis_concurrent_appends_do_not_lose_events() {
    let Some(url) = redis_url() else {
        return;
    };
    let sessions = bind(&url);
    let app = test_app();
    let session = sessions
        .create_session(CreateSessionRequest::new(&app, "alice").with_session_id("s1"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let sessions = Arc::clone(&sessions);
        let mut copy = session.clone();
        handles.push(tokio::spawn(async move {
            sessions
                .append_event(&mut copy, Event::new("user").with_state_delta(format!("k{i}"), json!(i)))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let fetched = sessions
        .get_session(GetSessionRequest::new(&app, "alice", "s1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.events.len(), 16);
    assert_eq!(fetched.state.len(), 16);
    sessions.delete_session(&app, "alice", "s1").await.unwrap();
}

#[tokio::test]
async fn redis_append_refreshes_ttl_of_both_keys_and_reads_do_not() {
    let Some(url) = redis_url() else {
        return;
    };
    let sessions = bind(&with_query(&url, "ttl_secs=600"));
    let app = test_app();
    let key = SessionKey::new(&app, "alice", "s1");
    let header = keys::session_key(&key);
    let log = keys::events_key(&key);
    let mut con = raw_connection(&url).await;

    let mut session = sessions
        .create_session(CreateSessionRequest::new(&app, "alice").with_session_id("s1"))
        .await
        .unwrap();
    sessions
        .append_event(&mut session, Event::new("user"))
        .await
        .unwrap();
    let header_ttl = ttl_of(&mut con, &header).await;
    let log_ttl = ttl_of(&mut con, &log).await;
    assert!(header_ttl > 0 && header_ttl <= 600, "header ttl {header_ttl}");
    assert!(log_ttl > 0 && log_ttl <= 600, "log ttl {log_ttl}");

    expire(&mut con, &header, 30).await;
    expire(&mut con, &log, 30).await;
    sessions
        .append_event(&mut session, Event::new("agent"))
        .await
        .unwrap();
    assert!(ttl_of(&mut con, &header).await > 30);
    assert!(ttl_of(&mut con, &log).await > 30);

    expire(&mut con, &header, 30).await;
    expire(&mut con, &log, 30).await;
    sessions
        .get_session(GetSessionRequest::new(&app, "alice", "s1"))
        .await
        .unwrap()
        .unwrap();
    sessions.list_sessions(&app, Some("alice")).await;
    assert!(ttl_of(&mut con, &header).await <= 30);
    assert!(ttl_of(&mut con, &log).await <= 30);

    sessions.delete_session(&app, "alice", "s1").await.unwrap();
}

#[tokio::test]
async fn redis_stale_copy_cannot_move_time_backwards() {
    let Some(url) = redis_url() else {
        return;
    };
    let sessions = bind(&url);
    let app = test_app();
    let session = sessions
        .create_session(CreateSessionRequest::new(&app, "alice").with_session_id("s1"))
        .await
        .unwrap();
    let mut ahead = session.clone();
    let mut stale = session.clone();

    let future = chrono::Utc::now() + chrono::Duration::seconds(10);
    sessions
        .append_event(&mut ahead, Event::new("agent").with_timestamp(future))
        .await
        .unwrap();
    let appended = sessions
        .append_event(&mut stale, Event::new("user"))
        .await
        .unwrap();
    assert_eq!(appended.timestamp, future);

    let fetched = sessions
        .get_session(GetSessionRequest::new(&app, "alice", "s1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.events.len(), 2);
    assert!(fetched.events[0].timestamp <= fetched.events[1].timestamp);
    sessions.delete_session(&app, "alice", "s1").await.unwrap();
}

#[tokio::test]
async fn redis_duplicate_event_id_is_rejected() {
    let Some(url) = redis_url() else {
        return;
    };
    let sessions = bind(&url);
    let app = test_app();
    let session = sessions
        .create_session(CreateSessionRequest::new(&app, "alice").with_session_id("s1"))
        .await
        .unwrap();
    let mut first = session.clone();
    let mut second = session.clone();
    sessions
        .append_event(&mut first, Event::new("user").with_id("e1"))
        .await
        .unwrap();
    let err = sessions
        .append_event(&mut second, Event::new("agent").with_id("e1"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Validation(_)));
    assert!(second.events.is_empty());

    let fetched = sessions
        .get_session(GetSessionRequest::new(&app, "alice", "s1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.events.len(), 1);
    sessions.delete_session(&app, "alice", "s1").await.unwrap();
}

#[tokio::test]
async fn redis_colons_in_app_and_user_do_not_alias() {
    let Some(url) = redis_url() else {
        return;
    };
    let sessions = bind(&url);
    let app = test_app();
    let left_app = format!("{app}:b");
    sessions
        .create_session(CreateSessionRequest::new(&left_app, "c").with_session_id("x"))
        .await
        .unwrap();

    assert!(sessions
        .get_session(GetSessionRequest::new(&app, "b:c", "x"))
        .await
        .unwrap()
        .is_none());
    let mut right = sessions
        .create_session(CreateSessionRequest::new(&app, "b:c").with_session_id("x"))
        .await
        .unwrap();
    sessions
        .append_event(&mut right, Event::new("user").with_state_delta("owner", json!("right")))
        .await
        .unwrap();
    sessions.delete_session(&app, "b:c", "x").await.unwrap();

    let left = sessions
        .get_session(GetSessionRequest::new(&left_app, "c", "x"))
        .await
        .unwrap()
        .expect("left session untouched");
    assert!(left.events.is_empty());
    assert_eq!(left.app_name, left_app);
    sessions.delete_session(&left_app, "c", "x").await.unwrap();
}

#[tokio::test]
async fn redis_unreachable_server_is_unavailable() {
    // Port 1 refuses connections; independent of the env var.
    let sessions = bind("redis://127.0.0.1:1/0?timeout_ms=500");
    let err = sessions
        .get_session(GetSessionRequest::new("app1", "alice", "s1"))
        .await
        .unwrap_err();
    assert!(err.is_unavailable(), "unexpected error: {err}");
    assert!(sessions.list_sessions("app1", None).await.is_empty());
}
