//! Session persistence: one storage contract, several backends.
//!
//! Backends are picked at startup by URI scheme through
//! [`crate::registry::ServiceRegistry`]; callers only ever see
//! `Arc<dyn SessionService>`.

pub mod clock;
pub mod codec;
pub mod event_log;
pub mod in_memory;
pub mod keys;
pub mod options;
pub mod redis;
pub mod sqlite;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{SessionDocument, SCHEMA_VERSION};
pub use in_memory::InMemorySessionService;
pub use options::StoreOptions;
pub use redis::RedisSessionService;
pub use sqlite::SqliteSessionService;
pub use traits::{
    CreateSessionRequest, Event, EventActions, GetSessionConfig, GetSessionRequest,
    ListSessionsResponse, Session, SessionKey, SessionService, StateMap,
};
