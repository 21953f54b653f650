#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_wraps,
    dead_code
)]

//! Swappable session persistence for agent runtimes.
//!
//! A host registers backend factories by URI scheme, freezes the registry,
//! then binds one connection URI to get an `Arc<dyn SessionService>`:
//!
//! ```no_run
//! # async fn demo() -> agent_sessions::Result<()> {
//! use agent_sessions::{Bootstrap, CreateSessionRequest};
//!
//! let host = Bootstrap::new().finish()?.bind("memory://")?;
//! let sessions = host.service();
//! let session = sessions
//!     .create_session(CreateSessionRequest::new("app1", "alice"))
//!     .await?;
//! # let _ = session;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod registry;
pub mod sessions;

pub use bootstrap::{Bootstrap, Serve, SessionHost};
pub use config::Config;
pub use error::{Result, SessionError};
pub use registry::{FactoryArgs, RegistryBuilder, ServiceRegistry, SessionServiceFactory};
pub use sessions::{
    CreateSessionRequest, Event, EventActions, GetSessionConfig, GetSessionRequest,
    ListSessionsResponse, Session, SessionKey, SessionService, StateMap,
};
