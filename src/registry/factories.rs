//! Built-in backend factories.
//!
//! Every factory accepts the `ttl_secs` and `timeout_ms` arguments, either
//! injected by the host or given in the URI query string (the query wins).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{parse_u64, FactoryArgs};
use crate::error::{Result, SessionError};
use crate::sessions::{
    InMemorySessionService, RedisSessionService, SessionService, SqliteSessionService,
    StoreOptions,
};

const TTL_SECS: &str = "ttl_secs";
const TIMEOUT_MS: &str = "timeout_ms";
const WORKING_DIR: &str = "working_dir";

/// Keys that are option overrides rather than part of the backend address.
const OPTION_KEYS: [&str; 2] = [TTL_SECS, TIMEOUT_MS];

/// `memory://`: process-local store, lost on exit.
pub fn memory_factory(uri: &str, args: &FactoryArgs) -> Result<Arc<dyn SessionService>> {
    let (_, query) = split_query(uri);
    let options = store_options(args, query, &[])?;
    Ok(Arc::new(InMemorySessionService::with_options(options)))
}

/// `redis://[user:pass@]host[:port][/db]` and `rediss://...`.
///
/// Builds a lazily connected client; nothing touches the network here.
pub fn redis_factory(uri: &str, args: &FactoryArgs) -> Result<Arc<dyn SessionService>> {
    let mut url = url::Url::parse(uri)
        .map_err(|e| SessionError::Configuration(format!("invalid redis url '{uri}': {e}")))?;

    let query = url.query().map(str::to_string);
    let options = store_options(args, query.as_deref(), &[])?;

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !OPTION_KEYS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    Ok(Arc::new(RedisSessionService::open(url.as_str(), options)?))
}

/// `sqlite:///abs/path.db`, `sqlite://relative.db`, `sqlite://~/x.db`, or
/// `sqlite://:memory:`. Relative paths resolve against `working_dir`.
pub fn sqlite_factory(uri: &str, args: &FactoryArgs) -> Result<Arc<dyn SessionService>> {
    let (address, query) = split_query(uri);
    let options = store_options(args, query, &[WORKING_DIR])?;
    let path = address
        .split_once("://")
        .map_or(address, |(_, rest)| rest)
        .trim();

    if path.is_empty() || path == ":memory:" {
        return Ok(Arc::new(SqliteSessionService::in_memory(options)?));
    }

    let expanded = PathBuf::from(shellexpand::tilde(path).into_owned());
    let resolved = match args.get(WORKING_DIR) {
        Some(dir) if expanded.is_relative() => {
            PathBuf::from(shellexpand::tilde(dir).into_owned()).join(expanded)
        }
        _ => expanded,
    };
    Ok(Arc::new(SqliteSessionService::open(&resolved, options)?))
}

fn split_query(uri: &str) -> (&str, Option<&str>) {
    match uri.split_once('?') {
        Some((address, query)) => (address, Some(query)),
        None => (uri, None),
    }
}

/// Combine defaults, injected arguments and URI query overrides.
/// `consumed` names extra argument keys the calling factory reads itself.
fn store_options(args: &FactoryArgs, query: Option<&str>, consumed: &[&str]) -> Result<StoreOptions> {
    for key in args.keys() {
        if !OPTION_KEYS.contains(&key) && !consumed.contains(&key) {
            tracing::trace!(argument = key, "ignoring unknown factory argument");
        }
    }

    let mut ttl_secs = args.get_u64(TTL_SECS)?;
    let mut timeout_ms = args.get_u64(TIMEOUT_MS)?;

    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                TTL_SECS => ttl_secs = Some(parse_u64(TTL_SECS, &value)?),
                TIMEOUT_MS => timeout_ms = Some(parse_u64(TIMEOUT_MS, &value)?),
                _ => {}
            }
        }
    }

    let mut options = StoreOptions::default();
    if let Some(secs) = ttl_secs {
        options = options.with_ttl_secs(secs);
    }
    if let Some(ms) = timeout_ms {
        if ms == 0 {
            return Err(SessionError::Configuration(
                "timeout_ms must be greater than zero".into(),
            ));
        }
        options = options.with_timeout(Duration::from_millis(ms));
    }
    Ok(options)
}
