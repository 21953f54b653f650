pub mod schema;

pub use schema::{Config, SessionsConfig};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reexported_config_default_is_constructible() {
        let config = Config::default();

        assert!(config.sessions.uri.contains("://"));
        assert!(config.sessions.timeout_ms > 0);
    }
}
