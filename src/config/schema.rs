use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::registry::FactoryArgs;
use crate::sessions::options::{DEFAULT_TIMEOUT, DEFAULT_TTL};

const CONFIG_DIR_ENV: &str = "AGENT_SESSIONS_CONFIG_DIR";
const CONFIG_FILE: &str = "config.toml";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level configuration, loaded from `config.toml`.
///
/// Resolution order: `--config-dir` flag → `AGENT_SESSIONS_CONFIG_DIR` env →
/// `~/.agent-sessions/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub sessions: SessionsConfig,
}

/// Session store selection and tunables.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SessionsConfig {
    /// Backend URI, e.g. `memory://`, `redis://localhost:6379/0`,
    /// `sqlite://sessions.db`. Relative SQLite paths resolve against the
    /// config directory.
    #[serde(default = "default_sessions_uri")]
    pub uri: String,

    /// Seconds of inactivity before a session expires. `0` disables expiry.
    #[serde(default = "default_sessions_ttl_secs")]
    pub ttl_secs: u64,

    /// Upper bound for a single store call, in milliseconds.
    #[serde(default = "default_sessions_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_sessions_uri() -> String {
    "memory://".into()
}

fn default_sessions_ttl_secs() -> u64 {
    DEFAULT_TTL.as_secs()
}

fn default_sessions_timeout_ms() -> u64 {
    u64::try_from(DEFAULT_TIMEOUT.as_millis()).unwrap_or(u64::MAX)
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            uri: default_sessions_uri(),
            ttl_secs: default_sessions_ttl_secs(),
            timeout_ms: default_sessions_timeout_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = default_config_dir().unwrap_or_else(|_| PathBuf::from(".agent-sessions"));
        Self {
            config_path: config_dir.join(CONFIG_FILE),
            sessions: SessionsConfig::default(),
        }
    }
}

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".agent-sessions"))
}

/// Pick the config directory: explicit override, then env, then `~/.agent-sessions`.
fn resolve_config_dir(explicit: Option<&Path>) -> Result<(PathBuf, &'static str)> {
    if let Some(dir) = explicit {
        return Ok((dir.to_path_buf(), "flag"));
    }
    if let Ok(custom) = std::env::var(CONFIG_DIR_ENV) {
        let custom = custom.trim();
        if !custom.is_empty() {
            return Ok((
                PathBuf::from(shellexpand::tilde(custom).into_owned()),
                CONFIG_DIR_ENV,
            ));
        }
    }
    Ok((default_config_dir()?, "default"))
}

impl Config {
    /// Load `config.toml`, writing a default one first if none exists.
    pub async fn load_or_init(config_dir: Option<&Path>) -> Result<Self> {
        let (config_dir, resolution_source) = resolve_config_dir(config_dir)?;
        let config_path = config_dir.join(CONFIG_FILE);

        fs::create_dir_all(&config_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let initialized = !config_path.exists();
        let mut config = if initialized {
            let config = Config {
                config_path: config_path.clone(),
                ..Config::default()
            };
            config.save().await?;
            config
        } else {
            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path;
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            source = resolution_source,
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    /// Directory holding `config.toml`; relative store paths resolve here.
    pub fn config_dir(&self) -> &Path {
        self.config_path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Arguments injected into every backend factory.
    pub fn factory_args(&self) -> FactoryArgs {
        FactoryArgs::new()
            .with("working_dir", self.config_dir().display())
            .with("ttl_secs", self.sessions.ttl_secs)
            .with("timeout_ms", self.sessions.timeout_ms)
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        let uri = self.sessions.uri.trim();
        if uri.is_empty() {
            anyhow::bail!("sessions.uri must not be empty");
        }
        if !uri.contains("://") {
            anyhow::bail!("sessions.uri '{uri}' must include a scheme (e.g. memory://, redis://)");
        }
        if self.sessions.timeout_ms == 0 {
            anyhow::bail!("sessions.timeout_ms must be greater than 0");
        }
        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Ok(uri) = std::env::var("AGENT_SESSIONS_URI") {
            if !uri.trim().is_empty() {
                self.sessions.uri = uri.trim().to_string();
            }
        }

        if let Ok(ttl) = std::env::var("AGENT_SESSIONS_TTL_SECS") {
            match ttl.trim().parse::<u64>() {
                Ok(secs) => self.sessions.ttl_secs = secs,
                Err(_) => tracing::warn!("Ignoring invalid AGENT_SESSIONS_TTL_SECS={ttl:?}"),
            }
        }

        if let Ok(timeout) = std::env::var("AGENT_SESSIONS_TIMEOUT_MS") {
            match timeout.trim().parse::<u64>() {
                Ok(ms) => self.sessions.timeout_ms = ms,
                Err(_) => tracing::warn!("Ignoring invalid AGENT_SESSIONS_TIMEOUT_MS={timeout:?}"),
            }
        }
    }

    /// Write the config atomically: temp file, fsync, rename.
    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or(CONFIG_FILE);
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir).await
    }
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::sync::{Mutex, MutexGuard};
    use tokio::test;

    async fn env_override_lock() -> MutexGuard<'static, ()> {
        static ENV_OVERRIDE_TEST_LOCK: Mutex<()> = Mutex::const_new(());
        ENV_OVERRIDE_TEST_LOCK.lock().await
    }

    fn clear_env_test_vars() {
        for key in [
            "AGENT_SESSIONS_URI",
            "AGENT_SESSIONS_TTL_SECS",
            "AGENT_SESSIONS_TIMEOUT_MS",
            CONFIG_DIR_ENV,
        ] {
            std::env::remove_var(key);
        }
    }

    // ── Defaults ─────────────────────────────────────────────

    #[test]
    async fn sessions_config_defaults() {
        let config = Config::default();
        assert_eq!(config.sessions.uri, "memory://");
        assert_eq!(config.sessions.ttl_secs, 86_400);
        assert_eq!(config.sessions.timeout_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    async fn missing_sections_fall_back_to_defaults() {
        let parsed: Config = toml::from_str("[sessions]\nuri = \"redis://cache:6379/2\"\n").unwrap();
        assert_eq!(parsed.sessions.uri, "redis://cache:6379/2");
        assert_eq!(parsed.sessions.ttl_secs, 86_400);

        let empty: Config = toml::from_str("").unwrap();
        assert_eq!(empty.sessions, SessionsConfig::default());
    }

    // ── Validation ───────────────────────────────────────────

    #[test]
    async fn validate_rejects_empty_uri() {
        let mut config = Config::default();
        config.sessions.uri = "  ".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    async fn validate_rejects_uri_without_scheme() {
        let mut config = Config::default();
        config.sessions.uri = "localhost:6379".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("scheme"));
    }

    #[test]
    async fn validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.sessions.timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    async fn validate_accepts_zero_ttl() {
        let mut config = Config::default();
        config.sessions.ttl_secs = 0;
        assert!(config.validate().is_ok());
    }

    // ── Persistence ──────────────────────────────────────────

    #[test]
    async fn config_save_and_load_tmpdir() {
        let _env_guard = env_override_lock().await;
        clear_env_test_vars();
        let dir = TempDir::new().unwrap();

        let config = Config {
            config_path: dir.path().join(CONFIG_FILE),
            sessions: SessionsConfig {
                uri: "sqlite://sessions.db".into(),
                ttl_secs: 60,
                timeout_ms: 750,
            },
        };
        config.save().await.unwrap();

        let loaded = Config::load_or_init(Some(dir.path())).await.unwrap();
        assert_eq!(loaded.sessions, config.sessions);
        assert_eq!(loaded.config_path, dir.path().join(CONFIG_FILE));
    }

    #[test]
    async fn load_or_init_writes_defaults_on_first_run() {
        let _env_guard = env_override_lock().await;
        clear_env_test_vars();
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join("fresh");

        let config = Config::load_or_init(Some(&config_dir)).await.unwrap();
        assert_eq!(config.sessions, SessionsConfig::default());

        let written = fs::read_to_string(config_dir.join(CONFIG_FILE)).await.unwrap();
        assert!(written.contains("[sessions]"));
        assert!(written.contains("uri = \"memory://\""));

        let mut leftovers = fs::read_dir(&config_dir).await.unwrap();
        while let Some(entry) = leftovers.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().into_owned();
            assert!(!name.contains(".tmp-"), "temp file left behind: {name}");
        }
    }

    #[test]
    async fn load_or_init_uses_env_config_dir() {
        let _env_guard = env_override_lock().await;
        clear_env_test_vars();
        let dir = TempDir::new().unwrap();
        std::env::set_var(CONFIG_DIR_ENV, dir.path());

        let config = Config::load_or_init(None).await.unwrap();
        assert_eq!(config.config_path, dir.path().join(CONFIG_FILE));

        std::env::remove_var(CONFIG_DIR_ENV);
    }

    #[test]
    async fn load_or_init_rejects_invalid_file() {
        let _env_guard = env_override_lock().await;
        clear_env_test_vars();
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "[sessions]\nuri = \"memory://\"\ntimeout_ms = 0\n",
        )
        .await
        .unwrap();

        let err = Config::load_or_init(Some(dir.path())).await.unwrap_err();
        assert!(err.to_string().contains("timeout_ms"));
    }

    #[test]
    async fn factory_args_carry_config_dir_and_tunables() {
        let config = Config {
            config_path: PathBuf::from("/srv/sessions/config.toml"),
            sessions: SessionsConfig {
                ttl_secs: 0,
                ..SessionsConfig::default()
            },
        };
        let args = config.factory_args();
        assert_eq!(args.get("working_dir"), Some("/srv/sessions"));
        assert_eq!(args.get("ttl_secs"), Some("0"));
        assert_eq!(args.get("timeout_ms"), Some("5000"));
    }

    // ── Env overrides ────────────────────────────────────────

    #[test]
    async fn env_override_uri() {
        let _env_guard = env_override_lock().await;
        clear_env_test_vars();
        let mut config = Config::default();

        std::env::set_var("AGENT_SESSIONS_URI", "redis://env-host:6379/0");
        config.apply_env_overrides();
        assert_eq!(config.sessions.uri, "redis://env-host:6379/0");

        std::env::remove_var("AGENT_SESSIONS_URI");
    }

    #[test]
    async fn env_override_ttl_and_timeout() {
        let _env_guard = env_override_lock().await;
        clear_env_test_vars();
        let mut config = Config::default();

        std::env::set_var("AGENT_SESSIONS_TTL_SECS", "0");
        std::env::set_var("AGENT_SESSIONS_TIMEOUT_MS", "1500");
        config.apply_env_overrides();
        assert_eq!(config.sessions.ttl_secs, 0);
        assert_eq!(config.sessions.timeout_ms, 1500);

        clear_env_test_vars();
    }

    #[test]
    async fn env_override_invalid_numbers_ignored() {
        let _env_guard = env_override_lock().await;
        clear_env_test_vars();
        let mut config = Config::default();

        std::env::set_var("AGENT_SESSIONS_TTL_SECS", "a day");
        std::env::set_var("AGENT_SESSIONS_TIMEOUT_MS", "-1");
        config.apply_env_overrides();
        assert_eq!(config.sessions.ttl_secs, 86_400);
        assert_eq!(config.sessions.timeout_ms, 5_000);

        clear_env_test_vars();
    }

    #[test]
    async fn env_override_empty_uri_ignored() {
        let _env_guard = env_override_lock().await;
        clear_env_test_vars();
        let mut config = Config::default();

        std::env::set_var("AGENT_SESSIONS_URI", "");
        config.apply_env_overrides();
        assert_eq!(config.sessions.uri, "memory://");

        std::env::remove_var("AGENT_SESSIONS_URI");
    }
}
