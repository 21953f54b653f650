#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::unnecessary_wraps,
    dead_code
)]

use agent_sessions::{
    Bootstrap, Config, CreateSessionRequest, Event, GetSessionConfig, GetSessionRequest,
    SessionService, StateMap,
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// `agent-sessions` - inspect and manage persisted agent sessions.
#[derive(Parser, Debug)]
#[command(name = "agent-sessions")]
#[command(author = "theonlyhennygod")]
#[command(version)]
#[command(about = "Swappable session persistence for agent runtimes.", long_about = None)]
struct Cli {
    /// Directory holding config.toml (default: ~/.agent-sessions)
    #[arg(long, global = true)]
    config_dir: Option<String>,

    /// Session store URI; overrides sessions.uri from config
    #[arg(long, global = true)]
    uri: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a session
    #[command(long_about = "\
Create a session.

Prints the new session as JSON. A random id is generated unless --session \
is given; creating an id that already exists fails.

Examples:
  agent-sessions create --app app1 --user alice
  agent-sessions create --app app1 --user alice --session s1 --state '{\"lang\":\"en\"}'
  agent-sessions --uri sqlite://sessions.db create --app app1 --user alice")]
    Create {
        #[arg(long)]
        app: String,
        #[arg(long)]
        user: String,
        /// Session id (generated when omitted)
        #[arg(long)]
        session: Option<String>,
        /// Initial state as a JSON object
        #[arg(long, value_parser = parse_state)]
        state: Option<StateMap>,
    },

    /// Print one session with its derived state and events
    #[command(long_about = "\
Print one session with its derived state and events.

State is always derived from the full history; --recent and --after only \
trim the events that are printed.

Examples:
  agent-sessions get --app app1 --user alice --session s1
  agent-sessions get --app app1 --user alice --session s1 --recent 5
  agent-sessions get --app app1 --user alice --session s1 --after 2025-01-01T00:00:00Z")]
    Get {
        #[arg(long)]
        app: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        session: String,
        /// Keep only the N most recent events
        #[arg(long)]
        recent: Option<usize>,
        /// Keep only events at or after this RFC 3339 timestamp
        #[arg(long, value_parser = parse_timestamp)]
        after: Option<DateTime<Utc>>,
    },

    /// List session summaries for an app
    List {
        #[arg(long)]
        app: String,
        /// Restrict to one user
        #[arg(long)]
        user: Option<String>,
    },

    /// Delete a session (no-op when it does not exist)
    Delete {
        #[arg(long)]
        app: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        session: String,
    },

    /// Append an event to a session
    #[command(long_about = "\
Append an event to a session.

Each --delta KEY=VALUE sets one state key; VALUE is parsed as JSON and \
falls back to a plain string.

Examples:
  agent-sessions append --app app1 --user alice --session s1 --author user --delta topic=poems
  agent-sessions append --app app1 --user alice --session s1 --author poet_agent \\
      --content '{\"text\":\"Roses are red\"}' --delta 'drafts=[1,2]'")]
    Append {
        #[arg(long)]
        app: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        session: String,
        /// Who produced the event (user, an agent name, ...)
        #[arg(long)]
        author: String,
        /// State change as KEY=VALUE (repeatable)
        #[arg(long = "delta", value_parser = parse_delta)]
        deltas: Vec<(String, Value)>,
        /// Event content as JSON
        #[arg(long, value_parser = parse_json)]
        content: Option<Value>,
        #[arg(long)]
        invocation: Option<String>,
        /// Mark the event as a partial (streaming) chunk
        #[arg(long)]
        partial: bool,
    },

    /// List registered session backends
    Backends,

    /// Manage configuration
    #[command(long_about = "\
Manage agent-sessions configuration.

Use 'schema' to dump the full JSON Schema for the config file, which \
documents every available key, type, and default value.

Examples:
  agent-sessions config schema              # print JSON Schema to stdout
  agent-sessions config schema > schema.json")]
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    /// Generate shell completion script to stdout
    #[command(long_about = "\
Generate shell completion scripts for `agent-sessions`.

The script is printed to stdout so it can be sourced directly:

Examples:
  source <(agent-sessions completions bash)
  agent-sessions completions zsh > ~/.zfunc/_agent-sessions
  agent-sessions completions fish > ~/.config/fish/completions/agent-sessions.fish")]
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Dump the full configuration JSON Schema to stdout
    Schema,
}

fn parse_json(s: &str) -> std::result::Result<Value, String> {
    serde_json::from_str(s).map_err(|e| format!("invalid JSON: {e}"))
}

fn parse_state(s: &str) -> std::result::Result<StateMap, String> {
    match parse_json(s)? {
        Value::Object(map) => Ok(map),
        _ => Err("state must be a JSON object".to_string()),
    }
}

fn parse_delta(s: &str) -> std::result::Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("delta key must not be empty".to_string());
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

fn parse_timestamp(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 timestamp: {e}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
    }

    // Completions must remain stdout-only and should not load config or initialize logging.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        write_shell_completion(*shell, &mut stdout)?;
        return Ok(());
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO.
    // Logs go to stderr so JSON on stdout stays machine-readable.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config_dir = cli.config_dir.as_deref().map(PathBuf::from);
    let mut config = Config::load_or_init(config_dir.as_deref()).await?;
    if let Some(uri) = cli.uri {
        config.sessions.uri = uri;
        config.validate()?;
    }

    if let Commands::Config { config_command } = &cli.command {
        match config_command {
            ConfigCommands::Schema => {
                let schema = schemars::schema_for!(Config);
                return print_json(&schema);
            }
        }
    }

    let serve = Bootstrap::new().with_args(config.factory_args()).finish()?;

    if let Commands::Backends = cli.command {
        let active = agent_sessions::registry::uri_scheme(&config.sessions.uri).ok();
        println!("Registered session backends:\n");
        for scheme in serve.registry().schemes() {
            let marker = if active.as_deref() == Some(scheme.as_str()) {
                " (active)"
            } else {
                ""
            };
            println!("  {scheme}://{marker}");
        }
        return Ok(());
    }

    let host = serve.bind(&config.sessions.uri)?;
    run_command(cli.command, host.service().as_ref()).await
}

async fn run_command(command: Commands, sessions: &dyn SessionService) -> Result<()> {
    match command {
        Commands::Create {
            app,
            user,
            session,
            state,
        } => {
            let mut request = CreateSessionRequest::new(app, user);
            if let Some(id) = session {
                request = request.with_session_id(id);
            }
            if let Some(state) = state {
                request = request.with_state(state);
            }
            print_json(&sessions.create_session(request).await?)
        }

        Commands::Get {
            app,
            user,
            session,
            recent,
            after,
        } => {
            let request = GetSessionRequest::new(&app, &user, &session).with_config(
                GetSessionConfig {
                    num_recent_events: recent,
                    after_timestamp: after,
                },
            );
            match sessions.get_session(request).await? {
                Some(found) => print_json(&found),
                None => bail!("Session not found: {app}/{user}/{session}"),
            }
        }

        Commands::List { app, user } => {
            print_json(&sessions.list_sessions(&app, user.as_deref()).await)
        }

        Commands::Delete { app, user, session } => {
            sessions.delete_session(&app, &user, &session).await?;
            println!("Deleted {app}/{user}/{session}");
            Ok(())
        }

        Commands::Append {
            app,
            user,
            session,
            author,
            deltas,
            content,
            invocation,
            partial,
        } => {
            let Some(mut target) = sessions
                .get_session(GetSessionRequest::new(&app, &user, &session))
                .await?
            else {
                bail!("Session not found: {app}/{user}/{session}");
            };

            let mut event = Event::new(author).partial(partial);
            for (key, value) in deltas {
                event = event.with_state_delta(key, value);
            }
            if let Some(content) = content {
                event = event.with_content(content);
            }
            if let Some(invocation) = invocation {
                event = event.with_invocation_id(invocation);
            }

            let appended = sessions.append_event(&mut target, event).await?;
            print_json(&appended)
        }

        Commands::Backends | Commands::Config { .. } | Commands::Completions { .. } => {
            unreachable!("handled before the store is bound")
        }
    }
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}
