mod config;
mod error;

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use runtime::{
    Agent, AgentHandle, KeywordRetriever, OpenAiBackend, ProviderRegistry, Retriever, Status,
};
use storage::{Event, EventKind, EventStore, KnowledgeStore, Role, SessionId};
use tracing::{info, warn};

use config::{Config, ModelConfig};
use error::{Error, Result};

const CONFIG_FILE: &str = "keel.toml";
const EVENTS_DB: &str = "events.db";
const KNOWLEDGE_DB: &str = "knowledge.db";

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "A tool-using chat agent over MCP providers", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session
    Chat {
        /// Knowledge label to retrieve context from
        #[arg(short, long)]
        label: Option<String>,
    },
    /// Connect to every provider and list its tools
    Tools,
    /// Manage knowledge indexes
    Index {
        #[command(subcommand)]
        action: IndexCommand,
    },
    /// List all sessions
    Sessions {
        /// Show only the last N sessions
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Show event logs for a session
    Logs {
        /// Session ID (prefix match supported)
        #[arg(short, long)]
        session: String,
        /// Filter by event kind (message, tool_call, tool_result)
        #[arg(short, long)]
        kind: Option<String>,
    },
}

#[derive(Subcommand)]
enum IndexCommand {
    /// Index every file under a directory (replaces an existing label)
    Create { dir: PathBuf, label: String },
    /// Remove a label's index
    Delete { label: String },
    /// List indexed labels
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load_or_default(&cli.config)?;

    match cli.command {
        Some(Commands::Chat { label }) => cmd_chat(&config, label).await,
        None => cmd_chat(&config, None).await,
        Some(Commands::Tools) => cmd_tools(&config).await,
        Some(Commands::Index { action }) => cmd_index(&config, action).await,
        Some(Commands::Sessions { limit }) => cmd_sessions(limit),
        Some(Commands::Logs { session, kind }) => cmd_logs(&session, kind.as_deref()),
    }
}

async fn cmd_chat(config: &Config, label: Option<String>) -> Result<()> {
    println!("keel v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let store = EventStore::open(data_dir.join(EVENTS_DB))?;

    let model = model_backend(&config.model);
    println!("Model: {model}");

    let registry = ProviderRegistry::from_configs(
        config.server_configs(),
        config.limits.provider_timeouts(),
    );
    let mut agent = Agent::new(model, registry)
        .with_retriever(keyword_retriever(config, &data_dir)?)
        .with_max_rounds(config.agent.max_rounds)
        .with_label(label.or_else(|| config.agent.label.clone()));
    if let Some(prompt) = &config.agent.system_prompt {
        agent = agent.with_system_prompt(prompt);
    }
    let agent = agent.with_journal(store)?;
    if let Some(session) = agent.session_id() {
        println!("Session ID: {session}");
    }

    let handle = AgentHandle::start(agent)?.with_timeouts(config.limits.operation_timeouts());
    let setup_wait = config.limits.provider_timeouts().handshake + Duration::from_secs(5);
    if !handle.wait_ready(setup_wait).await {
        handle.shutdown().await;
        return Err(Error::NotReady(setup_wait));
    }

    let tools = handle.catalog().await?;
    println!(
        "Providers: {} configured, {} tool(s) available",
        config.providers.len(),
        tools.len()
    );
    println!("Type 'quit' or Ctrl+D to exit, '/help' for commands.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            // EOF
            break;
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "quit" || input == "exit" {
            break;
        }

        let reply = match input.strip_prefix('/') {
            Some(command) => match repl_command(&handle, command).await {
                Some(reply) => reply,
                None => continue,
            },
            None => handle.chat(input).await,
        };

        match reply.status {
            Status::Success => println!("\n{}\n", reply.message),
            Status::Error => eprintln!("Error: {}\n", reply.message),
        }
    }

    handle.shutdown().await;
    println!("\nSession ended.");
    Ok(())
}

/// Slash commands inside the chat REPL. `None` means the command printed
/// its own output.
async fn repl_command<M, R, C>(handle: &AgentHandle<M, R, C>, command: &str) -> Option<runtime::Reply>
where
    M: runtime::Model + 'static,
    R: Retriever + 'static,
    C: runtime::Connector + 'static,
{
    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("tools"), None, None) => {
            match handle.catalog().await {
                Ok(tools) if tools.is_empty() => println!("No tools available.\n"),
                Ok(tools) => {
                    for tool in tools {
                        println!("  {:<24} {}", tool.name, tool.description);
                    }
                    println!();
                }
                Err(e) => eprintln!("Error: {e}\n"),
            }
            None
        }
        (Some("label"), label, None) => Some(handle.update_label(label.map(str::to_string)).await),
        (Some("index"), Some(dir), Some(label)) => Some(handle.create_index(dir, label).await),
        (Some("unindex"), Some(label), None) => Some(handle.delete_index(label).await),
        (Some("reconnect"), None, None) => Some(handle.setup().await),
        _ => {
            println!("Commands:");
            println!("  /tools                 list available tools");
            println!("  /label [name]          set or clear the knowledge label");
            println!("  /index <dir> <label>   index a directory under a label");
            println!("  /unindex <label>       delete a label's index");
            println!("  /reconnect             reconnect providers that are down\n");
            None
        }
    }
}

async fn cmd_tools(config: &Config) -> Result<()> {
    let registry = ProviderRegistry::from_configs(
        config.server_configs(),
        config.limits.provider_timeouts(),
    );
    if registry.connections().is_empty() {
        println!("No providers configured in {CONFIG_FILE}.");
        return Ok(());
    }

    registry.connect_all().await;
    for connection in registry.connections() {
        println!("{} ({})", connection.name(), connection.state());
        for tool in connection.catalog() {
            println!("  {:<24} {}", tool.name, tool.description);
        }
    }
    registry.cleanup().await;
    Ok(())
}

async fn cmd_index(config: &Config, action: IndexCommand) -> Result<()> {
    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let retriever = keyword_retriever(config, &data_dir)?;

    match action {
        IndexCommand::Create { dir, label } => {
            let summary = retriever.create_index(&dir, &label).await?;
            println!(
                "Indexed {} file(s) into {} chunk(s) under '{}'.",
                summary.files, summary.chunks, summary.label
            );
        }
        IndexCommand::Delete { label } => {
            retriever.delete_index(&label).await?;
            println!("Deleted index '{label}'.");
        }
        IndexCommand::List => {
            let labels = retriever.labels()?;
            if labels.is_empty() {
                println!("No indexes found.");
            }
            for label in labels {
                println!("{label}");
            }
        }
    }
    Ok(())
}

fn cmd_sessions(limit: usize) -> Result<()> {
    let store = open_store()?;
    let sessions = store.list_sessions()?;

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<8}  STATUS",
        "SESSION ID", "STARTED", "MSGS"
    );
    println!("{}", "-".repeat(80));

    for summary in sessions.into_iter().take(limit) {
        let started = Local
            .from_utc_datetime(&summary.started_at.naive_utc())
            .format("%Y-%m-%d %H:%M");
        let status = if summary.ended_at.is_some() {
            "ended"
        } else {
            "active"
        };
        println!(
            "{:<36}  {:<20}  {:<8}  {status}",
            summary.id, started, summary.message_count
        );
    }

    Ok(())
}

fn cmd_logs(session_prefix: &str, kind_filter: Option<&str>) -> Result<()> {
    let store = open_store()?;
    let session_id = resolve_session(&store, session_prefix)?;

    let events = store.load_events(session_id, kind_filter)?;

    if events.is_empty() {
        println!("No events found for session {session_id}");
        return Ok(());
    }

    println!("Session: {session_id}\n");

    for event in events {
        print_event(&event);
    }

    Ok(())
}

/// A full session id is looked up directly; anything shorter must be an
/// unambiguous prefix.
fn resolve_session(store: &EventStore, session_prefix: &str) -> Result<SessionId> {
    if let Ok(id) = session_prefix.parse::<SessionId>() {
        if store.contains(id)? {
            return Ok(id);
        }
        return Err(Error::SessionNotFound {
            prefix: session_prefix.to_string(),
        });
    }

    let sessions = store.list_sessions()?;
    let matching: Vec<_> = sessions
        .iter()
        .filter(|s| s.id.to_string().starts_with(session_prefix))
        .collect();

    match matching.as_slice() {
        [] => Err(Error::SessionNotFound {
            prefix: session_prefix.to_string(),
        }),
        [only] => Ok(only.id),
        _ => Err(Error::AmbiguousSession {
            prefix: session_prefix.to_string(),
            matches: matching.iter().map(|s| s.id.to_string()).collect(),
        }),
    }
}

fn print_event(event: &Event) {
    let time = Local
        .from_utc_datetime(&event.timestamp.naive_utc())
        .format("%H:%M:%S");

    match &event.kind {
        EventKind::SessionStart => {
            println!("[{time}] === Session started ===");
        }
        EventKind::SessionEnd => {
            println!("[{time}] === Session ended ===");
        }
        EventKind::Message { role, content } => {
            let role_str = match role {
                Role::User => "USER",
                Role::Assistant => "ASSISTANT",
                Role::System => "SYSTEM",
                Role::Tool => "TOOL",
            };
            println!("[{time}] {role_str}: {}", truncate(content, 200));
        }
        EventKind::ToolCall {
            call_id,
            name,
            input,
        } => {
            println!("[{time}] TOOL CALL [{call_id}]: {name} {input}");
        }
        EventKind::ToolResult { call_id, output } => {
            println!("[{time}] TOOL RESULT [{call_id}]: {}", truncate(output, 200));
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

fn model_backend(config: &ModelConfig) -> OpenAiBackend {
    let builder = OpenAiBackend::builder(&config.model).base_url(&config.base_url);
    match config.api_key() {
        Some(key) => builder.api_key(key).build(),
        None => {
            warn!(env = %config.api_key_env, "no API key configured; requests are unauthenticated");
            builder.build()
        }
    }
}

fn keyword_retriever(config: &Config, data_dir: &Path) -> Result<KeywordRetriever> {
    let path = data_dir.join(KNOWLEDGE_DB);
    info!(path = %path.display(), "opening knowledge store");
    Ok(KeywordRetriever::new(KnowledgeStore::open(path)?)
        .with_threshold(config.retrieval.similarity_threshold)
        .with_top_k(config.retrieval.top_k))
}

fn open_store() -> Result<EventStore> {
    let db_path = data_dir().join(EVENTS_DB);

    if !db_path.exists() {
        return Err(Error::DatabaseNotFound { path: db_path });
    }

    Ok(EventStore::open(&db_path)?)
}

fn data_dir() -> PathBuf {
    dirs_data_dir().unwrap_or_else(|| ".keel".into())
}

fn dirs_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share/keel"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
            .map(|p| p.join("keel"))
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|h| PathBuf::from(h).join("keel"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}
