mod logging;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chatloop_agents::{
    ChunkKind, ConversationDriver, ConversationEvent, DriverOutcome, EventSender, LlmProvider,
    OpenAiProvider, ToolDispatcher, ToolExecutor,
};
use chatloop_common::{ConversationMessage, SessionId};
use chatloop_config::{AppConfig, ConfigLoader};
use chatloop_db::{MessagePersistenceGuard, NewMessage, SessionStore, SqliteMessageStore};
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

/// How many stored messages are replayed when resuming a session.
const HISTORY_LIMIT: usize = 200;

#[derive(Parser)]
#[command(name = "chatloop", version, about = "Streaming tool-calling conversations")]
struct Cli {
    /// Config file (YAML or TOML). Defaults to ~/.chatloop/config.yml
    #[arg(long, short, global = true, env = "CHATLOOP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a prompt and stream the conversation until the model answers
    Ask {
        prompt: String,

        /// Resume (or start) a stored session
        #[arg(long)]
        session: Option<String>,

        /// Override agent.max_rounds
        #[arg(long)]
        max_rounds: Option<usize>,

        /// Print every event as a JSON line instead of plain text
        #[arg(long)]
        json: bool,
    },
    /// List the combined tool catalog of all configured backends
    Tools,
    /// Validate configuration and check provider and tool backend reachability
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new(cli.config.clone())
        .load()
        .context("failed to load configuration")?;
    logging::init(config.logging.level.as_deref(), config.logging.json);

    match cli.command {
        Command::Ask {
            prompt,
            session,
            max_rounds,
            json,
        } => ask(config, prompt, session, max_rounds, json).await,
        Command::Tools => list_tools(&config).await,
        Command::Check => check(&config).await,
    }
}

fn provider(config: &AppConfig) -> Arc<dyn LlmProvider> {
    Arc::new(OpenAiProvider::new(
        config.provider.api_key.clone(),
        Some(config.provider.base_url.clone()),
    ))
}

fn dispatcher(config: &AppConfig) -> ToolDispatcher {
    ToolDispatcher::from_config(&config.tools)
        .with_idle_timeout(Duration::from_secs(config.agent.tool_idle_timeout_secs))
}

fn open_store(config: &AppConfig) -> Result<SessionStore> {
    let store = match &config.database.path {
        Some(path) => SessionStore::open(path),
        None => SessionStore::in_memory(),
    };
    store.context("failed to open session store")
}

async fn ask(
    mut config: AppConfig,
    prompt: String,
    session: Option<String>,
    max_rounds: Option<usize>,
    json: bool,
) -> Result<()> {
    if let Some(max_rounds) = max_rounds {
        config.agent.max_rounds = max_rounds.max(1);
    }

    let store = Arc::new(Mutex::new(open_store(&config)?));
    let guard = Arc::new(
        MessagePersistenceGuard::new(Arc::new(SqliteMessageStore::new(Arc::clone(&store))))
            .with_poll_interval(Duration::from_millis(config.agent.persistence_poll_ms))
            .with_cache_capacity(config.agent.persistence_cache_capacity),
    );
    let session = session.map(SessionId::from).unwrap_or_default();

    let mut messages = {
        let store = store.lock().await;
        let stored = store
            .message_count(session.as_str())
            .context("failed to count session history")?;
        if stored > HISTORY_LIMIT {
            info!(session = %session, stored, kept = HISTORY_LIMIT, "replaying recent history only");
        }
        store
            .load_conversation(session.as_str(), HISTORY_LIMIT)
            .context("failed to load session history")?
    };
    if !messages.is_empty() {
        info!(session = %session, restored = messages.len(), "resuming session");
    }

    let user = ConversationMessage::user(prompt);
    guard
        .save(NewMessage::new(session.clone(), user.clone()))
        .await
        .context("failed to persist prompt")?;
    messages.push(user);

    let (events, rx) = EventSender::channel();
    let printer = tokio::spawn(print_events(rx, json));

    let tools: Arc<dyn ToolExecutor> = Arc::new(dispatcher(&config));
    let driver = ConversationDriver::from_config(
        &config,
        provider(&config),
        tools,
        events,
        Some((guard, session.clone())),
    );

    let abort = driver.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping conversation");
            abort.abort();
        }
    });

    let outcome = driver.start(&mut messages).await;
    // Closing every sender lets the printer drain and exit.
    drop(driver);
    printer.await.context("event printer panicked")?;

    match outcome {
        Ok(DriverOutcome::Completed(_)) => {
            if !json {
                eprintln!("\n[session {session}]");
            }
            Ok(())
        }
        Ok(DriverOutcome::Cancelled) => {
            if !json {
                eprintln!("\nconversation stopped");
            }
            Ok(())
        }
        Err(e) => Err(e).context("conversation failed"),
    }
}

async fn print_events(mut rx: UnboundedReceiver<ConversationEvent>, json: bool) {
    let mut stdout = std::io::stdout();

    while let Some(event) = rx.recv().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => {
                    let _ = writeln!(stdout, "{line}");
                }
                Err(e) => warn!("failed to serialize event: {e}"),
            }
            continue;
        }

        match event {
            ConversationEvent::Chunk {
                kind: ChunkKind::Text,
                text,
            } => {
                let _ = write!(stdout, "{text}");
                let _ = stdout.flush();
            }
            ConversationEvent::Chunk {
                kind: ChunkKind::Reasoning,
                text,
            } => eprint!("{text}"),
            ConversationEvent::ToolCall { calls } => {
                for call in calls {
                    eprintln!("\n-> {}({})", call.name, call.arguments_text);
                }
            }
            ConversationEvent::ToolStreamChunk { text, .. } => eprint!("{text}"),
            ConversationEvent::ToolResult { results } => {
                for result in results {
                    let status = if result.is_error() { "failed" } else { "ok" };
                    eprintln!(
                        "<- {} {status} ({} chars)",
                        result.name,
                        result.content.chars().count()
                    );
                }
            }
            ConversationEvent::SummaryChunk { .. } => eprint!("."),
            ConversationEvent::ConversationComplete { .. } => {
                let _ = writeln!(stdout);
            }
            ConversationEvent::Error { message } => eprintln!("\nerror: {message}"),
            ConversationEvent::Cancelled => {}
        }
    }
}

async fn list_tools(config: &AppConfig) -> Result<()> {
    if config.tools.is_empty() {
        println!("no tool backends configured");
        return Ok(());
    }

    let catalog = dispatcher(config)
        .list_combined_catalog()
        .await
        .context("failed to list tools")?;

    for tool in &catalog {
        println!("{:<40} {}", tool.name, tool.description);
    }
    println!("\n{} tool(s)", catalog.len());
    Ok(())
}

async fn check(config: &AppConfig) -> Result<()> {
    println!("configuration ok");
    println!("  provider: {} ({})", config.provider.base_url, config.provider.model);
    println!(
        "  api key:  {}",
        if config.provider.api_key.is_some() { "set" } else { "not set" }
    );

    let healthy = provider(config).health_check().await.unwrap_or(false);
    println!("  provider reachable: {}", if healthy { "yes" } else { "no" });

    let dispatcher = dispatcher(config);
    let catalog = dispatcher.list_combined_catalog().await?;
    for backend in dispatcher.backends() {
        let prefix = format!("{}__", backend.namespace);
        let count = catalog.iter().filter(|t| t.name.starts_with(&prefix)).count();
        println!("  tools/{}: {count} tool(s) at {}", backend.namespace, backend.endpoint);
    }

    if !healthy {
        anyhow::bail!("provider at {} is not reachable", config.provider.base_url);
    }
    Ok(())
}
