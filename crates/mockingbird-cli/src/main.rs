use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mockingbird_agent::sink::WriterEventSink;
use mockingbird_agent::{Agent, AgentEvent, TurnContext};
use mockingbird_core::config::{Config, LoggingConfig};
use mockingbird_core::error::MockingbirdError;
use mockingbird_core::session::{Conversation, HistoryEntry};
use mockingbird_core::transcript_store::{JsonlTranscriptStore, load_history_file};
use mockingbird_providers::instructions::parse_instructions;
use mockingbird_tools::ToolRegistry;

#[derive(Parser)]
#[command(
    name = "mockingbird",
    about = "Scripted streaming model: replays instruction chains as chat-completion SSE",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat interactively; each line is a user message
    Chat {
        /// Load and persist this conversation in the transcript store
        #[arg(long)]
        session: Option<String>,

        /// Override the delay between streamed fragments
        #[arg(long)]
        chunk_delay_ms: Option<u64>,
    },

    /// Run the next turn of a stored history and write the raw SSE stream to stdout
    Replay {
        /// History file (JSON array or JSONL of history entries)
        #[arg(long)]
        history: PathBuf,

        /// Override the delay between streamed fragments
        #[arg(long)]
        chunk_delay_ms: Option<u64>,
    },

    /// Parse instruction markup from a file and print the plan
    Parse {
        #[arg(long)]
        file: PathBuf,

        /// Print normalized markup instead of JSON
        #[arg(long)]
        render: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show effective settings
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Set a config value (JSON, or a bare string) and save the file
    Set { key: String, value: String },
    /// Check the configuration for problems
    Validate,
}

fn init_logging(logging: &LoggingConfig, verbose: bool, force_stderr: bool) {
    let level = if verbose {
        "debug"
    } else {
        logging.level.as_deref().unwrap_or("info")
    };
    let mut directives = level.to_string();
    for filter in &logging.filters {
        directives.push(',');
        directives.push_str(filter);
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    let to_stdout = logging.output == "stdout" && !force_stderr;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (logging.format.as_str(), to_stdout) {
        ("json", true) => builder.json().with_writer(std::io::stdout).init(),
        ("json", false) => builder.json().with_writer(std::io::stderr).init(),
        (_, true) => builder.with_writer(std::io::stdout).init(),
        (_, false) => builder.with_writer(std::io::stderr).init(),
    }
}

fn with_chunk_delay(config: &Config, chunk_delay_ms: Option<u64>) -> Config {
    let mut config = config.clone();
    if let Some(ms) = chunk_delay_ms {
        let mut stream = config.stream();
        stream.chunk_delay_ms = ms;
        config.stream = Some(stream);
    }
    config
}

/// Cancel `cancel` on Ctrl-C until the returned task is aborted.
fn cancel_on_ctrl_c(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling turn");
            cancel.cancel();
        }
    })
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<AgentEvent>) {
    let mut out = std::io::stdout();
    let mut in_reasoning = false;
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::PartialReply { delta } => {
                if in_reasoning {
                    println!();
                    in_reasoning = false;
                }
                print!("{delta}");
            }
            AgentEvent::ReasoningStream { text } => {
                if !in_reasoning {
                    print!("[reasoning] ");
                    in_reasoning = true;
                }
                print!("{text}");
            }
            AgentEvent::ToolCall { id, tool, params } => {
                println!("\n[tool call] {tool} {params} ({id})");
            }
            AgentEvent::ToolResult {
                tool_call_id,
                content,
                is_error,
            } => {
                let label = if is_error { "tool error" } else { "tool result" };
                println!("[{label}] {tool_call_id}: {content}");
            }
            AgentEvent::TurnComplete { .. } => println!(),
            AgentEvent::Error { kind, message } => eprintln!("\n[{kind}] {message}"),
        }
        let _ = out.flush();
    }
}

async fn run_chat(config: &Config, session: Option<String>) -> anyhow::Result<()> {
    let store = JsonlTranscriptStore::new(config.transcript_dir());
    let mut conversation = match &session {
        Some(id) => store.load(id).await?,
        None => Conversation::new(),
    };
    let agent = Agent::from_config(config);

    tracing::info!(
        conversation_id = %conversation.id,
        entries = conversation.entries().len(),
        "Starting chat"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "/quit" | "/exit") {
            break;
        }

        let before = conversation.entries().len();
        conversation.append(HistoryEntry::user(line));

        let cancel = CancellationToken::new();
        let interrupt = cancel_on_ctrl_c(cancel.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(print_events(events_rx));

        let result = agent
            .run_turn(
                &mut conversation,
                TurnContext::new().with_cancel(cancel).with_events(events_tx),
            )
            .await;
        interrupt.abort();
        let _ = printer.await;

        match result {
            Ok(report) => {
                tracing::debug!(
                    generation_id = %report.generation_id,
                    fragments = report.fragments,
                    "Turn finished"
                );
                if let Some(id) = &session {
                    store.append(id, &conversation.entries()[before..]).await?;
                }
            }
            Err(e) => {
                // Only completed exchanges stay in the history.
                conversation.entries.truncate(before);
                if matches!(e, MockingbirdError::Cancelled) {
                    println!("\n[cancelled]");
                }
            }
        }
    }

    Ok(())
}

async fn run_replay(config: &Config, history: &Path) -> anyhow::Result<()> {
    let entries = load_history_file(history).await?;
    let mut conversation = Conversation::from_entries("replay", entries);
    let agent = Agent::from_config(config).with_event_sink(Arc::new(WriterEventSink::stdout()));

    let cancel = CancellationToken::new();
    let interrupt = cancel_on_ctrl_c(cancel.clone());
    let result = agent
        .run_turn(&mut conversation, TurnContext::new().with_cancel(cancel))
        .await;
    interrupt.abort();

    let report = result?;
    tracing::info!(
        generation_id = %report.generation_id,
        fragments = report.fragments,
        tool_calls = report.tool_calls,
        orphaned = report.orphaned_results.len(),
        "Replay complete"
    );
    Ok(())
}

fn run_parse(config: &Config, file: &Path, render: bool) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)?;
    let markers = config.instructions();
    match parse_instructions(&text, &markers)? {
        Some(chain) if render => println!("{}", chain.to_markup(&markers)),
        Some(chain) => println!("{}", serde_json::to_string_pretty(&chain)?),
        None => println!("No instructions found"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    let raw_stream_on_stdout = matches!(cli.command, Commands::Replay { .. });
    init_logging(&config.logging(), cli.verbose, raw_stream_on_stdout);

    match cli.command {
        Commands::Chat {
            session,
            chunk_delay_ms,
        } => {
            run_chat(&with_chunk_delay(&config, chunk_delay_ms), session).await?;
        }
        Commands::Replay {
            history,
            chunk_delay_ms,
        } => {
            run_replay(&with_chunk_delay(&config, chunk_delay_ms), &history).await?;
        }
        Commands::Parse { file, render } => run_parse(&config, &file, render)?,
        Commands::Status => {
            let stream = config.stream();
            let markers = config.instructions();
            println!("mockingbird v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Model: {}", config.model());
            println!("Transcripts: {}", config.transcript_dir().display());
            println!("Markers: {} ... {}", markers.start_marker, markers.end_marker);
            println!(
                "Stream: {}ms delay, {} words/chunk, {} reasoning words/chunk, {} argument fragments",
                stream.chunk_delay_ms,
                stream.words_per_chunk,
                stream.reasoning_words_per_chunk,
                stream.argument_fragments
            );
            println!("Tools: {}", ToolRegistry::with_builtins().list().join(", "));
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{value}"),
                None => anyhow::bail!("No config value at '{key}'"),
            },
            ConfigAction::Set { key, value } => {
                let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
                let mut updated = config.clone();
                updated.set_path(&key, value)?;
                let (_, errors) = updated.validate();
                if !errors.is_empty() {
                    anyhow::bail!("Not saving {}: {}", config_path.display(), errors.join("; "));
                }
                updated.save(&config_path)?;
                println!("Set {key} in {}", config_path.display());
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} config error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK");
            }
        },
    }

    Ok(())
}
