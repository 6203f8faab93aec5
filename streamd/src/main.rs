//! streamd - stream text generation from a local Ollama server
//!
//! CLI entry point: checks the connection, runs concurrent streams and
//! shows the event flow.

use std::fs;
use std::io::Write;

use clap::{CommandFactory, FromArgMatches};
use colored::Colorize;
use eyre::{Context, Result, eyre};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use streamd::cli::{Cli, Command, generate_after_help, get_log_path};
use streamd::config::Config;
use streamd::events::{
    BusLogger, DebugRecord, EventBus, EventType, LogLevel, SessionLogger, StreamContext, StreamEvent, format_event,
};
use streamd::llm::create_client;
use streamd::stream::{StreamManager, StreamRequest};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if let Some(host) = &cli.host {
        debug!(%host, "main: host overridden on command line");
        config.ollama.host = host.clone();
    }
    info!("streamd loaded config: host={}", config.ollama.host);

    let backend = create_client(&config.ollama).context("Failed to create Ollama client")?;
    let bus = EventBus::new();
    let session_log = SessionLogger::new(config.session_log.clone());
    let _session_sub = session_log.attach(&bus);
    let manager = StreamManager::new(backend, bus.clone());
    let log = BusLogger::new(bus, "cli");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Models => cmd_models(&manager).await,
        Command::Run {
            model,
            context,
            export,
            prompts,
        } => {
            let model = model.unwrap_or_else(|| config.defaults.model.clone());
            let context = context.unwrap_or(config.defaults.context);
            log.info(&format!("Running {} prompt(s) on {}", prompts.len(), model));

            let result = cmd_run(&manager, &model, context, prompts).await;
            if let Some(path) = export {
                session_log
                    .export_to_file(&path)
                    .context(format!("Failed to export session log to {}", path.display()))?;
                println!("{} {}", "Session log written to".dimmed(), path.display());
            }
            result
        }
    }
}

async fn cmd_models(manager: &StreamManager) -> Result<()> {
    debug!("cmd_models: called");
    let status = manager.test_connection().await;
    if !status.connected {
        let reason = status.error.unwrap_or_else(|| "unknown error".to_string());
        eprintln!("{} {}: {}", "✗".red(), manager.host(), reason);
        return Err(eyre!("Cannot connect to {}", manager.host()));
    }

    println!("{} {}", "✓".green(), manager.host());
    if status.models.is_empty() {
        println!("{}", "No models installed".dimmed());
    }
    for name in &status.models {
        println!("  {}", name);
    }
    Ok(())
}

async fn cmd_run(manager: &StreamManager, model: &str, context: StreamContext, prompts: Vec<String>) -> Result<()> {
    debug!(%model, %context, count = prompts.len(), "cmd_run: called");
    let bus = manager.bus().clone();
    let single = prompts.len() == 1;

    // Subscribe before starting anything so no event is missed
    let printer = if single {
        bus.subscribe_to_types([EventType::StreamChunk], |event| {
            if let StreamEvent::Chunk { chunk, .. } = event {
                let mut stdout = std::io::stdout().lock();
                write!(stdout, "{}", chunk.content)?;
                stdout.flush()?;
            }
            Ok(())
        })
    } else {
        bus.subscribe(|event| {
            if !event.is_terminal() && event.event_type() != EventType::StreamChunk {
                println!("{}", paint(&format_event(event)));
            }
            Ok(())
        })
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let terminals = bus.subscribe_to_types(EventType::TERMINAL, move |event| {
        let _ = tx.send(event.clone());
        Ok(())
    });

    let ids: Vec<String> = prompts
        .into_iter()
        .map(|prompt| manager.start_stream(StreamRequest::new(model, prompt, context)))
        .collect();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut outcomes = Vec::new();
    while outcomes.len() < ids.len() {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                let cancelled = manager.cancel_all(Some("interrupted")).await;
                warn!(cancelled, "cmd_run: interrupted");
            }
            event = rx.recv() => match event {
                Some(event) if event.stream_id().is_some_and(|id| ids.iter().any(|i| i == id)) => outcomes.push(event),
                Some(_) => {}
                None => break,
            }
        }
    }
    printer.unsubscribe();
    terminals.unsubscribe();

    if single {
        println!();
    }
    let mut failed = 0;
    for event in &outcomes {
        if !single && let StreamEvent::Completed { result } = event {
            println!("\n{}", result.full_content);
        }
        if matches!(event, StreamEvent::Error { .. }) {
            failed += 1;
        }
        println!("{}", paint(&format_event(event)));
    }

    if failed > 0 {
        return Err(eyre!("{} of {} stream(s) failed", failed, ids.len()));
    }
    Ok(())
}

fn paint(record: &DebugRecord) -> String {
    let line = format!("[{}] {}", record.category, record.content);
    match record.level {
        LogLevel::Error => line.red().to_string(),
        LogLevel::Warn => line.yellow().to_string(),
        LogLevel::Info => line.green().to_string(),
        LogLevel::Debug => line.dimmed().to_string(),
    }
}
