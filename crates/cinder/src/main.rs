use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use cinder::config::{self, APP_NAME, AppConfig, AppPaths};
use cinder::{
    EventStore, PullTransport, PushTransport, SessionClient, SessionState, StoreChange,
    StreamTransport, TurnHandle, TurnReport,
};
use cinder_protocol::{AgentRole, CanonicalBriefingEvent, EventType};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_ask(ctx: RuntimeContext, cmd: AskCommand) -> Result<()> {
    handle_ask(&ctx, cmd).await
}

#[tokio::main]
async fn async_watch(ctx: RuntimeContext, cmd: WatchCommand) -> Result<()> {
    handle_watch(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {:#?}", ctx.paths);

    match cli.command {
        Command::Ask(cmd) => async_ask(ctx, cmd),
        Command::Watch(cmd) => async_watch(ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Cinder - agent briefings for post-fire recovery operators.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// One Server-Sent-Events request per turn
    Pull,
    /// Persistent WebSocket subscription
    Push,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ask the recovery agents a question and print their briefings
    Ask(AskCommand),
    /// Follow pushed briefings until interrupted or the server closes
    Watch(WatchCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct AskCommand {
    /// The operator's question
    #[arg(value_name = "QUERY")]
    query: String,
    /// JSON object handed to the agents as session state
    #[arg(long, value_name = "JSON")]
    context: Option<String>,
    /// Which stream transport to use
    #[arg(long, value_enum, default_value_t = TransportKind::Pull)]
    transport: TransportKind,
}

#[derive(Debug, Clone, Args)]
struct WatchCommand {
    /// Only show briefings from this agent (repeatable)
    #[arg(long = "agent", value_name = "AGENT")]
    agents: Vec<String>,
    /// Only show briefings of this type (repeatable)
    #[arg(long = "type", value_name = "TYPE")]
    event_types: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = config::load_or_init_config(&paths)
            .with_context(|| format!("loading config from {}", paths.config_file.display()))?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("cinder={level},cinder_protocol={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(!self.disable_color())
                        .with_writer(io::stderr),
                )
                .try_init()
                .ok();
        }

        // log crate users (the library) go through env_logger
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn disable_color(&self) -> bool {
        let force_color =
            matches!(self.common.color, ColorOption::Always) || env::var_os("FORCE_COLOR").is_some();
        self.common.no_color
            || matches!(self.common.color, ColorOption::Never)
            || env::var_os("NO_COLOR").is_some()
            || (!force_color && !io::stderr().is_terminal())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self.config.logging.level.parse().unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn store(&self) -> EventStore {
        EventStore::new(self.config.store.max_events)
    }

    fn pull_client(&self) -> Result<SessionClient<PullTransport>> {
        let transport =
            PullTransport::new(self.config.backend.clone(), self.config.pull.clone())?;
        Ok(SessionClient::new(
            transport,
            self.store(),
            self.config.backoff,
            self.config.retry.clone(),
        ))
    }

    fn push_client(&self) -> Result<SessionClient<PushTransport>> {
        let transport = PushTransport::new(
            self.config.backend.clone(),
            self.config.push.clone(),
            self.config.backoff,
        )?;
        Ok(SessionClient::new(
            transport,
            self.store(),
            self.config.backoff,
            self.config.retry.clone(),
        ))
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn handle_ask(ctx: &RuntimeContext, cmd: AskCommand) -> Result<()> {
    let context = match cmd.context.as_deref() {
        Some(text) => serde_json::from_str::<Value>(text).context("parsing --context JSON")?,
        None => Value::Null,
    };

    let report = match cmd.transport {
        TransportKind::Pull => {
            let client = ctx.pull_client()?;
            let changes = client.store().subscribe();
            let handle = client.start(cmd.query, context);
            follow_turn(ctx, &client, handle, changes).await?
        }
        TransportKind::Push => {
            let client = ctx.push_client()?;
            let changes = client.store().subscribe();
            let handle = client.start(cmd.query, context);
            follow_turn(ctx, &client, handle, changes).await?
        }
    };
    finish(report)
}

async fn handle_watch(ctx: &RuntimeContext, cmd: WatchCommand) -> Result<()> {
    let client = ctx.push_client()?;

    let mut filter = ctx.config.push.filter();
    if !cmd.agents.is_empty() {
        filter.agents = parse_agents(&cmd.agents)?;
    }
    if !cmd.event_types.is_empty() {
        filter.event_types = parse_event_types(&cmd.event_types)?;
    }
    info!("Watching with filter {:?}", filter);
    client.transport().set_filter(filter);

    let changes = client.store().subscribe();
    let handle = client.watch();
    let report = follow_turn(ctx, &client, handle, changes).await?;
    finish(report)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Init { force } => {
            let path = &ctx.paths.config_file;
            if path.exists() && !force {
                bail!(
                    "config already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            config::write_default_config(path)
                .with_context(|| format!("writing config file to {}", path.display()))?;
            info!("wrote default config to {}", path.display());
            Ok(())
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

/// Print briefings as they land in the store until the turn settles. Ctrl-C
/// cancels the turn.
async fn follow_turn<T: StreamTransport>(
    ctx: &RuntimeContext,
    client: &SessionClient<T>,
    handle: TurnHandle,
    mut changes: tokio::sync::broadcast::Receiver<StoreChange>,
) -> Result<TurnReport> {
    let mut states = client.watch_state();
    let mut wait = Box::pin(handle.wait());

    loop {
        tokio::select! {
            report = &mut wait => {
                // briefings committed just before the turn settled
                while let Ok(change) = changes.try_recv() {
                    print_change(ctx, &change)?;
                }
                return Ok(report);
            }
            change = changes.recv() => match change {
                Ok(change) => print_change(ctx, &change)?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Output fell behind; {} briefing(s) not printed", skipped);
                }
                Err(RecvError::Closed) => return Ok(wait.await),
            },
            changed = states.changed() => {
                if changed.is_ok() {
                    let state = states.borrow_and_update().clone();
                    if state.is_reconnecting() {
                        warn!("Connection lost; {}", state);
                    } else {
                        debug!("Session {}", state);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; cancelling turn");
                client.cancel();
            }
        }
    }
}

fn print_change(ctx: &RuntimeContext, change: &StoreChange) -> Result<()> {
    if let StoreChange::Appended { event, .. } = change {
        print_event(ctx, event)?;
    }
    Ok(())
}

fn print_event(ctx: &RuntimeContext, event: &CanonicalBriefingEvent) -> Result<()> {
    let mut out = io::stdout().lock();
    if ctx.common.json {
        let line = serde_json::to_string(event).context("serializing briefing")?;
        writeln!(out, "{line}")?;
        return Ok(());
    }

    writeln!(
        out,
        "[{:<8}] {} ({}): {}",
        event.severity.as_str(),
        event.source_agent.display_name(),
        event.event_type,
        event.content.summary
    )?;
    if event.content.detail != event.content.summary && !event.content.detail.is_empty() {
        for line in event.content.detail.lines() {
            writeln!(out, "    {line}")?;
        }
    }
    for action in &event.content.suggested_actions {
        writeln!(
            out,
            "    -> {} [{}]",
            action.label,
            action.target_agent.display_name()
        )?;
    }
    if !event.proof_layer.citations.is_empty() {
        writeln!(
            out,
            "    confidence {:.2}, {} citation(s)",
            event.proof_layer.confidence,
            event.proof_layer.citations.len()
        )?;
    }
    Ok(())
}

fn finish(report: TurnReport) -> Result<()> {
    match report.outcome {
        SessionState::Completed => {
            info!(
                "{} briefing(s) after {} attempt(s)",
                report.events, report.attempts
            );
            Ok(())
        }
        SessionState::Cancelled => {
            info!("Turn cancelled");
            Ok(())
        }
        SessionState::Failed(failure) => Err(anyhow!(
            "{} (gave up after {} attempt(s))",
            failure.message,
            failure.attempts
        )),
        other => Err(anyhow!("turn ended in unexpected state {other}")),
    }
}

fn parse_agents(values: &[String]) -> Result<Vec<AgentRole>> {
    values
        .iter()
        .map(|v| AgentRole::lookup(v).ok_or_else(|| anyhow!("unknown agent '{v}'")))
        .collect()
}

fn parse_event_types(values: &[String]) -> Result<Vec<EventType>> {
    values
        .iter()
        .map(|v| EventType::parse(v).ok_or_else(|| anyhow!("unknown event type '{v}'")))
        .collect()
}
