//! Toolgate - command-line console for a tool-calling assistant

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use toolgate::api::{ConsoleClient, HealthLevel};
use toolgate::error::ConsoleError;
use toolgate::approval::{ApprovalMachine, Execution, PendingApproval};
use toolgate::session::{run_turn, Requester, SessionController, TurnInterrupt};
use toolgate::turn::{TimelineMutation, TurnOutcome};
use toolgate::types::config::parse_timeout;
use toolgate::types::{
    ApprovalDirective, Config, EntryStatus, Timeline, ToolArgs, ToolDescriptor,
    ToolInvocationRequest, ToolInvocationResult,
};

type StdinLines = Lines<BufReader<Stdin>>;

#[derive(Parser, Debug)]
#[command(name = "toolgate")]
#[command(about = "Toolgate - console for a tool-calling assistant")]
#[command(version)]
struct Args {
    /// Server base URL (overrides the config file)
    #[arg(long, env = "TOOLGATE_BASE_URL")]
    base_url: Option<String>,

    /// Bearer token for the server
    #[arg(long, env = "TOOLGATE_TOKEN", hide_env_values = true)]
    token: Option<secrecy::SecretString>,

    /// Config file (defaults to the platform config dir)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Timeout for single-shot requests, e.g. "30s"
    #[arg(long, value_name = "DURATION")]
    timeout: Option<String>,

    /// Truncate printed tool results to this many characters (0 = no limit)
    #[arg(long, default_value_t = 400)]
    max_result_chars: usize,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chat with the assistant. Without a prompt, reads prompts line by line.
    Chat {
        /// Let the server run risky tools without approval
        #[arg(long)]
        auto_approve: bool,

        /// Prompt for a single turn
        #[arg(value_name = "PROMPT")]
        prompt: Option<String>,
    },

    /// Run a tool through the preview-then-confirm flow.
    Call {
        /// Tool name
        tool: String,

        /// Arguments as a JSON object
        #[arg(long, value_name = "JSON")]
        args: Option<String>,

        /// Endpoint path (defaults to the generic tool endpoint)
        #[arg(long)]
        path: Option<String>,

        /// Confirm without asking
        #[arg(long, short = 'y', conflicts_with = "direct")]
        yes: bool,

        /// Skip the preview and call the tool directly
        #[arg(long, conflicts_with = "confirm")]
        direct: bool,

        /// Commit an approval previewed earlier, without a new preview
        #[arg(long, value_name = "APPROVAL_ID", conflicts_with = "yes")]
        confirm: Option<String>,
    },

    /// List the tools registered on the server.
    Tools,

    /// Check server health.
    Health {
        /// Run the full readiness check
        #[arg(long)]
        full: bool,
    },

    /// List chat sessions, or delete one.
    Sessions {
        /// Session to delete
        #[arg(long, value_name = "ID")]
        delete: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug { "debug" } else { "warn" };

    // The REPL owns the terminal, so debug logs go to a file there.
    let is_repl = matches!(args.command, Command::Chat { prompt: None, .. });

    if is_repl && args.debug {
        let log_path = std::env::temp_dir().join("toolgate.log");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)
            .with_context(|| format!("failed to open log file {}", log_path.display()))?;

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| filter.into()),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
            .init();

        eprintln!("Debug logs written to: {}", log_path.display());
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| filter.into()),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }

    let config = load_config(&args)?;
    let client = ConsoleClient::new(&config).context("failed to create client")?;
    let limit = args.max_result_chars;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    match args.command {
        Command::Chat {
            auto_approve,
            prompt,
        } => {
            let auto_approve = auto_approve || config.auto_approve();
            chat(&client, auto_approve, prompt, limit, &mut stdin).await
        }
        Command::Call {
            tool,
            args: raw_args,
            path,
            yes,
            direct,
            confirm,
        } => {
            let tool_args = parse_args(raw_args.as_deref())?;
            let path = path.unwrap_or_else(|| ToolDescriptor::default_path(&tool));
            let directive = ApprovalDirective::from_flags(
                !direct && confirm.is_none(),
                confirm.is_some(),
                confirm.as_deref(),
            )?;
            call(&client, &path, tool_args, directive, yes, limit, &mut stdin).await
        }
        Command::Tools => tools(&client).await,
        Command::Health { full } => {
            let level = if full {
                HealthLevel::Full
            } else {
                HealthLevel::Quick
            };
            let result = client.health(level).await?;
            println!("{}: {}", result.status, result.message());
            if result.is_error() {
                bail!("server reported unhealthy");
            }
            Ok(())
        }
        Command::Sessions { delete } => sessions(&client, delete).await,
    }
}

/// Resolves defaults, then the config file, then env vars and flags.
fn load_config(args: &Args) -> Result<Config> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => Config::default_config_path()?,
    };
    let mut config = Config::load(&path)?;

    if let Some(base_url) = &args.base_url {
        config = config.with_base_url(base_url.as_str());
    }
    if let Some(token) = &args.token {
        config = config.with_api_token(token.clone());
    }
    if let Some(timeout) = &args.timeout {
        config = config.with_request_timeout(parse_timeout(timeout)?);
    }
    config.validate()?;
    tracing::debug!(?config, "configuration resolved");
    Ok(config)
}

fn parse_args(raw: Option<&str>) -> Result<ToolArgs> {
    let Some(raw) = raw else {
        return Ok(ToolArgs::new());
    };
    match serde_json::from_str(raw).context("--args is not valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("--args must be a JSON object, got {other}"),
    }
}

async fn chat(
    client: &ConsoleClient,
    auto_approve: bool,
    prompt: Option<String>,
    limit: usize,
    stdin: &mut StdinLines,
) -> Result<()> {
    let mut controller = SessionController::new(Requester::chat(), auto_approve);
    let mut timeline = Timeline::new();
    let interrupt = TurnInterrupt::default();
    listen_for_interrupts(interrupt.clone());

    if let Some(prompt) = prompt {
        let outcome =
            chat_turn(client, &mut controller, &mut timeline, &interrupt, &prompt, limit).await;
        if let TurnOutcome::Failed { message, .. } = outcome {
            bail!("turn failed: {message}");
        }
        return Ok(());
    }

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = stdin.next_line().await? else {
            break;
        };
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                controller.reset_session();
                println!("(new conversation)");
            }
            prompt => {
                chat_turn(client, &mut controller, &mut timeline, &interrupt, prompt, limit).await;
            }
        }
    }
    Ok(())
}

async fn chat_turn(
    client: &ConsoleClient,
    controller: &mut SessionController,
    timeline: &mut Timeline,
    interrupt: &TurnInterrupt,
    prompt: &str,
    limit: usize,
) -> TurnOutcome {
    let stop = CancellationToken::new();
    interrupt.arm(stop.clone());
    let outcome = run_turn(controller, client, timeline, prompt, &stop, |timeline, mutation| {
        render(timeline, mutation, limit);
    })
    .await;
    interrupt.disarm();
    outcome
}

/// Installs one Ctrl-C listener for the whole chat.
///
/// Ctrl-C cancels the running turn; with no turn running it exits.
fn listen_for_interrupts(interrupt: TurnInterrupt) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !interrupt.interrupt() {
                println!();
                std::process::exit(130);
            }
        }
    });
}

fn render(timeline: &Timeline, mutation: &TimelineMutation, limit: usize) {
    match mutation {
        TimelineMutation::TextAppended { id, text } => {
            let is_error = timeline
                .get(*id)
                .is_some_and(|entry| entry.status == EntryStatus::Error);
            if !is_error {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
        }
        TimelineMutation::ToolOpened { tool, .. } => println!("\n[{tool}] running"),
        TimelineMutation::ToolClosed { id, tool } => {
            let content = timeline.get(*id).map_or("", |entry| entry.content.as_str());
            println!("[{tool}] {}", truncate(content, limit));
        }
        TimelineMutation::ApprovalRaised { tool, .. } => {
            println!(
                "[{tool}] needs approval; run it with `toolgate call {tool}` or chat with --auto-approve"
            );
        }
        TimelineMutation::Finished(TurnOutcome::Done) => println!(),
        TimelineMutation::Finished(TurnOutcome::Cancelled) => println!("\n(cancelled)"),
        TimelineMutation::Finished(TurnOutcome::Failed { message, .. }) => {
            eprintln!("\nerror: {message}");
        }
        TimelineMutation::SessionBound(_)
        | TimelineMutation::EntryOpened { .. }
        | TimelineMutation::EntryFrozen { .. }
        | TimelineMutation::EntryRemoved(_) => {}
    }
}

async fn call(
    client: &ConsoleClient,
    path: &str,
    tool_args: ToolArgs,
    directive: ApprovalDirective,
    yes: bool,
    limit: usize,
    stdin: &mut StdinLines,
) -> Result<()> {
    let mut machine = ApprovalMachine::new(client, Requester::form("cli"));
    let mut timeline = Timeline::new();

    match directive {
        ApprovalDirective::DryRun => {}
        ApprovalDirective::Direct => {
            let result = match machine.execute_direct(path, tool_args.clone()).await {
                Ok(result) => result,
                Err(err @ ConsoleError::ApprovalRequired { .. }) => {
                    bail!("{err}; run without --direct to preview and confirm")
                }
                Err(err) => return Err(err.into()),
            };
            return report(&mut timeline, &result, tool_args, limit);
        }
        directive @ ApprovalDirective::Confirm { .. } => {
            // No local snapshot exists here; the server validates the ticket.
            let request = ToolInvocationRequest::new(path, tool_args.clone(), directive)
                .with_actor(machine.requester().label());
            let result = machine.transport().call_tool(&request).await?;
            return report(&mut timeline, &result, tool_args, limit);
        }
    }

    let mut execution = machine.execute(path, tool_args.clone()).await?;
    loop {
        let pending = match execution {
            Execution::Finished(result) => {
                return report(&mut timeline, &result, tool_args, limit)
            }
            Execution::NeedsApproval(pending) => pending,
        };
        show_preview(&pending);
        if !yes && !ask(stdin, "Proceed? [y/N] ").await? {
            machine.cancel();
            println!("cancelled");
            return Ok(());
        }

        execution = loop {
            match machine.confirm_approval(&pending.approval_id).await {
                Ok(Execution::Finished(result)) => {
                    return report(&mut timeline, &result, pending.args, limit)
                }
                Ok(execution) => break execution,
                Err(err) if err.is_transport() => {
                    eprintln!("confirm failed: {err}");
                    eprintln!("the server may or may not have run the tool");
                    if !ask(stdin, "Retry confirm with the same approval? [y/N] ").await? {
                        machine.cancel();
                        bail!("approval {} abandoned", pending.approval_id);
                    }
                }
                Err(err) => return Err(err.into()),
            }
        };
    }
}

fn show_preview(pending: &PendingApproval) {
    println!("{} requires approval ({})", pending.tool, pending.approval_id);
    if !pending.preview.is_empty() {
        println!("{}", pending.preview);
    }
}

fn report(
    timeline: &mut Timeline,
    result: &ToolInvocationResult,
    args: ToolArgs,
    limit: usize,
) -> Result<()> {
    let id = timeline.push_invocation(result, args);
    if let Some(entry) = timeline.get(id) {
        println!("[{}] {}", result.tool, truncate(&entry.content, limit));
    }
    if result.is_error() {
        bail!("{} failed", result.tool);
    }
    Ok(())
}

async fn ask(stdin: &mut StdinLines, prompt: &str) -> Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let answer = stdin.next_line().await?.unwrap_or_default();
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

async fn tools(client: &ConsoleClient) -> Result<()> {
    let tools = client.registry().await?;
    if tools.is_empty() {
        println!("No tools registered.");
        return Ok(());
    }
    let width = tools.iter().map(|t| t.name.len()).max().unwrap_or(0);
    for tool in &tools {
        let marker = if tool.risky { "!" } else { " " };
        println!("{marker} {:width$}  {}", tool.name, tool.description);
    }
    Ok(())
}

async fn sessions(client: &ConsoleClient, delete: Option<String>) -> Result<()> {
    if let Some(id) = delete {
        if client.delete_session(&id).await? {
            println!("Deleted session {id}");
            return Ok(());
        }
        bail!("session {id} not found");
    }

    let sessions = client.list_sessions().await?;
    if sessions.is_empty() {
        println!("No sessions.");
    }
    for session in sessions {
        println!("{}  ({} messages)", session.session_id, session.message_count);
    }
    Ok(())
}

fn truncate(text: &str, limit: usize) -> String {
    if limit == 0 || text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push_str("...");
    out
}
