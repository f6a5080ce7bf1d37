//! Anima -- autonomous forward progress for registered projects.
//!
//! `anima daemon run` starts the supervisor and the control socket; every
//! other subcommand is a thin NDJSON client for a running daemon.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use anima_engine::CliAgentLauncher;
use anima_supervisor::{ControlCommand, Supervisor};
use anima_types::paths;

/// Anima -- keeps your projects moving while you sleep.
#[derive(Parser, Debug)]
#[command(name = "anima", version, about)]
struct Cli {
    /// Increase logging verbosity (same as RUST_LOG=debug)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the supervisor daemon in the foreground.
    Daemon {
        /// Agent CLI command to drive (developer and acceptor sessions).
        #[arg(long, default_value = "claude")]
        agent_cmd: String,
        /// Extra arguments passed to the agent CLI (repeatable).
        #[arg(long = "agent-arg")]
        agent_args: Vec<String>,
    },
    /// Register a project directory with the running daemon.
    Register { path: PathBuf },
    /// Remove a project registration (state tree stays on disk).
    Remove { project_id: String },
    /// List registered projects.
    List,
    /// Show a project's state and milestones.
    Status { project_id: String },
    /// Check for ready milestones immediately.
    Wake { project_id: String },
    /// Pause a project, interrupting the current round.
    Pause { project_id: String },
    /// Resume a paused project.
    Resume { project_id: String },
    /// Cancel a milestone (rolls its branch back to the base commit).
    Cancel {
        project_id: String,
        milestone_id: String,
    },
    /// Approve an awaiting-review milestone.
    Approve {
        project_id: String,
        milestone_id: String,
    },
    /// Reject an awaiting-review milestone with a reason.
    Reject {
        project_id: String,
        milestone_id: String,
        reason: String,
    },
    /// Send guidance text to a project's developer agent.
    Guide { project_id: String, text: String },
    /// Stream events as NDJSON (all projects, or one).
    Events {
        #[arg(long)]
        project_id: Option<String>,
    },
}

static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: i32) {
    SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { agent_cmd, agent_args } => run_daemon(cli.verbose, agent_cmd, agent_args),
        Commands::Register { path } => send_command(ControlCommand::RegisterProject { path }),
        Commands::Remove { project_id } => {
            send_command(ControlCommand::RemoveProject { project_id })
        }
        Commands::List => send_command(ControlCommand::ListProjects),
        Commands::Status { project_id } => {
            send_command(ControlCommand::GetProjectSnapshot { project_id })
        }
        Commands::Wake { project_id } => send_command(ControlCommand::WakeNow { project_id }),
        Commands::Pause { project_id } => send_command(ControlCommand::Pause { project_id }),
        Commands::Resume { project_id } => send_command(ControlCommand::Resume { project_id }),
        Commands::Cancel {
            project_id,
            milestone_id,
        } => send_command(ControlCommand::CancelMilestone {
            project_id,
            milestone_id,
        }),
        Commands::Approve {
            project_id,
            milestone_id,
        } => send_command(ControlCommand::ApproveAwaitingReview {
            project_id,
            milestone_id,
        }),
        Commands::Reject {
            project_id,
            milestone_id,
            reason,
        } => send_command(ControlCommand::RejectAwaitingReview {
            project_id,
            milestone_id,
            reason,
        }),
        Commands::Guide { project_id, text } => {
            send_command(ControlCommand::ProvideHumanGuidance { project_id, text })
        }
        Commands::Events { project_id } => stream_events(project_id),
    }
}

// ----------------------------------------------------------------------
// Daemon
// ----------------------------------------------------------------------

fn run_daemon(verbose: bool, agent_cmd: String, agent_args: Vec<String>) -> anyhow::Result<()> {
    init_logging(verbose)?;

    let launcher = Arc::new(CliAgentLauncher::new(agent_cmd, agent_args));
    let supervisor = Supervisor::new(paths::app_config_file(), launcher)
        .context("failed to load project registry")?;
    supervisor.start().context("failed to start workers")?;

    let server = anima_supervisor::server::spawn_control_server(
        paths::control_socket_path(),
        Arc::clone(&supervisor),
    )
    .context("failed to start control server")?;

    install_signal_handlers()?;
    tracing::info!("anima daemon running");

    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    tracing::info!("signal received, shutting down");
    supervisor.shutdown();
    let _ = server.join();
    Ok(())
}

/// Log to the app-level file; the core never writes to standard streams.
fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };

    let log_path = paths::app_log_file();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("open log file {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .init();
    Ok(())
}

fn install_signal_handlers() -> anyhow::Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // Safety: the handler only stores to an atomic flag.
    unsafe {
        sigaction(Signal::SIGINT, &action).context("install SIGINT handler")?;
        sigaction(Signal::SIGTERM, &action).context("install SIGTERM handler")?;
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------

fn connect() -> anyhow::Result<UnixStream> {
    let path = paths::control_socket_path();
    UnixStream::connect(&path)
        .with_context(|| format!("is the daemon running? (socket {})", path.display()))
}

fn send_command(command: ControlCommand) -> anyhow::Result<()> {
    let mut stream = connect()?;
    let mut json = serde_json::to_string(&command)?;
    json.push('\n');
    stream.write_all(json.as_bytes())?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        bail!("daemon closed the connection without a response");
    }

    // Re-render compact NDJSON as readable output.
    let value: serde_json::Value = serde_json::from_str(line.trim())?;
    println!("{}", serde_json::to_string_pretty(&value)?);

    if value.get("status").and_then(|s| s.as_str()) == Some("error") {
        std::process::exit(1);
    }
    Ok(())
}

fn stream_events(project_id: Option<String>) -> anyhow::Result<()> {
    let mut stream = connect()?;
    let command = ControlCommand::SubscribeEvents { project_id };
    let mut json = serde_json::to_string(&command)?;
    json.push('\n');
    stream.write_all(json.as_bytes())?;

    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        println!("{line}");
    }
    Ok(())
}
