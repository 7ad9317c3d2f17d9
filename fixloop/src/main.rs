//! Automated review → fix loop for coding agents.
//!
//! `fixloop run` drives a reviewer and a fixer agent over the current
//! repository until the fixer reports nothing left to fix. The remaining
//! subcommands inspect session logs and locks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

use fixloop::cancel::CancelToken;
use fixloop::core::log_entry::{CycleStatus, LogEntry};
use fixloop::cycle::{CycleRequest, Engine};
use fixloop::exit_codes;
use fixloop::io::agent::{AgentKind, ProcessAgentRunner};
use fixloop::io::checkpoint::GitCheckpoints;
use fixloop::io::config::{FixloopConfig, RoleConfig, default_config_path, load_config};
use fixloop::io::git::Git;
use fixloop::io::lockfile::{LockHeld, list_all_active_sessions};
use fixloop::io::prompt::TemplatePrompts;
use fixloop::io::session_log::{
    SessionLogs, compute_session_stats, latest_session, read_log_incremental,
};
use fixloop::logging;

const FOLLOW_POLL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(
    name = "fixloop",
    version,
    about = "Automated review → fix loop for coding agents"
)]
struct Cli {
    /// Config file (defaults to `~/.fixloop/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log progress at `info` level unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Review and fix the repository until clean or out of iterations.
    Run {
        /// Repository to work on (defaults to the current directory).
        #[arg(long)]
        project: Option<PathBuf>,
        /// Human-readable session name (defaults to the repository name).
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Keep iterating after the fixer reports nothing left to fix.
        #[arg(long)]
        force_max_iterations: bool,
        /// Do not take the per-project lock.
        #[arg(long)]
        no_lock: bool,
        /// Run the simplifier once before the first review.
        #[arg(long)]
        simplify: bool,
    },
    /// List sessions currently holding a project lock.
    Sessions,
    /// Print the summary of a session (latest for the project by default).
    Stats {
        log: Option<PathBuf>,
        /// Pick the latest session of this project instead of the current one.
        #[arg(long)]
        project: Option<PathBuf>,
    },
    /// Print session log entries as JSON lines.
    Log {
        path: PathBuf,
        /// Keep printing new entries until the session ends.
        #[arg(short, long)]
        follow: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            if err.downcast_ref::<LockHeld>().is_some() {
                std::process::exit(exit_codes::LOCKED);
            }
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = load_config(&config_path)?;
    match cli.command {
        Command::Run {
            project,
            name,
            max_iterations,
            force_max_iterations,
            no_lock,
            simplify,
        } => cmd_run(
            config,
            RunArgs {
                project,
                name,
                max_iterations,
                force_max_iterations,
                no_lock,
                simplify,
            },
        ),
        Command::Sessions => cmd_sessions(&config),
        Command::Stats { log, project } => cmd_stats(&config, log, project),
        Command::Log { path, follow } => cmd_log(&path, follow),
    }
}

struct RunArgs {
    project: Option<PathBuf>,
    name: Option<String>,
    max_iterations: Option<u32>,
    force_max_iterations: bool,
    no_lock: bool,
    simplify: bool,
}

fn cmd_run(mut config: FixloopConfig, args: RunArgs) -> Result<i32> {
    if let Some(max) = args.max_iterations {
        config.max_iterations = max;
    }
    if args.force_max_iterations {
        config.force_max_iterations = true;
    }
    if args.simplify && config.simplifier.is_none() {
        config.simplifier = Some(RoleConfig {
            agent: AgentKind::Claude,
            ..RoleConfig::default()
        });
    }
    config.validate()?;

    let start = match args.project {
        Some(path) => path,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let git = Git::new(&start);
    let project_path = git
        .toplevel()
        .with_context(|| format!("{} is not inside a git repository", start.display()))?;
    let branch = Git::new(&project_path).branch_name()?;
    let session_name = args.name.unwrap_or_else(|| {
        project_path
            .file_name()
            .map_or_else(|| "fixloop".to_string(), |n| n.to_string_lossy().into_owned())
    });
    let logs_dir = config.resolved_logs_dir()?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("interrupt received; stopping after the current agent finishes");
        handler_token.cancel();
    })
    .context("install Ctrl-C handler")?;

    let runner = ProcessAgentRunner::from_config(&project_path, &config);
    let prompts = TemplatePrompts::new(project_path.display().to_string(), branch.clone());
    let logs = SessionLogs::new();
    let request = CycleRequest {
        project_path,
        branch,
        session_name,
        logs_dir,
        config,
        use_lock: !args.no_lock,
    };
    let outcome = Engine::new(&runner, &GitCheckpoints, &prompts, &logs).run(&request, &cancel)?;
    if let Err(e) = logs.close(&outcome.log_path) {
        warn!(err = %format!("{e:#}"), "failed to close session log");
    }

    if let Some(banner) = outcome.failure_banner() {
        eprintln!("{banner}");
    }
    println!(
        "{}: {} ({} iteration(s)) log: {}",
        outcome.status,
        outcome.reason,
        outcome.iterations,
        outcome.log_path.display()
    );
    Ok(match outcome.status {
        CycleStatus::Success => exit_codes::OK,
        CycleStatus::MaxIterations => exit_codes::MAX_ITERATIONS,
        CycleStatus::Failed => exit_codes::FAILED,
        CycleStatus::Interrupted => exit_codes::INTERRUPTED,
    })
}

fn cmd_sessions(config: &FixloopConfig) -> Result<i32> {
    let sessions = list_all_active_sessions(&config.resolved_logs_dir()?)?;
    if sessions.is_empty() {
        println!("no active sessions");
    }
    for lock in sessions {
        let agent = lock
            .current_agent
            .map_or_else(|| "-".to_string(), |role| role.to_string());
        let iteration = lock
            .iteration
            .map_or_else(|| "-".to_string(), |i| i.to_string());
        println!(
            "{}  {:?}  pid {}  {}@{}  agent {}  iteration {}",
            lock.session_name,
            lock.status,
            lock.pid,
            lock.project_path,
            lock.branch,
            agent,
            iteration
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_stats(config: &FixloopConfig, log: Option<PathBuf>, project: Option<PathBuf>) -> Result<i32> {
    let path = match log {
        Some(path) => path,
        None => {
            let start = match project {
                Some(path) => path,
                None => std::env::current_dir().context("resolve current directory")?,
            };
            let project_path = Git::new(&start).toplevel()?;
            let project = project_path.display().to_string();
            latest_session(&config.resolved_logs_dir()?, Some(&project))?
                .ok_or_else(|| anyhow!("no sessions recorded for {project}"))?
        }
    };
    let summary = compute_session_stats(&path)?;
    print_json(&summary)?;
    Ok(exit_codes::OK)
}

fn cmd_log(path: &Path, follow: bool) -> Result<i32> {
    let mut cursor = None;
    loop {
        let read = read_log_incremental(path, cursor.as_ref())?;
        if read.reset && cursor.is_some() {
            warn!(path = %path.display(), "log was rewritten; printing from the start");
        }
        let mut ended = false;
        for entry in &read.entries {
            ended |= matches!(entry, LogEntry::SessionEnd(_));
            println!("{}", serde_json::to_string(entry).context("serialize entry")?);
        }
        cursor = Some(read.cursor);
        if !follow || ended {
            return Ok(exit_codes::OK);
        }
        std::thread::sleep(FOLLOW_POLL);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_flags() {
        let cli = Cli::parse_from([
            "fixloop",
            "run",
            "--max-iterations",
            "3",
            "--force-max-iterations",
            "--no-lock",
        ]);
        match cli.command {
            Command::Run {
                max_iterations,
                force_max_iterations,
                no_lock,
                simplify,
                ..
            } => {
                assert_eq!(max_iterations, Some(3));
                assert!(force_max_iterations);
                assert!(no_lock);
                assert!(!simplify);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_log_follow_with_global_verbose() {
        let cli = Cli::parse_from(["fixloop", "log", "session.jsonl", "-f", "-v"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Log { follow: true, .. }));
    }
}
