//! queuectl: command-line front end for the job queue.
//!
//! stdout carries results (ids, JSON); logs go to stderr.

use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod commands;
mod logging;

#[derive(Parser)]
#[command(name = "queuectl")]
#[command(about = "Persistent background job queue", long_about = None, version)]
struct Cli {
    /// Queue home directory (database, worker logs)
    #[arg(long, env = "QUEUECTL_HOME", global = true)]
    home: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a job: a JSON object with `command`, or a plain command line
    Enqueue {
        /// Job JSON or command
        job: String,
        /// Earliest run time (RFC 3339)
        #[arg(long)]
        run_at: Option<String>,
        /// Retry ceiling for this job
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Manage worker processes
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
    /// Job counts per state and live workers
    Status,
    /// List jobs
    List {
        /// Only jobs in this state
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value_t = queuectl_core::queue::DEFAULT_LIST_LIMIT)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Dead-letter queue
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
    /// Read or change configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// Spawn background workers
    Start {
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Sleep between empty polls (defaults to config `poll_interval_ms`)
        #[arg(long)]
        poll_interval: Option<u64>,
    },
    /// Ask all background workers to stop after their current job
    Stop,
    /// Run one worker in the foreground
    Run {
        #[arg(long, env = "QUEUECTL_POLL")]
        poll_interval: Option<u64>,
        /// Identity assigned by `worker start`
        #[arg(long, env = "QUEUECTL_WORKER_ID", hide = true)]
        worker_id: Option<String>,
    },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List dead jobs, most recent first
    List,
    /// Re-enqueue a dead job with a fresh retry budget
    Retry {
        /// Job ID
        id: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    Get { key: String },
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    logging::init();
    let cli = Cli::parse();
    let home = cli.home.unwrap_or_else(queuectl_core::config::queue_home);

    match cli.command {
        Commands::Enqueue {
            job,
            run_at,
            max_retries,
        } => commands::enqueue(&home, &job, run_at.as_deref(), max_retries).await,
        Commands::Worker { command } => match command {
            WorkerCommands::Start {
                count,
                poll_interval,
            } => commands::worker::start(&home, count, poll_interval).await,
            WorkerCommands::Stop => commands::worker::stop(&home).await,
            WorkerCommands::Run {
                poll_interval,
                worker_id,
            } => commands::worker::run(&home, poll_interval, worker_id).await,
        },
        Commands::Status => commands::status(&home).await,
        Commands::List {
            state,
            limit,
            offset,
        } => commands::list(&home, state.as_deref(), limit, offset).await,
        Commands::Dlq { command } => match command {
            DlqCommands::List => commands::dlq::list(&home).await,
            DlqCommands::Retry { id } => commands::dlq::retry(&home, &id).await,
        },
        Commands::Config { command } => match command {
            ConfigCommands::Get { key } => commands::config::get(&home, &key).await,
            ConfigCommands::Set { key, value } => commands::config::set(&home, &key, &value).await,
        },
    }
}
