//! `queuectl` command-line interface.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::info;

use queuectl::{DeadJob, Job, JobState, NewJob, Queue, Runner, dashboard};

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(about = "Durable background-job queue for shell commands")]
#[command(version)]
struct Args {
    /// Path to the queue database file
    #[arg(long, default_value = "queue.db", global = true)]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a job to the queue
    ///
    /// JOB is either a raw shell command or a JSON object such as
    /// '{"command": "echo hi", "priority": 5}'.
    Enqueue {
        /// Shell command line, or a JSON job description
        job: String,
        /// Claim-time priority, higher wins
        #[arg(long)]
        priority: Option<i64>,
        /// Per-attempt timeout in seconds
        #[arg(long)]
        timeout: Option<i64>,
        /// Seconds before the job first becomes eligible to run
        #[arg(long)]
        delay: Option<i64>,
        /// Retry ceiling before the job moves to the dead-letter queue
        #[arg(long)]
        max_retries: Option<i64>,
        /// Explicit job id (must be unique)
        #[arg(long)]
        id: Option<String>,
    },
    /// Worker pool operations
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
    /// Show state counts and config
    Status,
    /// List jobs
    List {
        /// Filter by state (pending, processing, completed, failed, dead)
        #[arg(long)]
        state: Option<String>,
        /// Maximum number of jobs to show
        #[arg(long, default_value = "50")]
        limit: i64,
    },
    /// Dead-letter queue operations
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
    /// Config management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show execution statistics
    Metrics,
    /// Start the read-only HTTP dashboard
    Dashboard {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,
    },
}

#[derive(Subcommand, Debug)]
enum WorkerAction {
    /// Run the worker pool until Ctrl-C
    Start {
        /// Number of concurrent workers
        #[arg(long, default_value = "1")]
        count: usize,
    },
}

#[derive(Subcommand, Debug)]
enum DlqAction {
    /// List dead-letter entries
    List {
        /// Maximum number of entries to show
        #[arg(long, default_value = "50")]
        limit: i64,
    },
    /// Re-queue a dead-letter entry as a fresh pending job
    Retry {
        /// Id of the dead-letter entry
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Read one config value
    Get {
        /// Config key
        key: String,
    },
    /// Write one config value
    Set {
        /// Config key
        key: String,
        /// New value
        value: String,
    },
    /// Show all config entries
    List,
}

async fn run(args: Args) -> anyhow::Result<()> {
    let queue = Queue::open(&args.db_path)
        .await
        .with_context(|| format!("failed to open queue database at {}", args.db_path.display()))?;

    match args.command {
        Command::Enqueue {
            job,
            priority,
            timeout,
            delay,
            max_retries,
            id,
        } => {
            let mut new = parse_new_job(&job)?;
            if let Some(priority) = priority {
                new = new.priority(priority);
            }
            if let Some(timeout) = timeout {
                new = new.timeout_seconds(timeout);
            }
            if let Some(delay) = delay {
                new = new.run_at(chrono::Utc::now() + chrono::Duration::seconds(delay));
            }
            if let Some(max_retries) = max_retries {
                new = new.max_retries(max_retries);
            }
            if let Some(id) = id {
                new = new.id(id);
            }

            let job = queue.enqueue(new).await?;
            println!("Enqueued job {}", job.id);
        }
        Command::Worker {
            action: WorkerAction::Start { count },
        } => {
            let handle = Runner::new(queue, count).start();
            info!(count, "Worker pool running. Press Ctrl-C to stop.");

            tokio::signal::ctrl_c().await?;
            info!("Shutting down, waiting for in-flight jobs…");
            handle.shutdown();
            handle.wait_for_shutdown().await;
        }
        Command::Status => {
            let stats = queue.stats().await?;
            println!("State counts:");
            println!("  pending     {}", stats.pending);
            println!("  processing  {}", stats.processing);
            println!("  completed   {}", stats.completed);
            println!("  failed      {}", stats.failed);
            println!("  dead        {}", stats.dead);

            let config = queue.all_config().await?;
            if !config.is_empty() {
                println!("Config:");
                for entry in config {
                    println!("  {} = {}", entry.key, entry.value);
                }
            }
        }
        Command::List { state, limit } => {
            let state = match state.as_deref() {
                Some(name) => match JobState::parse(name) {
                    Some(state) => Some(state),
                    None => bail!("unknown job state: {name}"),
                },
                None => None,
            };

            let jobs = queue.list(state, limit).await?;
            print_jobs(&jobs);
        }
        Command::Dlq { action } => match action {
            DlqAction::List { limit } => {
                let dead = queue.dead_jobs(limit).await?;
                print_dead_jobs(&dead);
            }
            DlqAction::Retry { id } => {
                let job = queue.retry_dead(&id).await?;
                println!("Re-queued job {}", job.id);
            }
        },
        Command::Config { action } => match action {
            ConfigAction::Get { key } => match queue.get_config(&key).await? {
                Some(value) => println!("{value}"),
                None => println!("(unset)"),
            },
            ConfigAction::Set { key, value } => {
                queue.set_config(&key, &value).await?;
                println!("{key} = {value}");
            }
            ConfigAction::List => {
                for entry in queue.all_config().await? {
                    println!("{} = {}", entry.key, entry.value);
                }
            }
        },
        Command::Metrics => {
            let metrics = queue.metrics().await?;
            println!("Completed jobs:     {}", metrics.total_completed);
            println!("Success rate:       {}%", metrics.success_rate);
            println!("Avg execution time: {:.1} ms", metrics.avg_execution_time_ms);
            println!("Dead-letter jobs:   {}", metrics.stats.dead);
        }
        Command::Dashboard { port } => {
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

            let server = tokio::spawn(dashboard::serve(addr, queue, shutdown_rx));
            println!("Dashboard running at http://{addr}. Press Ctrl-C to stop.");

            tokio::signal::ctrl_c().await?;
            let _ = shutdown_tx.send(());
            server.await??;
        }
    }

    Ok(())
}

/// Accept either a raw command line or a JSON job description.
fn parse_new_job(input: &str) -> anyhow::Result<NewJob> {
    if input.trim_start().starts_with('{') {
        serde_json::from_str(input).context("invalid job JSON")
    } else {
        Ok(NewJob::command(input))
    }
}

fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs.");
        return;
    }

    println!(
        "{:<36}  {:<10}  {:>4}  {:>8}  {:<19}  COMMAND",
        "ID", "STATE", "PRIO", "ATTEMPTS", "CREATED"
    );
    for job in jobs {
        println!(
            "{:<36}  {:<10}  {:>4}  {:>5}/{:<2}  {:<19}  {}",
            job.id,
            job.state,
            job.priority,
            job.attempts,
            job.max_retries,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            truncate(&job.command, 48),
        );
    }
}

fn print_dead_jobs(dead: &[DeadJob]) {
    if dead.is_empty() {
        println!("Dead-letter queue is empty.");
        return;
    }

    println!(
        "{:<36}  {:>8}  {:<19}  {:<32}  COMMAND",
        "ID", "ATTEMPTS", "FAILED", "ERROR"
    );
    for entry in dead {
        println!(
            "{:<36}  {:>5}/{:<2}  {:<19}  {:<32}  {}",
            entry.id,
            entry.attempts,
            entry.max_retries,
            entry.failed_at.format("%Y-%m-%d %H:%M:%S"),
            truncate(entry.error_message.as_deref().unwrap_or("-"), 32),
            truncate(&entry.command, 40),
        );
    }
}

fn truncate(text: &str, max: usize) -> String {
    let mut cleaned = text.replace(['\n', '\r'], " ");
    if cleaned.chars().count() > max {
        cleaned = cleaned.chars().take(max.saturating_sub(1)).collect();
        cleaned.push('…');
    }
    cleaned
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_level(true)
        .compact()
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
