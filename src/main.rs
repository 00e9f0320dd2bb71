use clap::{Args, Parser, Subcommand};
use std::process::ExitCode;
use strum::IntoEnumIterator;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use queuectl::{
    app_state::AppState,
    config::{AppConfig, ConfigKey, EngineSettings},
    models::job::JobState,
    models::submission::SubmitJobRequest,
    server,
    services::{queue::JobQueue, worker::WorkerPool},
};

#[derive(Debug, Parser)]
#[command(name = "queuectl", version, about = "Background job queue with retries and a dead-letter queue")]
struct Cli {
    /// Overrides QUEUECTL_DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Enqueue a job, e.g. queuectl enqueue '{"command":"echo hello","max_retries":2}'
    Enqueue { job_json: String },
    /// Manage workers
    #[command(subcommand)]
    Worker(WorkerCommand),
    /// Show job counts per state
    Status,
    /// Inspect live jobs
    #[command(subcommand)]
    Jobs(JobsCommand),
    /// Manage the dead-letter queue
    #[command(subcommand)]
    Dlq(DlqCommand),
    /// Manage persisted engine settings
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Serve the HTTP API
    Serve,
}

#[derive(Debug, Subcommand)]
enum WorkerCommand {
    /// Run worker loops until interrupted
    Start(StartArgs),
}

#[derive(Debug, Args)]
struct StartArgs {
    /// Number of workers to start
    #[arg(long, default_value_t = 1)]
    count: usize,
}

#[derive(Debug, Subcommand)]
enum JobsCommand {
    /// List jobs in one state
    List {
        #[arg(long, default_value = "pending")]
        state: String,
    },
    /// Show one job in full
    Show { job_id: String },
}

#[derive(Debug, Subcommand)]
enum DlqCommand {
    /// List DLQ entries
    List,
    /// Move a DLQ entry back to the queue
    Retry { job_id: String },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Store a setting
    Set { key: String, value: String },
    /// Show the stored value of a setting
    Get { key: String },
    /// Remove a stored setting
    Unset { key: String },
    /// Show every setting with its effective value
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Command::Worker(_) | Command::Serve => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::from_env()?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    let queue = JobQueue::connect(&config.database_url).await?;
    let base_settings = EngineSettings::from_config(&config);

    match cli.command {
        Command::Enqueue { job_json } => {
            let new_job = SubmitJobRequest::from_json(&job_json)?.into_new_job()?;
            let settings = queue.engine_settings(base_settings).await?;
            let job = queue.submit_new(new_job, settings.default_max_retries).await?;
            println!("Job {} enqueued", job.id);
        }
        Command::Worker(WorkerCommand::Start(args)) => {
            let settings = queue.engine_settings(base_settings).await?;
            let shutdown = CancellationToken::new();
            spawn_shutdown_listener(shutdown.clone());

            eprintln!("Starting {} worker(s)...", args.count);
            WorkerPool::new(queue, settings)
                .run(args.count.max(1), shutdown)
                .await;
        }
        Command::Status => {
            let summary = queue.summary().await?;
            println!("=== Queue Status ===");
            for (state, count) in &summary.states {
                println!("{:15}: {:5}", state.to_string(), count);
            }
            println!("{:15}: {:5}", "dlq", summary.dlq);
        }
        Command::Jobs(JobsCommand::List { state }) => {
            let state: JobState = state
                .parse()
                .map_err(|_| format!("unknown job state '{state}'"))?;
            let jobs = queue.list_by_state(state).await?;
            if jobs.is_empty() {
                println!("No jobs in state: {state}");
                return Ok(());
            }
            println!("=== {} jobs ({}) ===", state.as_ref().to_uppercase(), jobs.len());
            for job in jobs {
                println!(
                    "{:36} | {:50} | Attempts: {}/{}",
                    job.id, job.command, job.attempts, job.max_retries
                );
            }
        }
        Command::Jobs(JobsCommand::Show { job_id }) => {
            let job = queue
                .get_job(&job_id)
                .await?
                .ok_or_else(|| format!("Job {job_id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::Dlq(DlqCommand::List) => {
            let entries = queue.list_dlq().await?;
            if entries.is_empty() {
                println!("DLQ is empty");
                return Ok(());
            }
            println!("=== Dead Letter Queue ({} jobs) ===", entries.len());
            for entry in entries {
                println!("\n{}", entry.id);
                println!("  Command:  {}", entry.command);
                println!("  Attempts: {}/{}", entry.attempts, entry.max_retries);
                println!("  Moved at: {}", entry.moved_at.to_rfc3339());
                println!("  Reason:   {}", truncate(&entry.reason, 80));
            }
        }
        Command::Dlq(DlqCommand::Retry { job_id }) => {
            if queue.retry_from_dlq(&job_id).await? {
                println!("Job {job_id} moved back to queue for retry");
            } else {
                return Err(format!("Job {job_id} not found in DLQ").into());
            }
        }
        Command::Config(ConfigCommand::Set { key, value }) => {
            let key = queue.set_config(&key, &value).await?;
            println!("Config: {key} = {}", value.trim());
        }
        Command::Config(ConfigCommand::Get { key }) => match queue.get_config(&key).await? {
            Some(value) => println!("{key} = {value}"),
            None => println!("{key} is not set"),
        },
        Command::Config(ConfigCommand::Unset { key }) => {
            if queue.unset_config(&key).await? {
                println!("Config: {key} removed");
            } else {
                println!("{key} is not set");
            }
        }
        Command::Config(ConfigCommand::List) => {
            let effective = queue.engine_settings(base_settings).await?;
            for key in ConfigKey::iter() {
                println!("{:26} {}", key.to_string(), effective.value_of(key));
            }
        }
        Command::Serve => {
            let shutdown = CancellationToken::new();
            spawn_shutdown_listener(shutdown.clone());

            tracing::info!("Starting queuectl API on {}", config.bind_addr);
            let state = AppState::new(queue, base_settings);
            server::serve(state, &config.bind_addr, shutdown).await?;
        }
    }

    Ok(())
}

/// Cancel `token` on Ctrl-C. Workers finish their in-flight job before exiting.
fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nShutting down gracefully...");
            token.cancel();
        }
    });
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
