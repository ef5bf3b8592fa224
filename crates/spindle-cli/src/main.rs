use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use spindle_core::app::{GcLoop, HandlerError, ReaperLoop, TaskHandler, WorkerGroup};
use spindle_core::domain::{TaskRecord, TaskStatus, WorkerTag};
use spindle_core::impls::InMemoryTaskStore;
use spindle_core::ports::Filter;
use spindle_core::queue::{DEFAULT_MAX_RETRIES, HealReport};
use spindle_core::{DiscardStrategy, QueueConfig, TaskQueue};
use spindle_mongo::{DEFAULT_URI, MongoArgs, open_queue};

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Parser)]
#[command(name = "spindle", version, about = "Persistent task queue over MongoDB")]
struct Cli {
    #[command(flatten)]
    mongo: MongoOpts,

    #[command(flatten)]
    queue: QueueOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct MongoOpts {
    #[arg(long = "mongo-uri", env = "SPINDLE_MONGO_URI", default_value = DEFAULT_URI)]
    uri: String,

    #[arg(long, env = "SPINDLE_DATABASE", default_value = "spindle")]
    database: String,

    #[arg(long, env = "SPINDLE_COLLECTION", default_value = "tasks")]
    collection: String,
}

impl From<MongoOpts> for MongoArgs {
    fn from(opts: MongoOpts) -> Self {
        MongoArgs {
            uri: opts.uri,
            database: opts.database,
            collection: opts.collection,
        }
    }
}

#[derive(Debug, Args)]
struct QueueOpts {
    /// Defaults to consumer_<pid>.
    #[arg(long, env = "SPINDLE_WORKER_TAG")]
    worker_tag: Option<String>,

    /// Lease lifetime in seconds; -1 never expires.
    #[arg(long, env = "SPINDLE_TTL", default_value_t = -1, allow_negative_numbers = true)]
    ttl: i64,

    #[arg(long, env = "SPINDLE_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// keep | remove
    #[arg(long, env = "SPINDLE_DISCARD_STRATEGY", default_value_t = DiscardStrategy::Keep)]
    discard_strategy: DiscardStrategy,
}

impl QueueOpts {
    fn config(&self) -> CliResult<QueueConfig> {
        let mut builder = QueueConfig::builder()
            .ttl(self.ttl)
            .max_retries(self.max_retries)
            .discard_strategy(self.discard_strategy);
        if let Some(tag) = &self.worker_tag {
            builder = builder.worker_tag(WorkerTag::new(tag.as_str()));
        }
        Ok(builder.build()?)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Append a task. The payload is parsed as JSON, or taken as a plain string.
    Append {
        payload: String,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i64,
    },
    /// Claim up to COUNT tasks for this worker.
    Claim {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Remove and print the oldest completed task.
    Pop,
    /// Expire stale leases, then apply the discard strategy.
    Refresh {
        /// Sweep leases even when the ttl is -1; then every outstanding lease expires.
        #[arg(long)]
        force_expiry: bool,
    },
    /// Look for tasks in states the lifecycle cannot produce.
    Heal {
        /// Correct what is found instead of only listing it.
        #[arg(long)]
        apply: bool,
    },
    /// Task counts per status.
    Status,
    Head {
        #[arg(default_value_t = 10)]
        n: usize,
    },
    Tail {
        #[arg(default_value_t = 10)]
        n: usize,
    },
    /// Run workers and maintenance loops against an in-memory queue.
    Demo {
        #[arg(long, default_value_t = 20)]
        tasks: u64,
        #[arg(long, default_value_t = 3)]
        workers: usize,
        /// Every task whose number is a multiple of this always fails.
        #[arg(long, default_value_t = 7)]
        fail_every: u64,
    },
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[derive(Serialize)]
struct HealSummary<'a> {
    anomaly: &'a str,
    found: Vec<&'a str>,
    modified: Option<u64>,
}

fn summarize(reports: &[HealReport]) -> Vec<HealSummary<'_>> {
    reports
        .iter()
        .map(|r| HealSummary {
            anomaly: &r.anomaly,
            found: r.found.iter().map(|t| t.id.as_str()).collect(),
            modified: r.modified,
        })
        .collect()
}

async fn run(cli: Cli) -> CliResult<()> {
    let config = cli.queue.config()?;
    match cli.command {
        Command::Demo {
            tasks,
            workers,
            fail_every,
        } => demo(config, tasks, workers, fail_every).await,
        command => {
            let queue = open_queue(&cli.mongo.into(), config).await?;
            operate(&queue, command).await
        }
    }
}

async fn operate(queue: &TaskQueue, command: Command) -> CliResult<()> {
    match command {
        Command::Append { payload, priority } => {
            let id = queue.append(parse_payload(&payload), priority).await?;
            println!("{id}");
        }
        Command::Claim { count } => {
            let batch = queue.claim_many(count).await?;
            if let Some(shortfall) = batch.shortfall() {
                warn!(error = %shortfall, "Claimed fewer tasks than requested");
            }
            print_json(&batch.into_tasks())?;
        }
        Command::Pop => match queue.pop().await? {
            Some(task) => print_json(&task)?,
            None => info!("No completed task to pop"),
        },
        Command::Refresh { force_expiry } => {
            if force_expiry {
                let expired = queue.sweep_expired(true).await?;
                info!(expired, "Forced expiry");
            }
            print_json(&queue.refresh().await?)?;
        }
        Command::Heal { apply } => {
            let reports = queue.detect(!apply).await?;
            print_json(&summarize(&reports))?;
        }
        Command::Status => print_json(&queue.status_counts().await?)?,
        Command::Head { n } => print_json(&queue.head(n).await?)?,
        Command::Tail { n } => print_json(&queue.tail(n).await?)?,
        Command::Demo { .. } => return Err("demo runs on its own in-memory queue".into()),
    }
    Ok(())
}

/// Fails tasks whose numeric payload is a multiple of `fail_every`.
struct DemoHandler {
    fail_every: u64,
}

#[async_trait]
impl TaskHandler for DemoHandler {
    async fn handle(&self, task: &TaskRecord) -> Result<(), HandlerError> {
        let n = task.payload.as_u64().ok_or("payload is not a number")?;
        tokio::time::sleep(Duration::from_millis(5)).await;
        if self.fail_every > 0 && n % self.fail_every == 0 {
            return Err(format!("task {n} always fails").into());
        }
        Ok(())
    }
}

async fn demo(config: QueueConfig, tasks: u64, workers: usize, fail_every: u64) -> CliResult<()> {
    let queue = TaskQueue::new(Arc::new(InMemoryTaskStore::new()), config);
    for n in 1..=tasks {
        queue.append(Value::from(n), (n % 3) as i64).await?;
    }
    info!(tasks, workers, "Demo queue filled");

    let tags = (0..workers).map(|i| WorkerTag::new(format!("demo-{i}")));
    let handler = Arc::new(DemoHandler { fail_every });
    let group = WorkerGroup::spawn(&queue, tags, handler, Duration::from_millis(20))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = ReaperLoop::new(queue.clone(), Duration::from_millis(200));
    let reaper = tokio::spawn(reaper.run(shutdown_rx.clone()));
    let gc = tokio::spawn(GcLoop::new(queue.clone(), Duration::from_millis(200)).run(shutdown_rx));

    let claimable = queue.discard_policy().claimable();
    let in_flight = Filter::Status(TaskStatus::Pending);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                let store = queue.store();
                if store.count(&claimable).await? == 0 && store.count(&in_flight).await? == 0 {
                    break;
                }
            }
        }
    }

    let stats = group.shutdown_and_join().await?;
    // receivers may already be gone
    let _ = shutdown_tx.send(true);
    let reclaimed = reaper.await?;
    let deleted = gc.await?;

    info!(
        claimed = stats.claimed,
        succeeded = stats.succeeded,
        failed = stats.failed,
        reclaimed,
        deleted,
        "Demo finished"
    );
    print_json(&queue.status_counts().await?)?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "spindle failed");
            ExitCode::FAILURE
        }
    }
}
