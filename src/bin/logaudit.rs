//! logaudit CLI: operator interface to the task store.

use chrono::Utc;
use clap::{Parser, Subcommand};
use logaudit::config::Config;
use logaudit::config::secrets::ExposeSecret;
use logaudit::db::Db;
use logaudit::model::task::{Completion, Failure, NewTask, TaskRecord};
use logaudit::store::{BatchReport, TaskStore};
use logaudit::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "logaudit", about = "Log audit task store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending database migrations
    Migrate,
    /// Enqueue a new task
    Submit {
        /// Submitting organization
        org: String,
        /// Raw log content (hashed with SHA-256)
        #[arg(long, conflicts_with = "hash", required_unless_present = "hash")]
        content: Option<String>,
        /// Precomputed log hash
        #[arg(long)]
        hash: Option<String>,
        /// Request ID (defaults to a fresh UUID)
        #[arg(long)]
        request_id: Option<String>,
    },
    /// Claim RECEIVED tasks for processing
    Claim {
        /// Candidate request IDs
        #[arg(required = true)]
        ids: Vec<String>,
        /// Retry ceiling (defaults to MAX_RETRIES)
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Mark a PROCESSING task as anchored
    Complete {
        request_id: String,
        tx_hash: String,
        block_height: u64,
        log_hash_on_chain: String,
    },
    /// Mark a PROCESSING task as permanently failed
    Fail { request_id: String, message: String },
    /// Return PROCESSING tasks to the queue
    Retry {
        #[arg(required = true)]
        ids: Vec<String>,
        /// Last error to record
        #[arg(long)]
        error: String,
    },
    /// Show a task by request ID
    Show { request_id: String },
    /// Show the task with the given log hash
    Find { log_hash: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;

    let db = Db::connect(config.database_url.expose_secret(), config.store_options()).await?;

    let result = run(&db, &config, cli.command).await;
    db.close().await;
    result
}

async fn run(db: &Db, config: &Config, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Migrate => {
            db.migrate().await?;
            println!("Migrations applied.");
        }
        Command::Submit {
            org,
            content,
            hash,
            request_id,
        } => {
            let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let task = match (content, hash) {
                (Some(content), _) => NewTask::from_content(&request_id, &org, &content, Utc::now()),
                (None, Some(hash)) => NewTask::new(&request_id, hash, &org, Utc::now()),
                (None, None) => anyhow::bail!("either --content or --hash is required"),
            };
            let report = db.insert(vec![task]).await?;
            if report.affected == 1 {
                println!("Submitted: {request_id}");
            } else {
                println!("Already present: {request_id}");
            }
        }
        Command::Claim { ids, max_retries } => {
            let max_retries = max_retries.unwrap_or(config.max_retries);
            let claimed = db.claim(&ids, max_retries).await?;
            if claimed.is_empty() {
                println!("Nothing claimable.");
            }
            let mut ids: Vec<_> = claimed.keys().collect();
            ids.sort();
            for id in ids {
                println!("Claimed: {id} (retries: {})", claimed[id].retry_count);
            }
        }
        Command::Complete {
            request_id,
            tx_hash,
            block_height,
            log_hash_on_chain,
        } => {
            let report = db
                .complete(vec![Completion {
                    request_id,
                    tx_hash,
                    log_hash_on_chain,
                    block_height,
                }])
                .await?;
            print_report("Completed", report);
        }
        Command::Fail {
            request_id,
            message,
        } => {
            let report = db.fail(vec![Failure::new(request_id, message)]).await?;
            print_report("Failed", report);
        }
        Command::Retry { ids, error } => {
            let report = db.retry(&ids, &error).await?;
            print_report("Requeued", report);
        }
        Command::Show { request_id } => print_task(&db.get_by_id(&request_id).await?),
        Command::Find { log_hash } => print_task(&db.get_by_hash(&log_hash).await?),
    }
    Ok(())
}

fn print_report(verb: &str, report: BatchReport) {
    println!("{verb}: {} of {}", report.affected, report.requested);
}

fn print_task(task: &TaskRecord) {
    let or_dash = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());

    println!("Request ID:  {}", task.request_id);
    println!("Log Hash:    {}", task.log_hash);
    println!("Org:         {}", task.source_org_id);
    println!("Status:      {}", task.status);
    println!("Retries:     {}", task.retry_count);
    println!("Received:    {}", task.received_timestamp);
    println!("Stored:      {}", task.received_at_db);
    println!(
        "Started:     {}",
        or_dash(task.processing_started_at.map(|t| t.to_string()))
    );
    println!(
        "Finished:    {}",
        or_dash(task.processing_finished_at.map(|t| t.to_string()))
    );
    if let Some(ref tx) = task.tx_hash {
        println!("---");
        println!("Tx Hash:     {tx}");
        println!(
            "Block:       {}",
            or_dash(task.block_height.map(|h| h.to_string()))
        );
        println!("Chain Hash:  {}", or_dash(task.log_hash_on_chain.clone()));
    }
    if let Some(ref err) = task.error_message {
        println!("Error:       {err}");
    }
}
