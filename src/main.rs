use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Use the library instead of redeclaring modules
use labour_queue::{
    config::Config,
    database::Database,
    job_scheduling::{
        workers::register_builtin, AddOptions, AdvisoryLock, CommandSpawner, JobExecutor,
        JobQueue, JobQueueRunner, JobScheduler, WorkerRegistry, EXIT_OUTCOME_NOT_RECORDED,
    },
    models::Rule,
    repositories::{FlagRepository, LabourRepository, LockRepository},
};

#[derive(Parser)]
#[command(name = "labour-queue")]
#[command(version)]
#[command(about = "A persistent priority job queue with process-isolated workers")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "labour-queue.toml")]
    config: String,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, global = true, value_name = "URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatch supervisor
    Server(ServerArgs),

    /// Execute one deployed labour (spawned by the supervisor)
    Labour {
        /// Labour id
        id: i64,
    },

    /// Enqueue a labour
    Add(AddArgs),

    /// Print the number of labours per status
    Stats,
}

#[derive(Args)]
struct ServerArgs {
    /// Maximum number of concurrent worker processes
    #[arg(long)]
    threads: Option<usize>,

    /// Poll interval in seconds
    #[arg(long, value_name = "SECONDS")]
    poll: Option<u64>,

    /// Recurring planning horizon in minutes
    #[arg(long, value_name = "MINUTES")]
    plan_ahead: Option<u32>,

    /// Minutes between candidate recurring ticks
    #[arg(long, value_name = "MINUTES")]
    resolution: Option<u32>,
}

#[derive(Args)]
struct AddArgs {
    /// Worker code
    worker: String,

    /// JSON payload
    #[arg(long, default_value = "{}")]
    payload: String,

    #[arg(long)]
    identity: Option<String>,

    #[arg(long)]
    priority: Option<i64>,

    /// Delay in seconds
    #[arg(long, value_name = "SECONDS")]
    delay: Option<i64>,

    /// run, wait, batch, ignore or replace
    #[arg(long)]
    rule: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging with specified level
    let log_filter = format!("labour_queue={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Worker processes inherit both through the environment
    std::env::set_var("LABOUR_QUEUE_CONFIG", &cli.config);
    if let Some(database_url) = &cli.database_url {
        std::env::set_var("LABOUR_QUEUE__DATABASE__URL", database_url);
    }
    let mut config = Config::load()?;

    match cli.command {
        Command::Server(args) => {
            apply_server_args(&mut config, &args)?;
            run_server(config, &cli.config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Labour { id } => Ok(run_labour(config, id).await),
        Command::Add(args) => {
            run_add(config, args).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Stats => {
            run_stats(config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn apply_server_args(config: &mut Config, args: &ServerArgs) -> Result<()> {
    if let Some(threads) = args.threads {
        config.server.threads = threads;
    }
    if let Some(poll) = args.poll {
        config.server.poll_interval = Duration::from_secs(poll);
    }
    if let Some(plan_ahead) = args.plan_ahead {
        config.server.plan_ahead_minutes = plan_ahead;
    }
    if let Some(resolution) = args.resolution {
        config.server.resolution_minutes = resolution;
    }
    config.server.validate()
}

async fn open_database(config: &Config) -> Result<Database> {
    info!("Using database: {}", config.database.url);
    let database = Database::new(&config.database).await?;
    database.migrate().await?;
    Ok(database)
}

fn build_registry(config: &Config) -> Result<Arc<WorkerRegistry>> {
    let mut registry = WorkerRegistry::new(config);
    register_builtin(&mut registry)?;
    registry.warn_unregistered_sections();
    Ok(Arc::new(registry))
}

async fn run_server(config: Config, config_file: &str) -> Result<()> {
    info!("Starting labour-queue supervisor v{}", env!("CARGO_PKG_VERSION"));

    let database = open_database(&config).await?;
    let registry = build_registry(&config)?;
    let labours = LabourRepository::new(database.pool());

    let job_queue = Arc::new(JobQueue::new(
        labours.clone(),
        Arc::clone(&registry),
        &config.server,
    ));
    let job_executor = Arc::new(JobExecutor::new(labours.clone(), registry));
    let job_scheduler = Arc::new(JobScheduler::new(
        Arc::clone(&job_queue),
        labours,
        FlagRepository::new(database.pool()),
        config.server.plan_ahead_minutes,
        config.server.resolution_minutes,
    ));
    let spawner = CommandSpawner::current_exe(Some(PathBuf::from(config_file)))
        .context("Failed to locate the labour-queue executable")?;
    let lock = AdvisoryLock::new(
        LockRepository::new(database.pool()),
        &config.server.lock_name,
        config.server.lock_ttl,
    );

    let mut runner = JobQueueRunner::new(
        job_queue,
        job_executor,
        job_scheduler,
        Arc::new(spawner),
        lock,
        &config.server,
    );

    let cancellation_token = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancellation_token.clone()));

    runner.run(cancellation_token).await?;
    Ok(())
}

async fn shutdown_signal(cancellation_token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), shutting down gracefully");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            return;
        }
        info!("Received Ctrl+C, shutting down gracefully");
    }

    cancellation_token.cancel();
}

/// Exits 0 once an outcome is recorded, `EXIT_OUTCOME_NOT_RECORDED` otherwise
async fn run_labour(config: Config, id: i64) -> ExitCode {
    let result = async {
        let database = open_database(&config).await?;
        let registry = build_registry(&config)?;
        let executor = JobExecutor::new(LabourRepository::new(database.pool()), registry);
        let labour = executor.execute(id, Some(std::process::id())).await?;
        anyhow::Ok(labour)
    }
    .await;

    match result {
        Ok(labour) => {
            info!("Labour {} ({}) ended {}", labour.id, labour.worker, labour.status);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Labour {} could not record an outcome: {:#}", id, e);
            ExitCode::from(EXIT_OUTCOME_NOT_RECORDED as u8)
        }
    }
}

async fn run_add(config: Config, args: AddArgs) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("--payload must be valid JSON")?;

    let mut options = AddOptions::new();
    options.identity = args.identity;
    options.priority = args.priority;
    options.delay = args.delay;
    options.rule = args.rule.as_deref().map(str::parse::<Rule>).transpose()?;

    let database = open_database(&config).await?;
    let registry = build_registry(&config)?;
    let queue = JobQueue::new(LabourRepository::new(database.pool()), registry, &config.server);

    match queue.add(&args.worker, payload, options).await? {
        Some(labour) => println!(
            "{} {} {}",
            labour.id,
            labour.status,
            labour.execute_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => println!("ignored: a pending labour with the same identity exists"),
    }
    Ok(())
}

async fn run_stats(config: Config) -> Result<()> {
    let database = open_database(&config).await?;
    let counts = LabourRepository::new(database.pool())
        .count_by_status()
        .await?;
    for (status, count) in counts {
        println!("{:<10} {}", status.as_str(), count);
    }
    Ok(())
}
