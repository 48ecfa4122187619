use clap::{Parser, Subcommand};
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wf_config::Config;
use wf_core::telemetry;
use wf_cron::{CronEngine, CronSyncer, ScheduleSource};
use wf_db::{
    ApprovalRepository, CronScheduleRepository, Db, ExecutionRepository, FlowRepository,
    NodeRepository, SecretRepository,
};
use wf_exec::{
    DbSecretsProvider, ExecutorRegistry, FlowExecutionHandler, FlowHandlerSettings,
    PgApprovalGate, PgExecutionStore, PgNodeDirectory, PlainKeeper, ScriptExecutor,
};
use wf_flow::FlowRegistry;
use wf_logstream::{LogManager, LogManagerConfig};
use wf_notify::{LogMessenger, MessengerRegistry, NotificationHandler};
use wf_sched::{CancellationBus, Scheduler, SchedulerSettings};
use wf_store::{JobNotifications, PayloadType, PgJobStore};

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "weft workflow execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine (default)
    Start,
    /// Parse and validate every flow file, then exit
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env = std::env::var("WEFT_ENV").unwrap_or_else(|_| "development".to_string());
    telemetry::init_tracing(&env, "weft");

    let config = match Config::load() {
        Ok(config) => {
            tracing::debug!(?config, "Configuration loaded successfully");
            config
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Validate => validate_flows(&config),
        Commands::Start => {
            tracing::info!("weft starting");
            if let Err(e) = start(config).await {
                tracing::error!("Engine failed: {}", e);
                process::exit(1);
            }
        }
    }
}

/// Strict pass over the flow directory: any broken file fails the command
fn validate_flows(config: &Config) {
    let executors = default_executors();
    let known = executors.names();

    match wf_flow::registry::load_directory(std::path::Path::new(&config.flows.directory), &known)
    {
        Ok((loaded, failures)) => {
            for flow in &loaded {
                println!("ok   {} ({})", flow.flow.slug(), flow.path.display());
            }
            for (path, error) in &failures {
                eprintln!("FAIL {}: {}", path.display(), error);
            }
            println!("{} flows valid, {} broken", loaded.len(), failures.len());
            if !failures.is_empty() {
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Cannot read flow directory: {}", e);
            process::exit(1);
        }
    }
}

fn default_executors() -> ExecutorRegistry {
    let mut executors = ExecutorRegistry::new();
    executors.register(Arc::new(ScriptExecutor::new()));
    executors
}

async fn start(config: Config) -> wf_core::Result<()> {
    // Fatal on an unreachable database: nothing works without it.
    let db = Db::new(
        &config.database.url,
        config.database.pool_size,
        std::time::Duration::from_secs(config.database.acquire_timeout_seconds),
    )
    .await?;
    db.health_check().await?;
    tracing::info!("Database ready");

    let store = Arc::new(PgJobStore::new(db.pool().clone()));
    let notifications = JobNotifications::start(db.pool()).await?;

    let log_manager = LogManager::new(LogManagerConfig {
        directory: config.logger.directory.clone().into(),
        max_size_bytes: config.logger.max_size_bytes(),
        flush_interval: config.logger.flush_interval(),
        retention: config.logger.retention_time(),
        scan_interval: config.logger.scan_interval(),
    })?;

    let executors = Arc::new(default_executors());
    let registry = Arc::new(FlowRegistry::new(
        &config.flows.directory,
        executors.names(),
        FlowRepository::new(db.pool().clone()),
    ));
    let report = registry.rebuild().await?;
    tracing::info!(
        loaded = report.loaded,
        skipped = report.skipped,
        "Flow registry ready"
    );

    if config.keystore.keeper_url.is_none() {
        tracing::warn!("No keeper configured; secrets are stored as plaintext");
    }

    let bus = CancellationBus::new();
    let flow_handler = Arc::new(FlowExecutionHandler::new(
        registry.clone(),
        Arc::new(PgExecutionStore::new(ExecutionRepository::new(
            db.pool().clone(),
        ))),
        Arc::new(PgApprovalGate::new(ApprovalRepository::new(
            db.pool().clone(),
        ))),
        Arc::new(PgNodeDirectory::new(NodeRepository::new(db.pool().clone()))),
        Arc::new(DbSecretsProvider::new(
            SecretRepository::new(db.pool().clone()),
            Arc::new(PlainKeeper),
        )),
        executors,
        log_manager.clone(),
        store.clone(),
        bus.clone(),
        FlowHandlerSettings {
            execution_timeout: config.scheduler.flow_execution_timeout(),
            max_action_retries: config.scheduler.max_action_retries,
            action_backoff: config.scheduler.action_backoff(),
            max_concurrency_per_action: None,
            notifications: Vec::new(),
        },
    ));

    let mut messengers = MessengerRegistry::new();
    messengers.register(Arc::new(LogMessenger::new("log")));
    let notification_handler = Arc::new(NotificationHandler::new(Arc::new(messengers)));

    let mut queues = Vec::with_capacity(config.scheduler.queues.len());
    for queue in &config.scheduler.queues {
        queues.push((PayloadType::parse(&queue.payload_type)?, queue.weight));
    }

    let scheduler = Scheduler::builder(store.clone())
        .settings(SchedulerSettings {
            worker_count: config.scheduler.worker_count,
            lease_ttl: config.scheduler.lease_ttl(),
            poll_interval: config.scheduler.poll_interval(),
            reclaim_interval: config.scheduler.reclaim_interval(),
            job_retention: std::time::Duration::from_secs(
                config.scheduler.job_retention_days as u64 * 24 * 3600,
            ),
            queues,
        })
        .notifications(notifications)
        .cancellation_bus(bus)
        .handler(flow_handler)
        .handler(notification_handler)
        .build();

    let shutdown = CancellationToken::new();

    let cron_engine = Arc::new(CronEngine::new(store.clone()));
    tokio::spawn(Arc::clone(&cron_engine).run(shutdown.child_token()));

    let schedule_source: Arc<dyn ScheduleSource> = registry.clone();
    let syncer = CronSyncer::new(
        cron_engine,
        schedule_source,
        CronScheduleRepository::new(db.pool().clone()),
        config.scheduler.cron_sync_interval(),
    );
    // One synchronous pass so declared schedules are live before traffic.
    if let Err(e) = syncer.sync_now().await {
        tracing::error!(error = %e, "Initial cron sync failed");
    }
    tokio::spawn(syncer.run(shutdown.child_token()));

    log_manager.start_retention(shutdown.child_token());

    scheduler.start().await;
    tracing::info!("weft ready");

    tokio::signal::ctrl_c()
        .await
        .map_err(wf_core::Error::Io)?;
    tracing::info!("Shutdown signal received");

    shutdown.cancel();
    scheduler.shutdown(config.scheduler.shutdown_grace()).await;
    tracing::info!("weft stopped");
    Ok(())
}
