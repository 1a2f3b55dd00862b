use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tw_engine::{
    load_seed_file, AlertLifecycle, EngineConfig, HeuristicDeduplicator, ScanOrchestrator,
    Scheduler, StaticTierResolver, WatchService,
};
use tw_storage::{LeaseManager, MemoryLeases, MemoryStore, MonitorStore, PgStore, WatchStore};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "tw-cli")]
#[command(about = "ThreatWatch continuous monitoring engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted.
    Run,
    /// Dispatch due monitors once and wait for their scans.
    Tick,
    /// Scan one monitor now, outside the schedule.
    Scan { monitor_id: Uuid },
    /// Apply retention to alerts and scan history.
    Cleanup,
    /// Summarise the last 24 hours of scans.
    Stats,
    /// Apply database migrations.
    Migrate,
    /// Create monitors from a YAML file.
    Seed { path: PathBuf },
}

struct Engine {
    store: Arc<dyn WatchStore>,
    scheduler: Scheduler,
    service: WatchService,
}

async fn open_store(config: &EngineConfig) -> Result<(Arc<dyn WatchStore>, Arc<dyn LeaseManager>)> {
    match &config.database_url {
        Some(url) => {
            let pg = Arc::new(
                PgStore::connect(url, (config.worker_pool as u32).saturating_add(4))
                    .await
                    .context("connecting to postgres")?,
            );
            pg.migrate().await?;
            let store: Arc<dyn WatchStore> = pg.clone();
            let leases: Arc<dyn LeaseManager> = pg;
            Ok((store, leases))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store, state is lost on exit");
            let store: Arc<dyn WatchStore> = Arc::new(MemoryStore::new());
            let leases: Arc<dyn LeaseManager> = Arc::new(MemoryLeases::new());
            Ok((store, leases))
        }
    }
}

async fn build_engine(config: &EngineConfig) -> Result<Engine> {
    let (store, leases) = open_store(config).await?;
    let (search, analysis) = config.build_collaborators()?;
    info!(
        search = search.name(),
        analysis = analysis.name(),
        "collaborators ready"
    );
    let orchestrator = Arc::new(ScanOrchestrator::new(
        store.clone(),
        search,
        analysis,
        Arc::new(HeuristicDeduplicator::new(config.dedup_config())),
        config.scan_settings(),
    )
    .with_rates(config.cost_rates));
    let lifecycle = Arc::new(AlertLifecycle::new(
        store.clone(),
        Arc::new(StaticTierResolver::new(config.default_tier)),
    ));
    let scheduler = Scheduler::new(
        store.clone(),
        leases.clone(),
        orchestrator.clone(),
        lifecycle.clone(),
        config.scheduler_settings(),
    );
    let service = WatchService::new(store.clone(), leases, orchestrator, lifecycle, config.lease_ttl);
    Ok(Engine {
        store,
        scheduler,
        service,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut filter = EnvFilter::from_default_env();
    for directive in ["tw_cli=info", "tw_engine=info", "tw_adapters=info", "tw_storage=info"] {
        filter = filter.add_directive(directive.parse()?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Migrate => {
            let Some(url) = &config.database_url else {
                bail!("DATABASE_URL must be set to migrate");
            };
            PgStore::connect(url, 1).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Run => start(&config).await?.scheduler.run().await?,
        Commands::Tick => {
            let engine = start(&config).await?;
            let summary = engine.scheduler.tick(Utc::now()).await?;
            engine.scheduler.wait_idle().await;
            println!(
                "tick complete: due={} dispatched={} skipped={} deferred={} failed={}",
                summary.due,
                summary.dispatched,
                summary.skipped_in_flight,
                summary.deferred_pool_full,
                summary.dispatch_failures
            );
        }
        Commands::Scan { monitor_id } => {
            let engine = start(&config).await?;
            let Some(monitor) = engine.store.get_monitor(monitor_id).await? else {
                bail!("monitor {monitor_id} not found");
            };
            let report = engine
                .service
                .trigger_manual_scan(&monitor.owner_id, monitor_id)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report.record)?);
        }
        Commands::Cleanup => {
            let report = start(&config).await?.scheduler.cleanup(Utc::now()).await?;
            println!(
                "cleanup complete: owners={} alerts_deleted={} scan_records_deleted={} failures={}",
                report.owners_checked,
                report.alerts_deleted,
                report.scan_records_deleted,
                report.owners_failed
            );
        }
        Commands::Stats => {
            let stats = start(&config)
                .await?
                .scheduler
                .refresh_statistics(Utc::now())
                .await?;
            println!(
                "last 24h: scans={} successful={} success_rate={:.2} avg_duration_secs={:.2} cost=${:.4} alerts={}",
                stats.total_scans,
                stats.successful_scans,
                stats.success_rate,
                stats.average_duration_secs,
                stats.total_cost,
                stats.alerts_generated
            );
        }
        Commands::Seed { path } => {
            let engine = start(&config).await?;
            let seed = load_seed_file(&path).await?;
            for entry in seed.monitors {
                let monitor = engine
                    .service
                    .create_monitor(&entry.owner_id, entry.settings)
                    .await?;
                println!("created monitor {} ({}) for {}", monitor.id, monitor.term, monitor.owner_id);
            }
        }
    }

    Ok(())
}

/// Validate configuration and wire the engine; every command except `migrate` needs it.
async fn start(config: &EngineConfig) -> Result<Engine> {
    config.validate()?;
    build_engine(config).await
}
