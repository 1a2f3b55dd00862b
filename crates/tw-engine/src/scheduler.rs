use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use tw_core::ScanRecord;
use tw_storage::{Lease, LeaseManager, WatchStore};
use uuid::Uuid;

use crate::lifecycle::{AlertLifecycle, CleanupReport};
use crate::scan::ScanOrchestrator;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub worker_pool: usize,
    /// Must exceed the longest expected scan duration.
    pub lease_ttl: chrono::Duration,
    pub cleanup_cron: String,
    pub stats_cron: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(300),
            worker_pool: 4,
            lease_ttl: chrono::Duration::seconds(900),
            cleanup_cron: "0 0 2 * * *".to_string(),
            stats_cron: "0 0 * * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub due: usize,
    pub dispatched: usize,
    pub skipped_in_flight: usize,
    /// Due monitors left for a later tick because every worker was busy.
    pub deferred_pool_full: usize,
    pub dispatch_failures: usize,
}

/// Scan health over a trailing window.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanStatistics {
    pub window_start: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
    pub total_scans: u64,
    pub successful_scans: u64,
    pub success_rate: f64,
    pub average_duration_secs: f64,
    pub total_cost: f64,
    pub alerts_generated: u64,
}

impl ScanStatistics {
    pub fn from_records(
        records: &[ScanRecord],
        window_start: DateTime<Utc>,
        computed_at: DateTime<Utc>,
    ) -> Self {
        let total = records.len() as u64;
        let successful = records.iter().filter(|r| r.success).count() as u64;
        let duration: f64 = records.iter().map(|r| r.duration_secs).sum();
        let (success_rate, average_duration_secs) = if total == 0 {
            (0.0, 0.0)
        } else {
            (successful as f64 / total as f64, duration / total as f64)
        };
        Self {
            window_start,
            computed_at,
            total_scans: total,
            successful_scans: successful,
            success_rate,
            average_duration_secs,
            total_cost: records.iter().map(|r| r.api_costs.total_cost).sum(),
            alerts_generated: records.iter().map(|r| u64::from(r.alerts_generated)).sum(),
        }
    }
}

struct SchedulerInner {
    store: Arc<dyn WatchStore>,
    leases: Arc<dyn LeaseManager>,
    orchestrator: Arc<ScanOrchestrator>,
    lifecycle: Arc<AlertLifecycle>,
    settings: SchedulerSettings,
    holder: String,
    workers: Arc<Semaphore>,
    jobs: Mutex<JoinSet<()>>,
    latest_stats: RwLock<Option<ScanStatistics>>,
}

/// Periodic driver: dispatches due monitors onto a bounded worker pool and runs the
/// retention and statistics jobs on their own cron schedules.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn WatchStore>,
        leases: Arc<dyn LeaseManager>,
        orchestrator: Arc<ScanOrchestrator>,
        lifecycle: Arc<AlertLifecycle>,
        settings: SchedulerSettings,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(settings.worker_pool.max(1)));
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                leases,
                orchestrator,
                lifecycle,
                holder: format!("scheduler-{}", Uuid::new_v4()),
                settings,
                workers,
                jobs: Mutex::new(JoinSet::new()),
                latest_stats: RwLock::new(None),
            }),
        }
    }

    pub fn holder(&self) -> &str {
        &self.inner.holder
    }

    /// Snapshot the due set and dispatch each monitor for which a free worker and the lease can
    /// both be taken. A dispatched job starts scanning at once, so the lease never ages in a queue.
    /// Monitors that cannot be dispatched keep their `next_scan` and come back on the next tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let inner = &self.inner;
        let due = inner
            .store
            .due_monitors(now)
            .await
            .context("loading due monitors")?;
        let mut summary = TickSummary {
            due: due.len(),
            ..Default::default()
        };

        let mut jobs = inner.jobs.lock().await;
        while let Some(finished) = jobs.try_join_next() {
            if let Err(err) = finished {
                error!(error = %err, "scan job aborted");
            }
        }

        for monitor in due {
            let Ok(permit) = inner.workers.clone().try_acquire_owned() else {
                summary.deferred_pool_full += 1;
                continue;
            };
            match inner
                .leases
                .try_acquire(monitor.id, &inner.holder, inner.settings.lease_ttl, now)
                .await
            {
                Ok(Some(lease)) => {
                    let job = self.clone();
                    jobs.spawn(async move { job.run_job(monitor.id, lease, permit).await });
                    summary.dispatched += 1;
                }
                Ok(None) => {
                    debug!(monitor_id = %monitor.id, "scan still in flight; skipping");
                    summary.skipped_in_flight += 1;
                }
                Err(err) => {
                    warn!(monitor_id = %monitor.id, error = %err, "dispatch failed; will retry next tick");
                    summary.dispatch_failures += 1;
                }
            }
        }

        info!(
            due = summary.due,
            dispatched = summary.dispatched,
            skipped = summary.skipped_in_flight,
            deferred = summary.deferred_pool_full,
            failed = summary.dispatch_failures,
            "scheduler tick"
        );
        Ok(summary)
    }

    async fn run_job(&self, monitor_id: Uuid, lease: Lease, permit: OwnedSemaphorePermit) {
        self.scan_leased(monitor_id).await;
        if let Err(err) = self.inner.leases.release(&lease).await {
            warn!(monitor_id = %lease.monitor_id, error = %err, "releasing scan lease failed");
        }
        drop(permit);
    }

    /// Re-read the monitor under the lease so edits, deactivation, deletion and manual scans
    /// made since the due snapshot are honoured.
    async fn scan_leased(&self, monitor_id: Uuid) {
        let inner = &self.inner;
        let monitor = match inner.store.get_monitor(monitor_id).await {
            Ok(Some(monitor)) => monitor,
            Ok(None) => {
                debug!(%monitor_id, "monitor deleted before scan started");
                return;
            }
            Err(err) => {
                warn!(%monitor_id, error = %err, "reloading monitor failed");
                return;
            }
        };
        if !monitor.is_due(Utc::now()) {
            debug!(%monitor_id, "monitor no longer due; skipping");
            return;
        }
        if let Err(err) = inner.orchestrator.run_scan(&monitor).await {
            error!(%monitor_id, error = %err, "scan record could not be persisted");
        }
    }

    /// Wait until every dispatched job has finished.
    pub async fn wait_idle(&self) {
        let mut jobs = std::mem::take(&mut *self.inner.jobs.lock().await);
        while let Some(finished) = jobs.join_next().await {
            if let Err(err) = finished {
                error!(error = %err, "scan job aborted");
            }
        }
    }

    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        self.inner.lifecycle.cleanup(now).await
    }

    pub async fn refresh_statistics(&self, now: DateTime<Utc>) -> Result<ScanStatistics> {
        let window_start = now - chrono::Duration::hours(24);
        let records = self
            .inner
            .store
            .scan_records_since(window_start)
            .await
            .context("loading recent scan records")?;
        let stats = ScanStatistics::from_records(&records, window_start, now);
        info!(
            scans = stats.total_scans,
            success_rate = stats.success_rate,
            avg_duration_secs = stats.average_duration_secs,
            cost = stats.total_cost,
            alerts = stats.alerts_generated,
            "scan statistics refreshed"
        );
        *self.inner.latest_stats.write().await = Some(stats.clone());
        Ok(stats)
    }

    pub async fn latest_statistics(&self) -> Option<ScanStatistics> {
        self.inner.latest_stats.read().await.clone()
    }

    async fn build_jobs(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let settings = &self.inner.settings;

        let ticker = self.clone();
        let tick = Job::new_repeated_async(settings.tick_interval, move |_uuid, _l| {
            let ticker = ticker.clone();
            Box::pin(async move {
                if let Err(err) = ticker.tick(Utc::now()).await {
                    error!(error = %err, "scheduler tick failed");
                }
            })
        })
        .context("creating tick job")?;
        sched.add(tick).await.context("adding tick job")?;

        let cleaner = self.clone();
        let cron = settings.cleanup_cron.as_str();
        let cleanup = Job::new_async(cron, move |_uuid, _l| {
            let cleaner = cleaner.clone();
            Box::pin(async move {
                if let Err(err) = cleaner.cleanup(Utc::now()).await {
                    error!(error = %err, "retention cleanup failed");
                }
            })
        })
        .with_context(|| format!("creating cleanup job for cron {cron}"))?;
        sched.add(cleanup).await.context("adding cleanup job")?;

        let reporter = self.clone();
        let cron = settings.stats_cron.as_str();
        let stats = Job::new_async(cron, move |_uuid, _l| {
            let reporter = reporter.clone();
            Box::pin(async move {
                if let Err(err) = reporter.refresh_statistics(Utc::now()).await {
                    error!(error = %err, "statistics refresh failed");
                }
            })
        })
        .with_context(|| format!("creating statistics job for cron {cron}"))?;
        sched.add(stats).await.context("adding statistics job")?;

        Ok(sched)
    }

    /// Run until ctrl-c, then stop scheduling and drain in-flight scans.
    pub async fn run(&self) -> Result<()> {
        let mut sched = self.build_jobs().await?;
        sched.start().await.context("starting scheduler")?;
        info!(holder = %self.inner.holder, "scheduler started");

        if let Err(err) = self.tick(Utc::now()).await {
            error!(error = %err, "initial tick failed");
        }

        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        info!("shutdown requested; draining scans");
        sched.shutdown().await.context("stopping scheduler")?;
        self.wait_idle().await;
        Ok(())
    }
}
