//! Owner-facing operations consumed by the CRUD layer.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use tw_core::{
    Alert, AlertStatistics, AlertStatus, Monitor, MonitorUpdate, NewMonitor, ScanRecord,
    WatchError,
};
use tw_storage::{AlertQuery, LeaseManager, WatchStore};
use uuid::Uuid;

use crate::lifecycle::AlertLifecycle;
use crate::scan::{ScanOrchestrator, ScanReport};

/// Page size ceiling for alert listings.
pub const MAX_PAGE_SIZE: usize = 200;

pub struct WatchService {
    store: Arc<dyn WatchStore>,
    leases: Arc<dyn LeaseManager>,
    orchestrator: Arc<ScanOrchestrator>,
    lifecycle: Arc<AlertLifecycle>,
    lease_ttl: chrono::Duration,
    holder: String,
}

impl WatchService {
    pub fn new(
        store: Arc<dyn WatchStore>,
        leases: Arc<dyn LeaseManager>,
        orchestrator: Arc<ScanOrchestrator>,
        lifecycle: Arc<AlertLifecycle>,
        lease_ttl: chrono::Duration,
    ) -> Self {
        Self {
            store,
            leases,
            orchestrator,
            lifecycle,
            lease_ttl,
            holder: format!("manual-{}", Uuid::new_v4()),
        }
    }

    async fn owned_monitor(&self, owner_id: &str, id: Uuid) -> Result<Monitor, WatchError> {
        match self.store.get_monitor(id).await.map_err(WatchError::storage)? {
            Some(monitor) if monitor.owner_id == owner_id => Ok(monitor),
            _ => Err(WatchError::monitor_not_found(id)),
        }
    }

    pub async fn create_monitor(
        &self,
        owner_id: &str,
        settings: NewMonitor,
    ) -> Result<Monitor, WatchError> {
        let monitor = Monitor::new(owner_id, settings, Utc::now())?;
        self.store
            .insert_monitor(&monitor)
            .await
            .map_err(WatchError::storage)?;
        info!(monitor_id = %monitor.id, owner_id, term = %monitor.term, "monitor created");
        Ok(monitor)
    }

    pub async fn list_monitors(&self, owner_id: &str) -> Result<Vec<Monitor>, WatchError> {
        self.store
            .list_monitors(owner_id)
            .await
            .map_err(WatchError::storage)
    }

    pub async fn get_monitor(&self, owner_id: &str, id: Uuid) -> Result<Monitor, WatchError> {
        self.owned_monitor(owner_id, id).await
    }

    pub async fn update_monitor(
        &self,
        owner_id: &str,
        id: Uuid,
        update: MonitorUpdate,
    ) -> Result<Monitor, WatchError> {
        let mut monitor = self.owned_monitor(owner_id, id).await?;
        let previous_next_scan = monitor.next_scan;
        monitor.apply_update(update, Utc::now())?;
        let reschedule = monitor.next_scan.filter(|_| monitor.next_scan != previous_next_scan);
        let written = self
            .store
            .update_owner_fields(&monitor, reschedule)
            .await
            .map_err(WatchError::storage)?;
        if !written {
            return Err(WatchError::monitor_not_found(id));
        }
        info!(monitor_id = %id, active = monitor.active, "monitor updated");
        Ok(monitor)
    }

    /// An in-flight scan is allowed to finish; nothing is scheduled afterwards.
    pub async fn delete_monitor(&self, owner_id: &str, id: Uuid) -> Result<(), WatchError> {
        self.owned_monitor(owner_id, id).await?;
        let deleted = self
            .store
            .delete_monitor(id)
            .await
            .map_err(WatchError::storage)?;
        if !deleted {
            return Err(WatchError::monitor_not_found(id));
        }
        info!(monitor_id = %id, "monitor deleted");
        Ok(())
    }

    /// Scan now, outside the scheduler, under the same per-monitor lease.
    pub async fn trigger_manual_scan(
        &self,
        owner_id: &str,
        id: Uuid,
    ) -> Result<ScanReport, WatchError> {
        self.owned_monitor(owner_id, id).await?;
        let lease = self
            .leases
            .try_acquire(id, &self.holder, self.lease_ttl, Utc::now())
            .await
            .map_err(|e| WatchError::DispatchFailure(format!("lease store unavailable: {e}")))?
            .ok_or_else(|| {
                WatchError::DispatchFailure(format!("a scan for monitor {id} is already in progress"))
            })?;

        let result = match self.owned_monitor(owner_id, id).await {
            Ok(monitor) => self.orchestrator.run_scan(&monitor).await,
            Err(err) => Err(err),
        };
        if let Err(err) = self.leases.release(&lease).await {
            warn!(monitor_id = %id, error = %err, "releasing manual scan lease failed");
        }
        result
    }

    pub async fn scan_history(
        &self,
        owner_id: &str,
        monitor_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ScanRecord>, WatchError> {
        self.owned_monitor(owner_id, monitor_id).await?;
        self.store
            .scan_records_for_monitor(monitor_id, limit)
            .await
            .map_err(WatchError::storage)
    }

    pub async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>, WatchError> {
        let mut query = query.clone();
        query.limit = query.limit.clamp(1, MAX_PAGE_SIZE);
        self.store
            .list_alerts(&query)
            .await
            .map_err(WatchError::storage)
    }

    pub async fn get_alert(&self, owner_id: &str, id: Uuid) -> Result<Alert, WatchError> {
        match self.store.get_alert(id).await.map_err(WatchError::storage)? {
            Some(alert) if alert.owner_id == owner_id => Ok(alert),
            _ => Err(WatchError::alert_not_found(id)),
        }
    }

    pub async fn update_alert_status(
        &self,
        owner_id: &str,
        id: Uuid,
        status: AlertStatus,
        feedback: Option<&str>,
    ) -> Result<Alert, WatchError> {
        self.lifecycle
            .transition(owner_id, id, status, feedback, Utc::now())
            .await
    }

    pub async fn alert_statistics(&self, owner_id: &str) -> Result<AlertStatistics, WatchError> {
        let mut alerts = Vec::new();
        let mut query = AlertQuery::for_owner(owner_id);
        query.limit = MAX_PAGE_SIZE;
        loop {
            let page = self
                .store
                .list_alerts(&query)
                .await
                .map_err(WatchError::storage)?;
            let done = page.len() < query.limit;
            query.offset += page.len();
            alerts.extend(page);
            if done {
                break;
            }
        }
        Ok(AlertStatistics::from_alerts(&alerts, Utc::now()))
    }
}
