//! Persistence contracts for monitors, alerts, scan records and per-monitor scan leases.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tw_core::{Alert, AlertSource, AlertStatus, Monitor, ScanRecord, Severity};
use uuid::Uuid;

pub mod pg;

pub use pg::PgStore;

pub const CRATE_NAME: &str = "tw-storage";

/// System-owned fields written when a scan attempt finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCompletion {
    pub last_scan: DateTime<Utc>,
    pub next_scan: DateTime<Utc>,
    pub alerts_created: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertQuery {
    pub owner_id: String,
    pub monitor_id: Option<Uuid>,
    pub status: Option<AlertStatus>,
    pub severity: Option<Severity>,
    pub offset: usize,
    pub limit: usize,
}

impl AlertQuery {
    pub fn for_owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            limit: 50,
            ..Default::default()
        }
    }

    fn matches(&self, alert: &Alert) -> bool {
        alert.owner_id == self.owner_id
            && self.monitor_id.map_or(true, |id| alert.monitor_id == id)
            && self.status.map_or(true, |s| alert.status == s)
            && self.severity.map_or(true, |s| alert.severity == s)
    }
}

#[async_trait]
pub trait MonitorStore: Send + Sync {
    async fn insert_monitor(&self, monitor: &Monitor) -> Result<()>;
    async fn get_monitor(&self, id: Uuid) -> Result<Option<Monitor>>;
    async fn list_monitors(&self, owner_id: &str) -> Result<Vec<Monitor>>;
    async fn list_owners(&self) -> Result<Vec<String>>;
    /// Write the owner-controlled fields of `monitor`; `reschedule` also overwrites `next_scan`.
    async fn update_owner_fields(
        &self,
        monitor: &Monitor,
        reschedule: Option<DateTime<Utc>>,
    ) -> Result<bool>;
    async fn delete_monitor(&self, id: Uuid) -> Result<bool>;
    /// Active monitors with `next_scan <= now`, oldest-due first.
    async fn due_monitors(&self, now: DateTime<Utc>) -> Result<Vec<Monitor>>;
    /// Advance `last_scan`/`next_scan` and bump counters. Returns false if the monitor is gone.
    async fn record_scan_completion(&self, id: Uuid, completion: ScanCompletion) -> Result<bool>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn insert_alert(&self, alert: &Alert) -> Result<()>;
    async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>>;
    /// Newest first.
    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>>;
    async fn alerts_for_monitor_since(
        &self,
        monitor_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Alert>>;
    async fn replace_alert_sources(
        &self,
        id: Uuid,
        sources: &[AlertSource],
        updated_at: DateTime<Utc>,
    ) -> Result<bool>;
    /// Compare-and-set on `expected`; returns false if the alert is gone or its status moved.
    async fn update_alert_status(
        &self,
        id: Uuid,
        expected: AlertStatus,
        status: AlertStatus,
        user_feedback: Option<&str>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool>;
    async fn delete_alerts_before(&self, owner_id: &str, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait ScanRecordStore: Send + Sync {
    async fn insert_scan_record(&self, record: &ScanRecord) -> Result<()>;
    /// Newest first.
    async fn scan_records_for_monitor(&self, monitor_id: Uuid, limit: usize)
        -> Result<Vec<ScanRecord>>;
    async fn scan_records_since(&self, since: DateTime<Utc>) -> Result<Vec<ScanRecord>>;
    async fn delete_scan_records_before(
        &self,
        owner_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64>;
}

pub trait WatchStore: MonitorStore + AlertStore + ScanRecordStore {}

impl<T> WatchStore for T where T: MonitorStore + AlertStore + ScanRecordStore {}

/// Exclusive right to scan one monitor until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub monitor_id: Uuid,
    pub holder: String,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// `None` when an unexpired lease is held by someone else.
    async fn try_acquire(
        &self,
        monitor_id: Uuid,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>>;
    /// No-op if the lease already expired and was taken over.
    async fn release(&self, lease: &Lease) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    monitors: HashMap<Uuid, Monitor>,
    alerts: HashMap<Uuid, Alert>,
    scan_records: Vec<ScanRecord>,
}

/// Single-process store backing tests and database-less runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MonitorStore for MemoryStore {
    async fn insert_monitor(&self, monitor: &Monitor) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.monitors.contains_key(&monitor.id) {
            anyhow::bail!("monitor {} already exists", monitor.id);
        }
        state.monitors.insert(monitor.id, monitor.clone());
        Ok(())
    }

    async fn get_monitor(&self, id: Uuid) -> Result<Option<Monitor>> {
        Ok(self.state.lock().await.monitors.get(&id).cloned())
    }

    async fn list_monitors(&self, owner_id: &str) -> Result<Vec<Monitor>> {
        let state = self.state.lock().await;
        let mut out = state
            .monitors
            .values()
            .filter(|m| m.owner_id == owner_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|m| m.created_at);
        Ok(out)
    }

    async fn list_owners(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut owners = state
            .monitors
            .values()
            .map(|m| m.owner_id.clone())
            .chain(state.alerts.values().map(|a| a.owner_id.clone()))
            .chain(state.scan_records.iter().map(|r| r.owner_id.clone()))
            .collect::<Vec<_>>();
        owners.sort();
        owners.dedup();
        Ok(owners)
    }

    async fn update_owner_fields(
        &self,
        monitor: &Monitor,
        reschedule: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.monitors.get_mut(&monitor.id) else {
            return Ok(false);
        };
        stored.term = monitor.term.clone();
        stored.description = monitor.description.clone();
        stored.keywords = monitor.keywords.clone();
        stored.exclude_keywords = monitor.exclude_keywords.clone();
        stored.frequency = monitor.frequency;
        stored.severity_threshold = monitor.severity_threshold;
        stored.active = monitor.active;
        stored.updated_at = monitor.updated_at;
        if let Some(next_scan) = reschedule {
            stored.next_scan = Some(next_scan);
        }
        Ok(true)
    }

    async fn delete_monitor(&self, id: Uuid) -> Result<bool> {
        Ok(self.state.lock().await.monitors.remove(&id).is_some())
    }

    async fn due_monitors(&self, now: DateTime<Utc>) -> Result<Vec<Monitor>> {
        let state = self.state.lock().await;
        let mut due = state
            .monitors
            .values()
            .filter(|m| m.is_due(now))
            .cloned()
            .collect::<Vec<_>>();
        due.sort_by_key(|m| m.next_scan);
        Ok(due)
    }

    async fn record_scan_completion(&self, id: Uuid, completion: ScanCompletion) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.monitors.get_mut(&id) else {
            return Ok(false);
        };
        stored.last_scan = Some(completion.last_scan);
        stored.next_scan = Some(completion.next_scan);
        stored.scan_count += 1;
        stored.alert_count += completion.alerts_created;
        Ok(true)
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.alerts.contains_key(&alert.id) {
            anyhow::bail!("alert {} already exists", alert.id);
        }
        state.alerts.insert(alert.id, alert.clone());
        Ok(())
    }

    async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>> {
        Ok(self.state.lock().await.alerts.get(&id).cloned())
    }

    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        let state = self.state.lock().await;
        let mut out = state
            .alerts
            .values()
            .filter(|a| query.matches(a))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out
            .into_iter()
            .skip(query.offset)
            .take(query.limit.max(1))
            .collect())
    }

    async fn alerts_for_monitor_since(
        &self,
        monitor_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Alert>> {
        let state = self.state.lock().await;
        let mut out = state
            .alerts
            .values()
            .filter(|a| a.monitor_id == monitor_id && a.created_at >= since)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn replace_alert_sources(
        &self,
        id: Uuid,
        sources: &[AlertSource],
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(alert) = state.alerts.get_mut(&id) else {
            return Ok(false);
        };
        alert.sources = sources.to_vec();
        alert.source_count = sources.len();
        alert.updated_at = updated_at;
        Ok(true)
    }

    async fn update_alert_status(
        &self,
        id: Uuid,
        expected: AlertStatus,
        status: AlertStatus,
        user_feedback: Option<&str>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.alerts.get_mut(&id) {
            Some(alert) if alert.status == expected => {
                alert.status = status;
                if let Some(feedback) = user_feedback {
                    alert.user_feedback = Some(feedback.to_string());
                }
                alert.updated_at = updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_alerts_before(&self, owner_id: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.alerts.len();
        state
            .alerts
            .retain(|_, a| !(a.owner_id == owner_id && a.created_at < cutoff));
        Ok((before - state.alerts.len()) as u64)
    }
}

#[async_trait]
impl ScanRecordStore for MemoryStore {
    async fn insert_scan_record(&self, record: &ScanRecord) -> Result<()> {
        self.state.lock().await.scan_records.push(record.clone());
        Ok(())
    }

    async fn scan_records_for_monitor(
        &self,
        monitor_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ScanRecord>> {
        let state = self.state.lock().await;
        let mut out = state
            .scan_records
            .iter()
            .filter(|r| r.monitor_id == monitor_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.scan_timestamp.cmp(&a.scan_timestamp));
        out.truncate(limit);
        Ok(out)
    }

    async fn scan_records_since(&self, since: DateTime<Utc>) -> Result<Vec<ScanRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .scan_records
            .iter()
            .filter(|r| r.scan_timestamp >= since)
            .cloned()
            .collect())
    }

    async fn delete_scan_records_before(
        &self,
        owner_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.scan_records.len();
        state
            .scan_records
            .retain(|r| !(r.owner_id == owner_id && r.scan_timestamp < cutoff));
        Ok((before - state.scan_records.len()) as u64)
    }
}

/// In-process leases; only valid when scheduler and workers share one process.
#[derive(Debug, Default)]
pub struct MemoryLeases {
    leases: Mutex<HashMap<Uuid, Lease>>,
}

impl MemoryLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn held(&self) -> usize {
        self.leases.lock().await.len()
    }
}

#[async_trait]
impl LeaseManager for MemoryLeases {
    async fn try_acquire(
        &self,
        monitor_id: Uuid,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        let mut leases = self.leases.lock().await;
        if let Some(existing) = leases.get(&monitor_id) {
            if existing.expires_at > now {
                return Ok(None);
            }
            tracing::warn!(
                %monitor_id,
                holder = existing.holder.as_str(),
                "taking over expired scan lease"
            );
        }
        let lease = Lease {
            monitor_id,
            holder: holder.to_string(),
            token: Uuid::new_v4(),
            expires_at: now + ttl,
        };
        leases.insert(monitor_id, lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if leases
            .get(&lease.monitor_id)
            .is_some_and(|held| held.token == lease.token)
        {
            leases.remove(&lease.monitor_id);
        }
        Ok(())
    }
}
