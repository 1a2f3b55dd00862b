use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use tw_core::{Alert, AlertStatus, SubscriptionTier, WatchError};
use tw_storage::WatchStore;
use uuid::Uuid;

/// Subscription lookup; billing and plan management live outside the engine.
#[async_trait]
pub trait TierResolver: Send + Sync {
    async fn tier_for(&self, owner_id: &str) -> Result<SubscriptionTier>;
}

#[derive(Debug, Clone)]
pub struct StaticTierResolver {
    default: SubscriptionTier,
    overrides: HashMap<String, SubscriptionTier>,
}

impl StaticTierResolver {
    pub fn new(default: SubscriptionTier) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>, tier: SubscriptionTier) -> Self {
        self.overrides.insert(owner_id.into(), tier);
        self
    }
}

#[async_trait]
impl TierResolver for StaticTierResolver {
    async fn tier_for(&self, owner_id: &str) -> Result<SubscriptionTier> {
        Ok(self.overrides.get(owner_id).copied().unwrap_or(self.default))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub owners_checked: usize,
    pub owners_retained_forever: usize,
    pub owners_failed: usize,
    pub alerts_deleted: u64,
    pub scan_records_deleted: u64,
}

/// Owner-driven alert status changes plus tier-based retention.
pub struct AlertLifecycle {
    store: Arc<dyn WatchStore>,
    tiers: Arc<dyn TierResolver>,
}

impl AlertLifecycle {
    pub fn new(store: Arc<dyn WatchStore>, tiers: Arc<dyn TierResolver>) -> Self {
        Self { store, tiers }
    }

    async fn owned_alert(&self, owner_id: &str, alert_id: Uuid) -> Result<Alert, WatchError> {
        match self.store.get_alert(alert_id).await.map_err(WatchError::storage)? {
            Some(alert) if alert.owner_id == owner_id => Ok(alert),
            _ => Err(WatchError::alert_not_found(alert_id)),
        }
    }

    pub async fn transition(
        &self,
        owner_id: &str,
        alert_id: Uuid,
        next: AlertStatus,
        feedback: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Alert, WatchError> {
        let mut alert = self.owned_alert(owner_id, alert_id).await?;
        let from = alert.status;
        let next = from.transition(next)?;
        let feedback = feedback.map(str::trim).filter(|f| !f.is_empty());

        let applied = self
            .store
            .update_alert_status(alert_id, from, next, feedback, now)
            .await
            .map_err(WatchError::storage)?;
        if !applied {
            // Lost a race with another owner action; report against the status that won.
            let current = self.owned_alert(owner_id, alert_id).await?;
            return Err(WatchError::InvalidTransition {
                from: current.status,
                to: next,
            });
        }

        alert.status = next;
        if let Some(feedback) = feedback {
            alert.user_feedback = Some(feedback.to_string());
        }
        alert.updated_at = now;
        info!(%alert_id, from = %from.as_str(), to = %next.as_str(), "alert status changed");
        Ok(alert)
    }

    /// Purge alerts and scan records older than each owner's retention window. Monitor
    /// counters are left alone.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for owner_id in self.store.list_owners().await? {
            report.owners_checked += 1;
            match self.cleanup_owner(&owner_id, now).await {
                Ok(Some((alerts, records))) => {
                    report.alerts_deleted += alerts;
                    report.scan_records_deleted += records;
                }
                Ok(None) => report.owners_retained_forever += 1,
                Err(err) => {
                    report.owners_failed += 1;
                    warn!(owner_id, error = %err, "retention cleanup failed for owner");
                }
            }
        }
        info!(
            owners = report.owners_checked,
            alerts_deleted = report.alerts_deleted,
            scan_records_deleted = report.scan_records_deleted,
            failures = report.owners_failed,
            "retention cleanup finished"
        );
        Ok(report)
    }

    async fn cleanup_owner(&self, owner_id: &str, now: DateTime<Utc>) -> Result<Option<(u64, u64)>> {
        let tier = self.tiers.tier_for(owner_id).await?;
        let Some(retention) = tier.retention() else {
            return Ok(None);
        };
        let cutoff = now - retention;
        let alerts = self.store.delete_alerts_before(owner_id, cutoff).await?;
        let records = self.store.delete_scan_records_before(owner_id, cutoff).await?;
        Ok(Some((alerts, records)))
    }
}
