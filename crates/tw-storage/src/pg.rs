//! Postgres-backed store and lease table.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tw_core::{Alert, AlertSource, AlertStatus, ApiCosts, Monitor, ScanRecord, ThreatIndicators};
use uuid::Uuid;

use crate::{
    AlertQuery, AlertStore, Lease, LeaseManager, MonitorStore, ScanCompletion, ScanRecordStore,
};

const MONITOR_COLUMNS: &str = "id, owner_id, term, description, keywords, exclude_keywords, \
     frequency, severity_threshold, active, created_at, updated_at, last_scan, next_scan, \
     scan_count, alert_count";

const ALERT_COLUMNS: &str = "id, monitor_id, owner_id, title, summary, severity, confidence_score, \
     sources, source_count, threat_indicators, recommendations, status, created_at, updated_at, \
     user_feedback";

const SCAN_RECORD_COLUMNS: &str = "id, monitor_id, owner_id, scan_timestamp, duration_secs, query, \
     timeframe, articles_fetched, articles_processed, alerts_generated, duplicates_merged, \
     api_costs, errors, success";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .context("running tw-storage migrations")
    }
}

fn monitor_from_row(row: &PgRow) -> Result<Monitor> {
    let frequency: String = row.try_get("frequency")?;
    let threshold: String = row.try_get("severity_threshold")?;
    let keywords: Json<Vec<String>> = row.try_get("keywords")?;
    let exclude_keywords: Json<Vec<String>> = row.try_get("exclude_keywords")?;
    let scan_count: i64 = row.try_get("scan_count")?;
    let alert_count: i64 = row.try_get("alert_count")?;
    Ok(Monitor {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        term: row.try_get("term")?,
        description: row.try_get("description")?,
        keywords: keywords.0,
        exclude_keywords: exclude_keywords.0,
        frequency: frequency.parse()?,
        severity_threshold: threshold.parse()?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_scan: row.try_get("last_scan")?,
        next_scan: row.try_get("next_scan")?,
        scan_count: scan_count.max(0) as u64,
        alert_count: alert_count.max(0) as u64,
    })
}

fn alert_from_row(row: &PgRow) -> Result<Alert> {
    let severity: String = row.try_get("severity")?;
    let status: String = row.try_get("status")?;
    let sources: Json<Vec<AlertSource>> = row.try_get("sources")?;
    let indicators: Json<ThreatIndicators> = row.try_get("threat_indicators")?;
    let source_count: i64 = row.try_get("source_count")?;
    Ok(Alert {
        id: row.try_get("id")?,
        monitor_id: row.try_get("monitor_id")?,
        owner_id: row.try_get("owner_id")?,
        title: row.try_get("title")?,
        summary: row.try_get("summary")?,
        severity: severity.parse()?,
        confidence_score: row.try_get("confidence_score")?,
        sources: sources.0,
        source_count: source_count.max(0) as usize,
        threat_indicators: indicators.0,
        recommendations: row.try_get("recommendations")?,
        status: status.parse()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        user_feedback: row.try_get("user_feedback")?,
    })
}

fn scan_record_from_row(row: &PgRow) -> Result<ScanRecord> {
    let api_costs: Json<ApiCosts> = row.try_get("api_costs")?;
    let errors: Json<Vec<String>> = row.try_get("errors")?;
    let count = |col: &str| -> Result<u32> {
        let value: i32 = row.try_get(col)?;
        Ok(value.max(0) as u32)
    };
    Ok(ScanRecord {
        id: row.try_get("id")?,
        monitor_id: row.try_get("monitor_id")?,
        owner_id: row.try_get("owner_id")?,
        scan_timestamp: row.try_get("scan_timestamp")?,
        duration_secs: row.try_get("duration_secs")?,
        query: row.try_get("query")?,
        timeframe: row.try_get("timeframe")?,
        articles_fetched: count("articles_fetched")?,
        articles_processed: count("articles_processed")?,
        alerts_generated: count("alerts_generated")?,
        duplicates_merged: count("duplicates_merged")?,
        api_costs: api_costs.0,
        errors: errors.0,
        success: row.try_get("success")?,
    })
}

fn clamp_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl MonitorStore for PgStore {
    async fn insert_monitor(&self, monitor: &Monitor) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO monitors ({MONITOR_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        ))
        .bind(monitor.id)
        .bind(&monitor.owner_id)
        .bind(&monitor.term)
        .bind(&monitor.description)
        .bind(Json(&monitor.keywords))
        .bind(Json(&monitor.exclude_keywords))
        .bind(monitor.frequency.as_str())
        .bind(monitor.severity_threshold.as_str())
        .bind(monitor.active)
        .bind(monitor.created_at)
        .bind(monitor.updated_at)
        .bind(monitor.last_scan)
        .bind(monitor.next_scan)
        .bind(monitor.scan_count as i64)
        .bind(monitor.alert_count as i64)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting monitor {}", monitor.id))?;
        Ok(())
    }

    async fn get_monitor(&self, id: Uuid) -> Result<Option<Monitor>> {
        let row = sqlx::query(&format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading monitor {id}"))?;
        row.as_ref().map(monitor_from_row).transpose()
    }

    async fn list_monitors(&self, owner_id: &str) -> Result<Vec<Monitor>> {
        let rows = sqlx::query(&format!(
            "SELECT {MONITOR_COLUMNS} FROM monitors WHERE owner_id = $1 ORDER BY created_at"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .context("listing monitors")?;
        rows.iter().map(monitor_from_row).collect()
    }

    async fn list_owners(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT owner_id FROM monitors
            UNION SELECT owner_id FROM alerts
            UNION SELECT owner_id FROM scan_records
            ORDER BY owner_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing owners")?;
        rows.iter()
            .map(|row| row.try_get("owner_id").map_err(anyhow::Error::from))
            .collect()
    }

    async fn update_owner_fields(
        &self,
        monitor: &Monitor,
        reschedule: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE monitors
               SET term = $2,
                   description = $3,
                   keywords = $4,
                   exclude_keywords = $5,
                   frequency = $6,
                   severity_threshold = $7,
                   active = $8,
                   updated_at = $9,
                   next_scan = COALESCE($10, next_scan)
             WHERE id = $1
            "#,
        )
        .bind(monitor.id)
        .bind(&monitor.term)
        .bind(&monitor.description)
        .bind(Json(&monitor.keywords))
        .bind(Json(&monitor.exclude_keywords))
        .bind(monitor.frequency.as_str())
        .bind(monitor.severity_threshold.as_str())
        .bind(monitor.active)
        .bind(monitor.updated_at)
        .bind(reschedule)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating monitor {}", monitor.id))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_monitor(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM monitors WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("deleting monitor {id}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn due_monitors(&self, now: DateTime<Utc>) -> Result<Vec<Monitor>> {
        let rows = sqlx::query(&format!(
            "SELECT {MONITOR_COLUMNS} FROM monitors \
             WHERE active AND (next_scan IS NULL OR next_scan <= $1) \
             ORDER BY next_scan ASC NULLS FIRST"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("selecting due monitors")?;
        rows.iter().map(monitor_from_row).collect()
    }

    async fn record_scan_completion(&self, id: Uuid, completion: ScanCompletion) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE monitors
               SET last_scan = $2,
                   next_scan = $3,
                   scan_count = scan_count + 1,
                   alert_count = alert_count + $4
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(completion.last_scan)
        .bind(completion.next_scan)
        .bind(completion.alerts_created as i64)
        .execute(&self.pool)
        .await
        .with_context(|| format!("recording scan completion for {id}"))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO alerts ({ALERT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        ))
        .bind(alert.id)
        .bind(alert.monitor_id)
        .bind(&alert.owner_id)
        .bind(&alert.title)
        .bind(&alert.summary)
        .bind(alert.severity.as_str())
        .bind(alert.confidence_score)
        .bind(Json(&alert.sources))
        .bind(alert.source_count as i64)
        .bind(Json(&alert.threat_indicators))
        .bind(&alert.recommendations)
        .bind(alert.status.as_str())
        .bind(alert.created_at)
        .bind(alert.updated_at)
        .bind(&alert.user_feedback)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting alert {}", alert.id))?;
        Ok(())
    }

    async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>> {
        let row = sqlx::query(&format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading alert {id}"))?;
        row.as_ref().map(alert_from_row).transpose()
    }

    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        let rows = sqlx::query(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts \
             WHERE owner_id = $1 \
               AND ($2::uuid IS NULL OR monitor_id = $2) \
               AND ($3::text IS NULL OR status = $3) \
               AND ($4::text IS NULL OR severity = $4) \
             ORDER BY created_at DESC \
             OFFSET $5 LIMIT $6"
        ))
        .bind(&query.owner_id)
        .bind(query.monitor_id)
        .bind(query.status.map(|s| s.as_str()))
        .bind(query.severity.map(|s| s.as_str()))
        .bind(i64::try_from(query.offset).unwrap_or(i64::MAX))
        .bind(i64::try_from(query.limit.max(1)).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("listing alerts")?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn alerts_for_monitor_since(
        &self,
        monitor_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Alert>> {
        let rows = sqlx::query(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts \
             WHERE monitor_id = $1 AND created_at >= $2 \
             ORDER BY created_at DESC"
        ))
        .bind(monitor_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading recent alerts for monitor {monitor_id}"))?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn replace_alert_sources(
        &self,
        id: Uuid,
        sources: &[AlertSource],
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE alerts
               SET sources = $2, source_count = $3, updated_at = $4
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Json(sources))
        .bind(sources.len() as i64)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("merging sources into alert {id}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_alert_status(
        &self,
        id: Uuid,
        expected: AlertStatus,
        status: AlertStatus,
        user_feedback: Option<&str>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE alerts
               SET status = $3,
                   user_feedback = COALESCE($4, user_feedback),
                   updated_at = $5
             WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(status.as_str())
        .bind(user_feedback)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating status of alert {id}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_alerts_before(&self, owner_id: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM alerts WHERE owner_id = $1 AND created_at < $2")
            .bind(owner_id)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("purging alerts")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ScanRecordStore for PgStore {
    async fn insert_scan_record(&self, record: &ScanRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO scan_records ({SCAN_RECORD_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        ))
        .bind(record.id)
        .bind(record.monitor_id)
        .bind(&record.owner_id)
        .bind(record.scan_timestamp)
        .bind(record.duration_secs)
        .bind(&record.query)
        .bind(&record.timeframe)
        .bind(clamp_i32(record.articles_fetched))
        .bind(clamp_i32(record.articles_processed))
        .bind(clamp_i32(record.alerts_generated))
        .bind(clamp_i32(record.duplicates_merged))
        .bind(Json(&record.api_costs))
        .bind(Json(&record.errors))
        .bind(record.success)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting scan record {}", record.id))?;
        Ok(())
    }

    async fn scan_records_for_monitor(
        &self,
        monitor_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ScanRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCAN_RECORD_COLUMNS} FROM scan_records \
             WHERE monitor_id = $1 ORDER BY scan_timestamp DESC LIMIT $2"
        ))
        .bind(monitor_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("listing scan records")?;
        rows.iter().map(scan_record_from_row).collect()
    }

    async fn scan_records_since(&self, since: DateTime<Utc>) -> Result<Vec<ScanRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCAN_RECORD_COLUMNS} FROM scan_records WHERE scan_timestamp >= $1"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("loading recent scan records")?;
        rows.iter().map(scan_record_from_row).collect()
    }

    async fn delete_scan_records_before(
        &self,
        owner_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM scan_records WHERE owner_id = $1 AND scan_timestamp < $2")
                .bind(owner_id)
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .context("purging scan records")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LeaseManager for PgStore {
    async fn try_acquire(
        &self,
        monitor_id: Uuid,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        let token = Uuid::new_v4();
        let expires_at = now + ttl;
        let row = sqlx::query(
            r#"
            INSERT INTO scan_leases (monitor_id, holder, token, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (monitor_id) DO UPDATE
               SET holder = EXCLUDED.holder,
                   token = EXCLUDED.token,
                   expires_at = EXCLUDED.expires_at
             WHERE scan_leases.expires_at <= $5
            RETURNING token
            "#,
        )
        .bind(monitor_id)
        .bind(holder)
        .bind(token)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("acquiring scan lease for {monitor_id}"))?;
        Ok(row.map(|_| Lease {
            monitor_id,
            holder: holder.to_string(),
            token,
            expires_at,
        }))
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        sqlx::query("DELETE FROM scan_leases WHERE monitor_id = $1 AND token = $2")
            .bind(lease.monitor_id)
            .bind(lease.token)
            .execute(&self.pool)
            .await
            .with_context(|| format!("releasing scan lease for {}", lease.monitor_id))?;
        Ok(())
    }
}
