//! Core domain model for the ThreatWatch monitoring engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tw-core";

/// Upper bound on the random delay added to `next_scan`, as a fraction of the frequency interval.
pub const MAX_JITTER_FRACTION: f64 = 0.10;

/// Relevance assigned to a source the analysis collaborator did not score.
pub const DEFAULT_SOURCE_RELEVANCE: f64 = 0.5;

pub const TERM_MIN_CHARS: usize = 3;
pub const TERM_MAX_CHARS: usize = 200;
pub const DESCRIPTION_MAX_CHARS: usize = 500;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum WatchError {
    #[error("{collaborator} call timed out after {attempts} attempt(s)")]
    CollaboratorTimeout {
        collaborator: String,
        attempts: usize,
    },
    #[error("{collaborator} quota exceeded: {message}")]
    CollaboratorQuotaExceeded {
        collaborator: String,
        message: String,
    },
    #[error("{collaborator} call failed: {message}")]
    CollaboratorFailure {
        collaborator: String,
        message: String,
    },
    #[error("malformed assessment: {0}")]
    MalformedAssessment(String),
    #[error("dispatch failed: {0}")]
    DispatchFailure(String),
    #[error("invalid alert transition {from} -> {to}")]
    InvalidTransition { from: AlertStatus, to: AlertStatus },
    #[error("{kind} {id} not found")]
    ResourceNotFound { kind: &'static str, id: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl WatchError {
    pub fn monitor_not_found(id: Uuid) -> Self {
        Self::ResourceNotFound {
            kind: "monitor",
            id: id.to_string(),
        }
    }

    pub fn alert_not_found(id: Uuid) -> Self {
        Self::ResourceNotFound {
            kind: "alert",
            id: id.to_string(),
        }
    }

    pub fn storage(err: impl fmt::Display) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// True when `self` is at or above the given threshold.
    pub fn meets(self, threshold: Severity) -> bool {
        self >= threshold
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(WatchError::InvalidInput(format!("unknown severity `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
        }
    }

    pub fn interval(self) -> Duration {
        match self {
            Frequency::Hourly => Duration::hours(1),
            Frequency::Daily => Duration::days(1),
            Frequency::Weekly => Duration::weeks(1),
        }
    }

    /// How far back a scan looks for new material.
    pub fn recency_window(self) -> Duration {
        self.interval()
    }

    pub fn timeframe_label(self) -> &'static str {
        match self {
            Frequency::Hourly => "last 1 hour",
            Frequency::Daily => "last 24 hours",
            Frequency::Weekly => "last 7 days",
        }
    }

    /// `from + interval + jitter`, with `jitter_fraction` clamped to `[0, MAX_JITTER_FRACTION]`.
    pub fn next_scan_after(self, from: DateTime<Utc>, jitter_fraction: f64) -> DateTime<Utc> {
        let interval = self.interval();
        let fraction = if jitter_fraction.is_finite() {
            jitter_fraction.clamp(0.0, MAX_JITTER_FRACTION)
        } else {
            0.0
        };
        let jitter_ms = (interval.num_milliseconds() as f64 * fraction).round() as i64;
        from + interval + Duration::milliseconds(jitter_ms)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(Frequency::Hourly),
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            other => Err(WatchError::InvalidInput(format!("unknown frequency `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    New,
    Acknowledged,
    Resolved,
    FalsePositive,
}

impl AlertStatus {
    pub const ALL: [AlertStatus; 4] = [
        AlertStatus::New,
        AlertStatus::Acknowledged,
        AlertStatus::Resolved,
        AlertStatus::FalsePositive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::New => "new",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
            AlertStatus::FalsePositive => "false_positive",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AlertStatus::Resolved | AlertStatus::FalsePositive)
    }

    pub fn can_transition_to(self, next: AlertStatus) -> bool {
        use AlertStatus::*;
        matches!(
            (self, next),
            (New, Acknowledged)
                | (New, Resolved)
                | (New, FalsePositive)
                | (Acknowledged, Resolved)
                | (Acknowledged, FalsePositive)
        )
    }

    pub fn transition(self, next: AlertStatus) -> Result<AlertStatus, WatchError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(WatchError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(AlertStatus::New),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "resolved" => Ok(AlertStatus::Resolved),
            "false_positive" | "false-positive" => Ok(AlertStatus::FalsePositive),
            other => Err(WatchError::InvalidInput(format!("unknown alert status `{other}`"))),
        }
    }
}

/// Subscription tier of a monitor owner; only its retention window matters to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    Professional,
    Enterprise,
    EnterprisePlus,
}

impl SubscriptionTier {
    /// `None` means history is kept forever.
    pub fn retention(self) -> Option<Duration> {
        match self {
            SubscriptionTier::Free => Some(Duration::days(7)),
            SubscriptionTier::Professional => Some(Duration::days(30)),
            SubscriptionTier::Enterprise => Some(Duration::days(365)),
            SubscriptionTier::EnterprisePlus => None,
        }
    }
}

impl FromStr for SubscriptionTier {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(SubscriptionTier::Free),
            "professional" => Ok(SubscriptionTier::Professional),
            "enterprise" => Ok(SubscriptionTier::Enterprise),
            "enterprise_plus" | "enterprise-plus" => Ok(SubscriptionTier::EnterprisePlus),
            other => Err(WatchError::InvalidInput(format!("unknown tier `{other}`"))),
        }
    }
}

/// Owner-supplied settings for a new monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMonitor {
    pub term: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
    #[serde(default = "default_frequency")]
    pub frequency: Frequency,
    #[serde(default = "default_threshold")]
    pub severity_threshold: Severity,
}

fn default_frequency() -> Frequency {
    Frequency::Daily
}

fn default_threshold() -> Severity {
    Severity::Medium
}

/// Partial update of the owner-controlled fields of a monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorUpdate {
    pub term: Option<String>,
    pub description: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub exclude_keywords: Option<Vec<String>>,
    pub frequency: Option<Frequency>,
    pub severity_threshold: Option<Severity>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    pub id: Uuid,
    pub owner_id: String,
    pub term: String,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    pub frequency: Frequency,
    pub severity_threshold: Severity,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_scan: Option<DateTime<Utc>>,
    pub next_scan: Option<DateTime<Utc>>,
    pub scan_count: u64,
    pub alert_count: u64,
}

impl Monitor {
    /// Build a validated monitor that is due immediately.
    pub fn new(owner_id: &str, settings: NewMonitor, now: DateTime<Utc>) -> Result<Self, WatchError> {
        if owner_id.trim().is_empty() {
            return Err(WatchError::InvalidInput("owner id must not be empty".into()));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.trim().to_string(),
            term: validate_term(&settings.term)?,
            description: validate_description(settings.description)?,
            keywords: clean_terms(settings.keywords),
            exclude_keywords: clean_terms(settings.exclude_keywords),
            frequency: settings.frequency,
            severity_threshold: settings.severity_threshold,
            active: true,
            created_at: now,
            updated_at: now,
            last_scan: None,
            next_scan: Some(now),
            scan_count: 0,
            alert_count: 0,
        })
    }

    /// Apply owner edits. A frequency change re-anchors `next_scan` on the last scan.
    pub fn apply_update(&mut self, update: MonitorUpdate, now: DateTime<Utc>) -> Result<(), WatchError> {
        if let Some(term) = update.term {
            self.term = validate_term(&term)?;
        }
        if update.description.is_some() {
            self.description = validate_description(update.description)?;
        }
        if let Some(keywords) = update.keywords {
            self.keywords = clean_terms(keywords);
        }
        if let Some(excludes) = update.exclude_keywords {
            self.exclude_keywords = clean_terms(excludes);
        }
        if let Some(threshold) = update.severity_threshold {
            self.severity_threshold = threshold;
        }
        if let Some(frequency) = update.frequency {
            if frequency != self.frequency {
                self.frequency = frequency;
                self.next_scan = Some(match self.last_scan {
                    Some(last) => (last + frequency.interval()).max(now),
                    None => now,
                });
            }
        }
        if let Some(active) = update.active {
            if active && !self.active && self.next_scan.map_or(true, |n| n < now) {
                self.next_scan = Some(now);
            }
            self.active = active;
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.next_scan.map_or(true, |next| next <= now)
    }

    pub fn context(&self) -> MonitorContext {
        MonitorContext {
            monitor_id: self.id,
            term: self.term.clone(),
            description: self.description.clone(),
            keywords: self.keywords.clone(),
            severity_threshold: self.severity_threshold,
        }
    }
}

fn validate_term(term: &str) -> Result<String, WatchError> {
    let term = term.trim();
    let chars = term.chars().count();
    if !(TERM_MIN_CHARS..=TERM_MAX_CHARS).contains(&chars) {
        return Err(WatchError::InvalidInput(format!(
            "monitor term must be {TERM_MIN_CHARS}-{TERM_MAX_CHARS} characters, got {chars}"
        )));
    }
    Ok(term.to_string())
}

fn validate_description(description: Option<String>) -> Result<Option<String>, WatchError> {
    match description.map(|d| d.trim().to_string()) {
        Some(d) if d.is_empty() => Ok(None),
        Some(d) if d.chars().count() > DESCRIPTION_MAX_CHARS => Err(WatchError::InvalidInput(
            format!("description exceeds {DESCRIPTION_MAX_CHARS} characters"),
        )),
        other => Ok(other),
    }
}

fn clean_terms(terms: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(terms.len());
    for term in terms {
        let term = term.trim();
        if !term.is_empty() && !out.iter().any(|t| t.eq_ignore_ascii_case(term)) {
            out.push(term.to_string());
        }
    }
    out
}

/// What the analysis collaborator is told about the monitor it is assessing for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorContext {
    pub monitor_id: Uuid,
    pub term: String,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub severity_threshold: Severity,
}

/// Candidate document returned by the search collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    pub url: String,
    pub domain: String,
    pub snippet: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl Document {
    /// Lowercased title + snippet, the text keyword filters match against.
    pub fn searchable_text(&self) -> String {
        format!("{} {}", self.title, self.snippet).to_lowercase()
    }
}

/// Lowercase a host and drop a leading `www.`.
pub fn normalize_domain(domain: &str) -> String {
    let lower = domain.trim().to_ascii_lowercase();
    lower.strip_prefix("www.").unwrap_or(&lower).to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreatIndicators {
    #[serde(default)]
    pub attack_vectors: Vec<String>,
    #[serde(default)]
    pub affected_sectors: Vec<String>,
    #[serde(default)]
    pub geographical_scope: Vec<String>,
    #[serde(default)]
    pub threat_actors: Vec<String>,
    #[serde(default)]
    pub key_threats: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRelevance {
    pub url: String,
    pub relevance_score: f64,
}

/// Token usage reported by the analysis collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl AnalysisUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens() == 0
    }
}

impl std::ops::AddAssign for AnalysisUsage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}

/// Structured result of one batched analysis call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    #[serde(default)]
    pub title: Option<String>,
    pub summary: String,
    pub severity: Severity,
    pub confidence_score: f64,
    #[serde(default)]
    pub threat_indicators: ThreatIndicators,
    #[serde(default)]
    pub recommendations: Option<String>,
    #[serde(default)]
    pub source_relevance: Vec<SourceRelevance>,
    #[serde(default)]
    pub usage: AnalysisUsage,
}

impl Assessment {
    pub fn validate(&self) -> Result<(), WatchError> {
        if self.summary.trim().is_empty() {
            return Err(WatchError::MalformedAssessment("summary is empty".into()));
        }
        if !self.confidence_score.is_finite() || !(0.0..=1.0).contains(&self.confidence_score) {
            return Err(WatchError::MalformedAssessment(format!(
                "confidence_score {} outside [0, 1]",
                self.confidence_score
            )));
        }
        if let Some(bad) = self
            .source_relevance
            .iter()
            .find(|s| !s.relevance_score.is_finite() || !(0.0..=1.0).contains(&s.relevance_score))
        {
            return Err(WatchError::MalformedAssessment(format!(
                "relevance_score {} for {} outside [0, 1]",
                bad.relevance_score, bad.url
            )));
        }
        Ok(())
    }

    pub fn relevance_for(&self, url: &str) -> Option<f64> {
        self.source_relevance
            .iter()
            .find(|s| s.url == url)
            .map(|s| s.relevance_score)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSource {
    pub title: String,
    pub url: String,
    pub domain: String,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub snippet: Option<String>,
    pub relevance_score: f64,
}

impl AlertSource {
    pub fn from_document(doc: &Document, relevance_score: f64) -> Self {
        Self {
            title: doc.title.clone(),
            url: doc.url.clone(),
            domain: doc.domain.clone(),
            published_at: doc.published_at,
            snippet: Some(doc.snippet.clone()).filter(|s| !s.is_empty()),
            relevance_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub monitor_id: Uuid,
    pub owner_id: String,
    pub title: String,
    pub summary: String,
    pub severity: Severity,
    pub confidence_score: f64,
    pub sources: Vec<AlertSource>,
    pub source_count: usize,
    pub threat_indicators: ThreatIndicators,
    pub recommendations: Option<String>,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_feedback: Option<String>,
}

impl Alert {
    /// Materialize a `new` alert from an assessment of `documents`.
    pub fn from_assessment(
        monitor: &Monitor,
        assessment: &Assessment,
        documents: &[Document],
        now: DateTime<Utc>,
    ) -> Self {
        let sources = documents
            .iter()
            .map(|doc| {
                let relevance = assessment
                    .relevance_for(&doc.url)
                    .unwrap_or(DEFAULT_SOURCE_RELEVANCE);
                AlertSource::from_document(doc, relevance)
            })
            .collect::<Vec<_>>();
        let title = assessment
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Threat detected: {}", monitor.term));
        Self {
            id: Uuid::new_v4(),
            monitor_id: monitor.id,
            owner_id: monitor.owner_id.clone(),
            title,
            summary: assessment.summary.trim().to_string(),
            severity: assessment.severity,
            confidence_score: assessment.confidence_score,
            source_count: sources.len(),
            sources,
            threat_indicators: assessment.threat_indicators.clone(),
            recommendations: assessment.recommendations.clone(),
            status: AlertStatus::New,
            created_at: now,
            updated_at: now,
            user_feedback: None,
        }
    }

    /// Union `incoming` into `sources` by URL and recompute `source_count`. Returns how many were added.
    pub fn merge_sources(&mut self, incoming: &[AlertSource]) -> usize {
        let mut added = 0;
        for source in incoming {
            if !self.sources.iter().any(|s| s.url == source.url) {
                self.sources.push(source.clone());
                added += 1;
            }
        }
        self.source_count = self.sources.len();
        added
    }

    pub fn source_domains(&self) -> impl Iterator<Item = String> + '_ {
        self.sources.iter().map(|s| normalize_domain(&s.domain))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiCosts {
    pub search_queries: u32,
    pub search_results: u32,
    pub analysis_units: u64,
    pub analysis_input_tokens: u64,
    pub analysis_output_tokens: u64,
    pub total_cost: f64,
}

/// Audit entry for one scan attempt. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: Uuid,
    pub monitor_id: Uuid,
    pub owner_id: String,
    pub scan_timestamp: DateTime<Utc>,
    pub duration_secs: f64,
    pub query: String,
    pub timeframe: String,
    pub articles_fetched: u32,
    pub articles_processed: u32,
    pub alerts_generated: u32,
    pub duplicates_merged: u32,
    pub api_costs: ApiCosts,
    pub errors: Vec<String>,
    pub success: bool,
}

impl ScanRecord {
    pub fn begin(monitor: &Monitor, scan_timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            monitor_id: monitor.id,
            owner_id: monitor.owner_id.clone(),
            scan_timestamp,
            duration_secs: 0.0,
            query: String::new(),
            timeframe: monitor.frequency.timeframe_label().to_string(),
            articles_fetched: 0,
            articles_processed: 0,
            alerts_generated: 0,
            duplicates_merged: 0,
            api_costs: ApiCosts::default(),
            errors: Vec::new(),
            success: true,
        }
    }

    pub fn push_error(&mut self, err: impl fmt::Display) {
        self.errors.push(err.to_string());
        self.success = false;
    }
}

/// Owner-facing alert counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertStatistics {
    pub total_alerts: u64,
    pub by_status: Vec<(AlertStatus, u64)>,
    pub by_severity: Vec<(Severity, u64)>,
    pub last_24_hours: u64,
}

impl AlertStatistics {
    pub fn from_alerts<'a>(alerts: impl IntoIterator<Item = &'a Alert>, now: DateTime<Utc>) -> Self {
        let mut by_status = AlertStatus::ALL.map(|s| (s, 0u64));
        let mut by_severity = Severity::ALL.map(|s| (s, 0u64));
        let mut total = 0;
        let mut recent = 0;
        let since = now - Duration::hours(24);
        for alert in alerts {
            total += 1;
            if alert.created_at >= since {
                recent += 1;
            }
            if let Some(slot) = by_status.iter_mut().find(|(s, _)| *s == alert.status) {
                slot.1 += 1;
            }
            if let Some(slot) = by_severity.iter_mut().find(|(s, _)| *s == alert.severity) {
                slot.1 += 1;
            }
        }
        Self {
            total_alerts: total,
            by_status: by_status.to_vec(),
            by_severity: by_severity.to_vec(),
            last_24_hours: recent,
        }
    }

    pub fn count_for_status(&self, status: AlertStatus) -> u64 {
        self.by_status
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}
