//! External collaborator contracts (search + analysis), retry policy, and fixture-first implementations.

use std::fmt;
use std::fs;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use tw_core::{
    AnalysisUsage, Assessment, Document, MonitorContext, Severity, SourceRelevance,
    ThreatIndicators, WatchError,
};

pub mod http;

pub use http::{ChatAnalysisClient, GoogleSearchClient, HttpClientConfig};

pub const CRATE_NAME: &str = "tw-adapters";

/// Documents rendered into one analysis prompt.
pub const PROMPT_DOCUMENT_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollaboratorKind {
    Search,
    Analysis,
}

impl fmt::Display for CollaboratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollaboratorKind::Search => f.write_str("search"),
            CollaboratorKind::Analysis => f.write_str("analysis"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("quota exhausted: {0}")]
    QuotaExceeded(String),
    #[error("provider unavailable (status {status}): {message}")]
    Unavailable { status: u16, message: String },
    /// `usage` is whatever the provider reported for the rejected reply.
    #[error("malformed response: {message}")]
    Malformed {
        message: String,
        usage: AnalysisUsage,
    },
    #[error("request failed: {0}")]
    Request(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl CollaboratorError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            CollaboratorError::Timeout(_)
            | CollaboratorError::RateLimited(_)
            | CollaboratorError::Unavailable { .. } => RetryDisposition::Retryable,
            CollaboratorError::QuotaExceeded(_)
            | CollaboratorError::Malformed { .. }
            | CollaboratorError::Request(_) => RetryDisposition::NonRetryable,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        CollaboratorError::Malformed {
            message: message.into(),
            usage: AnalysisUsage::default(),
        }
    }

    /// Attach provider-reported usage to a malformed reply; other variants pass through.
    pub fn with_usage(self, usage: AnalysisUsage) -> Self {
        match self {
            CollaboratorError::Malformed { message, .. } => {
                CollaboratorError::Malformed { message, usage }
            }
            other => other,
        }
    }

    /// Tokens the provider billed for a failed call, when it told us.
    pub fn billed_usage(&self) -> AnalysisUsage {
        match self {
            CollaboratorError::Malformed { usage, .. } => *usage,
            _ => AnalysisUsage::default(),
        }
    }
}

/// Final error of a collaborator call after the retry budget was spent (or a permanent error hit).
#[derive(Debug, Clone, PartialEq)]
pub struct CallFailure {
    pub kind: CollaboratorKind,
    pub error: CollaboratorError,
    pub attempts: usize,
    /// Usage billed across every failed attempt.
    pub usage: AnalysisUsage,
}

impl From<CallFailure> for WatchError {
    fn from(failure: CallFailure) -> Self {
        let collaborator = failure.kind.to_string();
        match failure.error {
            CollaboratorError::Timeout(_) => WatchError::CollaboratorTimeout {
                collaborator,
                attempts: failure.attempts,
            },
            CollaboratorError::QuotaExceeded(message) => {
                WatchError::CollaboratorQuotaExceeded {
                    collaborator,
                    message,
                }
            }
            CollaboratorError::Malformed { message, .. }
                if failure.kind == CollaboratorKind::Analysis =>
            {
                WatchError::MalformedAssessment(message)
            }
            other => WatchError::CollaboratorFailure {
                collaborator,
                message: format!("{other} (after {} attempt(s))", failure.attempts),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Extra random delay as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// `delay_for_attempt` stretched by `unit * jitter`, where `unit` is in `[0, 1)`.
    pub fn delay_with_jitter(&self, attempt_index: usize, unit: f64) -> Duration {
        let base = self.delay_for_attempt(attempt_index);
        let unit = if unit.is_finite() { unit.clamp(0.0, 1.0) } else { 0.0 };
        base.mul_f64(1.0 + unit * self.jitter.max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: usize,
}

/// Run one collaborator call under a per-request timeout, retrying transient failures
/// with exponential backoff until `policy.max_attempts` is spent.
pub async fn call_with_retry<T, F, Fut>(
    kind: CollaboratorKind,
    policy: &BackoffPolicy,
    request_timeout: Duration,
    mut call: F,
) -> Result<Attempted<T>, CallFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollaboratorError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0usize;
    let mut usage = AnalysisUsage::default();
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(request_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout(request_timeout)),
        };
        if let Err(err) = &result {
            usage += err.billed_usage();
        }
        match result {
            Ok(value) => {
                return Ok(Attempted {
                    value,
                    attempts: attempt,
                })
            }
            Err(err)
                if err.disposition() == RetryDisposition::Retryable && attempt < max_attempts =>
            {
                let delay = policy.delay_with_jitter(attempt - 1, rand::rng().random::<f64>());
                warn!(
                    collaborator = %kind,
                    attempt = attempt as u64,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient collaborator failure; backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                return Err(CallFailure {
                    kind,
                    error,
                    attempts: attempt,
                    usage,
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub window: chrono::Duration,
    pub max_results: usize,
}

#[async_trait]
pub trait SearchCollaborator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Must return `QuotaExceeded` rather than an empty list when the provider refuses service.
    async fn search(&self, request: &SearchRequest) -> Result<Vec<Document>, CollaboratorError>;
}

#[async_trait]
pub trait AnalysisCollaborator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn analyze(
        &self,
        context: &MonitorContext,
        documents: &[Document],
    ) -> Result<Assessment, CollaboratorError>;
}

pub const ANALYST_SYSTEM_PROMPT: &str = r#"You are a cybersecurity threat analyst. Analyze the provided news articles and assess the threat level.

Respond only with JSON in the following format:
{
  "severity": "low|medium|high|critical",
  "confidence": 0.85,
  "title": "Brief threat title",
  "summary": "2-3 sentence summary of the threat",
  "key_threats": ["Threat 1", "Threat 2"],
  "attack_vectors": ["phishing", "malware"],
  "affected_sectors": ["healthcare", "finance"],
  "geographical_scope": ["US", "Europe"],
  "threat_actors": ["group name"],
  "source_relevance": [{"url": "https://...", "relevance_score": 0.9}],
  "recommendations": "Brief actionable recommendations"
}"#;

pub fn build_analysis_prompt(context: &MonitorContext, documents: &[Document]) -> String {
    let mut prompt = format!(
        "Analyze the following cybersecurity news articles related to \"{}\".\n",
        context.term
    );
    if let Some(description) = &context.description {
        prompt.push_str(&format!("Monitor description: {description}\n"));
    }
    if !context.keywords.is_empty() {
        prompt.push_str(&format!("Context keywords: {}\n", context.keywords.join(", ")));
    }
    prompt.push_str(
        "\nAssess the threat level, score each article's relevance, and provide a comprehensive analysis.\n\nARTICLES:\n",
    );
    for (i, doc) in documents.iter().take(PROMPT_DOCUMENT_LIMIT).enumerate() {
        let date = doc
            .published_at
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| "Unknown".to_string());
        prompt.push_str(&format!(
            "\n{}. {}\n   URL: {}\n   Source: {}\n   Date: {}\n   {}\n",
            i + 1,
            doc.title,
            doc.url,
            doc.domain,
            date,
            doc.snippet
        ));
    }
    prompt
}

#[derive(Debug, Deserialize)]
struct RawAssessment {
    severity: Option<String>,
    #[serde(alias = "confidence_score")]
    confidence: Option<f64>,
    title: Option<String>,
    summary: Option<String>,
    #[serde(default)]
    key_threats: Vec<String>,
    #[serde(default)]
    attack_vectors: Vec<String>,
    #[serde(default)]
    affected_sectors: Vec<String>,
    #[serde(default)]
    geographical_scope: Vec<String>,
    #[serde(default)]
    threat_actors: Vec<String>,
    #[serde(default)]
    source_relevance: Vec<RawRelevance>,
    #[serde(default)]
    recommendations: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct RawRelevance {
    url: String,
    #[serde(alias = "relevance")]
    relevance_score: f64,
}

/// Parse the analyst's JSON reply, tolerating surrounding prose. Missing or unknown severity,
/// a missing summary, or a missing confidence are all `Malformed`, never a default.
pub fn parse_assessment(text: &str, usage: AnalysisUsage) -> Result<Assessment, CollaboratorError> {
    parse_reply(text, usage).map_err(|e| e.with_usage(usage))
}

fn parse_reply(text: &str, usage: AnalysisUsage) -> Result<Assessment, CollaboratorError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => {
            return Err(CollaboratorError::malformed(
                "no JSON object in analysis reply",
            ))
        }
    };
    let raw: RawAssessment = serde_json::from_str(json)
        .map_err(|e| CollaboratorError::malformed(format!("invalid assessment JSON: {e}")))?;

    let severity = raw
        .severity
        .as_deref()
        .ok_or_else(|| CollaboratorError::malformed("missing severity"))?
        .parse::<Severity>()
        .map_err(|e| CollaboratorError::malformed(e.to_string()))?;
    let confidence_score = raw
        .confidence
        .ok_or_else(|| CollaboratorError::malformed("missing confidence"))?;
    let summary = raw
        .summary
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| CollaboratorError::malformed("missing summary"))?;
    let recommendations = match raw.recommendations {
        Some(JsonValue::String(s)) => Some(s),
        Some(JsonValue::Array(items)) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        ),
        _ => None,
    };

    let assessment = Assessment {
        title: raw.title,
        summary,
        severity,
        confidence_score,
        threat_indicators: ThreatIndicators {
            attack_vectors: raw.attack_vectors,
            affected_sectors: raw.affected_sectors,
            geographical_scope: raw.geographical_scope,
            threat_actors: raw.threat_actors,
            key_threats: raw.key_threats,
        },
        recommendations,
        source_relevance: raw
            .source_relevance
            .into_iter()
            .map(|r| SourceRelevance {
                url: r.url,
                relevance_score: r.relevance_score,
            })
            .collect(),
        usage,
    };
    assessment
        .validate()
        .map_err(|e| CollaboratorError::malformed(e.to_string()))?;
    Ok(assessment)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Search collaborator that replays a captured result set for every query.
#[derive(Debug, Clone)]
pub struct FixtureSearch {
    documents: Vec<Document>,
}

impl FixtureSearch {
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(read_json_file(path)?))
    }
}

#[async_trait]
impl SearchCollaborator for FixtureSearch {
    fn name(&self) -> &'static str {
        "fixture-search"
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Document>, CollaboratorError> {
        Ok(self
            .documents
            .iter()
            .take(request.max_results.max(1))
            .cloned()
            .collect())
    }
}

/// Analysis collaborator that replays a captured reply, parsed through the same path as live replies.
#[derive(Debug, Clone)]
pub struct FixtureAnalysis {
    reply: String,
}

impl FixtureAnalysis {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reply =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Ok(Self::new(reply))
    }
}

#[async_trait]
impl AnalysisCollaborator for FixtureAnalysis {
    fn name(&self) -> &'static str {
        "fixture-analysis"
    }

    async fn analyze(
        &self,
        _context: &MonitorContext,
        _documents: &[Document],
    ) -> Result<Assessment, CollaboratorError> {
        parse_assessment(&self.reply, AnalysisUsage::default())
    }
}

/// Load `search.json` and `assessment.json` from a fixture directory.
pub fn load_fixture_collaborators(dir: impl AsRef<Path>) -> Result<(FixtureSearch, FixtureAnalysis)> {
    let dir = dir.as_ref();
    let search = FixtureSearch::from_file(dir.join("search.json"))?;
    let analysis = FixtureAnalysis::from_file(dir.join("assessment.json"))?;
    Ok((search, analysis))
}
