use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use tw_core::{normalize_domain, AnalysisUsage, Assessment, Document, MonitorContext};

use crate::{
    build_analysis_prompt, parse_assessment, AnalysisCollaborator, CollaboratorError,
    SearchCollaborator, SearchRequest, ANALYST_SYSTEM_PROMPT,
};

pub const DEFAULT_SEARCH_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";
pub const DEFAULT_CHAT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// The search API returns at most this many results per page.
const SEARCH_PAGE_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("threatwatch/{}", env!("CARGO_PKG_VERSION"))),
            concurrency: 8,
        }
    }
}

#[derive(Debug, Clone)]
struct HttpCore {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    timeout: Duration,
}

impl HttpCore {
    fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            timeout: config.timeout,
        })
    }

    fn map_send_error(&self, err: reqwest::Error) -> CollaboratorError {
        if err.is_timeout() {
            CollaboratorError::Timeout(self.timeout)
        } else if err.is_connect() {
            CollaboratorError::Unavailable {
                status: 0,
                message: err.to_string(),
            }
        } else {
            CollaboratorError::Request(err.to_string())
        }
    }

    async fn send_json(&self, request: reqwest::RequestBuilder) -> Result<JsonValue, CollaboratorError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|e| CollaboratorError::Request(e.to_string()))?;
        let response = request.send().await.map_err(|e| self.map_send_error(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_send_error(e))?;
        if !status.is_success() {
            return Err(classify_failure(status, &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| CollaboratorError::malformed(format!("response is not JSON: {e}")))
    }
}

/// Map a non-success provider response to a collaborator error. Exhausted daily quotas are
/// separated from short-term throttling so callers never retry into a closed quota.
pub fn classify_failure(status: StatusCode, body: &str) -> CollaboratorError {
    let lower = body.to_ascii_lowercase();
    let quota_exhausted = lower.contains("dailylimitexceeded")
        || lower.contains("insufficient_quota")
        || lower.contains("quota exceeded")
        || lower.contains("per day");
    let message = format!("{status}: {}", truncate(body, 200));
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::FORBIDDEN if quota_exhausted => {
            CollaboratorError::QuotaExceeded(message)
        }
        StatusCode::TOO_MANY_REQUESTS => CollaboratorError::RateLimited(message),
        StatusCode::FORBIDDEN if lower.contains("ratelimitexceeded") => {
            CollaboratorError::RateLimited(message)
        }
        s if s.is_server_error() => CollaboratorError::Unavailable {
            status: s.as_u16(),
            message,
        },
        _ => CollaboratorError::Request(message),
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Flatten an HTML fragment to whitespace-normalized text.
pub fn html_to_text(fragment: &str) -> String {
    let html = scraper::Html::parse_fragment(fragment);
    let text = html.root_element().text().collect::<Vec<_>>().join(" ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItem {
    #[serde(default)]
    title: String,
    link: String,
    #[serde(default)]
    display_link: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    html_snippet: Option<String>,
    #[serde(default)]
    pagemap: Option<JsonValue>,
}

impl SearchItem {
    fn published_at(&self) -> Option<DateTime<Utc>> {
        let metatags = self.pagemap.as_ref()?.get("metatags")?.as_array()?;
        metatags.iter().find_map(|tags| {
            ["article:published_time", "og:updated_time", "date"]
                .iter()
                .find_map(|key| tags.get(*key)?.as_str())
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|dt| dt.with_timezone(&Utc))
        })
    }

    fn into_document(self) -> Option<Document> {
        let domain = Url::parse(&self.link)
            .ok()
            .and_then(|u| u.host_str().map(normalize_domain))
            .or_else(|| self.display_link.as_deref().map(normalize_domain))?;
        let published_at = self.published_at();
        let snippet = match (&self.html_snippet, &self.snippet) {
            (Some(html), _) if !html.trim().is_empty() => html_to_text(html),
            (_, Some(plain)) => plain.split_whitespace().collect::<Vec<_>>().join(" "),
            _ => String::new(),
        };
        Some(Document {
            title: html_to_text(&self.title),
            url: self.link,
            domain,
            snippet,
            published_at,
        })
    }
}

fn documents_from_search_response(value: JsonValue) -> Result<Vec<Document>, CollaboratorError> {
    let response: SearchResponse = serde_json::from_value(value)
        .map_err(|e| CollaboratorError::malformed(format!("unexpected search payload: {e}")))?;
    Ok(response
        .items
        .into_iter()
        .filter_map(SearchItem::into_document)
        .collect())
}

/// Restrict results to the last `n` days; the API has no finer granularity.
fn date_restrict(window: chrono::Duration) -> String {
    let hours = window.num_hours().max(1);
    let days = (hours + 23) / 24;
    format!("d{days}")
}

#[derive(Debug, Clone)]
pub struct GoogleSearchClient {
    http: HttpCore,
    api_key: String,
    engine_id: String,
    endpoint: String,
}

impl GoogleSearchClient {
    pub fn new(
        config: &HttpClientConfig,
        api_key: impl Into<String>,
        engine_id: impl Into<String>,
        endpoint: Option<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpCore::new(config)?,
            api_key: api_key.into(),
            engine_id: engine_id.into(),
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_SEARCH_ENDPOINT.to_string()),
        })
    }
}

#[async_trait]
impl SearchCollaborator for GoogleSearchClient {
    fn name(&self) -> &'static str {
        "google-custom-search"
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Document>, CollaboratorError> {
        let num = request.max_results.clamp(1, SEARCH_PAGE_LIMIT).to_string();
        let restrict = date_restrict(request.window);
        let builder = self.http.client.get(&self.endpoint).query(&[
            ("key", self.api_key.as_str()),
            ("cx", self.engine_id.as_str()),
            ("q", request.query.as_str()),
            ("num", num.as_str()),
            ("dateRestrict", restrict.as_str()),
            ("sort", "date"),
        ]);
        let span = info_span!("search_request", query = %request.query, date_restrict = %restrict);
        let payload = self.http.send_json(builder).instrument(span).await?;
        let documents = documents_from_search_response(payload)?;
        debug!(results = documents.len(), "search returned");
        Ok(documents)
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn assessment_from_chat_response(value: JsonValue) -> Result<Assessment, CollaboratorError> {
    let response: ChatResponse = serde_json::from_value(value)
        .map_err(|e| CollaboratorError::malformed(format!("unexpected chat payload: {e}")))?;
    let usage = response
        .usage
        .map(|u| AnalysisUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();
    let content = response
        .choices
        .into_iter()
        .find_map(|c| c.message.content)
        .ok_or_else(|| CollaboratorError::malformed("chat reply has no content").with_usage(usage))?;
    parse_assessment(&content, usage)
}

/// Analysis collaborator speaking the OpenAI-compatible chat completions protocol.
#[derive(Debug, Clone)]
pub struct ChatAnalysisClient {
    http: HttpCore,
    api_key: String,
    model: String,
    endpoint: String,
}

impl ChatAnalysisClient {
    pub fn new(
        config: &HttpClientConfig,
        api_key: impl Into<String>,
        model: impl Into<String>,
        endpoint: Option<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpCore::new(config)?,
            api_key: api_key.into(),
            model: model.into(),
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_CHAT_ENDPOINT.to_string()),
        })
    }
}

#[async_trait]
impl AnalysisCollaborator for ChatAnalysisClient {
    fn name(&self) -> &'static str {
        "chat-analysis"
    }

    async fn analyze(
        &self,
        context: &MonitorContext,
        documents: &[Document],
    ) -> Result<Assessment, CollaboratorError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": ANALYST_SYSTEM_PROMPT},
                {"role": "user", "content": build_analysis_prompt(context, documents)},
            ],
            "temperature": 0.2,
            "max_tokens": 1500,
            "response_format": {"type": "json_object"},
        });
        let builder = self
            .http
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body);
        let span = info_span!("analysis_request", monitor_id = %context.monitor_id, model = %self.model);
        let payload = self.http.send_json(builder).instrument(span).await?;
        let assessment = assessment_from_chat_response(payload)?;
        debug!(
            severity = %assessment.severity,
            tokens = assessment.usage.total_tokens(),
            "analysis returned"
        );
        Ok(assessment)
    }
}
