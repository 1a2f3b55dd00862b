use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;
use tw_adapters::{
    load_fixture_collaborators, AnalysisCollaborator, BackoffPolicy, ChatAnalysisClient,
    GoogleSearchClient, HttpClientConfig, SearchCollaborator,
};
use tw_core::{NewMonitor, SubscriptionTier};

use crate::cost::CostRates;
use crate::dedup::DedupConfig;
use crate::scan::{FilterSettings, ScanSettings};
use crate::scheduler::SchedulerSettings;

#[derive(Debug, Clone, Default)]
pub struct CollaboratorConfig {
    pub fixtures_dir: Option<PathBuf>,
    pub google_api_key: Option<String>,
    pub google_cse_id: Option<String>,
    pub search_endpoint: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub tick_interval: Duration,
    pub worker_pool: usize,
    pub lease_ttl: chrono::Duration,
    pub cleanup_cron: String,
    pub stats_cron: String,
    pub dedup_lookback: chrono::Duration,
    pub similarity_threshold: f64,
    pub max_batch: usize,
    pub search_results: usize,
    pub min_snippet_chars: usize,
    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub default_tier: SubscriptionTier,
    pub cost_rates: CostRates,
    pub collaborators: CollaboratorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            tick_interval: Duration::from_secs(300),
            worker_pool: 4,
            lease_ttl: chrono::Duration::seconds(900),
            cleanup_cron: "0 0 2 * * *".to_string(),
            stats_cron: "0 0 * * * *".to_string(),
            dedup_lookback: chrono::Duration::hours(72),
            similarity_threshold: 0.6,
            max_batch: 10,
            search_results: 10,
            min_snippet_chars: 50,
            request_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            default_tier: SubscriptionTier::Free,
            cost_rates: CostRates::default(),
            collaborators: CollaboratorConfig {
                llm_model: "gpt-4o".to_string(),
                ..Default::default()
            },
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env_opt(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparseable setting");
                default
            }
        },
        None => default,
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let default_tier = env_opt("TW_DEFAULT_TIER")
            .and_then(|raw| match raw.parse::<SubscriptionTier>() {
                Ok(tier) => Some(tier),
                Err(err) => {
                    warn!(error = %err, "ignoring TW_DEFAULT_TIER");
                    None
                }
            })
            .unwrap_or(defaults.default_tier);
        Self {
            database_url: env_opt("DATABASE_URL"),
            tick_interval: Duration::from_secs(env_parse("TW_TICK_SECS", 300)),
            worker_pool: env_parse("TW_WORKER_POOL", defaults.worker_pool),
            lease_ttl: chrono::Duration::seconds(env_parse("TW_LEASE_TTL_SECS", 900)),
            cleanup_cron: env_opt("TW_CLEANUP_CRON").unwrap_or(defaults.cleanup_cron),
            stats_cron: env_opt("TW_STATS_CRON").unwrap_or(defaults.stats_cron),
            dedup_lookback: chrono::Duration::hours(env_parse("TW_DEDUP_LOOKBACK_HOURS", 72)),
            similarity_threshold: env_parse("TW_SIMILARITY_THRESHOLD", defaults.similarity_threshold),
            max_batch: env_parse("TW_MAX_BATCH", defaults.max_batch),
            search_results: env_parse("TW_SEARCH_RESULTS", defaults.search_results),
            min_snippet_chars: env_parse("TW_MIN_SNIPPET_CHARS", defaults.min_snippet_chars),
            request_timeout: Duration::from_secs(env_parse("TW_REQUEST_TIMEOUT_SECS", 30)),
            backoff: BackoffPolicy {
                max_attempts: env_parse("TW_RETRY_ATTEMPTS", defaults.backoff.max_attempts),
                base_delay: Duration::from_millis(env_parse("TW_RETRY_BASE_MS", 500)),
                max_delay: Duration::from_millis(env_parse("TW_RETRY_MAX_MS", 8000)),
                jitter: defaults.backoff.jitter,
            },
            default_tier,
            cost_rates: CostRates {
                per_search_query: env_parse(
                    "TW_COST_PER_SEARCH_QUERY",
                    defaults.cost_rates.per_search_query,
                ),
                per_input_token: env_parse(
                    "TW_COST_PER_1M_INPUT_TOKENS",
                    defaults.cost_rates.per_input_token * 1_000_000.0,
                ) / 1_000_000.0,
                per_output_token: env_parse(
                    "TW_COST_PER_1M_OUTPUT_TOKENS",
                    defaults.cost_rates.per_output_token * 1_000_000.0,
                ) / 1_000_000.0,
            },
            collaborators: CollaboratorConfig {
                fixtures_dir: env_opt("TW_FIXTURES_DIR").map(PathBuf::from),
                google_api_key: env_opt("GOOGLE_API_KEY"),
                google_cse_id: env_opt("GOOGLE_CSE_ID"),
                search_endpoint: env_opt("TW_SEARCH_ENDPOINT"),
                llm_api_key: env_opt("LLM_API_KEY"),
                llm_model: env_opt("LLM_MODEL").unwrap_or(defaults.collaborators.llm_model),
                llm_endpoint: env_opt("LLM_ENDPOINT"),
            },
        }
    }

    /// Startup checks. Any error here is fatal for the process.
    pub fn validate(&self) -> Result<()> {
        if self.worker_pool == 0 {
            bail!("TW_WORKER_POOL must be at least 1");
        }
        if self.tick_interval.is_zero() {
            bail!("TW_TICK_SECS must be at least 1");
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            bail!(
                "TW_SIMILARITY_THRESHOLD must be in (0, 1], got {}",
                self.similarity_threshold
            );
        }
        if self.max_batch == 0 || self.search_results == 0 {
            bail!("TW_MAX_BATCH and TW_SEARCH_RESULTS must be at least 1");
        }
        if self.backoff.max_attempts == 0 {
            bail!("TW_RETRY_ATTEMPTS must be at least 1");
        }
        if self.lease_ttl <= chrono::Duration::zero() {
            bail!("TW_LEASE_TTL_SECS must be positive");
        }
        let rates = &self.cost_rates;
        if [rates.per_search_query, rates.per_input_token, rates.per_output_token]
            .iter()
            .any(|rate| !rate.is_finite() || *rate < 0.0)
        {
            bail!("TW_COST_* rates must be finite and non-negative");
        }
        if self.collaborators.fixtures_dir.is_none() {
            let c = &self.collaborators;
            let missing = [
                ("GOOGLE_API_KEY", c.google_api_key.is_none()),
                ("GOOGLE_CSE_ID", c.google_cse_id.is_none()),
                ("LLM_API_KEY", c.llm_api_key.is_none()),
            ]
            .into_iter()
            .filter(|(_, missing)| *missing)
            .map(|(key, _)| key)
            .collect::<Vec<_>>();
            if !missing.is_empty() {
                bail!(
                    "missing collaborator credentials: {} (set TW_FIXTURES_DIR for offline runs)",
                    missing.join(", ")
                );
            }
        }
        Ok(())
    }

    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            filter: FilterSettings {
                max_batch: self.max_batch,
                min_snippet_chars: self.min_snippet_chars,
            },
            search_results: self.search_results,
            request_timeout: self.request_timeout,
            backoff: self.backoff,
            dedup_lookback: self.dedup_lookback,
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            similarity_threshold: self.similarity_threshold,
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            tick_interval: self.tick_interval,
            worker_pool: self.worker_pool,
            lease_ttl: self.lease_ttl,
            cleanup_cron: self.cleanup_cron.clone(),
            stats_cron: self.stats_cron.clone(),
        }
    }

    /// Fixture-backed collaborators when `TW_FIXTURES_DIR` is set, HTTP clients otherwise.
    pub fn build_collaborators(
        &self,
    ) -> Result<(Arc<dyn SearchCollaborator>, Arc<dyn AnalysisCollaborator>)> {
        let c = &self.collaborators;
        if let Some(dir) = &c.fixtures_dir {
            let (search, analysis) = load_fixture_collaborators(dir)
                .with_context(|| format!("loading fixtures from {}", dir.display()))?;
            return Ok((Arc::new(search), Arc::new(analysis)));
        }
        let (Some(api_key), Some(cse_id), Some(llm_key)) =
            (&c.google_api_key, &c.google_cse_id, &c.llm_api_key)
        else {
            bail!("collaborator credentials are not configured");
        };
        let http = HttpClientConfig {
            timeout: self.request_timeout,
            concurrency: self.worker_pool.max(1) * 2,
            ..HttpClientConfig::default()
        };
        let search = GoogleSearchClient::new(&http, api_key, cse_id, c.search_endpoint.clone())?;
        let analysis =
            ChatAnalysisClient::new(&http, llm_key, c.llm_model.clone(), c.llm_endpoint.clone())?;
        Ok((Arc::new(search), Arc::new(analysis)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedFile {
    pub monitors: Vec<SeedMonitor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedMonitor {
    pub owner_id: String,
    #[serde(flatten)]
    pub settings: NewMonitor,
}

pub async fn load_seed_file(path: impl AsRef<Path>) -> Result<SeedFile> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
