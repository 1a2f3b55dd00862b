//! One scan attempt for one monitor: query, fetch, filter, analyze, gate, dedup, persist.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, info, info_span, warn, Instrument};
use tw_adapters::{
    call_with_retry, AnalysisCollaborator, BackoffPolicy, CollaboratorKind, SearchCollaborator,
    SearchRequest,
};
use tw_core::{Alert, Document, Monitor, ScanRecord, Severity, WatchError, MAX_JITTER_FRACTION};
use tw_storage::{ScanCompletion, WatchStore};
use uuid::Uuid;

use crate::cost::{CostRates, CostTracker};
use crate::dedup::{DedupDecision, Deduplicator};

/// Query terms beyond this count are dropped to keep provider queries short.
const MAX_QUERY_TERMS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSettings {
    pub max_batch: usize,
    pub min_snippet_chars: usize,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            max_batch: 10,
            min_snippet_chars: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub filter: FilterSettings,
    pub search_results: usize,
    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub dedup_lookback: chrono::Duration,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            filter: FilterSettings::default(),
            search_results: 10,
            request_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            dedup_lookback: chrono::Duration::hours(72),
        }
    }
}

fn quote(term: &str) -> String {
    if term.contains(char::is_whitespace) {
        format!("\"{term}\"")
    } else {
        term.to_string()
    }
}

/// `term (kw1 OR kw2 OR kw3) -ex1 -ex2`, each list capped at three entries.
pub fn build_query(monitor: &Monitor) -> String {
    let mut query = monitor.term.clone();
    if !monitor.keywords.is_empty() {
        let any = monitor
            .keywords
            .iter()
            .take(MAX_QUERY_TERMS)
            .map(|k| quote(k))
            .collect::<Vec<_>>()
            .join(" OR ");
        query.push_str(&format!(" ({any})"));
    }
    for exclude in monitor.exclude_keywords.iter().take(MAX_QUERY_TERMS) {
        query.push_str(&format!(" -{}", quote(exclude)));
    }
    query
}

fn required_terms(monitor: &Monitor) -> Vec<String> {
    if monitor.keywords.is_empty() {
        monitor
            .term
            .split_whitespace()
            .filter(|w| w.chars().count() > 2)
            .map(str::to_lowercase)
            .collect()
    } else {
        monitor.keywords.iter().map(|k| k.to_lowercase()).collect()
    }
}

/// Keep documents that mention a required term, mention no excluded term, fall inside the
/// recency window, and carry a usable snippet. URLs are de-duplicated and the batch is capped.
pub fn filter_documents(
    monitor: &Monitor,
    documents: Vec<Document>,
    now: DateTime<Utc>,
    settings: FilterSettings,
) -> Vec<Document> {
    let required = required_terms(monitor);
    let excluded = monitor
        .exclude_keywords
        .iter()
        .map(|k| k.to_lowercase())
        .collect::<Vec<_>>();
    let oldest = now - monitor.frequency.recency_window();
    let mut seen = HashSet::new();
    let mut kept = Vec::new();

    for doc in documents {
        if kept.len() >= settings.max_batch {
            break;
        }
        if doc.snippet.trim().chars().count() < settings.min_snippet_chars {
            continue;
        }
        if doc.published_at.is_some_and(|published| published < oldest) {
            continue;
        }
        let text = doc.searchable_text();
        if !required.is_empty() && !required.iter().any(|t| text.contains(t.as_str())) {
            continue;
        }
        if excluded.iter().any(|t| text.contains(t.as_str())) {
            continue;
        }
        if !seen.insert(doc.url.clone()) {
            continue;
        }
        kept.push(doc);
    }
    kept
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    AlertCreated { alert_id: Uuid },
    Merged { alert_id: Uuid, sources_added: usize },
    BelowThreshold { severity: Severity },
    NoCandidates,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ScanReport {
    pub record: ScanRecord,
    pub outcome: ScanOutcome,
    pub last_scan: DateTime<Utc>,
    pub next_scan: DateTime<Utc>,
    /// False when the monitor was deleted while the scan ran.
    pub monitor_updated: bool,
}

pub struct ScanOrchestrator {
    store: Arc<dyn WatchStore>,
    search: Arc<dyn SearchCollaborator>,
    analysis: Arc<dyn AnalysisCollaborator>,
    dedup: Arc<dyn Deduplicator>,
    settings: ScanSettings,
    rates: CostRates,
}

impl ScanOrchestrator {
    pub fn new(
        store: Arc<dyn WatchStore>,
        search: Arc<dyn SearchCollaborator>,
        analysis: Arc<dyn AnalysisCollaborator>,
        dedup: Arc<dyn Deduplicator>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            store,
            search,
            analysis,
            dedup,
            settings,
            rates: CostRates::default(),
        }
    }

    pub fn with_rates(mut self, rates: CostRates) -> Self {
        self.rates = rates;
        self
    }

    /// Run one attempt. Collaborator and pipeline failures end up in the scan record; only a
    /// failure to persist the record itself is returned as an error.
    pub async fn run_scan(&self, monitor: &Monitor) -> Result<ScanReport, WatchError> {
        let span = info_span!("scan", monitor_id = %monitor.id, term = %monitor.term);
        self.run_scan_inner(monitor).instrument(span).await
    }

    async fn run_scan_inner(&self, monitor: &Monitor) -> Result<ScanReport, WatchError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut record = ScanRecord::begin(monitor, started_at);
        let mut costs = CostTracker::new(self.rates);

        let outcome = match self.execute(monitor, started_at, &mut record, &mut costs).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "scan attempt failed");
                record.push_error(&err);
                ScanOutcome::Failed
            }
        };
        record.api_costs = costs.finish();
        record.duration_secs = clock.elapsed().as_secs_f64();

        let last_scan = Utc::now();
        let jitter = rand::rng().random_range(0.0..=MAX_JITTER_FRACTION);
        let next_scan = monitor.frequency.next_scan_after(last_scan, jitter);

        self.store
            .insert_scan_record(&record)
            .await
            .map_err(WatchError::storage)?;
        let monitor_updated = self
            .store
            .record_scan_completion(
                monitor.id,
                ScanCompletion {
                    last_scan,
                    next_scan,
                    alerts_created: u64::from(record.alerts_generated),
                },
            )
            .await
            .map_err(WatchError::storage)?;
        if !monitor_updated {
            debug!("monitor removed during scan; schedule not advanced");
        }

        info!(
            outcome = ?outcome,
            fetched = record.articles_fetched,
            processed = record.articles_processed,
            alerts = record.alerts_generated,
            cost = record.api_costs.total_cost,
            duration_secs = record.duration_secs,
            %next_scan,
            "scan finished"
        );
        Ok(ScanReport {
            record,
            outcome,
            last_scan,
            next_scan,
            monitor_updated,
        })
    }

    async fn execute(
        &self,
        monitor: &Monitor,
        now: DateTime<Utc>,
        record: &mut ScanRecord,
        costs: &mut CostTracker,
    ) -> Result<ScanOutcome, WatchError> {
        let request = SearchRequest {
            query: build_query(monitor),
            window: monitor.frequency.recency_window(),
            max_results: self.settings.search_results,
        };
        record.query = request.query.clone();

        let fetched = match call_with_retry(
            CollaboratorKind::Search,
            &self.settings.backoff,
            self.settings.request_timeout,
            || self.search.search(&request),
        )
        .await
        {
            Ok(fetched) => fetched,
            Err(failure) => {
                costs.record_search(failure.attempts, 0);
                return Err(failure.into());
            }
        };
        costs.record_search(fetched.attempts, fetched.value.len());
        record.articles_fetched = fetched.value.len() as u32;

        let candidates = filter_documents(monitor, fetched.value, now, self.settings.filter);
        record.articles_processed = candidates.len() as u32;
        if candidates.is_empty() {
            debug!("no candidates survived filtering");
            return Ok(ScanOutcome::NoCandidates);
        }

        let context = monitor.context();
        let assessment = match call_with_retry(
            CollaboratorKind::Analysis,
            &self.settings.backoff,
            self.settings.request_timeout,
            || self.analysis.analyze(&context, &candidates),
        )
        .await
        {
            Ok(attempted) => attempted.value,
            Err(failure) => {
                costs.record_analysis(failure.usage);
                return Err(failure.into());
            }
        };
        costs.record_analysis(assessment.usage);
        assessment.validate()?;

        if !assessment.severity.meets(monitor.severity_threshold) {
            debug!(
                severity = %assessment.severity,
                threshold = %monitor.severity_threshold,
                "assessment below threshold"
            );
            return Ok(ScanOutcome::BelowThreshold {
                severity: assessment.severity,
            });
        }

        let candidate = Alert::from_assessment(monitor, &assessment, &candidates, now);
        let recent = self
            .store
            .alerts_for_monitor_since(monitor.id, now - self.settings.dedup_lookback)
            .await
            .map_err(WatchError::storage)?;

        match self.dedup.check(&candidate, &recent) {
            DedupDecision::Duplicate { alert_id, reason } => {
                let mut existing = recent
                    .into_iter()
                    .find(|a| a.id == alert_id)
                    .ok_or_else(|| WatchError::alert_not_found(alert_id))?;
                let sources_added = existing.merge_sources(&candidate.sources);
                if sources_added > 0 {
                    self.store
                        .replace_alert_sources(alert_id, &existing.sources, Utc::now())
                        .await
                        .map_err(WatchError::storage)?;
                }
                record.duplicates_merged = 1;
                info!(%alert_id, ?reason, sources_added, "merged into existing alert");
                Ok(ScanOutcome::Merged {
                    alert_id,
                    sources_added,
                })
            }
            DedupDecision::Unique => {
                self.store
                    .insert_alert(&candidate)
                    .await
                    .map_err(WatchError::storage)?;
                record.alerts_generated = 1;
                info!(
                    alert_id = %candidate.id,
                    severity = %candidate.severity,
                    confidence = candidate.confidence_score,
                    "alert created"
                );
                Ok(ScanOutcome::AlertCreated {
                    alert_id: candidate.id,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tw_core::{Frequency, NewMonitor};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap()
    }

    fn monitor(keywords: &[&str], excludes: &[&str]) -> Monitor {
        Monitor::new(
            "owner",
            NewMonitor {
                term: "ransomware healthcare".into(),
                description: None,
                keywords: keywords.iter().map(|s| s.to_string()).collect(),
                exclude_keywords: excludes.iter().map(|s| s.to_string()).collect(),
                frequency: Frequency::Daily,
                severity_threshold: Severity::Medium,
            },
            now(),
        )
        .unwrap()
    }

    fn doc(url: &str, snippet: &str, age_hours: i64) -> Document {
        Document {
            title: "Security news".into(),
            url: url.into(),
            domain: "news.example".into(),
            snippet: snippet.into(),
            published_at: Some(now() - chrono::Duration::hours(age_hours)),
        }
    }

    #[test]
    fn query_caps_keywords_and_quotes_phrases() {
        let m = monitor(
            &["hospital", "health system", "clinic", "pharmacy"],
            &["job posting", "webinar", "course", "podcast"],
        );
        assert_eq!(
            build_query(&m),
            "ransomware healthcare (hospital OR \"health system\" OR clinic) -\"job posting\" -webinar -course"
        );
        assert_eq!(build_query(&monitor(&[], &[])), "ransomware healthcare");
    }

    #[test]
    fn filter_applies_keywords_exclusions_age_and_length() {
        let m = monitor(&["hospital"], &["webinar"]);
        let long = |extra: &str| {
            format!("A hospital was hit by ransomware overnight and diverted ambulances {extra}")
        };
        let docs = vec![
            doc("https://a/1", &long(""), 1),
            doc("https://a/1", &long("again"), 1),
            doc("https://a/2", "hospital hit", 1),
            doc("https://a/3", &long("join our webinar"), 1),
            doc("https://a/4", &long("old news"), 48),
            doc(
                "https://a/5",
                "A clinic was hit by ransomware overnight and diverted ambulances",
                1,
            ),
            Document {
                published_at: None,
                ..doc("https://a/6", &long("undated"), 0)
            },
        ];
        let kept = filter_documents(&m, docs, now(), FilterSettings::default());
        let urls = kept.iter().map(|d| d.url.as_str()).collect::<Vec<_>>();
        assert_eq!(urls, vec!["https://a/1", "https://a/6"]);
    }

    #[test]
    fn term_words_stand_in_for_missing_keywords() {
        let m = monitor(&[], &[]);
        let docs = vec![
            doc("https://a/1", "Healthcare providers brace for another difficult quarter of budgets", 1),
            doc("https://a/2", "Local bakery wins award for the best sourdough loaf in the county", 1),
        ];
        let kept = filter_documents(&m, docs, now(), FilterSettings::default());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].url, "https://a/1");
    }

    #[test]
    fn batch_is_capped() {
        let m = monitor(&["hospital"], &[]);
        let docs = (0..20)
            .map(|i| {
                doc(
                    &format!("https://a/{i}"),
                    "A hospital was hit by ransomware overnight and diverted ambulances",
                    1,
                )
            })
            .collect();
        let kept = filter_documents(
            &m,
            docs,
            now(),
            FilterSettings {
                max_batch: 4,
                min_snippet_chars: 50,
            },
        );
        assert_eq!(kept.len(), 4);
    }
}
