use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tw_adapters::{
    AnalysisCollaborator, BackoffPolicy, CollaboratorError, SearchCollaborator, SearchRequest,
};
use tw_core::{
    Alert, AlertSource, AlertStatus, AnalysisUsage, Assessment, Document, Frequency, Monitor,
    MonitorContext, MonitorUpdate, NewMonitor, Severity, SubscriptionTier, ThreatIndicators,
    WatchError,
};
use tw_engine::{
    AlertLifecycle, CostRates, DedupConfig, HeuristicDeduplicator, ScanOrchestrator, ScanOutcome,
    ScanSettings, Scheduler, SchedulerSettings, StaticTierResolver, WatchService,
};
use tw_storage::{
    AlertQuery, AlertStore, LeaseManager, MemoryLeases, MemoryStore, MonitorStore, ScanRecordStore,
};

const OWNER: &str = "analyst-1";

fn doc(url: &str, domain: &str, mentions_hospital: bool) -> Document {
    let snippet = if mentions_hospital {
        "Emergency rooms at the hospital diverted ambulances after ransomware encrypted records"
    } else {
        "Regional utility reports quarterly results and announces a new billing platform rollout"
    };
    Document {
        title: format!("Report {url}"),
        url: url.to_string(),
        domain: domain.to_string(),
        snippet: snippet.to_string(),
        published_at: Some(Utc::now() - chrono::Duration::hours(1)),
    }
}

fn first_batch() -> Vec<Document> {
    (0..10)
        .map(|i| {
            let domain = if i % 2 == 0 {
                "healthnews.example"
            } else {
                "securitywire.example"
            };
            doc(&format!("https://{domain}/a/{i}"), domain, i < 6)
        })
        .collect()
}

fn assessment(severity: Severity, title: &str, summary: &str) -> Assessment {
    Assessment {
        title: Some(title.to_string()),
        summary: summary.to_string(),
        severity,
        confidence_score: 0.87,
        threat_indicators: ThreatIndicators {
            attack_vectors: vec!["phishing".into()],
            ..Default::default()
        },
        recommendations: Some("Isolate affected systems".into()),
        source_relevance: Vec::new(),
        usage: AnalysisUsage {
            input_tokens: 1_500,
            output_tokens: 300,
        },
    }
}

#[derive(Default)]
struct ScriptedSearch {
    script: Mutex<VecDeque<Result<Vec<Document>, CollaboratorError>>>,
    fallback: Vec<Document>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: Mutex<HashMap<String, usize>>,
    max_per_query: AtomicUsize,
    total_in_flight: AtomicUsize,
    max_total: AtomicUsize,
}

impl ScriptedSearch {
    fn returning(documents: Vec<Document>) -> Self {
        Self {
            fallback: documents,
            ..Default::default()
        }
    }

    fn then(self, result: Result<Vec<Document>, CollaboratorError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchCollaborator for ScriptedSearch {
    fn name(&self) -> &'static str {
        "scripted-search"
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Document>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let slot = in_flight.entry(request.query.clone()).or_insert(0);
            *slot += 1;
            self.max_per_query.fetch_max(*slot, Ordering::SeqCst);
        }
        let total = self.total_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_total.fetch_max(total, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.total_in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(slot) = self.in_flight.lock().unwrap().get_mut(&request.query) {
            *slot -= 1;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

/// Never answers inside any sane request timeout.
struct HangingSearch {
    calls: AtomicUsize,
}

#[async_trait]
impl SearchCollaborator for HangingSearch {
    fn name(&self) -> &'static str {
        "hanging-search"
    }

    async fn search(&self, _request: &SearchRequest) -> Result<Vec<Document>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }
}

struct ScriptedAnalysis {
    replies: Mutex<VecDeque<Result<Assessment, CollaboratorError>>>,
    last: Result<Assessment, CollaboratorError>,
    calls: AtomicUsize,
    seen_documents: Mutex<Vec<usize>>,
}

impl ScriptedAnalysis {
    fn always(reply: Result<Assessment, CollaboratorError>) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            last: reply,
            calls: AtomicUsize::new(0),
            seen_documents: Mutex::new(Vec::new()),
        }
    }

    fn sequence(mut replies: Vec<Assessment>) -> Self {
        let last = replies.pop().map(Ok).unwrap_or_else(|| {
            Err(CollaboratorError::malformed("no scripted reply"))
        });
        let mut analysis = Self::always(last);
        analysis.replies = Mutex::new(replies.into_iter().map(Ok).collect());
        analysis
    }
}

#[async_trait]
impl AnalysisCollaborator for ScriptedAnalysis {
    fn name(&self) -> &'static str {
        "scripted-analysis"
    }

    async fn analyze(
        &self,
        _context: &MonitorContext,
        documents: &[Document],
    ) -> Result<Assessment, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_documents.lock().unwrap().push(documents.len());
        let next = self.replies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.last.clone())
    }
}

fn fast_settings() -> ScanSettings {
    ScanSettings {
        request_timeout: Duration::from_millis(500),
        backoff: BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        },
        ..ScanSettings::default()
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    leases: Arc<MemoryLeases>,
    orchestrator: Arc<ScanOrchestrator>,
    scheduler: Scheduler,
    service: WatchService,
}

fn harness(
    search: Arc<dyn SearchCollaborator>,
    analysis: Arc<dyn AnalysisCollaborator>,
    settings: ScanSettings,
    worker_pool: usize,
) -> Harness {
    harness_with_scheduler(
        search,
        analysis,
        settings,
        SchedulerSettings {
            worker_pool,
            ..SchedulerSettings::default()
        },
    )
}

fn harness_with_scheduler(
    search: Arc<dyn SearchCollaborator>,
    analysis: Arc<dyn AnalysisCollaborator>,
    settings: ScanSettings,
    scheduler_settings: SchedulerSettings,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let leases = Arc::new(MemoryLeases::new());
    let orchestrator = Arc::new(ScanOrchestrator::new(
        store.clone(),
        search,
        analysis,
        Arc::new(HeuristicDeduplicator::new(DedupConfig::default())),
        settings,
    ));
    let lifecycle = Arc::new(AlertLifecycle::new(
        store.clone(),
        Arc::new(StaticTierResolver::new(SubscriptionTier::Free)),
    ));
    let scheduler = Scheduler::new(
        store.clone(),
        leases.clone(),
        orchestrator.clone(),
        lifecycle.clone(),
        scheduler_settings,
    );
    let service = WatchService::new(
        store.clone(),
        leases.clone(),
        orchestrator.clone(),
        lifecycle,
        chrono::Duration::minutes(15),
    );
    Harness {
        store,
        leases,
        orchestrator,
        scheduler,
        service,
    }
}

fn healthcare_monitor(threshold: Severity) -> NewMonitor {
    NewMonitor {
        term: "ransomware healthcare".into(),
        description: Some("Ransomware against hospitals".into()),
        keywords: vec!["hospital".into()],
        exclude_keywords: Vec::new(),
        frequency: Frequency::Daily,
        severity_threshold: threshold,
    }
}

async fn reload(h: &Harness, monitor: &Monitor) -> Monitor {
    h.store.get_monitor(monitor.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn qualifying_scan_creates_exactly_one_alert() {
    let analysis = Arc::new(ScriptedAnalysis::always(Ok(assessment(
        Severity::High,
        "Ransomware attack disrupts regional hospital network",
        "Hospitals diverted ambulances after ransomware encrypted patient records",
    ))));
    let h = harness(
        Arc::new(ScriptedSearch::returning(first_batch())),
        analysis.clone(),
        fast_settings(),
        2,
    );
    let monitor = h
        .service
        .create_monitor(OWNER, healthcare_monitor(Severity::Medium))
        .await
        .unwrap();

    let report = h.orchestrator.run_scan(&monitor).await.unwrap();

    assert!(matches!(report.outcome, ScanOutcome::AlertCreated { .. }));
    assert_eq!(report.record.articles_fetched, 10);
    assert_eq!(report.record.articles_processed, 6);
    assert_eq!(report.record.alerts_generated, 1);
    assert!(report.record.errors.is_empty());
    assert!(report.record.success);
    assert_eq!(report.record.api_costs.search_queries, 1);
    assert_eq!(report.record.api_costs.analysis_units, 1_800);
    assert!(report.record.query.starts_with("ransomware healthcare"));
    assert_eq!(*analysis.seen_documents.lock().unwrap(), vec![6]);

    let stored = reload(&h, &monitor).await;
    assert_eq!(stored.alert_count, 1);
    assert_eq!(stored.scan_count, 1);

    let alerts = h
        .service
        .list_alerts(&AlertQuery::for_owner(OWNER))
        .await
        .unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].status, AlertStatus::New);
    assert_eq!(alerts[0].source_count, 6);
    assert!(alerts[0].severity.meets(monitor.severity_threshold));

    let history = h.service.scan_history(OWNER, monitor.id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn follow_up_coverage_merges_into_existing_alert() {
    let second_batch = vec![
        doc("https://healthnews.example/b/1", "healthnews.example", true),
        doc("https://othersite.example/b/2", "othersite.example", true),
    ];
    let search = ScriptedSearch::returning(second_batch).then(Ok(first_batch()));
    let analysis = ScriptedAnalysis::sequence(vec![
        assessment(
            Severity::High,
            "Ransomware attack disrupts regional hospital network",
            "Hospitals diverted ambulances after ransomware encrypted patient records",
        ),
        assessment(
            Severity::Critical,
            "Ransomware attack disrupts regional hospital systems",
            "Hospitals diverted ambulances after ransomware encrypted patient files",
        ),
    ]);
    let h = harness(Arc::new(search), Arc::new(analysis), fast_settings(), 2);
    let monitor = h
        .service
        .create_monitor(OWNER, healthcare_monitor(Severity::Medium))
        .await
        .unwrap();

    let first = h.orchestrator.run_scan(&monitor).await.unwrap();
    let ScanOutcome::AlertCreated { alert_id } = first.outcome else {
        panic!("expected an alert, got {:?}", first.outcome);
    };

    let second = h.orchestrator.run_scan(&monitor).await.unwrap();
    assert_eq!(
        second.outcome,
        ScanOutcome::Merged {
            alert_id,
            sources_added: 2
        }
    );
    assert_eq!(second.record.alerts_generated, 0);
    assert_eq!(second.record.duplicates_merged, 1);

    let alerts = h
        .service
        .list_alerts(&AlertQuery::for_owner(OWNER))
        .await
        .unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].source_count, 8);
    // merged alerts keep their original scoring
    assert_eq!(alerts[0].severity, Severity::High);
    assert_eq!(reload(&h, &monitor).await.alert_count, 1);
    assert_eq!(reload(&h, &monitor).await.scan_count, 2);
}

#[tokio::test]
async fn exhausted_search_retries_fail_the_scan_but_advance_the_schedule() {
    let search = Arc::new(HangingSearch {
        calls: AtomicUsize::new(0),
    });
    let analysis = Arc::new(ScriptedAnalysis::always(Ok(assessment(
        Severity::High,
        "unused",
        "unused",
    ))));
    let settings = ScanSettings {
        request_timeout: Duration::from_millis(20),
        ..fast_settings()
    };
    let h = harness(search.clone(), analysis.clone(), settings, 2);
    let monitor = h
        .service
        .create_monitor(OWNER, healthcare_monitor(Severity::Medium))
        .await
        .unwrap();
    let dispatched_next_scan = monitor.next_scan.unwrap();

    let report = h.orchestrator.run_scan(&monitor).await.unwrap();

    assert_eq!(search.calls.load(Ordering::SeqCst), 3);
    assert_eq!(analysis.calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.outcome, ScanOutcome::Failed);
    assert!(!report.record.errors.is_empty());
    assert!(!report.record.success);
    assert!(report.record.errors[0].contains("timed out"));
    assert_eq!(report.record.alerts_generated, 0);
    assert_eq!(report.record.api_costs.search_queries, 3);

    let stored = reload(&h, &monitor).await;
    let last = stored.last_scan.unwrap();
    let next = stored.next_scan.unwrap();
    assert!(next > last);
    assert!(next > dispatched_next_scan);
    let gap = next - last;
    assert!(gap >= chrono::Duration::days(1));
    assert!(gap <= chrono::Duration::days(1) + chrono::Duration::minutes(144));
    assert_eq!(stored.scan_count, 1);
    assert_eq!(stored.alert_count, 0);
    assert_eq!(
        h.store.scan_records_for_monitor(monitor.id, 10).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn below_threshold_assessment_records_scan_without_alert() {
    let h = harness(
        Arc::new(ScriptedSearch::returning(first_batch())),
        Arc::new(ScriptedAnalysis::always(Ok(assessment(
            Severity::Low,
            "Minor phishing chatter",
            "Low-grade phishing mentions in hospital forums",
        )))),
        fast_settings(),
        2,
    );
    let monitor = h
        .service
        .create_monitor(OWNER, healthcare_monitor(Severity::High))
        .await
        .unwrap();

    let report = h.orchestrator.run_scan(&monitor).await.unwrap();

    assert_eq!(
        report.outcome,
        ScanOutcome::BelowThreshold {
            severity: Severity::Low
        }
    );
    assert_eq!(report.record.alerts_generated, 0);
    assert_eq!(report.record.articles_processed, 6);
    assert!(report.record.errors.is_empty());
    assert!(h
        .service
        .list_alerts(&AlertQuery::for_owner(OWNER))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        h.store.scan_records_for_monitor(monitor.id, 10).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn malformed_assessment_is_a_failure_not_a_low_score() {
    let analysis = Arc::new(ScriptedAnalysis::always(Err(CollaboratorError::Malformed {
        message: "missing severity".into(),
        usage: AnalysisUsage {
            input_tokens: 900,
            output_tokens: 150,
        },
    })));
    let h = harness(
        Arc::new(ScriptedSearch::returning(first_batch())),
        analysis.clone(),
        fast_settings(),
        2,
    );
    let monitor = h
        .service
        .create_monitor(OWNER, healthcare_monitor(Severity::Low))
        .await
        .unwrap();

    let report = h.orchestrator.run_scan(&monitor).await.unwrap();

    assert_eq!(report.outcome, ScanOutcome::Failed);
    assert_eq!(analysis.calls.load(Ordering::SeqCst), 1);
    assert!(report.record.errors[0].contains("missing severity"));
    assert_eq!(report.record.articles_processed, 6);
    // the rejected reply was still billed
    assert_eq!(report.record.api_costs.analysis_units, 1_050);
    assert!(report.record.api_costs.total_cost > report.record.api_costs.search_queries as f64 * 0.005);
}

#[tokio::test]
async fn configured_cost_rates_price_the_scan() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = ScanOrchestrator::new(
        store.clone(),
        Arc::new(ScriptedSearch::returning(first_batch())),
        Arc::new(ScriptedAnalysis::always(Ok(assessment(
            Severity::High,
            "Ransomware attack disrupts regional hospital network",
            "Hospitals diverted ambulances",
        )))),
        Arc::new(HeuristicDeduplicator::new(DedupConfig::default())),
        fast_settings(),
    )
    .with_rates(CostRates {
        per_search_query: 0.25,
        per_input_token: 0.0,
        per_output_token: 0.0,
    });
    let monitor = Monitor::new(OWNER, healthcare_monitor(Severity::Medium), Utc::now()).unwrap();
    store.insert_monitor(&monitor).await.unwrap();

    let report = orchestrator.run_scan(&monitor).await.unwrap();

    assert_eq!(report.record.api_costs.search_queries, 1);
    assert_eq!(report.record.api_costs.total_cost, 0.25);
}

#[tokio::test]
async fn quota_exhaustion_is_not_retried() {
    let search = Arc::new(
        ScriptedSearch::returning(Vec::new())
            .then(Err(CollaboratorError::QuotaExceeded("daily limit".into()))),
    );
    let h = harness(
        search.clone(),
        Arc::new(ScriptedAnalysis::always(Ok(assessment(
            Severity::High,
            "unused",
            "unused",
        )))),
        fast_settings(),
        2,
    );
    let monitor = h
        .service
        .create_monitor(OWNER, healthcare_monitor(Severity::Medium))
        .await
        .unwrap();

    let report = h.orchestrator.run_scan(&monitor).await.unwrap();

    assert_eq!(search.calls(), 1);
    assert_eq!(report.outcome, ScanOutcome::Failed);
    assert!(report.record.errors[0].contains("quota"));
}

#[tokio::test]
async fn tick_dispatches_due_monitors_once_and_reschedules() {
    let search = Arc::new(ScriptedSearch::returning(first_batch()));
    let h = harness(
        search.clone(),
        Arc::new(ScriptedAnalysis::always(Ok(assessment(
            Severity::High,
            "Ransomware attack disrupts regional hospital network",
            "Hospitals diverted ambulances",
        )))),
        fast_settings(),
        2,
    );
    let active = h
        .service
        .create_monitor(OWNER, healthcare_monitor(Severity::Medium))
        .await
        .unwrap();
    let paused = h
        .service
        .create_monitor(OWNER, healthcare_monitor(Severity::Medium))
        .await
        .unwrap();
    h.service
        .update_monitor(
            OWNER,
            paused.id,
            MonitorUpdate {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let summary = h.scheduler.tick(Utc::now()).await.unwrap();
    assert_eq!(summary.due, 1);
    assert_eq!(summary.dispatched, 1);
    h.scheduler.wait_idle().await;

    let stored = reload(&h, &active).await;
    assert_eq!(stored.scan_count, 1);
    assert!(stored.next_scan.unwrap() > Utc::now());
    assert_eq!(reload(&h, &paused).await.scan_count, 0);
    assert_eq!(h.leases.held().await, 0);

    let again = h.scheduler.tick(Utc::now()).await.unwrap();
    assert_eq!(again.due, 0);
    assert_eq!(search.calls(), 1);

    let stats = h.scheduler.refresh_statistics(Utc::now()).await.unwrap();
    assert_eq!(stats.total_scans, 1);
    assert_eq!(stats.alerts_generated, 1);
    assert_eq!(h.scheduler.latest_statistics().await, Some(stats));
}

async fn create_distinct_monitors(h: &Harness, terms: &[&str]) -> Vec<Monitor> {
    let mut monitors = Vec::new();
    for term in terms {
        let monitor = h
            .service
            .create_monitor(
                OWNER,
                NewMonitor {
                    term: term.to_string(),
                    ..healthcare_monitor(Severity::Medium)
                },
            )
            .await
            .unwrap();
        monitors.push(monitor);
    }
    monitors
}

#[tokio::test]
async fn concurrent_dispatch_never_overlaps_scans_of_one_monitor() {
    let search = Arc::new(
        ScriptedSearch::returning(first_batch()).slow(Duration::from_millis(40)),
    );
    let h = harness(
        search.clone(),
        Arc::new(ScriptedAnalysis::always(Ok(assessment(
            Severity::High,
            "Ransomware attack disrupts regional hospital network",
            "Hospitals diverted ambulances",
        )))),
        fast_settings(),
        2,
    );
    let monitors = create_distinct_monitors(
        &h,
        &["ransomware hospital", "phishing bank", "supply chain", "ddos telecom"],
    )
    .await;

    let now = Utc::now();
    let (a, b, c) = tokio::join!(
        h.scheduler.tick(now),
        h.scheduler.tick(now),
        h.scheduler.tick(now)
    );
    let summaries = [a.unwrap(), b.unwrap(), c.unwrap()];
    let dispatched = summaries.iter().map(|s| s.dispatched).sum::<usize>();
    // only as many jobs as there are workers
    assert_eq!(dispatched, 2);
    for summary in &summaries {
        assert_eq!(
            summary.dispatched
                + summary.skipped_in_flight
                + summary.deferred_pool_full
                + summary.dispatch_failures,
            summary.due
        );
    }
    h.scheduler.wait_idle().await;

    let rest = h.scheduler.tick(Utc::now()).await.unwrap();
    assert_eq!(rest.due, 2);
    assert_eq!(rest.dispatched, 2);
    h.scheduler.wait_idle().await;

    assert_eq!(search.max_per_query.load(Ordering::SeqCst), 1);
    assert!(search.max_total.load(Ordering::SeqCst) <= 2);
    for monitor in &monitors {
        let records = h.store.scan_records_for_monitor(monitor.id, 10).await.unwrap();
        assert_eq!(records.len(), 1, "monitor {} scanned more than once", monitor.term);
    }
    assert_eq!(h.leases.held().await, 0);
}

#[tokio::test]
async fn backlog_longer_than_the_lease_never_doubles_a_scan() {
    let search = Arc::new(
        ScriptedSearch::returning(first_batch()).slow(Duration::from_millis(300)),
    );
    let h = harness_with_scheduler(
        search.clone(),
        Arc::new(ScriptedAnalysis::always(Ok(assessment(
            Severity::High,
            "Ransomware attack disrupts regional hospital network",
            "Hospitals diverted ambulances",
        )))),
        fast_settings(),
        SchedulerSettings {
            worker_pool: 2,
            lease_ttl: chrono::Duration::milliseconds(100),
            ..SchedulerSettings::default()
        },
    );
    let monitors =
        create_distinct_monitors(&h, &["ransomware hospital", "phishing bank", "supply chain"])
            .await;

    let first = h.scheduler.tick(Utc::now()).await.unwrap();
    assert_eq!(first.dispatched, 2);
    assert_eq!(first.deferred_pool_full, 1);

    // Both leases have expired but both scans are still running.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let second = h.scheduler.tick(Utc::now()).await.unwrap();
    assert_eq!(second.due, 3);
    assert_eq!(second.dispatched, 0);
    assert_eq!(second.deferred_pool_full, 3);
    h.scheduler.wait_idle().await;

    let third = h.scheduler.tick(Utc::now()).await.unwrap();
    assert_eq!(third.due, 1);
    assert_eq!(third.dispatched, 1);
    h.scheduler.wait_idle().await;

    assert_eq!(search.max_per_query.load(Ordering::SeqCst), 1);
    for monitor in &monitors {
        let records = h.store.scan_records_for_monitor(monitor.id, 10).await.unwrap();
        assert_eq!(records.len(), 1, "monitor {} scanned more than once", monitor.term);
    }
}

fn prior_alert(monitor: &Monitor, url: &str, age: chrono::Duration) -> Alert {
    let created_at = Utc::now() - age;
    let source = AlertSource {
        title: "Earlier coverage".into(),
        url: url.to_string(),
        domain: "healthnews.example".into(),
        published_at: Some(created_at),
        snippet: None,
        relevance_score: 0.9,
    };
    Alert {
        id: uuid::Uuid::new_v4(),
        monitor_id: monitor.id,
        owner_id: monitor.owner_id.clone(),
        title: "Utility billing outage".into(),
        summary: "Customers could not pay invoices online".into(),
        severity: Severity::High,
        confidence_score: 0.8,
        sources: vec![source],
        source_count: 1,
        threat_indicators: ThreatIndicators::default(),
        recommendations: None,
        status: AlertStatus::New,
        created_at,
        updated_at: created_at,
        user_feedback: None,
    }
}

#[tokio::test]
async fn dedup_only_looks_back_over_the_configured_window() {
    let h = harness(
        Arc::new(ScriptedSearch::returning(first_batch())),
        Arc::new(ScriptedAnalysis::always(Ok(assessment(
            Severity::High,
            "Ransomware attack disrupts regional hospital network",
            "Hospitals diverted ambulances after ransomware encrypted patient records",
        )))),
        fast_settings(),
        1,
    );
    let stale_monitor = h
        .service
        .create_monitor(OWNER, healthcare_monitor(Severity::Medium))
        .await
        .unwrap();
    let recent_monitor = h
        .service
        .create_monitor(OWNER, healthcare_monitor(Severity::Medium))
        .await
        .unwrap();

    let shared_url = "https://healthnews.example/a/0";
    let stale = prior_alert(&stale_monitor, shared_url, chrono::Duration::hours(73));
    let recent = prior_alert(&recent_monitor, shared_url, chrono::Duration::hours(71));
    h.store.insert_alert(&stale).await.unwrap();
    h.store.insert_alert(&recent).await.unwrap();

    let outside = h.orchestrator.run_scan(&stale_monitor).await.unwrap();
    let ScanOutcome::AlertCreated { alert_id } = outside.outcome else {
        panic!("expected a fresh alert, got {:?}", outside.outcome);
    };
    assert_ne!(alert_id, stale.id);
    assert_eq!(outside.record.duplicates_merged, 0);

    let inside = h.orchestrator.run_scan(&recent_monitor).await.unwrap();
    assert!(matches!(
        inside.outcome,
        ScanOutcome::Merged { alert_id, .. } if alert_id == recent.id
    ));
    assert_eq!(inside.record.alerts_generated, 0);
}

#[tokio::test]
async fn manual_scan_is_refused_while_a_lease_is_held() {
    let h = harness(
        Arc::new(ScriptedSearch::returning(first_batch())),
        Arc::new(ScriptedAnalysis::always(Ok(assessment(
            Severity::High,
            "Ransomware attack disrupts regional hospital network",
            "Hospitals diverted ambulances",
        )))),
        fast_settings(),
        1,
    );
    let monitor = h
        .service
        .create_monitor(OWNER, healthcare_monitor(Severity::Medium))
        .await
        .unwrap();
    let lease = h
        .leases
        .try_acquire(monitor.id, "other-worker", chrono::Duration::minutes(5), Utc::now())
        .await
        .unwrap()
        .unwrap();

    let refused = h.service.trigger_manual_scan(OWNER, monitor.id).await;
    assert!(matches!(refused, Err(WatchError::DispatchFailure(_))));

    h.leases.release(&lease).await.unwrap();
    let report = h
        .service
        .trigger_manual_scan(OWNER, monitor.id)
        .await
        .unwrap();
    assert_eq!(report.record.alerts_generated, 1);

    let foreign = h.service.trigger_manual_scan("someone-else", monitor.id).await;
    assert!(matches!(foreign, Err(WatchError::ResourceNotFound { .. })));
}

#[tokio::test]
async fn deleting_a_monitor_mid_scan_lets_the_scan_finish() {
    let h = harness(
        Arc::new(ScriptedSearch::returning(first_batch()).slow(Duration::from_millis(50))),
        Arc::new(ScriptedAnalysis::always(Ok(assessment(
            Severity::High,
            "Ransomware attack disrupts regional hospital network",
            "Hospitals diverted ambulances",
        )))),
        fast_settings(),
        1,
    );
    let monitor = h
        .service
        .create_monitor(OWNER, healthcare_monitor(Severity::Medium))
        .await
        .unwrap();

    let orchestrator = h.orchestrator.clone();
    let scanning = monitor.clone();
    let in_flight = tokio::spawn(async move { orchestrator.run_scan(&scanning).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.service.delete_monitor(OWNER, monitor.id).await.unwrap();

    let report = in_flight.await.unwrap().unwrap();
    assert!(!report.monitor_updated);
    assert_eq!(
        h.store.scan_records_for_monitor(monitor.id, 10).await.unwrap().len(),
        1
    );
    assert!(h.store.get_monitor(monitor.id).await.unwrap().is_none());
    assert_eq!(h.scheduler.tick(Utc::now()).await.unwrap().due, 0);
}

#[tokio::test]
async fn alert_status_changes_follow_the_state_machine() {
    let h = harness(
        Arc::new(ScriptedSearch::returning(first_batch())),
        Arc::new(ScriptedAnalysis::always(Ok(assessment(
            Severity::Critical,
            "Ransomware attack disrupts regional hospital network",
            "Hospitals diverted ambulances",
        )))),
        fast_settings(),
        1,
    );
    let monitor = h
        .service
        .create_monitor(OWNER, healthcare_monitor(Severity::Medium))
        .await
        .unwrap();
    let report = h.orchestrator.run_scan(&monitor).await.unwrap();
    let ScanOutcome::AlertCreated { alert_id } = report.outcome else {
        panic!("expected alert");
    };

    h.service
        .update_alert_status(OWNER, alert_id, AlertStatus::Acknowledged, None)
        .await
        .unwrap();
    let closed = h
        .service
        .update_alert_status(OWNER, alert_id, AlertStatus::FalsePositive, Some("vendor test"))
        .await
        .unwrap();
    assert_eq!(closed.user_feedback.as_deref(), Some("vendor test"));

    let err = h
        .service
        .update_alert_status(OWNER, alert_id, AlertStatus::Acknowledged, None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        WatchError::InvalidTransition {
            from: AlertStatus::FalsePositive,
            to: AlertStatus::Acknowledged
        }
    );

    let missing = h
        .service
        .update_alert_status(OWNER, uuid::Uuid::new_v4(), AlertStatus::Resolved, None)
        .await
        .unwrap_err();
    assert!(matches!(missing, WatchError::ResourceNotFound { .. }));

    let stats = h.service.alert_statistics(OWNER).await.unwrap();
    assert_eq!(stats.total_alerts, 1);
    assert_eq!(stats.count_for_status(AlertStatus::FalsePositive), 1);
    assert_eq!(stats.last_24_hours, 1);

    let mut filtered = AlertQuery::for_owner(OWNER);
    filtered.status = Some(AlertStatus::New);
    assert!(h.service.list_alerts(&filtered).await.unwrap().is_empty());
    assert!(h.store.get_alert(alert_id).await.unwrap().is_some());
}
