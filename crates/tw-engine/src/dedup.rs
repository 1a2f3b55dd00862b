//! Decides whether a candidate alert is another report of an incident already alerted on.
//!
//! An exact source URL match is authoritative. Textual similarity only counts when the two
//! alerts also share at least one source domain, which keeps genuinely new incidents from
//! being suppressed by a loosely similar headline.

use std::collections::HashSet;

use strsim::jaro_winkler;
use tw_core::{normalize_domain, Alert};
use uuid::Uuid;

/// Pluggable text similarity in `[0, 1]`.
pub trait Similarity: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, a: &str, b: &str) -> f64;
}

pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Dice coefficient over the sets of normalized words.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenOverlap;

impl TokenOverlap {
    fn tokens(input: &str) -> HashSet<String> {
        normalize_text(input)
            .split(' ')
            .filter(|t| t.chars().count() > 2)
            .map(str::to_string)
            .collect()
    }
}

impl Similarity for TokenOverlap {
    fn name(&self) -> &'static str {
        "token-overlap"
    }

    fn score(&self, a: &str, b: &str) -> f64 {
        let a = Self::tokens(a);
        let b = Self::tokens(b);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let shared = a.intersection(&b).count();
        (2 * shared) as f64 / (a.len() + b.len()) as f64
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JaroWinkler;

impl Similarity for JaroWinkler {
    fn name(&self) -> &'static str {
        "jaro-winkler"
    }

    fn score(&self, a: &str, b: &str) -> f64 {
        let a = normalize_text(a);
        let b = normalize_text(b);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        jaro_winkler(&a, &b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DuplicateReason {
    ExactUrl,
    Similar { score: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DedupDecision {
    Duplicate { alert_id: Uuid, reason: DuplicateReason },
    Unique,
}

impl DedupDecision {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DedupDecision::Duplicate { .. })
    }
}

pub trait Deduplicator: Send + Sync {
    /// `existing` is the monitor's alerts inside the lookback window.
    fn check(&self, candidate: &Alert, existing: &[Alert]) -> DedupDecision;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupConfig {
    pub similarity_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
        }
    }
}

pub struct HeuristicDeduplicator {
    config: DedupConfig,
    similarity: Box<dyn Similarity>,
}

impl HeuristicDeduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self::with_similarity(config, Box::new(TokenOverlap))
    }

    pub fn with_similarity(config: DedupConfig, similarity: Box<dyn Similarity>) -> Self {
        Self { config, similarity }
    }

    /// Best of title-vs-title and title+summary-vs-title+summary.
    pub fn similarity(&self, a: &Alert, b: &Alert) -> f64 {
        let title = self.similarity.score(&a.title, &b.title);
        let full = self.similarity.score(
            &format!("{} {}", a.title, a.summary),
            &format!("{} {}", b.title, b.summary),
        );
        title.max(full)
    }
}

impl Deduplicator for HeuristicDeduplicator {
    fn check(&self, candidate: &Alert, existing: &[Alert]) -> DedupDecision {
        let candidate_urls = candidate
            .sources
            .iter()
            .map(|s| s.url.as_str())
            .collect::<HashSet<_>>();
        if let Some(hit) = existing
            .iter()
            .find(|alert| alert.sources.iter().any(|s| candidate_urls.contains(s.url.as_str())))
        {
            return DedupDecision::Duplicate {
                alert_id: hit.id,
                reason: DuplicateReason::ExactUrl,
            };
        }

        let candidate_domains = candidate
            .sources
            .iter()
            .map(|s| normalize_domain(&s.domain))
            .collect::<HashSet<_>>();
        let mut best: Option<(Uuid, f64)> = None;
        for alert in existing {
            if !alert.source_domains().any(|d| candidate_domains.contains(&d)) {
                continue;
            }
            let score = self.similarity(candidate, alert);
            if score >= self.config.similarity_threshold
                && best.map_or(true, |(_, current)| score > current)
            {
                best = Some((alert.id, score));
            }
        }
        match best {
            Some((alert_id, score)) => DedupDecision::Duplicate {
                alert_id,
                reason: DuplicateReason::Similar { score },
            },
            None => DedupDecision::Unique,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tw_core::{AlertSource, AlertStatus, Severity, ThreatIndicators};

    fn source(url: &str, domain: &str) -> AlertSource {
        AlertSource {
            title: "source".into(),
            url: url.into(),
            domain: domain.into(),
            published_at: None,
            snippet: None,
            relevance_score: 0.8,
        }
    }

    fn alert(title: &str, summary: &str, sources: Vec<AlertSource>) -> Alert {
        let now = Utc::now();
        Alert {
            id: Uuid::new_v4(),
            monitor_id: Uuid::nil(),
            owner_id: "owner".into(),
            title: title.into(),
            summary: summary.into(),
            severity: Severity::High,
            confidence_score: 0.8,
            source_count: sources.len(),
            sources,
            threat_indicators: ThreatIndicators::default(),
            recommendations: None,
            status: AlertStatus::New,
            created_at: now,
            updated_at: now,
            user_feedback: None,
        }
    }

    #[test]
    fn token_overlap_is_symmetric_and_bounded() {
        let sim = TokenOverlap;
        let a = "Ransomware attack disrupts hospital network";
        let b = "Hospital network disrupted by ransomware attack";
        assert_eq!(sim.score(a, b), sim.score(b, a));
        assert_eq!(sim.score(a, a), 1.0);
        assert_eq!(sim.score(a, "quarterly earnings beat forecasts"), 0.0);
        assert_eq!(sim.score("", a), 0.0);
    }

    #[test]
    fn jaro_winkler_normalizes_before_scoring() {
        let sim = JaroWinkler;
        assert_eq!(sim.score("Ransomware, Hospital!", "ransomware hospital"), 1.0);
        assert!(sim.score("ransomware hospital", "zero day browser") < 0.7);
    }

    #[test]
    fn exact_url_match_wins_without_textual_similarity() {
        let dedup = HeuristicDeduplicator::new(DedupConfig::default());
        let existing = alert(
            "Completely different headline",
            "Unrelated summary",
            vec![source("https://a.example/1", "a.example")],
        );
        let candidate = alert(
            "Ransomware hits clinic",
            "Clinic outage",
            vec![source("https://a.example/1", "a.example")],
        );
        assert_eq!(
            dedup.check(&candidate, std::slice::from_ref(&existing)),
            DedupDecision::Duplicate {
                alert_id: existing.id,
                reason: DuplicateReason::ExactUrl
            }
        );
    }

    #[test]
    fn similar_text_requires_a_shared_domain() {
        let dedup = HeuristicDeduplicator::new(DedupConfig::default());
        let summary = "Ransomware attack disrupts hospital network across three states";
        let existing = alert(
            "Ransomware attack disrupts hospital network",
            summary,
            vec![source("https://news.example/a", "news.example")],
        );
        let other_domain = alert(
            "Ransomware attack disrupts hospital network",
            summary,
            vec![source("https://elsewhere.example/b", "elsewhere.example")],
        );
        assert_eq!(
            dedup.check(&other_domain, std::slice::from_ref(&existing)),
            DedupDecision::Unique
        );

        let shared_domain = alert(
            "Ransomware attack disrupts hospital network",
            summary,
            vec![source("https://www.news.example/c", "www.news.example")],
        );
        assert!(dedup
            .check(&shared_domain, std::slice::from_ref(&existing))
            .is_duplicate());
    }

    #[test]
    fn dissimilar_text_on_shared_domain_is_unique() {
        let dedup = HeuristicDeduplicator::new(DedupConfig::default());
        let existing = alert(
            "Ransomware attack disrupts hospital network",
            "Hospital systems offline",
            vec![source("https://news.example/a", "news.example")],
        );
        let candidate = alert(
            "Phishing campaign targets bank customers",
            "Credential theft wave",
            vec![source("https://news.example/b", "news.example")],
        );
        assert_eq!(
            dedup.check(&candidate, std::slice::from_ref(&existing)),
            DedupDecision::Unique
        );
    }

    #[test]
    fn repeated_checks_against_unchanged_alerts_agree() {
        let dedup = HeuristicDeduplicator::with_similarity(DedupConfig::default(), Box::new(JaroWinkler));
        let existing = vec![alert(
            "Ransomware attack disrupts hospital network",
            "Hospital systems offline",
            vec![source("https://news.example/a", "news.example")],
        )];
        let candidate = alert(
            "Ransomware attack disrupts hospital networks",
            "Hospital systems offline",
            vec![source("https://news.example/b", "news.example")],
        );
        let first = dedup.check(&candidate, &existing);
        let second = dedup.check(&candidate, &existing);
        assert!(first.is_duplicate());
        assert_eq!(first, second);
    }
}
