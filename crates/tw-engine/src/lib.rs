//! The monitoring core: scheduling, scan orchestration, deduplication, alert lifecycle and cost accounting.

pub mod config;
pub mod cost;
pub mod dedup;
pub mod lifecycle;
pub mod scan;
pub mod scheduler;
pub mod service;

pub use config::{load_seed_file, CollaboratorConfig, EngineConfig, SeedFile, SeedMonitor};
pub use cost::{CostRates, CostTracker};
pub use dedup::{
    DedupConfig, DedupDecision, DuplicateReason, Deduplicator, HeuristicDeduplicator, JaroWinkler,
    Similarity, TokenOverlap,
};
pub use lifecycle::{AlertLifecycle, CleanupReport, StaticTierResolver, TierResolver};
pub use scan::{build_query, filter_documents, FilterSettings, ScanOrchestrator, ScanOutcome, ScanReport, ScanSettings};
pub use scheduler::{ScanStatistics, Scheduler, SchedulerSettings, TickSummary};
pub use service::WatchService;

pub const CRATE_NAME: &str = "tw-engine";
