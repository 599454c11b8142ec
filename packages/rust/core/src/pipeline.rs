//! End-to-end run: discovery → batched assembly → reconciliation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{info, instrument, warn};

use prospector_discovery::{
    DiscoveryReport, DiscoveryService, EntityKind, IdentifierRegistry, id_order,
};
use prospector_providers::{
    GeocodingProvider, MapCenterProvider, QueryProvider, RelationshipProvider, ScrapeProvider,
};
use prospector_shared::{DataSource, Project, ProspectorError, Result, RunConfig, is_surrogate_id};
use prospector_storage::Storage;

use crate::assembler::{AssemblyContext, AssemblyResult, ProjectAssembler};
use crate::ledger::{ScrapeLedger, ScrapedCompanyUrls};
use crate::metrics::{MetricsSnapshot, ProcessingMetrics};
use crate::reconcile::{AuditReport, IdSet, build_report};
use crate::resolver::CompanyResolver;

/// Providers and shared state for one run.
pub struct PipelineDeps {
    pub query: Arc<dyn QueryProvider>,
    pub relationships: Arc<dyn RelationshipProvider>,
    pub scraper: Arc<dyn ScrapeProvider>,
    pub map_center: Option<Arc<dyn MapCenterProvider>>,
    pub geocoder: Option<Arc<dyn GeocodingProvider>>,
    pub registry: Arc<IdentifierRegistry>,
    /// Run history is recorded here when present.
    pub storage: Option<Arc<Storage>>,
    /// Site root used to build canonical profile URLs.
    pub site_url: String,
}

/// Result of [`run`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Option<String>,
    pub discovered: usize,
    pub failed_partitions: Vec<String>,
    pub projects: Vec<Project>,
    pub errors: Vec<String>,
    pub metrics: MetricsSnapshot,
    pub audit: AuditReport,
    /// True when the cancel flag stopped the run between batches.
    pub cancelled: bool,
    pub elapsed: std::time::Duration,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when the ids to assemble are known.
    fn discovered(&self, total: usize);
    /// Called after each batch with the running number of processed ids.
    fn batch_done(&self, result: &AssemblyResult, processed: usize, total: usize);
    /// Called when the pipeline completes.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn discovered(&self, _total: usize) {}
    fn batch_done(&self, _result: &AssemblyResult, _processed: usize, _total: usize) {}
    fn done(&self, _report: &RunReport) {}
}

/// Run the whole pipeline.
///
/// `cancel` is checked between batches only; a batch in flight always
/// finishes. Ids never reached are counted as skipped.
#[instrument(skip_all, fields(partitions = config.partitions.len(), batch_size = config.batch_size))]
pub async fn run(
    config: &RunConfig,
    deps: PipelineDeps,
    progress: &dyn ProgressReporter,
    cancel: &AtomicBool,
) -> Result<RunReport> {
    let start = Instant::now();
    if config.batch_size == 0 {
        return Err(ProspectorError::config("batch_size must be at least 1"));
    }

    let run_id = match &deps.storage {
        Some(storage) => Some(storage.insert_run().await?),
        None => None,
    };
    info!(run_id = ?run_id, "starting run");

    if config.retry_geocode_misses {
        if let Some(storage) = &deps.storage {
            let evicted = storage.evict_geocode_misses().await?;
            info!(evicted, "cleared cached geocoding misses");
        }
    }

    // --- Phase 1: Discovery ---
    progress.phase("Discovering projects");
    let discovery = DiscoveryService::new(
        Arc::clone(&deps.query),
        Arc::clone(&deps.registry),
        config.max_projects,
    );
    let report = discovery.discover(&config.partitions).await;
    let mut ids: Vec<String> = report.ids.iter().cloned().collect();
    ids.sort_by(|a, b| id_order(a, b));
    progress.discovered(ids.len());

    // --- Phase 2: Assembly ---
    progress.phase("Assembling projects");
    let ledger = Arc::new(ScrapeLedger::new(Arc::clone(&deps.scraper)));
    let metrics = Arc::new(ProcessingMetrics::new());
    let ctx = AssemblyContext {
        resolver: CompanyResolver::new(Arc::clone(&deps.relationships), Arc::clone(&ledger)),
        scraper: Arc::clone(&ledger),
        registry: Arc::clone(&deps.registry),
        safe_data: Arc::new(report.safe_data.clone()),
        map_center: deps.map_center.clone(),
        geocoder: deps.geocoder.clone(),
    };
    let assembler = ProjectAssembler::new(ctx, config, Arc::clone(&metrics));

    let mut projects = Vec::new();
    let mut errors = Vec::new();
    let mut processed = 0;
    let mut cancelled = false;

    for batch in ids.chunks(config.batch_size) {
        if cancel.load(Ordering::SeqCst) {
            let remaining = ids.len() - processed;
            warn!(remaining, "cancellation requested, stopping before next batch");
            metrics.record_skipped(remaining);
            cancelled = true;
            break;
        }
        let result = assembler.process_batch(batch).await;
        processed += batch.len();
        progress.batch_done(&result, processed, ids.len());
        projects.extend(result.projects);
        errors.extend(result.errors);
    }

    // --- Phase 3: Reconciliation ---
    progress.phase("Reconciling with registry");
    let audit = audit(
        &report,
        &projects,
        &deps.registry,
        &ledger.company_urls(),
        &deps.site_url,
    );

    let metrics = metrics.snapshot();
    if let (Some(storage), Some(id)) = (&deps.storage, &run_id) {
        let json = serde_json::to_string(&metrics)
            .map_err(|e| ProspectorError::validation(format!("metrics snapshot: {e}")))?;
        storage.finish_run(id, &json, cancelled).await?;
    }

    let run_report = RunReport {
        run_id,
        discovered: ids.len(),
        failed_partitions: report.failed_partitions,
        projects,
        errors,
        metrics,
        audit,
        cancelled,
        elapsed: start.elapsed(),
    };

    info!(
        completed = run_report.metrics.completed,
        failed = run_report.metrics.failed,
        cancelled,
        elapsed_ms = run_report.elapsed.as_millis() as u64,
        "run complete"
    );
    progress.done(&run_report);
    Ok(run_report)
}

/// Reconcile a discovery pass and its assembled projects against the
/// registry.
pub fn audit(
    report: &DiscoveryReport,
    projects: &[Project],
    registry: &IdentifierRegistry,
    scraped: &ScrapedCompanyUrls,
    site_url: &str,
) -> AuditReport {
    let project_source = IdSet::new(
        report.source_ids.clone(),
        report
            .source_ids
            .iter()
            .map(|id| (id.clone(), profile_url(site_url, EntityKind::Project, id)))
            .collect(),
    );

    let company_ids = authoritative_company_ids(report, projects);
    let company_urls: BTreeMap<String, String> = company_ids
        .iter()
        .map(|id| {
            let url = scraped
                .lookup(id, "")
                .map(String::from)
                .unwrap_or_else(|| profile_url(site_url, EntityKind::Company, id));
            (id.clone(), url)
        })
        .collect();
    let company_source = IdSet::new(company_ids, company_urls);

    build_report(
        (&project_source, &IdSet::from_registry(registry, EntityKind::Project)),
        (&company_source, &IdSet::from_registry(registry, EntityKind::Company)),
        projects,
        registry,
        scraped,
    )
}

/// Company ids the sources vouch for: ids on query rows plus ids from the
/// relationship provider. Surrogate ids are never authoritative.
pub fn authoritative_company_ids(report: &DiscoveryReport, projects: &[Project]) -> BTreeSet<String> {
    let from_relationships = projects
        .iter()
        .flat_map(|p| p.company_relationships())
        .filter(|r| r.data_source == DataSource::Relationships)
        .map(|r| r.company_id.clone());
    report
        .source_company_ids
        .iter()
        .cloned()
        .chain(from_relationships)
        .filter(|id| !id.trim().is_empty() && !is_surrogate_id(id))
        .collect()
}

/// Canonical profile page for an id on the site.
pub fn profile_url(site_url: &str, kind: EntityKind, id: &str) -> String {
    let page = match kind {
        EntityKind::Project => "project-profile",
        EntityKind::Company => "company-profile",
    };
    format!("{}/{page}?gid={id}", site_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use prospector_shared::{
        Centroid, GeoAddress, GeocodeHit, RawProject, RelationshipEntry, RelationshipGraph,
        ScrapedRecord,
    };
    use std::collections::HashMap;

    struct StubQuery;

    #[async_trait]
    impl QueryProvider for StubQuery {
        async fn fetch_partition(&self, partition: &str) -> Result<Vec<RawProject>> {
            if partition != "Australia" {
                return Err(ProspectorError::unavailable("HTTP 503"));
            }
            Ok(vec![RawProject {
                id: "100".into(),
                name: Some("Alpha Hill".into()),
                company_id: Some("55".into()),
                centroid: Some(Centroid {
                    coordinates: vec![146.26, -20.07],
                }),
                ..Default::default()
            }])
        }
    }

    struct StubRelationships;

    #[async_trait]
    impl RelationshipProvider for StubRelationships {
        async fn fetch_relationships(&self, id: &str) -> Result<RelationshipGraph> {
            if id != "100" {
                return Ok(RelationshipGraph::default());
            }
            Ok(RelationshipGraph {
                ownership: vec![RelationshipEntry {
                    id: "55".into(),
                    company_name: Some("Alpha Corp".into()),
                    percentage: Some(60.0),
                    ..Default::default()
                }],
                ..Default::default()
            })
        }
    }

    struct StubScraper(HashMap<String, ScrapedRecord>);

    #[async_trait]
    impl ScrapeProvider for StubScraper {
        async fn scrape(&self, id: &str) -> Result<Option<ScrapedRecord>> {
            Ok(self.0.get(id).cloned())
        }
    }

    fn deps(storage: Option<Arc<Storage>>) -> PipelineDeps {
        let registry = IdentifierRegistry::from_entries(
            [
                ("101".to_string(), Some("https://site.test/project-profile?gid=101".to_string())),
                ("102".to_string(), None),
            ],
            [("55".to_string(), Some("https://site.test/company-profile?gid=55".to_string()))],
        );
        let scraped = HashMap::from([(
            "101".to_string(),
            ScrapedRecord {
                operator: Some("Beta Mining".into()),
                company_url: Some("https://site.test/company-profile?gid=66".into()),
                ..Default::default()
            },
        )]);
        PipelineDeps {
            query: Arc::new(StubQuery),
            relationships: Arc::new(StubRelationships),
            scraper: Arc::new(StubScraper(scraped)),
            map_center: None,
            geocoder: None,
            registry: Arc::new(registry),
            storage,
            site_url: "https://site.test/".into(),
        }
    }

    fn config() -> RunConfig {
        RunConfig {
            partitions: vec!["Australia".into(), "Canada".into()],
            batch_size: 2,
            enable_geocoding: false,
            enable_map_center: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn full_run_assembles_and_reconciles() {
        let report = run(&config(), deps(None), &SilentProgress, &AtomicBool::new(false))
            .await
            .expect("run");

        assert_eq!(report.discovered, 3);
        assert_eq!(report.failed_partitions, vec!["Canada".to_string()]);
        assert_eq!(report.metrics.completed, 2);
        assert_eq!(report.metrics.failed, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(!report.cancelled);

        let p101 = report
            .projects
            .iter()
            .find(|p| p.id() == "101")
            .expect("101 assembled");
        assert_eq!(p101.operator(), Some("Beta Mining"));
        assert_eq!(p101.project_url(), Some("https://site.test/project-profile?gid=101"));

        // 100 is only in the source; 101 and 102 only in the registry.
        let rows: Vec<_> = report
            .audit
            .rows
            .iter()
            .map(|r| (r.id.as_str(), r.kind))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("100", EntityKind::Project),
                ("101", EntityKind::Project),
                ("102", EntityKind::Project),
            ]
        );
        assert_eq!(
            report.audit.rows[0].url.as_deref(),
            Some("https://site.test/project-profile?gid=100")
        );

        // 101's scraped operator has a surrogate id, resolved by name.
        assert_eq!(report.audit.orphans.len(), 1);
        assert_eq!(report.audit.orphans[0].project_id, "101");
        assert_eq!(
            report.audit.orphans[0].resolved_url.as_deref(),
            Some("https://site.test/company-profile?gid=66")
        );
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_batches() {
        let report = run(&config(), deps(None), &SilentProgress, &AtomicBool::new(true))
            .await
            .expect("run");
        assert!(report.cancelled);
        assert!(report.projects.is_empty());
        assert_eq!(report.metrics.skipped, 3);
    }

    #[tokio::test]
    async fn run_history_is_recorded() {
        let path = std::env::temp_dir().join(format!("prospector_test_{}.db", uuid::Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&path).await.expect("open"));
        let report = run(
            &config(),
            deps(Some(Arc::clone(&storage))),
            &SilentProgress,
            &AtomicBool::new(false),
        )
        .await
        .expect("run");

        let runs = storage.list_runs(10).await.expect("list");
        assert_eq!(runs.len(), 1);
        assert_eq!(Some(runs[0].id.clone()), report.run_id);
        assert!(runs[0].finished_at.is_some());
        assert!(!runs[0].cancelled);
        let _ = std::fs::remove_file(&path);
    }

    async fn storage_with_cached_miss() -> (Arc<Storage>, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("prospector_test_{}.db", uuid::Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&path).await.expect("open"));
        let hit = GeocodeHit {
            address: GeoAddress {
                state: Some("Queensland".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        storage.put_geocode("rev:-20.07,146.26", Some(&hit)).await.expect("put hit");
        storage.put_geocode("fwd:nowhere", None).await.expect("put miss");
        (storage, path)
    }

    #[tokio::test]
    async fn cached_geocoding_misses_are_cleared_before_assembly() {
        let (storage, path) = storage_with_cached_miss().await;
        run(
            &config(),
            deps(Some(Arc::clone(&storage))),
            &SilentProgress,
            &AtomicBool::new(false),
        )
        .await
        .expect("run");

        assert_eq!(storage.count_geocode().await.expect("count"), 1);
        assert_eq!(storage.get_geocode("fwd:nowhere").await.expect("get"), None);
        assert!(storage.get_geocode("rev:-20.07,146.26").await.expect("get").is_some());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn cached_misses_are_kept_when_retry_is_off() {
        let (storage, path) = storage_with_cached_miss().await;
        let config = RunConfig {
            retry_geocode_misses: false,
            ..config()
        };
        run(
            &config,
            deps(Some(Arc::clone(&storage))),
            &SilentProgress,
            &AtomicBool::new(false),
        )
        .await
        .expect("run");

        assert_eq!(storage.count_geocode().await.expect("count"), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn surrogate_ids_are_not_authoritative() {
        let report = DiscoveryReport {
            source_company_ids: BTreeSet::from(["55".to_string(), "operator_abc".to_string()]),
            ..Default::default()
        };
        let ids = authoritative_company_ids(&report, &[]);
        assert_eq!(ids, BTreeSet::from(["55".to_string()]));
    }

    #[test]
    fn profile_urls() {
        assert_eq!(
            profile_url("https://site.test/", EntityKind::Company, "9"),
            "https://site.test/company-profile?gid=9"
        );
    }
}
