//! Batch project assembly.
//!
//! Each id runs through its own spawned task, bounded by a semaphore.
//! A failing or panicking task costs only its own id; the batch always
//! returns an [`AssemblyResult`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use prospector_discovery::{EntityKind, IdentifierRegistry};
use prospector_providers::{GeocodingProvider, MapCenterProvider};
use prospector_shared::{
    CompanyRelationship, LocationSource, ProcessingStage, Project, ProspectorError, RawProject,
    Result, RunConfig, StageFailure,
};

use crate::enrichment;
use crate::ledger::ScrapeLedger;
use crate::metrics::ProcessingMetrics;
use crate::resolver::{CompanyResolver, select_primary};

/// Outcome of one `process_batch` call.
#[derive(Debug, Clone, Default)]
pub struct AssemblyResult {
    pub completed: usize,
    pub failed: usize,
    /// Assembled projects in completion order.
    pub projects: Vec<Project>,
    pub errors: Vec<String>,
}

/// Collaborators shared by every task of every batch.
pub struct AssemblyContext {
    pub resolver: CompanyResolver,
    pub scraper: Arc<ScrapeLedger>,
    pub registry: Arc<IdentifierRegistry>,
    /// Query rows by id, preloaded during discovery.
    pub safe_data: Arc<HashMap<String, RawProject>>,
    pub map_center: Option<Arc<dyn MapCenterProvider>>,
    pub geocoder: Option<Arc<dyn GeocodingProvider>>,
}

pub struct ProjectAssembler {
    ctx: Arc<AssemblyContext>,
    metrics: Arc<ProcessingMetrics>,
    max_workers: usize,
    map_center_timeout: Duration,
}

impl ProjectAssembler {
    /// Optional stages are dropped here when `config` disables them.
    pub fn new(mut ctx: AssemblyContext, config: &RunConfig, metrics: Arc<ProcessingMetrics>) -> Self {
        if !config.enable_map_center {
            ctx.map_center = None;
        }
        if !config.enable_geocoding {
            ctx.geocoder = None;
        }
        Self {
            ctx: Arc::new(ctx),
            metrics,
            max_workers: config.max_workers.max(1),
            map_center_timeout: Duration::from_millis(config.map_center_timeout_ms),
        }
    }

    pub fn metrics(&self) -> &Arc<ProcessingMetrics> {
        &self.metrics
    }

    /// Assemble `ids` with at most `min(max_workers, ids.len())` in flight.
    #[instrument(skip_all, fields(ids = ids.len()))]
    pub async fn process_batch(&self, ids: &[String]) -> AssemblyResult {
        let mut result = AssemblyResult::default();
        if ids.is_empty() {
            return result;
        }

        self.metrics.begin_batch(ids.len());
        let semaphore = Arc::new(Semaphore::new(self.max_workers.min(ids.len())));

        let mut pending: FuturesUnordered<_> = ids
            .iter()
            .map(|id| {
                let ctx = Arc::clone(&self.ctx);
                let sem = Arc::clone(&semaphore);
                let timeout = self.map_center_timeout;
                let task_id = id.clone();
                let handle = tokio::spawn(async move {
                    let _permit = sem
                        .acquire_owned()
                        .await
                        .map_err(|e| ProspectorError::Aborted(e.to_string()))?;
                    assemble_one(&ctx, &task_id, timeout).await
                });
                let id = id.clone();
                async move { (id, handle.await) }
            })
            .collect();

        while let Some((id, outcome)) = pending.next().await {
            let outcome = outcome.unwrap_or_else(|e| {
                warn!(id = %id, error = %e, "assembly task aborted");
                Err(ProspectorError::Aborted(e.to_string()))
            });
            match outcome {
                Ok(Assembled {
                    project,
                    failure: Some(failure),
                }) => {
                    self.metrics.record_stage_failure(&failure);
                    result.failed += 1;
                    result
                        .errors
                        .push(format!("{id}: {}", project.errors().join("; ")));
                    result.projects.push(project);
                }
                Ok(Assembled {
                    project,
                    failure: None,
                }) => {
                    self.metrics.record_project(&project);
                    result.completed += 1;
                    result.projects.push(project);
                }
                Err(e) => {
                    self.metrics.record_error(&e);
                    result.failed += 1;
                    result.errors.push(format!("{id}: {e}"));
                }
            }
        }

        self.metrics.end_batch();
        info!(
            completed = result.completed,
            failed = result.failed,
            "batch assembled"
        );
        result
    }
}

// ---------------------------------------------------------------------------
// Per-id pipeline
// ---------------------------------------------------------------------------

/// A project plus the stage failure that made it `Failed`, if any.
struct Assembled {
    project: Project,
    failure: Option<StageFailure>,
}

async fn assemble_one(ctx: &AssemblyContext, id: &str, map_timeout: Duration) -> Result<Assembled> {
    let safe = ctx.safe_data.get(id);
    let url = ctx.registry.lookup(id, EntityKind::Project);

    let resolution = ctx.resolver.resolve_detailed(id, safe).await;
    let mut failures = resolution.failures;

    let base = match safe {
        Some(raw) => Project::from_safe_data(raw),
        None => {
            let record = ctx
                .scraper
                .record(id)
                .await
                .filter(|r| !r.is_empty())
                .ok_or_else(|| {
                    ProspectorError::not_found(format!("project {id}: no source produced data"))
                })?;
            debug!(id, "building minimal project from scrape");
            Project::from_scrape(id, &record)
        }
    };
    let base = match url {
        Some(url) => base.with_project_url(url),
        None => base,
    };
    let project = attach_relationships(&base, resolution.relationships);

    let project = match project.advance(ProcessingStage::Assembling) {
        Ok(p) => p,
        Err(e) => {
            failures.push(StageFailure::new("stage", &e));
            return Ok(finish(project, failures));
        }
    };

    let project = match &ctx.map_center {
        Some(provider) if project.location().coordinates().is_none() => {
            match locate_on_map(&project, provider.as_ref(), map_timeout).await {
                Ok(located) => located,
                Err(e) => {
                    failures.push(StageFailure::new("map centre", &e));
                    project
                }
            }
        }
        _ => project,
    };

    let project = match &ctx.geocoder {
        Some(geocoder) => match enrichment::enrich(&project, geocoder.as_ref()).await {
            Ok(enriched) => enriched,
            Err(e) => {
                failures.push(StageFailure::new("geocoding", &e));
                project
            }
        },
        None => project,
    };

    Ok(finish(project, failures))
}

/// Note every stage failure on the project, then settle its final stage.
///
/// A project ends `Failed` when a stage failed and the record is left
/// without a primary company or without coordinates. Otherwise the
/// failures are notes on a `Completed` project.
fn finish(project: Project, failures: Vec<StageFailure>) -> Assembled {
    let project = failures
        .iter()
        .fold(project, |p, failure| p.with_error(failure.to_string()));
    let incomplete =
        project.primary_company().is_none() || project.location().coordinates().is_none();

    let deciding = if incomplete || project.processing_stage() != ProcessingStage::Assembling {
        failures.into_iter().next()
    } else {
        None
    };
    match deciding {
        Some(failure) => Assembled {
            project: fail(project),
            failure: Some(failure),
        },
        None => match project.advance(ProcessingStage::Completed) {
            Ok(done) => Assembled {
                project: done,
                failure: None,
            },
            Err(e) => {
                let failure = StageFailure::new("stage", &e);
                Assembled {
                    project: fail(project.with_error(failure.to_string())),
                    failure: Some(failure),
                }
            }
        },
    }
}

/// Move to `Failed` unless the project already reached a terminal stage.
fn fail(project: Project) -> Project {
    if project.processing_stage().is_terminal() {
        return project;
    }
    project.advance(ProcessingStage::Failed).unwrap_or(project)
}

/// Attach resolved relationships, backfilling the operator from the primary
/// company (or the first relationship) when the project has none.
fn attach_relationships(project: &Project, relationships: Vec<CompanyRelationship>) -> Project {
    if relationships.is_empty() {
        return project.clone();
    }
    let primary = select_primary(&relationships).map(CompanyRelationship::company);
    let fallback_name = relationships.first().map(|r| r.company_name.clone());
    let operator = primary
        .as_ref()
        .map(|c| c.name.clone())
        .filter(|n| !n.trim().is_empty())
        .or(fallback_name)
        .filter(|n| !n.trim().is_empty());

    let next = project.with_relationships(relationships, primary);
    match operator {
        Some(name) if next.operator().is_none() => next.with_operator(name),
        _ => next,
    }
}

/// Map-page coordinates, merged only into empty coordinate fields.
///
/// "No map on the page" is not an error; a provider error or the timeout is.
async fn locate_on_map(
    project: &Project,
    provider: &dyn MapCenterProvider,
    limit: Duration,
) -> Result<Project> {
    let center = match tokio::time::timeout(limit, provider.map_center(project.id())).await {
        Ok(Ok(center)) => center,
        Ok(Err(e)) => {
            warn!(id = project.id(), error = %e, "map centre lookup failed");
            return Err(e);
        }
        Err(_) => {
            let timeout_ms = limit.as_millis() as u64;
            warn!(id = project.id(), timeout_ms, "map centre lookup timed out");
            return Err(ProspectorError::unavailable(format!(
                "map centre lookup timed out after {timeout_ms} ms"
            )));
        }
    };
    let Some(center) = center else {
        return Ok(project.clone());
    };

    let mut location = project.location().clone();
    location.latitude = Some(center.latitude);
    location.longitude = Some(center.longitude);
    location.prefer_source(LocationSource::ScrapedMap);
    debug!(id = project.id(), "coordinates taken from map centre");
    Ok(project.with_location(location))
}
