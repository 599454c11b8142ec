//! Reconciliation between the authoritative sources and the identifier
//! registry.
//!
//! Produces audit rows for ids present on one side only, orphan rows for
//! assembled projects whose primary company has no registry URL, and a
//! per-kind coverage summary.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use prospector_discovery::{EntityKind, IdentifierRegistry};
use prospector_shared::Project;

use crate::ledger::ScrapedCompanyUrls;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditStatus {
    #[serde(rename = "in-source-but-missing-registry")]
    InSourceMissingRegistry,
    #[serde(rename = "in-registry-but-missing-source")]
    InRegistryMissingSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRow {
    pub id: String,
    pub kind: EntityKind,
    pub status: AuditStatus,
    pub url: Option<String>,
    pub note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanStatus {
    Resolved,
    Unresolved,
}

/// An assembled project whose primary company is missing a registry URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrphanRow {
    pub project_id: String,
    pub project_name: Option<String>,
    pub company_id: String,
    pub company_name: String,
    pub status: OrphanStatus,
    /// URL recovered from pages scraped in the same run.
    pub resolved_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageSummary {
    pub kind: EntityKind,
    pub source_total: usize,
    pub with_registry_url: usize,
    pub coverage_percent: f64,
}

/// One side of a comparison: ids plus whatever URLs are known for them.
#[derive(Debug, Clone, Default)]
pub struct IdSet {
    pub ids: BTreeSet<String>,
    pub urls: BTreeMap<String, String>,
}

impl IdSet {
    pub fn new(ids: BTreeSet<String>, urls: BTreeMap<String, String>) -> Self {
        Self { ids, urls }
    }

    /// The registry's ids and URLs for `kind`.
    pub fn from_registry(registry: &IdentifierRegistry, kind: EntityKind) -> Self {
        Self::new(registry.ids(kind), registry.urls(kind))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub generated_at: DateTime<Utc>,
    pub rows: Vec<AuditRow>,
    pub orphans: Vec<OrphanRow>,
    pub coverage: Vec<CoverageSummary>,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// `source − registry` and `registry − source` for one kind, in id order.
pub fn reconcile(kind: EntityKind, source: &IdSet, registry: &IdSet) -> Vec<AuditRow> {
    let missing_registry = source.ids.difference(&registry.ids).map(|id| AuditRow {
        id: id.clone(),
        kind,
        status: AuditStatus::InSourceMissingRegistry,
        url: source.urls.get(id).cloned(),
        note: format!("{kind} returned by the source but absent from the registry"),
    });
    let missing_source = registry.ids.difference(&source.ids).map(|id| AuditRow {
        id: id.clone(),
        kind,
        status: AuditStatus::InRegistryMissingSource,
        url: registry.urls.get(id).cloned(),
        note: format!("{kind} listed in the registry but not returned by the source"),
    });
    missing_registry.chain(missing_source).collect()
}

/// Projects whose primary company has no registry URL, each with a
/// resolution attempt against scraped company links.
pub fn find_orphans(
    projects: &[Project],
    registry: &IdentifierRegistry,
    scraped: &ScrapedCompanyUrls,
) -> Vec<OrphanRow> {
    projects
        .iter()
        .filter_map(|project| {
            let company = project.primary_company()?;
            if registry.lookup(&company.id, EntityKind::Company).is_some() {
                return None;
            }
            let resolved_url = scraped.lookup(&company.id, &company.name).map(String::from);
            Some(OrphanRow {
                project_id: project.id().to_string(),
                project_name: project.name().map(String::from),
                company_id: company.id.clone(),
                company_name: company.name.clone(),
                status: if resolved_url.is_some() {
                    OrphanStatus::Resolved
                } else {
                    OrphanStatus::Unresolved
                },
                resolved_url,
            })
        })
        .collect()
}

pub fn coverage(kind: EntityKind, source: &IdSet, registry: &IdSet) -> CoverageSummary {
    let source_total = source.ids.len();
    let with_registry_url = source
        .ids
        .iter()
        .filter(|id| registry.urls.contains_key(*id))
        .count();
    CoverageSummary {
        kind,
        source_total,
        with_registry_url,
        coverage_percent: if source_total == 0 {
            0.0
        } else {
            with_registry_url as f64 / source_total as f64 * 100.0
        },
    }
}

/// Full audit for both kinds.
pub fn build_report(
    projects: (&IdSet, &IdSet),
    companies: (&IdSet, &IdSet),
    assembled: &[Project],
    registry: &IdentifierRegistry,
    scraped: &ScrapedCompanyUrls,
) -> AuditReport {
    let mut rows = reconcile(EntityKind::Project, projects.0, projects.1);
    rows.extend(reconcile(EntityKind::Company, companies.0, companies.1));
    let orphans = find_orphans(assembled, registry, scraped);
    let coverage = vec![
        coverage(EntityKind::Project, projects.0, projects.1),
        coverage(EntityKind::Company, companies.0, companies.1),
    ];

    info!(
        rows = rows.len(),
        orphans = orphans.len(),
        unresolved = orphans
            .iter()
            .filter(|o| o.status == OrphanStatus::Unresolved)
            .count(),
        "reconciliation complete"
    );

    AuditReport {
        generated_at: Utc::now(),
        rows,
        orphans,
        coverage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use prospector_providers::ScrapeProvider;
    use prospector_shared::{Company, CompanyRelationship, DataSource, Result, ScrapedRecord};

    use crate::ledger::ScrapeLedger;

    fn set(ids: &[&str]) -> IdSet {
        IdSet::new(ids.iter().map(|s| s.to_string()).collect(), BTreeMap::new())
    }

    #[test]
    fn differences_are_symmetric() {
        let mut source = set(&["1", "2", "3"]);
        source.urls.insert("1".into(), "https://site.test/project-profile?gid=1".into());
        let mut registry = set(&["2", "3", "4"]);
        registry.urls.insert("4".into(), "https://site.test/project-profile?gid=4".into());

        let rows = reconcile(EntityKind::Project, &source, &registry);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "1");
        assert_eq!(rows[0].status, AuditStatus::InSourceMissingRegistry);
        assert_eq!(rows[0].url.as_deref(), Some("https://site.test/project-profile?gid=1"));
        assert_eq!(rows[1].id, "4");
        assert_eq!(rows[1].status, AuditStatus::InRegistryMissingSource);
        assert_eq!(rows[1].url.as_deref(), Some("https://site.test/project-profile?gid=4"));
    }

    #[test]
    fn status_serializes_as_kebab_tags() {
        let json = serde_json::to_string(&AuditStatus::InRegistryMissingSource).expect("json");
        assert_eq!(json, "\"in-registry-but-missing-source\"");
    }

    #[test]
    fn coverage_counts_registry_urls() {
        let source = set(&["1", "2", "3", "4"]);
        let mut registry = set(&["1", "2"]);
        registry.urls.insert("1".into(), "u1".into());
        let c = coverage(EntityKind::Company, &source, &registry);
        assert_eq!(c.source_total, 4);
        assert_eq!(c.with_registry_url, 1);
        assert_eq!(c.coverage_percent, 25.0);
    }

    struct OnePage;

    #[async_trait]
    impl ScrapeProvider for OnePage {
        async fn scrape(&self, _id: &str) -> Result<Option<ScrapedRecord>> {
            Ok(Some(ScrapedRecord {
                company_id: Some("77".into()),
                company_name: Some("Scraped Co".into()),
                company_url: Some("https://site.test/company-profile?gid=77".into()),
                ..Default::default()
            }))
        }
    }

    fn project_with_primary(id: &str, company_id: &str, name: &str) -> Project {
        let rel = CompanyRelationship::operator(company_id, name, None, DataSource::Scraper);
        Project::new(id).with_relationships(
            vec![rel],
            Some(Company::new(company_id, name, DataSource::Scraper)),
        )
    }

    #[tokio::test]
    async fn orphans_resolve_from_scraped_links() {
        let ledger = ScrapeLedger::new(Arc::new(OnePage));
        ledger.record("p1").await;
        let registry = IdentifierRegistry::from_entries(
            Vec::new(),
            [("10".to_string(), Some("https://site.test/company-profile?gid=10".to_string()))],
        );
        let projects = vec![
            project_with_primary("a", "10", "Listed Co"),
            project_with_primary("b", "77", "Scraped Co"),
            project_with_primary("c", "99", "Nowhere Co"),
            Project::new("d"),
        ];

        let orphans = find_orphans(&projects, &registry, &ledger.company_urls());
        assert_eq!(orphans.len(), 2);
        assert_eq!(orphans[0].project_id, "b");
        assert_eq!(orphans[0].status, OrphanStatus::Resolved);
        assert_eq!(
            orphans[0].resolved_url.as_deref(),
            Some("https://site.test/company-profile?gid=77")
        );
        assert_eq!(orphans[1].project_id, "c");
        assert_eq!(orphans[1].status, OrphanStatus::Unresolved);
    }
}
