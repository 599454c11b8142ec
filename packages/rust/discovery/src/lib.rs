//! Candidate identifier discovery.
//!
//! Discovery unions the project ids returned by the query provider across
//! all partitions with the ids listed in the static identifier registry.
//! Rows returned by the query provider are kept as "safe data" so assembly
//! does not have to fetch them a second time.

mod registry;

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, instrument, warn};

use prospector_providers::QueryProvider;
use prospector_shared::{RawProject, non_empty};

pub use registry::{EntityKind, IdentifierRegistry};

// ---------------------------------------------------------------------------
// DiscoveryReport
// ---------------------------------------------------------------------------

/// Everything discovery learned in one pass.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    /// Ids selected for assembly (union, capped if configured).
    pub ids: BTreeSet<String>,
    /// Every project id the query provider returned.
    pub source_ids: BTreeSet<String>,
    /// Company ids carried on query rows.
    pub source_company_ids: BTreeSet<String>,
    /// Every project id listed in the registry.
    pub registry_ids: BTreeSet<String>,
    /// Query rows by project id; first partition wins on duplicates.
    pub safe_data: HashMap<String, RawProject>,
    /// Partitions whose fetch failed.
    pub failed_partitions: Vec<String>,
}

// ---------------------------------------------------------------------------
// DiscoveryService
// ---------------------------------------------------------------------------

pub struct DiscoveryService {
    query: Arc<dyn QueryProvider>,
    registry: Arc<IdentifierRegistry>,
    max_projects: Option<usize>,
}

impl DiscoveryService {
    pub fn new(
        query: Arc<dyn QueryProvider>,
        registry: Arc<IdentifierRegistry>,
        max_projects: Option<usize>,
    ) -> Self {
        Self {
            query,
            registry,
            max_projects,
        }
    }

    /// Deduplicated union of source and registry project ids.
    pub async fn find_all_ids(&self, partitions: &[String]) -> BTreeSet<String> {
        self.discover(partitions).await.ids
    }

    /// Query every partition concurrently and merge with the registry.
    ///
    /// A failing partition is logged and skipped; discovery itself never
    /// fails.
    #[instrument(skip_all, fields(partitions = partitions.len()))]
    pub async fn discover(&self, partitions: &[String]) -> DiscoveryReport {
        let fetches = partitions.iter().map(|p| {
            let query = Arc::clone(&self.query);
            async move { (p.clone(), query.fetch_partition(p).await) }
        });

        let mut report = DiscoveryReport::default();
        for (partition, result) in join_all(fetches).await {
            match result {
                Ok(rows) => {
                    info!(partition = %partition, count = rows.len(), "partition fetched");
                    for row in rows {
                        if let Some(company) = non_empty(row.company_id.as_deref()) {
                            report.source_company_ids.insert(company.to_string());
                        }
                        report.source_ids.insert(row.id.clone());
                        report.safe_data.entry(row.id.clone()).or_insert(row);
                    }
                }
                Err(e) => {
                    warn!(partition = %partition, error = %e, "partition fetch failed, skipping");
                    report.failed_partitions.push(partition);
                }
            }
        }

        report.registry_ids = self.registry.ids(EntityKind::Project);
        report.ids = self.select(&report.source_ids, &report.registry_ids);

        info!(
            source = report.source_ids.len(),
            registry = report.registry_ids.len(),
            selected = report.ids.len(),
            "discovery complete"
        );
        report
    }

    /// Union of both sets, truncated to the cap with source ids first.
    /// Within each side, ids are taken in [`id_order`].
    fn select(&self, source: &BTreeSet<String>, registry: &BTreeSet<String>) -> BTreeSet<String> {
        let union_len = source.union(registry).count();
        match self.max_projects {
            Some(cap) if union_len > cap => {
                info!(cap, union_len, "capping discovered ids, preferring source ids");
                let mut from_source: Vec<&String> = source.iter().collect();
                let mut from_registry: Vec<&String> = registry.difference(source).collect();
                from_source.sort_by(|a, b| id_order(a, b));
                from_registry.sort_by(|a, b| id_order(a, b));
                from_source
                    .into_iter()
                    .chain(from_registry)
                    .take(cap)
                    .cloned()
                    .collect()
            }
            _ => source.union(registry).cloned().collect(),
        }
    }
}

/// Numeric ids by value, ahead of any non-numeric id; the rest by string.
pub fn id_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use prospector_shared::{ProspectorError, Result};

    struct StubQuery;

    #[async_trait]
    impl QueryProvider for StubQuery {
        async fn fetch_partition(&self, partition: &str) -> Result<Vec<RawProject>> {
            let row = |id: &str| RawProject {
                id: id.into(),
                company_id: Some(format!("c{id}")),
                ..Default::default()
            };
            match partition {
                "Australia" => Ok(vec![row("1"), row("2")]),
                "Canada" => Ok(vec![row("2"), row("3")]),
                "Chile" => Ok(vec![row("10"), row("9"), row("100")]),
                _ => Err(ProspectorError::unavailable("HTTP 503")),
            }
        }
    }

    fn registry(ids: &[&str]) -> Arc<IdentifierRegistry> {
        Arc::new(IdentifierRegistry::from_entries(
            ids.iter().map(|id| (id.to_string(), None)),
            Vec::new(),
        ))
    }

    fn partitions(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn union_of_sources_with_failed_partition_skipped() {
        let svc = DiscoveryService::new(Arc::new(StubQuery), registry(&["3", "4"]), None);
        let report = svc
            .discover(&partitions(&["Australia", "Brazil", "Canada"]))
            .await;
        assert_eq!(report.ids, set(&["1", "2", "3", "4"]));
        assert_eq!(report.source_ids, set(&["1", "2", "3"]));
        assert_eq!(report.registry_ids, set(&["3", "4"]));
        assert_eq!(report.failed_partitions, vec!["Brazil".to_string()]);
        assert_eq!(report.safe_data.len(), 3);
        assert!(report.source_company_ids.contains("c2"));
    }

    #[tokio::test]
    async fn cap_prefers_ids_with_safe_data() {
        let svc = DiscoveryService::new(Arc::new(StubQuery), registry(&["0", "9"]), Some(3));
        let ids = svc.find_all_ids(&partitions(&["Australia", "Canada"])).await;
        assert_eq!(ids, set(&["1", "2", "3"]));
    }

    #[tokio::test]
    async fn cap_fills_with_registry_ids() {
        let svc = DiscoveryService::new(Arc::new(StubQuery), registry(&["0", "9"]), Some(4));
        let ids = svc.find_all_ids(&partitions(&["Australia", "Canada"])).await;
        assert_eq!(ids, set(&["0", "1", "2", "3"]));
    }

    #[tokio::test]
    async fn cap_takes_ids_in_numeric_order() {
        let svc = DiscoveryService::new(Arc::new(StubQuery), registry(&["8", "11"]), Some(4));
        let ids = svc.find_all_ids(&partitions(&["Chile"])).await;
        assert_eq!(ids, set(&["9", "10", "100", "8"]));

        let svc = DiscoveryService::new(Arc::new(StubQuery), registry(&[]), Some(1));
        let ids = svc.find_all_ids(&partitions(&["Chile"])).await;
        assert_eq!(ids, set(&["9"]));
    }

    #[test]
    fn numeric_ids_sort_by_value() {
        let mut ids = vec!["10", "abc", "9", "010", "2"];
        ids.sort_by(|a, b| id_order(a, b));
        assert_eq!(ids, vec!["2", "9", "010", "10", "abc"]);
    }

    #[tokio::test]
    async fn every_partition_failing_still_returns_registry_ids() {
        let svc = DiscoveryService::new(Arc::new(StubQuery), registry(&["7"]), None);
        let ids = svc.find_all_ids(&partitions(&["Peru"])).await;
        assert_eq!(ids, set(&["7"]));
    }
}
