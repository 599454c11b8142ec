//! Company resolution: a tiered fallback chain from richest to poorest
//! source.
//!
//! 1. Relationship provider (ownership, royalty, option families).
//! 2. Scraped page (one operator relationship).
//! 3. Operator name carried on the query row (one operator relationship at
//!    100% under a surrogate id).
//!
//! A tier runs only when every earlier tier produced nothing. Provider
//! errors are treated as "no data" so `resolve` never fails, but they are
//! kept on the [`Resolution`] for the assembler to judge the record.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use prospector_providers::RelationshipProvider;
use prospector_shared::{
    CompanyRelationship, DataSource, Percentage, RawProject, RelationshipGraph, RelationshipType,
    StageFailure, non_empty, surrogate_company_id,
};

use crate::cache::{Cache, MemoryCache};
use crate::ledger::ScrapeLedger;

const UNKNOWN_COMPANY: &str = "Unknown Company";

/// Relationships for one id plus the provider failures hit on the way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub relationships: Vec<CompanyRelationship>,
    pub failures: Vec<StageFailure>,
}

pub struct CompanyResolver {
    relationships: Arc<dyn RelationshipProvider>,
    scraper: Arc<ScrapeLedger>,
    cache: Arc<dyn Cache<String, Resolution>>,
}

impl CompanyResolver {
    pub fn new(relationships: Arc<dyn RelationshipProvider>, scraper: Arc<ScrapeLedger>) -> Self {
        Self::with_cache(relationships, scraper, Arc::new(MemoryCache::new()))
    }

    pub fn with_cache(
        relationships: Arc<dyn RelationshipProvider>,
        scraper: Arc<ScrapeLedger>,
        cache: Arc<dyn Cache<String, Resolution>>,
    ) -> Self {
        Self {
            relationships,
            scraper,
            cache,
        }
    }

    /// Ordered relationships for `id`, memoized for the resolver's lifetime.
    pub async fn resolve(
        &self,
        id: &str,
        safe_data: Option<&RawProject>,
    ) -> Vec<CompanyRelationship> {
        self.resolve_detailed(id, safe_data).await.relationships
    }

    /// [`Self::resolve`] plus the failures of every tier that ran.
    #[instrument(skip_all, fields(id = %id))]
    pub async fn resolve_detailed(&self, id: &str, safe_data: Option<&RawProject>) -> Resolution {
        if let Some(hit) = self.cache.get(&id.to_string()) {
            debug!(id, "resolver cache hit");
            return hit;
        }

        let mut failures = Vec::new();
        let mut relationships = self.relationship_tier(id, &mut failures).await;
        if relationships.is_empty() {
            relationships = self.scrape_tier(id, &mut failures).await;
        }
        if relationships.is_empty() {
            relationships = operator_tier(safe_data);
        }
        let resolution = Resolution {
            relationships,
            failures,
        };

        debug!(
            id,
            count = resolution.relationships.len(),
            failures = resolution.failures.len(),
            "companies resolved"
        );
        self.cache.put(id.to_string(), resolution.clone());
        resolution
    }

    async fn relationship_tier(
        &self,
        id: &str,
        failures: &mut Vec<StageFailure>,
    ) -> Vec<CompanyRelationship> {
        match self.relationships.fetch_relationships(id).await {
            Ok(graph) => flatten_graph(id, &graph),
            Err(e) => {
                warn!(id, error = %e, "relationship lookup failed");
                failures.push(StageFailure::new("relationships", &e));
                Vec::new()
            }
        }
    }

    async fn scrape_tier(
        &self,
        id: &str,
        failures: &mut Vec<StageFailure>,
    ) -> Vec<CompanyRelationship> {
        let record = match self.scraper.outcome(id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Vec::new(),
            Err(failure) => {
                failures.push(failure);
                return Vec::new();
            }
        };
        if !record.identifies_company() {
            return Vec::new();
        }
        let name = record.company_label().unwrap_or(UNKNOWN_COMPANY);
        let company_id = non_empty(record.company_id.as_deref())
            .map(String::from)
            .unwrap_or_else(|| surrogate_company_id(name));

        let mut relationship =
            CompanyRelationship::operator(company_id, name, None, DataSource::Scraper);
        relationship.company_details = Some(relationship.company());
        vec![relationship]
    }
}

/// Ownership, then royalty, then options (flattened one level). Entries
/// that fail validation are skipped.
fn flatten_graph(id: &str, graph: &RelationshipGraph) -> Vec<CompanyRelationship> {
    let families = graph
        .ownership
        .iter()
        .map(|e| (e, RelationshipType::Ownership))
        .chain(graph.royalties.iter().map(|e| (e, RelationshipType::Royalty)))
        .chain(
            graph
                .options
                .iter()
                .flatten()
                .map(|e| (e, RelationshipType::Option)),
        );
    families
        .filter_map(|(entry, kind)| match CompanyRelationship::from_entry(entry, kind) {
            Ok(relationship) => Some(relationship),
            Err(e) => {
                warn!(id, company = %entry.id, error = %e, "skipping malformed relationship entry");
                None
            }
        })
        .collect()
}

fn operator_tier(safe_data: Option<&RawProject>) -> Vec<CompanyRelationship> {
    let Some(operator) = safe_data.and_then(|raw| non_empty(raw.operator.as_deref())) else {
        return Vec::new();
    };
    let mut relationship = CompanyRelationship::operator(
        surrogate_company_id(operator),
        operator,
        Some(Percentage::FULL),
        DataSource::Api,
    );
    relationship.company_details = Some(relationship.company());
    vec![relationship]
}

/// The ownership relationship with the highest percentage (first seen wins
/// ties, a missing percentage counts as zero); otherwise the first
/// relationship.
pub fn select_primary(relationships: &[CompanyRelationship]) -> Option<&CompanyRelationship> {
    let share = |r: &CompanyRelationship| r.percentage.map_or(0.0, Percentage::value);
    relationships
        .iter()
        .filter(|r| r.relationship_type == RelationshipType::Ownership)
        .fold(None, |best: Option<&CompanyRelationship>, r| match best {
            Some(b) if share(r) <= share(b) => Some(b),
            _ => Some(r),
        })
        .or_else(|| relationships.first())
}
