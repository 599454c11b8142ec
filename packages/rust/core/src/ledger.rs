//! Per-run scrape ledger.
//!
//! The resolver's scrape tier and the assembler's minimal-record fallback
//! both need the same page for an id. The ledger makes that a single
//! provider call per id per run and keeps every result so the company
//! links seen along the way can later resolve orphaned companies.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;
use tracing::{debug, warn};

use prospector_providers::ScrapeProvider;
use prospector_shared::{ScrapedRecord, StageFailure, non_empty};

pub type ScrapeOutcome = std::result::Result<Option<ScrapedRecord>, StageFailure>;
type Slot = Arc<OnceCell<ScrapeOutcome>>;

pub struct ScrapeLedger {
    provider: Arc<dyn ScrapeProvider>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ScrapeLedger {
    pub fn new(provider: Arc<dyn ScrapeProvider>) -> Self {
        Self {
            provider,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Scrape `id` once; later and concurrent callers share the result.
    ///
    /// Provider errors read as "nothing usable" here; [`Self::outcome`]
    /// keeps the failure.
    pub async fn record(&self, id: &str) -> Option<ScrapedRecord> {
        self.outcome(id).await.ok().flatten()
    }

    /// Like [`Self::record`], but a provider error is returned as the
    /// remembered [`StageFailure`].
    pub async fn outcome(&self, id: &str) -> ScrapeOutcome {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(id.to_string()).or_default())
        };
        slot.get_or_init(|| async {
            self.provider.scrape(id).await.map_err(|e| {
                warn!(id, error = %e, "scrape failed");
                StageFailure::new("scrape", &e)
            })
        })
        .await
        .clone()
    }

    /// Company links collected from every page scraped so far.
    pub fn company_urls(&self) -> ScrapedCompanyUrls {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut urls = ScrapedCompanyUrls::default();
        let records = slots
            .values()
            .filter_map(|s| s.get())
            .filter_map(|outcome| outcome.as_ref().ok())
            .flatten();
        for record in records {
            let Some(url) = non_empty(record.company_url.as_deref()) else {
                continue;
            };
            if let Some(id) = non_empty(record.company_id.as_deref()) {
                urls.by_id.entry(id.to_string()).or_insert_with(|| url.to_string());
            }
            if let Some(name) = record.company_label() {
                urls.by_name
                    .entry(normalize_name(name))
                    .or_insert_with(|| url.to_string());
            }
        }
        debug!(
            by_id = urls.by_id.len(),
            by_name = urls.by_name.len(),
            "collected scraped company urls"
        );
        urls
    }

    /// Number of ids scraped (or being scraped) in this run.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Company URLs seen on scraped pages, by company id and by name.
#[derive(Debug, Clone, Default)]
pub struct ScrapedCompanyUrls {
    by_id: BTreeMap<String, String>,
    by_name: BTreeMap<String, String>,
}

impl ScrapedCompanyUrls {
    /// Id match first, then a case- and whitespace-insensitive name match.
    pub fn lookup(&self, company_id: &str, company_name: &str) -> Option<&str> {
        self.by_id
            .get(company_id)
            .or_else(|| self.by_name.get(&normalize_name(company_name)))
            .map(String::as_str)
    }
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
