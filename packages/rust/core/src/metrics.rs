//! Thread-safe processing metrics accumulated across batches.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use prospector_shared::{DataSource, Project, ProspectorError, StageFailure};

#[derive(Debug, Default)]
pub struct ProcessingMetrics {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    api_projects: AtomicU64,
    scraped_projects: AtomicU64,
    relationships_enriched: AtomicU64,
    by_source: [AtomicU64; DataSource::ALL.len()],
    started_at: Mutex<Option<DateTime<Utc>>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    error_summary: Mutex<BTreeMap<String, u64>>,
}

/// Point-in-time copy of [`ProcessingMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub api_projects: u64,
    pub scraped_projects: u64,
    pub relationships_enriched: u64,
    pub by_source: BTreeMap<DataSource, u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    /// Completed over total, in percent.
    pub success_rate: f64,
    pub error_summary: BTreeMap<String, u64>,
}

impl ProcessingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of a batch of `count` ids. The first call fixes the
    /// start timestamp.
    pub fn begin_batch(&self, count: usize) {
        self.total.fetch_add(count as u64, Ordering::Relaxed);
        self.started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(Utc::now);
    }

    /// Record the end of a batch; the latest call wins.
    pub fn end_batch(&self) {
        *self.finished_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    /// Count one assembled project and its provenance.
    pub fn record_project(&self, project: &Project) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let sources = project.data_sources();
        if sources.contains(&DataSource::Api) {
            self.api_projects.fetch_add(1, Ordering::Relaxed);
        }
        if sources.contains(&DataSource::Scraper) {
            self.scraped_projects.fetch_add(1, Ordering::Relaxed);
        }
        if project
            .primary_company()
            .is_some_and(|c| c.data_source == DataSource::Relationships)
        {
            self.relationships_enriched.fetch_add(1, Ordering::Relaxed);
        }
        for (slot, source) in self.by_source.iter().zip(DataSource::ALL) {
            if sources.contains(&source) {
                slot.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Count one id that produced no project, keyed by the error's kind.
    pub fn record_error(&self, err: &ProspectorError) {
        self.record_failure(err.kind());
    }

    /// Count one project that finished `Failed`, keyed by the kind of the
    /// stage failure that decided it.
    pub fn record_stage_failure(&self, failure: &StageFailure) {
        self.record_failure(failure.kind);
    }

    fn record_failure(&self, kind: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        *self
            .error_summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind.to_string())
            .or_default() += 1;
    }

    /// Count ids never handed to a batch (e.g. after cancellation).
    pub fn record_skipped(&self, count: usize) {
        self.skipped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let started_at = *self.started_at.lock().unwrap_or_else(PoisonError::into_inner);
        let finished_at = *self.finished_at.lock().unwrap_or_else(PoisonError::into_inner);
        let total = load(&self.total);
        let completed = load(&self.completed);

        MetricsSnapshot {
            total,
            completed,
            failed: load(&self.failed),
            skipped: load(&self.skipped),
            api_projects: load(&self.api_projects),
            scraped_projects: load(&self.scraped_projects),
            relationships_enriched: load(&self.relationships_enriched),
            by_source: DataSource::ALL
                .into_iter()
                .zip(self.by_source.iter().map(load))
                .collect(),
            started_at,
            finished_at,
            duration_seconds: match (started_at, finished_at) {
                (Some(s), Some(f)) => Some((f - s).num_milliseconds() as f64 / 1000.0),
                _ => None,
            },
            success_rate: if total == 0 {
                0.0
            } else {
                completed as f64 / total as f64 * 100.0
            },
            error_summary: self
                .error_summary
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prospector_shared::{Company, CompanyRelationship, RawProject};

    #[test]
    fn counts_provenance_and_rates() {
        let metrics = ProcessingMetrics::new();
        metrics.begin_batch(4);

        let api = Project::from_safe_data(&RawProject {
            id: "1".into(),
            ..Default::default()
        });
        let rel = CompanyRelationship::operator("c", "Acme", None, DataSource::Relationships);
        let enriched = api.with_relationships(
            vec![rel],
            Some(Company::new("c", "Acme", DataSource::Relationships)),
        );
        metrics.record_project(&enriched);
        metrics.record_project(&Project::new("2").with_data_source(DataSource::Scraper));
        metrics.record_error(&ProspectorError::not_found("project 3"));
        metrics.record_stage_failure(&StageFailure::new(
            "map centre",
            &ProspectorError::unavailable("map page: HTTP 503"),
        ));
        metrics.end_batch();

        let snap = metrics.snapshot();
        assert_eq!(snap.total, 4);
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.failed, 2);
        assert_eq!(snap.api_projects, 1);
        assert_eq!(snap.scraped_projects, 1);
        assert_eq!(snap.relationships_enriched, 1);
        assert_eq!(snap.by_source[&DataSource::Relationships], 1);
        assert_eq!(snap.error_summary["not_found"], 1);
        assert_eq!(snap.error_summary["provider_unavailable"], 1);
        assert_eq!(snap.success_rate, 50.0);
        assert!(snap.duration_seconds.is_some());
    }

    #[test]
    fn start_is_kept_across_batches() {
        let metrics = ProcessingMetrics::new();
        metrics.begin_batch(1);
        let first = metrics.snapshot().started_at;
        metrics.begin_batch(1);
        assert_eq!(metrics.snapshot().started_at, first);
        assert_eq!(metrics.snapshot().total, 2);
        assert_eq!(metrics.snapshot().success_rate, 0.0);
    }
}
