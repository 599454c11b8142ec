//! Core pipeline orchestration and domain logic for Prospector.
//!
//! This crate ties together discovery, company resolution, project
//! assembly, location enrichment, and registry reconciliation into one
//! end-to-end run (see [`pipeline::run`]).

pub mod assembler;
pub mod cache;
pub mod enrichment;
pub mod ledger;
pub mod metrics;
pub mod pipeline;
pub mod reconcile;
pub mod resolver;

pub use assembler::{AssemblyContext, AssemblyResult, ProjectAssembler};
pub use cache::{Cache, MemoryCache};
pub use ledger::{ScrapeLedger, ScrapeOutcome, ScrapedCompanyUrls};
pub use metrics::{MetricsSnapshot, ProcessingMetrics};
pub use pipeline::{PipelineDeps, ProgressReporter, RunReport, SilentProgress, run};
pub use reconcile::{AuditReport, AuditRow, AuditStatus, CoverageSummary, OrphanRow, OrphanStatus};
pub use resolver::{CompanyResolver, Resolution, select_primary};
