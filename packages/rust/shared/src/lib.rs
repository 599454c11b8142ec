//! Shared types, error model, and configuration for Prospector.
//!
//! This crate is the foundation depended on by all other Prospector crates.
//! It provides:
//! - [`ProspectorError`]: the unified error type
//! - Domain types ([`Project`], [`Company`], [`CompanyRelationship`], [`Location`])
//! - Typed provider records ([`RawProject`], [`RelationshipGraph`], [`ScrapedRecord`])
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)

pub mod config;
pub mod error;
pub mod records;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    ApiConfig, AppConfig, AssemblyConfig, DiscoveryConfig, GeocodingConfig, RunConfig,
    ScraperConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    validate_api_token,
};
pub use error::{ProspectorError, Result, StageFailure};
pub use records::{
    Centroid, GeoAddress, GeocodeHit, MapCenter, RawProject, RelationshipEntry,
    RelationshipGraph, ScrapedRecord, non_empty, string_or_number,
};
pub use types::{
    Company, CompanyRelationship, DataSource, Location, LocationSource, Percentage,
    ProcessingStage, Project, RelationshipType, SURROGATE_PREFIX, is_surrogate_id,
    surrogate_company_id,
};
