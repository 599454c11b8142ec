//! Data providers consumed by discovery and assembly.
//!
//! Each provider is an async trait so the pipeline can run against the real
//! HTTP implementations in this crate or against in-memory stubs in tests.
//! Every implementation parses its wire format into the typed records from
//! `prospector_shared::records` before returning.

pub mod api;
pub mod cache;
pub mod client;
pub mod geocoding;
pub mod map_center;
pub mod scrape;

use async_trait::async_trait;
use prospector_shared::{GeocodeHit, MapCenter, RawProject, RelationshipGraph, Result, ScrapedRecord};

pub use api::HubApiClient;
pub use cache::{GeocodeCache, MemoryGeocodeCache};
pub use client::{HttpClient, RetryPolicy};
pub use geocoding::{GeocodingService, NominatimGeocoder, forward_key, reverse_key};
pub use map_center::HttpMapCenter;
pub use scrape::HttpScrapeProvider;

/// Fetches candidate project rows for one partition (a country).
#[async_trait]
pub trait QueryProvider: Send + Sync {
    async fn fetch_partition(&self, partition: &str) -> Result<Vec<RawProject>>;
}

/// Fetches the company relationship graph for one project id.
#[async_trait]
pub trait RelationshipProvider: Send + Sync {
    async fn fetch_relationships(&self, id: &str) -> Result<RelationshipGraph>;
}

/// Best-effort extraction of a project page.
///
/// `Ok(None)` means the page yielded nothing usable.
#[async_trait]
pub trait ScrapeProvider: Send + Sync {
    async fn scrape(&self, id: &str) -> Result<Option<ScrapedRecord>>;
}

/// Reverse and forward geocoding.
#[async_trait]
pub trait GeocodingProvider: Send + Sync {
    async fn reverse(&self, latitude: f64, longitude: f64) -> Result<Option<GeocodeHit>>;
    async fn forward(&self, text: &str) -> Result<Option<GeocodeHit>>;
}

/// Looks up the centre of the map displayed for a project.
#[async_trait]
pub trait MapCenterProvider: Send + Sync {
    async fn map_center(&self, id: &str) -> Result<Option<MapCenter>>;
}
