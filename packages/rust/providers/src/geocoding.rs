//! Nominatim geocoder and the paced, cached geocoding service.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use prospector_shared::{GeoAddress, GeocodeHit, GeocodingConfig, Result, non_empty};

use crate::GeocodingProvider;
use crate::cache::GeocodeCache;
use crate::client::{HttpClient, RetryPolicy};

// ---------------------------------------------------------------------------
// Cache keys
// ---------------------------------------------------------------------------

/// Cache key for a reverse lookup. Eight decimals keeps keys distinct for
/// points a millimetre apart.
pub fn reverse_key(latitude: f64, longitude: f64) -> String {
    format!("rev:{latitude:.8},{longitude:.8}")
}

/// Cache key for a forward lookup: whitespace-collapsed, lowercased text.
pub fn forward_key(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("fwd:{}", normalized.to_lowercase())
}

// ---------------------------------------------------------------------------
// Nominatim wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    #[serde(default)]
    lat: Option<String>,
    #[serde(default)]
    lon: Option<String>,
    #[serde(default)]
    address: Option<NominatimAddress>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NominatimAddress {
    state: Option<String>,
    state_district: Option<String>,
    region: Option<String>,
    province: Option<String>,
    territory: Option<String>,
    country: Option<String>,
    postcode: Option<String>,
    county: Option<String>,
    #[serde(rename = "ISO3166-2-lvl4")]
    iso_lvl4: Option<String>,
    #[serde(rename = "ISO3166-2-lvl6")]
    iso_lvl6: Option<String>,
}

impl NominatimPlace {
    fn into_hit(self) -> Option<GeocodeHit> {
        if let Some(err) = self.error {
            debug!(error = %err, "geocoder returned no result");
            return None;
        }
        let parse = |v: Option<String>| v.and_then(|s| s.trim().parse::<f64>().ok());
        let address = self.address.unwrap_or_default();
        Some(GeocodeHit {
            latitude: parse(self.lat),
            longitude: parse(self.lon),
            address: GeoAddress {
                state: address.state,
                state_district: address.state_district,
                region: address.region,
                province: address.province,
                territory: address.territory,
                country: address.country,
                postcode: address.postcode,
                iso_region_code: address.iso_lvl4.or(address.iso_lvl6),
                county: address.county,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// NominatimGeocoder
// ---------------------------------------------------------------------------

/// Direct Nominatim client. No pacing or caching; wrap it in
/// [`GeocodingService`].
pub struct NominatimGeocoder {
    http: HttpClient,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn new(config: &GeocodingConfig) -> Result<Self> {
        let http = HttpClient::new(Duration::from_secs(config.timeout_secs), RetryPolicy::none())?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeocodingProvider for NominatimGeocoder {
    async fn reverse(&self, latitude: f64, longitude: f64) -> Result<Option<GeocodeHit>> {
        let url = format!("{}/reverse", self.base_url);
        let (lat, lon) = (latitude.to_string(), longitude.to_string());
        let place: NominatimPlace = self
            .http
            .send_json("reverse geocode", |c| {
                c.get(&url)
                    .header("Accept-Language", "en")
                    .query(&[
                        ("format", "jsonv2"),
                        ("lat", lat.as_str()),
                        ("lon", lon.as_str()),
                        ("addressdetails", "1"),
                        ("zoom", "10"),
                    ])
            })
            .await?;
        Ok(place.into_hit())
    }

    async fn forward(&self, text: &str) -> Result<Option<GeocodeHit>> {
        let url = format!("{}/search", self.base_url);
        let places: Vec<NominatimPlace> = self
            .http
            .send_json("forward geocode", |c| {
                c.get(&url)
                    .header("Accept-Language", "en")
                    .query(&[
                        ("format", "jsonv2"),
                        ("q", text),
                        ("addressdetails", "1"),
                        ("limit", "1"),
                    ])
            })
            .await?;
        Ok(places.into_iter().next().and_then(NominatimPlace::into_hit))
    }
}

// ---------------------------------------------------------------------------
// GeocodingService
// ---------------------------------------------------------------------------

/// Paced, cached front for any [`GeocodingProvider`].
///
/// Calls to the inner provider are spaced at least `min_interval` apart.
/// Results are cached by key; provider failures are logged and cached as
/// misses so they are not retried within the cache's lifetime.
pub struct GeocodingService {
    provider: Arc<dyn GeocodingProvider>,
    cache: Arc<dyn GeocodeCache>,
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl GeocodingService {
    pub fn new(
        provider: Arc<dyn GeocodingProvider>,
        cache: Arc<dyn GeocodeCache>,
        min_interval: Duration,
    ) -> Self {
        Self {
            provider,
            cache,
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    async fn pace(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn cached(&self, key: &str) -> Option<Option<GeocodeHit>> {
        match self.cache.get(key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "geocode cache read failed");
                None
            }
        }
    }

    async fn store(&self, key: &str, hit: Option<&GeocodeHit>) {
        if let Err(e) = self.cache.put(key, hit).await {
            warn!(key, error = %e, "geocode cache write failed");
        }
    }

    async fn settle(&self, key: &str, outcome: Result<Option<GeocodeHit>>) -> Option<GeocodeHit> {
        let hit = outcome.unwrap_or_else(|e| {
            warn!(key, error = %e, "geocoding failed");
            None
        });
        self.store(key, hit.as_ref()).await;
        hit
    }
}

#[async_trait]
impl GeocodingProvider for GeocodingService {
    async fn reverse(&self, latitude: f64, longitude: f64) -> Result<Option<GeocodeHit>> {
        let key = reverse_key(latitude, longitude);
        if let Some(entry) = self.cached(&key).await {
            return Ok(entry);
        }
        self.pace().await;
        let outcome = self.provider.reverse(latitude, longitude).await;
        Ok(self.settle(&key, outcome).await)
    }

    async fn forward(&self, text: &str) -> Result<Option<GeocodeHit>> {
        let Some(text) = non_empty(Some(text)) else {
            return Ok(None);
        };
        let key = forward_key(text);
        if let Some(entry) = self.cached(&key).await {
            return Ok(entry);
        }
        self.pace().await;
        let outcome = self.provider.forward(text).await;
        Ok(self.settle(&key, outcome).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryGeocodeCache;
    use prospector_shared::ProspectorError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn keys_are_normalized() {
        assert_eq!(reverse_key(-20.5, 146.25), "rev:-20.50000000,146.25000000");
        assert_eq!(
            forward_key("  Queensland,\n  AUSTRALIA "),
            "fwd:queensland, australia"
        );
    }

    struct CountingProvider {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl GeocodingProvider for CountingProvider {
        async fn reverse(&self, latitude: f64, longitude: f64) -> Result<Option<GeocodeHit>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProspectorError::unavailable("geocoder down"));
            }
            Ok(Some(GeocodeHit {
                latitude: Some(latitude),
                longitude: Some(longitude),
                ..Default::default()
            }))
        }

        async fn forward(&self, _text: &str) -> Result<Option<GeocodeHit>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    fn service(fail: bool) -> (Arc<CountingProvider>, Arc<MemoryGeocodeCache>, GeocodingService) {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            fail,
        });
        let cache = Arc::new(MemoryGeocodeCache::new());
        let svc = GeocodingService::new(provider.clone(), cache.clone(), Duration::ZERO);
        (provider, cache, svc)
    }

    #[tokio::test]
    async fn repeated_lookups_hit_the_cache() {
        let (provider, _, svc) = service(false);
        let first = svc.reverse(-20.1, 146.2).await.expect("reverse");
        let second = svc.reverse(-20.1, 146.2).await.expect("reverse");
        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_cached_as_misses() {
        let (provider, cache, svc) = service(true);
        assert_eq!(svc.reverse(1.0, 2.0).await.expect("reverse"), None);
        assert_eq!(svc.reverse(1.0, 2.0).await.expect("reverse"), None);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.get(&reverse_key(1.0, 2.0)).await.expect("get"),
            Some(None)
        );
    }

    #[tokio::test]
    async fn forward_keys_ignore_case_and_spacing() {
        let (provider, _, svc) = service(false);
        svc.forward("Ontario, Canada").await.expect("forward");
        svc.forward("  ontario,   CANADA").await.expect("forward");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(svc.forward("   ").await.expect("blank"), None);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn calls_are_paced() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let svc = GeocodingService::new(
            provider,
            Arc::new(MemoryGeocodeCache::new()),
            Duration::from_millis(50),
        );
        let start = Instant::now();
        svc.reverse(1.0, 1.0).await.expect("first");
        svc.reverse(2.0, 2.0).await.expect("second");
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn nominatim_reverse_maps_address() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reverse"))
            .and(query_param("zoom", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "lat": "-20.0726218",
                "lon": "146.2614467",
                "address": {
                    "state_district": "Charters Towers Region",
                    "country": "Australia",
                    "postcode": "4820",
                    "ISO3166-2-lvl4": "AU-QLD"
                }
            })))
            .mount(&server)
            .await;

        let config = GeocodingConfig {
            base_url: server.uri(),
            ..Default::default()
        };
        let geocoder = NominatimGeocoder::new(&config).expect("geocoder");
        let hit = geocoder
            .reverse(-20.0726218, 146.2614467)
            .await
            .expect("reverse")
            .expect("hit");
        assert_eq!(hit.latitude, Some(-20.0726218));
        assert_eq!(hit.address.state_like(), Some("Charters Towers Region"));
        assert_eq!(hit.address.iso_region_code.as_deref(), Some("AU-QLD"));
    }

    #[tokio::test]
    async fn nominatim_error_body_is_no_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reverse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"error": "Unable to geocode"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let config = GeocodingConfig {
            base_url: server.uri(),
            ..Default::default()
        };
        let geocoder = NominatimGeocoder::new(&config).expect("geocoder");
        assert_eq!(geocoder.reverse(0.0, 0.0).await.expect("reverse"), None);
        assert_eq!(geocoder.forward("Atlantis").await.expect("forward"), None);
    }
}
