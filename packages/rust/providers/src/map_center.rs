//! Map-centre lookup from the project map page.
//!
//! The map page initialises either a Leaflet map (`setView([lat, lng], zoom)`)
//! or a Mapbox map (`center: [lng, lat]`, `zoom: n`) from inline script. The
//! first recognisable initialiser wins.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use prospector_shared::{MapCenter, Result, ScraperConfig};

use crate::MapCenterProvider;
use crate::client::{HttpClient, RetryPolicy};

static LEAFLET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"setView\(\s*\[\s*(-?\d+(?:\.\d+)?)\s*,\s*(-?\d+(?:\.\d+)?)\s*\]\s*(?:,\s*(\d+(?:\.\d+)?))?",
    )
    .expect("valid regex")
});

static MAPBOX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"center\s*:\s*\[\s*(-?\d+(?:\.\d+)?)\s*,\s*(-?\d+(?:\.\d+)?)\s*\]")
        .expect("valid regex")
});

static ZOOM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"zoom\s*:\s*(\d+(?:\.\d+)?)").expect("valid regex"));

/// Parse the initial map centre out of a map page.
pub fn parse_map_center(html: &str) -> Option<MapCenter> {
    let num = |m: Option<regex::Match<'_>>| m.and_then(|m| m.as_str().parse::<f64>().ok());

    if let Some(caps) = LEAFLET_RE.captures(html) {
        let (latitude, longitude) = (num(caps.get(1))?, num(caps.get(2))?);
        return valid(latitude, longitude).then(|| MapCenter {
            latitude,
            longitude,
            zoom: num(caps.get(3)),
        });
    }

    let caps = MAPBOX_RE.captures(html)?;
    let (longitude, latitude) = (num(caps.get(1))?, num(caps.get(2))?);
    valid(latitude, longitude).then(|| MapCenter {
        latitude,
        longitude,
        zoom: ZOOM_RE.captures(html).and_then(|z| num(z.get(1))),
    })
}

fn valid(latitude: f64, longitude: f64) -> bool {
    (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude)
}

/// Fetches `{site}/map?gid={id}` and parses the map initialiser.
pub struct HttpMapCenter {
    http: HttpClient,
    site: String,
}

impl HttpMapCenter {
    pub fn new(config: &ScraperConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new(timeout, RetryPolicy::from(config))?,
            site: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MapCenterProvider for HttpMapCenter {
    async fn map_center(&self, id: &str) -> Result<Option<MapCenter>> {
        let url = format!("{}/map?gid={id}", self.site);
        let html = self.http.send_text("map page", |c| c.get(&url)).await?;
        let center = parse_map_center(&html);
        if center.is_none() {
            debug!(id, "no map centre found");
        }
        Ok(center)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn leaflet_initialiser() {
        let html = "<script>var map = L.map('map').setView([-20.07262181, 146.26144671], 11);</script>";
        let c = parse_map_center(html).expect("centre");
        assert_eq!(c.latitude, -20.07262181);
        assert_eq!(c.longitude, 146.26144671);
        assert_eq!(c.zoom, Some(11.0));
    }

    #[test]
    fn mapbox_initialiser_is_lng_lat() {
        let html = "new mapboxgl.Map({ container: 'map', center: [-79.3832, 43.6532], zoom: 9.5 })";
        let c = parse_map_center(html).expect("centre");
        assert_eq!(c.latitude, 43.6532);
        assert_eq!(c.longitude, -79.3832);
        assert_eq!(c.zoom, Some(9.5));
    }

    #[test]
    fn out_of_range_or_missing_is_none() {
        assert_eq!(parse_map_center("setView([123.0, 10.0], 4)"), None);
        assert_eq!(parse_map_center("<html>no map</html>"), None);
    }

    #[tokio::test]
    async fn fetches_map_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/map"))
            .and(query_param("gid", "100"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("map.setView([-31.95, 115.86], 8)"),
            )
            .mount(&server)
            .await;

        let provider = HttpMapCenter::new(
            &ScraperConfig {
                base_url: server.uri(),
                ..Default::default()
            },
            Duration::from_secs(5),
        )
        .expect("provider");
        let c = provider.map_center("100").await.expect("fetch").expect("centre");
        assert_eq!((c.latitude, c.longitude), (-31.95, 115.86));
    }

    #[tokio::test]
    async fn map_page_is_retried_per_scraper_config() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/map"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/map"))
            .respond_with(ResponseTemplate::new(200).set_body_string("setView([10.5, 20.25], 6)"))
            .mount(&server)
            .await;

        let config = ScraperConfig {
            base_url: server.uri(),
            retry_attempts: 1,
            retry_delay_ms: 1,
            ..Default::default()
        };
        let provider = HttpMapCenter::new(&config, Duration::from_secs(5)).expect("provider");
        let c = provider.map_center("7").await.expect("fetch").expect("centre");
        assert_eq!((c.latitude, c.longitude), (10.5, 20.25));
    }
}
