//! Client for the filtered-query and relationship-graph API.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use prospector_shared::{ApiConfig, RawProject, RelationshipGraph, Result};

use crate::client::{HttpClient, RetryPolicy};
use crate::{QueryProvider, RelationshipProvider};

/// Authenticated API client. Implements both [`QueryProvider`] and
/// [`RelationshipProvider`].
pub struct HubApiClient {
    http: HttpClient,
    base_url: String,
    token: String,
}

impl HubApiClient {
    pub fn new(config: &ApiConfig, token: impl Into<String>) -> Result<Self> {
        Self::with_policy(config, token, RetryPolicy::from(config))
    }

    pub fn with_policy(
        config: &ApiConfig,
        token: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let http = HttpClient::new(Duration::from_secs(config.timeout_secs), policy)?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// `GET {base}/health` answers 200.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .http
            .inner()
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "health check failed");
                false
            }
        }
    }

    fn filter_payload(&self, partition: &str) -> Value {
        json!({
            "filters": {
                "country": partition,
                "marketcap": {"min": 0, "max": 10000},
                "outstandingshares": {"min": 0, "max": 10000},
                "projectSize": [null, null],
                "commoditiesWhere": "any"
            },
            "token": self.token,
        })
    }
}

#[async_trait]
impl QueryProvider for HubApiClient {
    #[instrument(skip_all, fields(partition = %partition))]
    async fn fetch_partition(&self, partition: &str) -> Result<Vec<RawProject>> {
        let url = format!("{}/projects/filter", self.base_url);
        let payload = self.filter_payload(partition);
        let rows: Vec<Value> = self
            .http
            .send_json(&format!("projects for {partition}"), |c| {
                c.post(&url).json(&payload)
            })
            .await?;

        let total = rows.len();
        let projects: Vec<RawProject> = rows
            .into_iter()
            .filter_map(|row| match serde_json::from_value::<RawProject>(row) {
                Ok(p) if !p.id.is_empty() => Some(p),
                Ok(_) => None,
                Err(e) => {
                    debug!(error = %e, "skipping malformed project row");
                    None
                }
            })
            .collect();

        if projects.len() < total {
            warn!(skipped = total - projects.len(), "dropped unusable project rows");
        }
        info!(count = projects.len(), "fetched partition");
        Ok(projects)
    }
}

#[async_trait]
impl RelationshipProvider for HubApiClient {
    async fn fetch_relationships(&self, id: &str) -> Result<RelationshipGraph> {
        let url = format!("{}/project/relationships", self.base_url);
        let payload = json!({ "gid": id });
        let graph: Option<RelationshipGraph> = self
            .http
            .send_json(&format!("relationships for {id}"), |c| {
                c.post(&url).json(&payload)
            })
            .await?;
        Ok(graph.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prospector_shared::ProspectorError;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HubApiClient {
        let config = ApiConfig {
            base_url: format!("{}/api/", server.uri()),
            ..Default::default()
        };
        HubApiClient::with_policy(&config, "jwt-test", RetryPolicy::none()).expect("client")
    }

    #[tokio::test]
    async fn fetch_partition_posts_filters_and_parses_rows() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/projects/filter"))
            .and(body_partial_json(json!({
                "filters": {"country": "Australia"},
                "token": "jwt-test"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"gid": 100, "project_name": "Alpha", "location": "Queensland, Australia"},
                {"gid": "101", "name": "Beta"},
                {"project_name": "no id"},
                "garbage"
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let rows = client_for(&server)
            .fetch_partition("Australia")
            .await
            .expect("fetch");
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["100", "101"]);
        assert_eq!(rows[0].name.as_deref(), Some("Alpha"));
    }

    #[tokio::test]
    async fn non_list_partition_response_is_validation_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/projects/filter"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "bad token"})))
            .mount(&server)
            .await;

        let err = client_for(&server).fetch_partition("Canada").await.unwrap_err();
        assert!(matches!(err, ProspectorError::Validation { .. }));
    }

    #[tokio::test]
    async fn fetch_relationships_sends_gid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/project/relationships"))
            .and(body_partial_json(json!({"gid": "100"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ownership": [{"id": 5, "company_name": "Alpha Resources", "percentage": 60}],
                "royalties": [],
                "options": [[]]
            })))
            .mount(&server)
            .await;

        let graph = client_for(&server)
            .fetch_relationships("100")
            .await
            .expect("fetch");
        assert_eq!(graph.ownership.len(), 1);
        assert_eq!(graph.ownership[0].company_name.as_deref(), Some("Alpha Resources"));
    }

    #[tokio::test]
    async fn null_relationships_body_is_empty_graph() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/project/relationships"))
            .respond_with(ResponseTemplate::new(200).set_body_string("null"))
            .mount(&server)
            .await;

        let graph = client_for(&server)
            .fetch_relationships("101")
            .await
            .expect("fetch");
        assert!(graph.is_empty());
    }

    #[tokio::test]
    async fn health_check_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        assert!(client_for(&server).health_check().await);
    }
}
