//! Best-effort project page scraper.
//!
//! Reads the public project profile page for its title, operator and the
//! linked company, then the company profile page for the project's commodities
//! and stage. Every field is optional; layout drift yields `None`s rather
//! than errors.

use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};
use url::Url;

use prospector_shared::{ProspectorError, Result, ScrapedRecord, ScraperConfig};

use crate::ScrapeProvider;
use crate::client::{HttpClient, RetryPolicy};

const COMPANY_LINK_MARKER: &str = "company-profile?gid=";
const PROJECT_LINK_MARKER: &str = "project-profile?gid=";

/// Scrape provider backed by plain HTTP fetches of the site's HTML.
pub struct HttpScrapeProvider {
    http: HttpClient,
    site: Url,
}

impl HttpScrapeProvider {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let site = Url::parse(&config.base_url).map_err(|e| {
            ProspectorError::config(format!("invalid scraper base_url {}: {e}", config.base_url))
        })?;
        let http = HttpClient::new(
            Duration::from_secs(config.timeout_secs),
            RetryPolicy::from(config),
        )?;
        Ok(Self { http, site })
    }

    /// Canonical profile URL for a project id.
    pub fn project_url(&self, id: &str) -> String {
        format!(
            "{}/project-profile?gid={id}",
            self.site.as_str().trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ScrapeProvider for HttpScrapeProvider {
    #[instrument(skip_all, fields(id = %id))]
    async fn scrape(&self, id: &str) -> Result<Option<ScrapedRecord>> {
        let url = self.project_url(id);
        let html = self.http.send_text("project page", |c| c.get(&url)).await?;
        let mut record = parse_project_page(&html, &self.site);

        if let Some(company_url) = record.company_url.clone() {
            match self
                .http
                .send_text("company page", |c| c.get(&company_url))
                .await
            {
                Ok(company_html) => {
                    let (commodities, stage) =
                        parse_company_projects(&company_html, id, record.project_name.as_deref());
                    record.commodities = commodities;
                    record.stage = stage;
                }
                Err(e) => debug!(error = %e, "company page unavailable"),
            }
        }

        if record.is_empty() && record.company_url.is_none() {
            return Ok(None);
        }
        Ok(Some(record))
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn text_of(el: ElementRef<'_>) -> Option<String> {
    let text = el.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

fn first_text(root: ElementRef<'_>, css: &str) -> Option<String> {
    let sel = Selector::parse(css).ok()?;
    root.select(&sel).find_map(text_of)
}

fn first_attr(root: ElementRef<'_>, css: &str, attrs: &[&str]) -> Option<String> {
    let sel = Selector::parse(css).ok()?;
    let el = root.select(&sel).next()?;
    attrs
        .iter()
        .filter_map(|a| el.value().attr(a))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(String::from)
}

/// Value cell of the first label/value row whose label contains `label`.
/// A `-` placeholder counts as missing.
fn labelled_value(root: ElementRef<'_>, label: &str) -> Option<String> {
    let (Ok(tr_sel), Ok(cell_sel)) = (Selector::parse("tr"), Selector::parse("td, th")) else {
        return None;
    };
    root.select(&tr_sel).find_map(|tr| {
        let mut cells = tr.select(&cell_sel);
        let key = text_of(cells.next()?)?.to_lowercase();
        let value = text_of(cells.next()?)?;
        (key.contains(label) && value != "-").then_some(value)
    })
}

/// Value of the `gid` query parameter following `marker` in a link.
fn gid_after(link: &str, marker: &str) -> Option<String> {
    let rest = link.split(marker).nth(1)?;
    let gid = rest.split(['&', '#']).next()?.trim();
    (!gid.is_empty()).then(|| gid.to_string())
}

/// Extract title and company identity from a project profile page.
pub fn parse_project_page(html: &str, site: &Url) -> ScrapedRecord {
    let doc = Html::parse_document(html);
    let root = doc.root_element();

    let project_name = ["h1#project-title", "h1#project_title", "h1"]
        .iter()
        .find_map(|css| first_text(root, css));

    let company_name = first_text(root, "#right-sider h3#company-name");
    let operator = labelled_value(root, "operator");

    let link = first_attr(root, "#right-sider a#company-news-btn", &["href"])
        .or_else(|| {
            first_attr(
                root,
                "#modal-nav-buttons a#company_profile, #modal_nav_buttons a#company_profile",
                &["data-url", "href"],
            )
        })
        .or_else(|| first_attr(root, "a[href*=\"company-profile?gid=\"]", &["href"]))
        .or_else(|| first_attr(root, "a[data-url]", &["data-url"]));

    let company_url = link
        .as_deref()
        .and_then(|l| site.join(l).ok())
        .map(String::from);
    let company_id = link.as_deref().and_then(|l| gid_after(l, COMPANY_LINK_MARKER));

    ScrapedRecord {
        project_name,
        operator,
        company_id,
        company_name,
        company_url,
        ..Default::default()
    }
}

/// Find `(commodities, stage)` for a project in a company's project table.
///
/// Rows are matched by the project link's gid first, then by normalized
/// project name.
pub fn parse_company_projects(
    html: &str,
    project_id: &str,
    project_name: Option<&str>,
) -> (Option<String>, Option<String>) {
    let doc = Html::parse_document(html);
    let (Ok(table_sel), Ok(tr_sel), Ok(cell_sel), Ok(a_sel)) = (
        Selector::parse("table.properties-wrapper-table"),
        Selector::parse("tr"),
        Selector::parse("td, th"),
        Selector::parse("a[href]"),
    ) else {
        return (None, None);
    };

    let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let wanted_name = project_name.map(normalize);

    let table = doc.select(&table_sel).find(|t| {
        let header = t
            .select(&tr_sel)
            .next()
            .map(|tr| {
                tr.select(&cell_sel)
                    .filter_map(text_of)
                    .collect::<Vec<_>>()
                    .join(",")
                    .to_lowercase()
            })
            .unwrap_or_default();
        header.contains("project") && header.contains("commodit") && header.contains("stage")
    });
    let Some(table) = table else {
        return (None, None);
    };

    let mut by_name = (None, None);
    for tr in table.select(&tr_sel).skip(1) {
        let cells: Vec<ElementRef<'_>> = tr.select(&cell_sel).collect();
        if cells.len() < 4 {
            continue;
        }
        let commodities = text_of(cells[2]);
        let stage = text_of(cells[3]);

        let link_gid = cells
            .get(4)
            .and_then(|c| c.select(&a_sel).next())
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| gid_after(href, PROJECT_LINK_MARKER));
        if link_gid.as_deref() == Some(project_id) {
            return (commodities, stage);
        }

        if let (Some(wanted), Some(name)) = (wanted_name.as_deref(), text_of(cells[0])) {
            if normalize(&name) == wanted {
                by_name = (commodities, stage);
            }
        }
    }
    by_name
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PROJECT_PAGE: &str = r#"
        <html><body>
          <h1 id="project-title">  Mount   Sample </h1>
          <div id="right-sider">
            <h3 id="company-name">Alpha Resources</h3>
            <a id="company-news-btn" href="/company-profile?gid=555&tab=news">News</a>
          </div>
        </body></html>"#;

    const COMPANY_PAGE: &str = r#"
        <html><body>
          <table class="properties-wrapper-table">
            <tr><th>Project</th><th>Ownership</th><th>Commodities</th><th>Stage</th><th>Link</th></tr>
            <tr><td>Other Hill</td><td>100%</td><td>Zinc</td><td>Production</td>
                <td><a href="/project-profile?gid=999">view</a></td></tr>
            <tr><td>mount sample</td><td>60%</td><td>Gold, Copper</td><td>Exploration</td>
                <td><a href="/project-profile?gid=100">view</a></td></tr>
          </table>
        </body></html>"#;

    fn site() -> Url {
        Url::parse("https://mining.example").expect("url")
    }

    #[test]
    fn project_page_right_sider() {
        let rec = parse_project_page(PROJECT_PAGE, &site());
        assert_eq!(rec.project_name.as_deref(), Some("Mount Sample"));
        assert_eq!(rec.company_name.as_deref(), Some("Alpha Resources"));
        assert_eq!(rec.company_id.as_deref(), Some("555"));
        assert_eq!(
            rec.company_url.as_deref(),
            Some("https://mining.example/company-profile?gid=555&tab=news")
        );
    }

    #[test]
    fn operator_from_details_table() {
        let html = r#"<h1>Deep Lead</h1>
            <table>
              <tr><td>Project:</td><td>Deep Lead</td></tr>
              <tr><td>Operator:</td><td>  Beta   Mining Ltd </td></tr>
              <tr><td>Stage:</td><td>-</td></tr>
            </table>"#;
        let rec = parse_project_page(html, &site());
        assert_eq!(rec.operator.as_deref(), Some("Beta Mining Ltd"));
        assert!(!rec.is_empty());
    }

    #[test]
    fn placeholder_operator_is_missing() {
        let html = "<table><tr><th>Operator</th><td>-</td></tr></table>";
        assert_eq!(parse_project_page(html, &site()).operator, None);
        assert_eq!(parse_project_page(PROJECT_PAGE, &site()).operator, None);
    }

    #[test]
    fn project_page_modal_fallback() {
        let html = r#"<h1>Deep Lead</h1>
            <div id="modal-nav-buttons"><a id="company_profile" data-url="company-profile?gid=77">Company</a></div>"#;
        let rec = parse_project_page(html, &site());
        assert_eq!(rec.company_id.as_deref(), Some("77"));
        assert_eq!(rec.company_name, None);
    }

    #[test]
    fn project_page_without_company() {
        let rec = parse_project_page("<html><body><p>nothing</p></body></html>", &site());
        assert!(rec.is_empty());
        assert!(rec.company_url.is_none());
    }

    #[test]
    fn company_table_matches_by_gid_then_name() {
        assert_eq!(
            parse_company_projects(COMPANY_PAGE, "100", None),
            (Some("Gold, Copper".into()), Some("Exploration".into()))
        );
        assert_eq!(
            parse_company_projects(COMPANY_PAGE, "4242", Some("Mount  Sample")),
            (Some("Gold, Copper".into()), Some("Exploration".into()))
        );
        assert_eq!(parse_company_projects(COMPANY_PAGE, "4242", None), (None, None));
    }

    #[tokio::test]
    async fn scrape_follows_company_link() {
        let server = MockServer::start().await;
        let project_page = PROJECT_PAGE.replace("/company-profile?gid=555&tab=news", "/company-profile?gid=555");
        Mock::given(method("GET"))
            .and(path("/project-profile"))
            .and(query_param("gid", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_string(project_page))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/company-profile"))
            .and(query_param("gid", "555"))
            .respond_with(ResponseTemplate::new(200).set_body_string(COMPANY_PAGE))
            .mount(&server)
            .await;

        let provider = HttpScrapeProvider::new(&ScraperConfig {
            base_url: server.uri(),
            ..Default::default()
        })
        .expect("provider");
        let rec = provider.scrape("100").await.expect("scrape").expect("record");
        assert_eq!(rec.company_id.as_deref(), Some("555"));
        assert_eq!(rec.commodities.as_deref(), Some("Gold, Copper"));
        assert_eq!(rec.stage.as_deref(), Some("Exploration"));
    }

    #[tokio::test]
    async fn transient_page_failure_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/project-profile"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/project-profile"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("<h1>Second Try</h1>"),
            )
            .mount(&server)
            .await;

        let provider = HttpScrapeProvider::new(&ScraperConfig {
            base_url: server.uri(),
            retry_attempts: 1,
            retry_delay_ms: 1,
            ..Default::default()
        })
        .expect("provider");
        let rec = provider.scrape("102").await.expect("scrape").expect("record");
        assert_eq!(rec.project_name.as_deref(), Some("Second Try"));
    }

    #[tokio::test]
    async fn blank_page_scrapes_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/project-profile"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let provider = HttpScrapeProvider::new(&ScraperConfig {
            base_url: server.uri(),
            ..Default::default()
        })
        .expect("provider");
        assert_eq!(provider.scrape("101").await.expect("scrape"), None);
    }
}
