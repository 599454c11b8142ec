//! Core domain types: projects, companies, relationships and provenance.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ProspectorError, Result};
use crate::records::{RawProject, RelationshipEntry, ScrapedRecord, non_empty};

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

/// Provider that contributed to a record's current field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Api,
    Relationships,
    Scraper,
}

impl DataSource {
    pub const ALL: [DataSource; 3] = [
        DataSource::Api,
        DataSource::Relationships,
        DataSource::Scraper,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Relationships => "relationships",
            Self::Scraper => "scraper",
        }
    }
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assembly lifecycle of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Discovered,
    Assembling,
    Completed,
    Failed,
}

impl ProcessingStage {
    /// Whether moving from `self` to `next` is a forward (or no-op) step.
    ///
    /// `Completed` and `Failed` are terminal.
    pub fn can_advance_to(self, next: ProcessingStage) -> bool {
        use ProcessingStage::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Discovered, _) => true,
            (Assembling, Completed | Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Kind of company-to-project association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Ownership,
    Option,
    Royalty,
    Operator,
}

/// Where a project's coordinates came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocationSource {
    Api,
    ScrapedMap,
    Geocode,
}

impl LocationSource {
    /// Higher is more trusted.
    pub fn confidence(self) -> u8 {
        match self {
            Self::Api => 3,
            Self::ScrapedMap => 2,
            Self::Geocode => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Percentage
// ---------------------------------------------------------------------------

/// A share in `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Percentage(f64);

impl Percentage {
    pub const FULL: Percentage = Percentage(100.0);

    pub fn new(value: f64) -> Result<Self> {
        if value.is_finite() && (0.0..=100.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ProspectorError::validation(format!(
                "percentage {value} out of range [0, 100]"
            )))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Percentage {
    type Error = ProspectorError;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Percentage> for f64 {
    fn from(p: Percentage) -> f64 {
        p.0
    }
}

// ---------------------------------------------------------------------------
// Company
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ceo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headquarters: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    pub data_source: DataSource,
    pub fetched_at: DateTime<Utc>,
}

impl Company {
    pub fn new(id: impl Into<String>, name: impl Into<String>, data_source: DataSource) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ticker: None,
            exchange: None,
            website: None,
            ceo: None,
            headquarters: None,
            phone: None,
            industry: None,
            sector: None,
            data_source,
            fetched_at: Utc::now(),
        }
    }

    /// Build the embedded company details carried by a relationship entry.
    pub fn from_entry(entry: &RelationshipEntry, data_source: DataSource) -> Self {
        let own = |v: &Option<String>| non_empty(v.as_deref()).map(String::from);
        Self {
            ticker: own(&entry.ticker),
            exchange: own(&entry.exchange),
            website: own(&entry.website),
            ceo: own(&entry.ceo),
            headquarters: own(&entry.headquarters),
            phone: own(&entry.phone),
            industry: own(&entry.industry),
            sector: own(&entry.sector),
            ..Self::new(
                entry.id.clone(),
                entry.company_name.clone().unwrap_or_default(),
                data_source,
            )
        }
    }
}

/// Deterministic id for a company known only by name.
///
/// `operator_` followed by the first 12 hex chars of SHA-256 over the
/// trimmed name; stable across processes and platforms.
pub fn surrogate_company_id(name: &str) -> String {
    let digest = Sha256::digest(name.trim().as_bytes());
    let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("{SURROGATE_PREFIX}{hex}")
}

pub const SURROGATE_PREFIX: &str = "operator_";

pub fn is_surrogate_id(id: &str) -> bool {
    id.starts_with(SURROGATE_PREFIX)
}

// ---------------------------------------------------------------------------
// CompanyRelationship
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyRelationship {
    pub company_id: String,
    pub company_name: String,
    pub relationship_type: RelationshipType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<Percentage>,
    /// Correlation key back to the relationship provider's row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ownership_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optionee_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_details: Option<Company>,
    pub data_source: DataSource,
}

impl CompanyRelationship {
    /// Relationship synthesized from a single name, with no provider row.
    pub fn operator(
        company_id: impl Into<String>,
        company_name: impl Into<String>,
        percentage: Option<Percentage>,
        data_source: DataSource,
    ) -> Self {
        Self {
            company_id: company_id.into(),
            company_name: company_name.into(),
            relationship_type: RelationshipType::Operator,
            percentage,
            ownership_id: None,
            optionee_id: None,
            comments: None,
            company_details: None,
            data_source,
        }
    }

    /// Convert one provider row. Out-of-range percentages fail validation.
    pub fn from_entry(entry: &RelationshipEntry, kind: RelationshipType) -> Result<Self> {
        let percentage = entry.percentage.map(Percentage::new).transpose()?;
        let ownership_id = match kind {
            RelationshipType::Ownership => entry.ownership_ref,
            RelationshipType::Royalty => entry.royalty_ref,
            RelationshipType::Option => entry.option_ref,
            RelationshipType::Operator => None,
        };
        let (optionee_id, comments) = if kind == RelationshipType::Option {
            (entry.optionee_id, entry.comments.clone())
        } else {
            (None, None)
        };
        Ok(Self {
            company_id: entry.id.clone(),
            company_name: entry.company_name.clone().unwrap_or_default(),
            relationship_type: kind,
            percentage,
            ownership_id,
            optionee_id,
            comments,
            company_details: Some(Company::from_entry(entry, DataSource::Relationships)),
            data_source: DataSource::Relationships,
        })
    }

    /// The related company, from embedded details or synthesized from the
    /// relationship's own id and name.
    pub fn company(&self) -> Company {
        self.company_details.clone().unwrap_or_else(|| {
            Company::new(&self.company_id, &self.company_name, self.data_source)
        })
    }
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub location_string: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub mineral_district: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub geocoded: bool,
    #[serde(default)]
    pub location_source: Option<LocationSource>,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub iso_region_code: Option<String>,
    #[serde(default)]
    pub county: Option<String>,
    #[serde(default)]
    pub territory: Option<String>,
}

impl Location {
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }

    pub fn has_state(&self) -> bool {
        non_empty(self.state.as_deref()).is_some()
    }

    /// Record `candidate` as the source unless a more trusted one is set.
    /// Returns whether the source changed.
    pub fn prefer_source(&mut self, candidate: LocationSource) -> bool {
        match self.location_source {
            Some(current) if current.confidence() >= candidate.confidence() => false,
            _ => {
                self.location_source = Some(candidate);
                true
            }
        }
    }

    /// Location built from a query row.
    pub fn from_raw(raw: &RawProject) -> Self {
        let (state, country) = raw.state_and_country();
        let coords = raw.lat_lon();
        Self {
            location_string: non_empty(raw.location.as_deref()).map(String::from),
            latitude: coords.map(|(lat, _)| lat),
            longitude: coords.map(|(_, lon)| lon),
            country,
            state,
            mineral_district: raw.district(),
            area: raw.area.clone(),
            location_source: coords.map(|_| LocationSource::Api),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// Canonical, immutable project record.
///
/// Every `with_*` method returns a new value; the receiver is left
/// untouched. Collections sit behind `Arc` so unchanged parts are shared
/// between versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    id: String,
    name: Option<String>,
    location: Arc<Location>,
    stage: Option<String>,
    commodities: Option<String>,
    operator: Option<String>,
    company_relationships: Arc<[CompanyRelationship]>,
    primary_company: Option<Arc<Company>>,
    data_sources: Arc<BTreeSet<DataSource>>,
    processing_stage: ProcessingStage,
    project_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    errors: Arc<[String]>,
}

impl Project {
    /// Bare shell carrying only an id.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: None,
            location: Arc::new(Location::default()),
            stage: None,
            commodities: None,
            operator: None,
            company_relationships: Arc::from(Vec::new()),
            primary_company: None,
            data_sources: Arc::new(BTreeSet::new()),
            processing_stage: ProcessingStage::Discovered,
            project_url: None,
            created_at: now,
            updated_at: now,
            errors: Arc::from(Vec::new()),
        }
    }

    /// Base project from query-provider safe data, tagged `api`.
    pub fn from_safe_data(raw: &RawProject) -> Self {
        let own = |v: &Option<String>| non_empty(v.as_deref()).map(String::from);
        Self {
            name: own(&raw.name),
            stage: own(&raw.stage),
            commodities: own(&raw.commodities),
            operator: own(&raw.operator),
            location: Arc::new(Location::from_raw(raw)),
            data_sources: Arc::new(BTreeSet::from([DataSource::Api])),
            ..Self::new(raw.id.clone())
        }
    }

    /// Minimal project from a scrape: name, operator, stage and
    /// commodities only, tagged `scraper`.
    pub fn from_scrape(id: impl Into<String>, record: &ScrapedRecord) -> Self {
        let own = |v: &Option<String>| non_empty(v.as_deref()).map(String::from);
        Self {
            name: own(&record.project_name),
            operator: record.company_label().map(String::from),
            stage: own(&record.stage),
            commodities: own(&record.commodities),
            data_sources: Arc::new(BTreeSet::from([DataSource::Scraper])),
            ..Self::new(id)
        }
    }

    // -- accessors ----------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    pub fn location(&self) -> &Location {
        &self.location
    }
    pub fn stage(&self) -> Option<&str> {
        self.stage.as_deref()
    }
    pub fn commodities(&self) -> Option<&str> {
        self.commodities.as_deref()
    }
    pub fn operator(&self) -> Option<&str> {
        self.operator.as_deref()
    }
    pub fn company_relationships(&self) -> &[CompanyRelationship] {
        &self.company_relationships
    }
    pub fn primary_company(&self) -> Option<&Company> {
        self.primary_company.as_deref()
    }
    pub fn data_sources(&self) -> &BTreeSet<DataSource> {
        &self.data_sources
    }
    pub fn processing_stage(&self) -> ProcessingStage {
        self.processing_stage
    }
    pub fn project_url(&self) -> Option<&str> {
        self.project_url.as_deref()
    }
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    // -- copy-on-write updates ---------------------------------------------

    fn touched(&self) -> Self {
        Self {
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn with_project_url(&self, url: impl Into<String>) -> Self {
        Self {
            project_url: Some(url.into()),
            ..self.touched()
        }
    }

    /// Attach resolved relationships and their primary company, merging
    /// each relationship's provenance into `data_sources`.
    pub fn with_relationships(
        &self,
        relationships: Vec<CompanyRelationship>,
        primary: Option<Company>,
    ) -> Self {
        let next = Self {
            company_relationships: Arc::from(relationships),
            primary_company: primary.map(Arc::new),
            ..self.touched()
        };
        let tags: Vec<DataSource> = next
            .company_relationships
            .iter()
            .map(|r| r.data_source)
            .collect();
        next.with_data_sources(tags)
    }

    pub fn with_operator(&self, operator: impl Into<String>) -> Self {
        Self {
            operator: Some(operator.into()),
            ..self.touched()
        }
    }

    pub fn with_location(&self, location: Location) -> Self {
        Self {
            location: Arc::new(location),
            ..self.touched()
        }
    }

    /// Union `tags` into `data_sources`. Existing tags are never removed.
    pub fn with_data_sources(&self, tags: impl IntoIterator<Item = DataSource>) -> Self {
        let mut merged = (*self.data_sources).clone();
        let before = merged.len();
        merged.extend(tags);
        if merged.len() == before {
            return self.clone();
        }
        Self {
            data_sources: Arc::new(merged),
            ..self.touched()
        }
    }

    pub fn with_data_source(&self, tag: DataSource) -> Self {
        self.with_data_sources([tag])
    }

    /// Append a diagnostic to `errors`.
    pub fn with_error(&self, message: impl Into<String>) -> Self {
        let mut errors = self.errors.to_vec();
        errors.push(message.into());
        Self {
            errors: Arc::from(errors),
            ..self.touched()
        }
    }

    /// Move to `next`. Backward transitions are rejected.
    pub fn advance(&self, next: ProcessingStage) -> Result<Self> {
        if !self.processing_stage.can_advance_to(next) {
            return Err(ProspectorError::validation(format!(
                "project {}: illegal stage transition {:?} -> {:?}",
                self.id, self.processing_stage, next
            )));
        }
        Ok(Self {
            processing_stage: next,
            ..self.touched()
        })
    }
}
