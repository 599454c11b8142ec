//! Typed provider records.
//!
//! Providers return loosely-shaped JSON; it is parsed into these structs at
//! the provider boundary so nothing past the adapter layer handles raw maps.

use serde::{Deserialize, Deserializer, Serialize};

// ---------------------------------------------------------------------------
// Query provider
// ---------------------------------------------------------------------------

/// One project row returned by the filtered-query API for a partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawProject {
    /// Project identifier (`gid` on the wire; string or number).
    #[serde(alias = "gid", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, alias = "project_name")]
    pub name: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub commodities: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    /// GeoJSON-style point: `coordinates = [lon, lat]`.
    #[serde(default)]
    pub centroid: Option<Centroid>,
    /// Free-text `"State, Country"`.
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub mineral_district_camp: Option<String>,
    #[serde(default)]
    pub mineral_district: Option<String>,
    #[serde(default, alias = "area_m2", deserialize_with = "opt_string_or_number")]
    pub area: Option<String>,
    /// Owning company as reported by the query API, when present.
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub company_id: Option<String>,
}

/// Point geometry attached to a query row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    #[serde(default)]
    pub coordinates: Vec<f64>,
}

impl RawProject {
    /// `(latitude, longitude)` if both ordinates are present.
    pub fn lat_lon(&self) -> Option<(f64, f64)> {
        let coords = &self.centroid.as_ref()?.coordinates;
        match coords.as_slice() {
            [lon, lat, ..] => Some((*lat, *lon)),
            _ => None,
        }
    }

    /// Split `"State, Country"` into `(state, country)`.
    ///
    /// The last comma-separated part is the country; the first part is the
    /// state only when there is more than one part.
    pub fn state_and_country(&self) -> (Option<String>, Option<String>) {
        let Some(location) = non_empty(self.location.as_deref()) else {
            return (None, None);
        };
        let parts: Vec<&str> = location.split(", ").collect();
        let country = parts.last().and_then(|c| non_empty(Some(c))).map(String::from);
        let state = if parts.len() > 1 {
            non_empty(parts.first().copied()).map(String::from)
        } else {
            None
        };
        (state, country)
    }

    /// Mineral district, preferring the `_camp` field the API usually fills.
    pub fn district(&self) -> Option<String> {
        non_empty(self.mineral_district_camp.as_deref())
            .or_else(|| non_empty(self.mineral_district.as_deref()))
            .map(String::from)
    }
}

// ---------------------------------------------------------------------------
// Relationship provider
// ---------------------------------------------------------------------------

/// Companies related to one project, grouped by relationship family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipGraph {
    #[serde(default, alias = "jv", deserialize_with = "null_as_default")]
    pub ownership: Vec<RelationshipEntry>,
    #[serde(default, alias = "nsrs", deserialize_with = "null_as_default")]
    pub royalties: Vec<RelationshipEntry>,
    /// Option agreements arrive as a list of lists.
    #[serde(default, alias = "option", deserialize_with = "null_as_default")]
    pub options: Vec<Vec<RelationshipEntry>>,
}

impl RelationshipGraph {
    pub fn is_empty(&self) -> bool {
        self.ownership.is_empty()
            && self.royalties.is_empty()
            && self.options.iter().all(Vec::is_empty)
    }
}

/// One company entry inside a relationship family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipEntry {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default, deserialize_with = "opt_f64_lenient")]
    pub percentage: Option<f64>,
    #[serde(default, rename = "projectCompanyOwnership", deserialize_with = "opt_i64_lenient")]
    pub ownership_ref: Option<i64>,
    #[serde(default, rename = "projectCompanyNsr", deserialize_with = "opt_i64_lenient")]
    pub royalty_ref: Option<i64>,
    #[serde(default, rename = "projectcompanyoptions", deserialize_with = "opt_i64_lenient")]
    pub option_ref: Option<i64>,
    #[serde(default, rename = "optionee", deserialize_with = "opt_i64_lenient")]
    pub optionee_id: Option<i64>,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default, rename = "root_ticker", alias = "ticker")]
    pub ticker: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub ceo: Option<String>,
    #[serde(default)]
    pub headquarters: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub sector: Option<String>,
}

// ---------------------------------------------------------------------------
// Scrape provider
// ---------------------------------------------------------------------------

/// Best-effort record extracted from a project page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapedRecord {
    pub project_name: Option<String>,
    pub operator: Option<String>,
    pub company_id: Option<String>,
    pub company_name: Option<String>,
    pub company_url: Option<String>,
    pub commodities: Option<String>,
    pub stage: Option<String>,
}

impl ScrapedRecord {
    /// Company name, falling back to the operator label.
    pub fn company_label(&self) -> Option<&str> {
        non_empty(self.company_name.as_deref()).or_else(|| non_empty(self.operator.as_deref()))
    }

    /// Whether the page identified a company by id or by name.
    pub fn identifies_company(&self) -> bool {
        non_empty(self.company_id.as_deref()).is_some() || self.company_label().is_some()
    }

    /// True when nothing usable was extracted.
    pub fn is_empty(&self) -> bool {
        [
            &self.project_name,
            &self.operator,
            &self.company_id,
            &self.company_name,
            &self.commodities,
            &self.stage,
        ]
        .iter()
        .all(|f| non_empty(f.as_deref()).is_none())
    }
}

// ---------------------------------------------------------------------------
// Geocoding / map centre
// ---------------------------------------------------------------------------

/// Provider-agnostic geocoding result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeocodeHit {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub address: GeoAddress,
}

/// Address components returned by a geocoder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoAddress {
    pub state: Option<String>,
    pub state_district: Option<String>,
    pub region: Option<String>,
    pub province: Option<String>,
    pub territory: Option<String>,
    pub country: Option<String>,
    pub postcode: Option<String>,
    pub iso_region_code: Option<String>,
    pub county: Option<String>,
}

impl GeoAddress {
    /// First non-empty of state, state_district, region, province, territory.
    pub fn state_like(&self) -> Option<&str> {
        [
            &self.state,
            &self.state_district,
            &self.region,
            &self.province,
            &self.territory,
        ]
        .into_iter()
        .find_map(|f| non_empty(f.as_deref()))
    }
}

/// Centre of the interactive map shown for a project.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapCenter {
    pub latitude: f64,
    pub longitude: f64,
    pub zoom: Option<f64>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `Some(trimmed)` for non-blank strings.
pub fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// Deserialize a string or a JSON number into a `String`; null becomes empty.
pub fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(opt_string_or_number(deserializer)?.unwrap_or_default())
}

fn opt_string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde_json::Value;
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(non_empty(Some(&s)).map(String::from)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn opt_f64_lenient<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde_json::Value;
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) => Ok(s.trim().trim_end_matches('%').trim().parse::<f64>().ok()),
        other => Err(serde::de::Error::custom(format!(
            "expected numeric percentage, got {other}"
        ))),
    }
}

/// Integer reference that may arrive as a number or a numeric string.
/// Anything unparseable is treated as absent.
fn opt_i64_lenient<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde_json::Value;
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    })
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
