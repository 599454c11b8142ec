//! Static identifier registry: id → canonical URL, per entity kind.
//!
//! The registry file is JSON:
//!
//! ```json
//! {
//!   "projects":  [{"id": "100", "url": "https://…/project-profile?gid=100"}],
//!   "companies": [{"id": 55,    "url": "https://…/company-profile?gid=55"}]
//! }
//! ```
//!
//! `ID`/`URL` column-style keys are accepted too. Entries without a URL
//! still count as known ids.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use prospector_shared::{ProspectorError, Result, non_empty, string_or_number};

/// Which id space an identifier belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Company,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Project => "project",
            Self::Company => "company",
        })
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default, alias = "Projects")]
    projects: Vec<RegistryRow>,
    #[serde(default, alias = "Companies")]
    companies: Vec<RegistryRow>,
}

#[derive(Debug, Deserialize)]
struct RegistryRow {
    #[serde(alias = "ID", alias = "gid", deserialize_with = "string_or_number")]
    id: String,
    #[serde(default, alias = "URL")]
    url: Option<String>,
}

/// In-memory lookup table loaded once per run.
#[derive(Debug, Clone, Default)]
pub struct IdentifierRegistry {
    projects: BTreeMap<String, Option<String>>,
    companies: BTreeMap<String, Option<String>>,
}

impl IdentifierRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from `(id, url)` pairs.
    pub fn from_entries<P, C>(projects: P, companies: C) -> Self
    where
        P: IntoIterator<Item = (String, Option<String>)>,
        C: IntoIterator<Item = (String, Option<String>)>,
    {
        Self {
            projects: projects.into_iter().collect(),
            companies: companies.into_iter().collect(),
        }
    }

    /// Load the registry file. A missing file yields an empty registry;
    /// an unreadable or malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "registry file not found, continuing without it");
            return Ok(Self::empty());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ProspectorError::io(path, e))?;
        let registry = Self::from_json(&content)?;
        info!(
            path = %path.display(),
            projects = registry.projects.len(),
            companies = registry.companies.len(),
            "loaded identifier registry"
        );
        Ok(registry)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let file: RegistryFile = serde_json::from_str(content)
            .map_err(|e| ProspectorError::validation(format!("malformed registry: {e}")))?;
        let collect = |rows: Vec<RegistryRow>| {
            rows.into_iter()
                .filter(|r| !r.id.is_empty())
                .map(|r| (r.id, non_empty(r.url.as_deref()).map(String::from)))
                .collect::<BTreeMap<_, _>>()
        };
        Ok(Self {
            projects: collect(file.projects),
            companies: collect(file.companies),
        })
    }

    fn table(&self, kind: EntityKind) -> &BTreeMap<String, Option<String>> {
        match kind {
            EntityKind::Project => &self.projects,
            EntityKind::Company => &self.companies,
        }
    }

    /// Canonical URL for `id`, if the registry has one.
    pub fn lookup(&self, id: &str, kind: EntityKind) -> Option<&str> {
        self.table(kind).get(id)?.as_deref()
    }

    pub fn contains(&self, id: &str, kind: EntityKind) -> bool {
        self.table(kind).contains_key(id)
    }

    /// All known ids of `kind`.
    pub fn ids(&self, kind: EntityKind) -> BTreeSet<String> {
        self.table(kind).keys().cloned().collect()
    }

    /// id → URL for every entry of `kind` that has a URL.
    pub fn urls(&self, kind: EntityKind) -> BTreeMap<String, String> {
        self.table(kind)
            .iter()
            .filter_map(|(id, url)| url.clone().map(|u| (id.clone(), u)))
            .collect()
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.table(kind).len()
    }
}
