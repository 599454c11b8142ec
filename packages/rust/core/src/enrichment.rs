//! Location enrichment through geocoding.
//!
//! Enrichment only fills gaps. A state that is already set is never
//! touched, and every other field is written only while it is empty.

use tracing::{debug, warn};

use prospector_providers::GeocodingProvider;
use prospector_shared::{GeocodeHit, Location, LocationSource, Project, Result, non_empty};

/// Which geocoding call, if any, a location needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Reverse { latitude: f64, longitude: f64 },
    Forward(String),
}

/// Decide the lookup for `location`.
///
/// Coordinates with no state → reverse. No coordinates, a location string
/// and no state → forward. Anything else needs nothing.
pub fn plan(location: &Location) -> Option<Lookup> {
    if location.has_state() {
        return None;
    }
    match location.coordinates() {
        Some((latitude, longitude)) => Some(Lookup::Reverse {
            latitude,
            longitude,
        }),
        None => non_empty(location.location_string.as_deref())
            .map(|text| Lookup::Forward(text.to_string())),
    }
}

/// Merge a geocoding hit into `location` without overwriting anything.
///
/// Coordinates from the hit are taken only when the location has none.
/// `geocoded` is set only when the hit filled at least one field.
pub fn apply_hit(location: &Location, hit: &GeocodeHit) -> Location {
    let mut next = location.clone();
    let address = &hit.address;

    let mut filled = fill(&mut next.state, address.state_like());
    filled |= fill(&mut next.country, address.country.as_deref());
    filled |= fill(&mut next.postcode, address.postcode.as_deref());
    filled |= fill(&mut next.iso_region_code, address.iso_region_code.as_deref());
    filled |= fill(&mut next.county, address.county.as_deref());
    filled |= fill(&mut next.territory, address.territory.as_deref());

    if next.coordinates().is_none() {
        if let (Some(lat), Some(lon)) = (hit.latitude, hit.longitude) {
            next.latitude = Some(lat);
            next.longitude = Some(lon);
            filled = true;
        }
    }

    if filled {
        next.geocoded = true;
        next.prefer_source(LocationSource::Geocode);
    }
    next
}

fn fill(slot: &mut Option<String>, value: Option<&str>) -> bool {
    if non_empty(slot.as_deref()).is_some() {
        return false;
    }
    match non_empty(value) {
        Some(v) => {
            *slot = Some(v.to_string());
            true
        }
        None => false,
    }
}

/// Geocode `project` if its location has gaps the policy covers.
///
/// A provider error is returned to the caller; "no result" is not an error
/// and leaves the project unchanged.
pub async fn enrich(project: &Project, geocoder: &dyn GeocodingProvider) -> Result<Project> {
    let Some(lookup) = plan(project.location()) else {
        return Ok(project.clone());
    };

    let result = match &lookup {
        Lookup::Reverse {
            latitude,
            longitude,
        } => geocoder.reverse(*latitude, *longitude).await,
        Lookup::Forward(text) => geocoder.forward(text).await,
    };

    match result {
        Ok(Some(hit)) => {
            debug!(id = project.id(), ?lookup, "location enriched");
            Ok(project.with_location(apply_hit(project.location(), &hit)))
        }
        Ok(None) => {
            debug!(id = project.id(), ?lookup, "geocoder had no result");
            Ok(project.clone())
        }
        Err(e) => {
            warn!(id = project.id(), error = %e, "geocoding failed");
            Err(e)
        }
    }
}
