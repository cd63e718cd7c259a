//! Resolves raw location strings into structured administrative regions via
//! the Nominatim (OpenStreetMap) API, with a per-process cache and a fixed
//! inter-call delay to respect the service's rate limits.

use crate::domain::types::Location;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/search";
const USER_AGENT: &str = "Udyamitra/1.0";
const DEFAULT_DELAY: Duration = Duration::from_secs(1);

/// Spellings that short-circuit to the canonical country-level location
/// without an external call.
const COUNTRY_LEVEL: [&str; 3] = ["unknown", "n/a", "india"];

#[derive(Debug, Error)]
#[error("geocoding lookup failed: {0}")]
pub struct GeocodeError(#[from] reqwest::Error);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoAddress {
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

/// Lookup seam so tests can count external calls.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn lookup(&self, raw: &str) -> Result<Option<GeoAddress>, GeocodeError>;
}

pub struct NominatimGeocoder {
    http: Client,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn new() -> Self {
        Self::with_base_url(NOMINATIM_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl Default for NominatimGeocoder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct NominatimResult {
    #[serde(default)]
    address: NominatimAddress,
}

#[derive(Debug, Deserialize, Default)]
struct NominatimAddress {
    city: Option<String>,
    town: Option<String>,
    suburb: Option<String>,
    state: Option<String>,
    country: Option<String>,
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn lookup(&self, raw: &str) -> Result<Option<GeoAddress>, GeocodeError> {
        let results: Vec<NominatimResult> = self
            .http
            .get(&self.base_url)
            .query(&[
                ("q", raw),
                ("format", "json"),
                ("addressdetails", "1"),
                ("limit", "1"),
            ])
            .header("User-Agent", USER_AGENT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(results.into_iter().next().map(|result| GeoAddress {
            city: result
                .address
                .city
                .or(result.address.town)
                .or(result.address.suburb),
            state: result.address.state,
            country: result.address.country,
        }))
    }
}

/// Normalizes raw location strings. One external call per distinct unseen
/// string; warm cache hits are free; failures degrade to a country-level
/// location rather than surfacing an error.
pub struct LocationNormalizer {
    geocoder: Box<dyn Geocoder>,
    cache: Mutex<HashMap<String, Location>>,
    delay: Duration,
}

impl LocationNormalizer {
    pub fn new(geocoder: Box<dyn Geocoder>) -> Self {
        Self::with_delay(geocoder, DEFAULT_DELAY)
    }

    pub fn with_delay(geocoder: Box<dyn Geocoder>, delay: Duration) -> Self {
        Self {
            geocoder,
            cache: Mutex::new(HashMap::new()),
            delay,
        }
    }

    pub async fn normalize(&self, raw_location: &str) -> Location {
        let trimmed = raw_location.trim();
        let lowered = trimmed.to_lowercase();
        if trimmed.is_empty() || COUNTRY_LEVEL.contains(&lowered.as_str()) {
            let raw = if trimmed.is_empty() { "India" } else { trimmed };
            return Location::india(raw);
        }

        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(trimmed) {
                debug!(raw = %trimmed, "Location cache hit");
                return cached.clone();
            }
        }

        info!(raw = %trimmed, "Normalizing location via geocoder");
        let resolved = match self.geocoder.lookup(trimmed).await {
            Ok(Some(address)) => Location {
                raw: trimmed.to_string(),
                city: address.city,
                state: address.state,
                country: address.country.or_else(|| Some("India".to_string())),
            },
            Ok(None) => {
                debug!(raw = %trimmed, "Geocoder returned no match");
                Location::india(trimmed)
            }
            Err(error) => {
                warn!(raw = %trimmed, %error, "Geocoding failed; treating location as unresolved");
                Location::india(trimmed)
            }
        };
        tokio::time::sleep(self.delay).await;

        let mut cache = self.cache.lock().await;
        cache.insert(trimmed.to_string(), resolved.clone());
        resolved
    }
}
