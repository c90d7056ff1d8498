use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use maxminddb::geoip2;
use tracing::{debug, error, info};

/// Backend answering "which country is this address in".
pub trait CountryLookup: Send + Sync {
    fn country(&self, ip: IpAddr) -> Result<Option<String>, anyhow::Error>;
}

pub struct MaxmindLookup(maxminddb::Reader<Vec<u8>>);

impl MaxmindLookup {
    pub fn open(path: &Path) -> Result<Self, anyhow::Error> {
        Ok(Self(maxminddb::Reader::open_readfile(path)?))
    }
}

impl CountryLookup for MaxmindLookup {
    fn country(&self, ip: IpAddr) -> Result<Option<String>, anyhow::Error> {
        let record: geoip2::Country = self.0.lookup(ip)?;
        Ok(record
            .country
            .and_then(|country| country.iso_code)
            .map(String::from))
    }
}

/// Resolves IP literals to ISO country codes.
///
/// Never fails: anything that cannot be resolved maps to an empty string.
/// Results (misses included) are cached for the lifetime of the process.
#[derive(Default)]
pub struct GeoAnnotator {
    lookup: Option<Box<dyn CountryLookup>>,
    cache: RwLock<HashMap<String, String>>,
}

impl std::fmt::Debug for GeoAnnotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoAnnotator")
            .field("active", &self.is_active())
            .field("cached", &self.cached_len())
            .finish()
    }
}

impl GeoAnnotator {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Falls back to a disabled annotator when the database can't be opened.
    pub fn open(path: &Path) -> Self {
        match MaxmindLookup::open(path) {
            Ok(lookup) => {
                info!(msg = "GeoIP lookup enabled", path = %path.display());
                Self::with_lookup(Box::new(lookup))
            }
            Err(err) => {
                error!(msg = "Failed to open GeoIP database, lookup disabled", path = %path.display(), ?err);
                Self::disabled()
            }
        }
    }

    pub fn with_lookup(lookup: Box<dyn CountryLookup>) -> Self {
        Self {
            lookup: Some(lookup),
            cache: RwLock::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.lookup.is_some()
    }

    pub fn cached_len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn resolve(&self, literal: &str) -> String {
        let Some(lookup) = &self.lookup else {
            return String::new();
        };

        let cached = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(literal)
            .cloned();
        if let Some(country) = cached {
            return country;
        }

        let country = match literal.parse::<IpAddr>() {
            Ok(ip) => match lookup.country(ip) {
                Ok(country) => country.unwrap_or_default(),
                Err(err) => {
                    debug!(msg = "GeoIP lookup failed", literal, ?err);
                    String::new()
                }
            },
            Err(err) => {
                debug!(msg = "Not an IP address", literal, ?err);
                String::new()
            }
        };

        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(literal.to_string(), country.clone());
        country
    }
}
