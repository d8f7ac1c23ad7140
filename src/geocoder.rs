use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::{trace, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;

const COUNTRY_TYPE: &str = "country";
const ADMIN_AREA_TYPE: &str = "administrative_area_level_1";
const DETAIL_FIELDS: &str = "address_components,geometry";

/// What the provider is asked to look up.
#[derive(Debug, Clone, PartialEq)]
pub enum GeocodeQuery {
    Coordinate { lat: f64, lng: f64 },
    CustomerId(u64),
    Address(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedComponent {
    pub long_name: String,
    pub short_name: Option<String>,
}

impl NamedComponent {
    pub fn new(long_name: impl Into<String>, short_name: Option<&str>) -> Self {
        Self {
            long_name: long_name.into(),
            short_name: short_name.map(str::to_string),
        }
    }
}

/// The parts of a provider answer the resolver cares about.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AddressComponents {
    pub country: Option<NamedComponent>,
    pub admin_area: Option<NamedComponent>,
    pub location: Option<(f64, f64)>,
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("no match")]
    NoMatch,
}

impl From<reqwest::Error> for GeocodeError {
    fn from(err: reqwest::Error) -> Self {
        // Request URLs carry the API key.
        let err = err.without_url();
        if err.is_status() || err.is_decode() {
            GeocodeError::Provider(err.to_string())
        } else {
            GeocodeError::Network(err.to_string())
        }
    }
}

#[async_trait]
pub trait GeocodeLookup: Send + Sync {
    async fn geocode(&self, query: &GeocodeQuery) -> Result<AddressComponents, GeocodeError>;
}

#[derive(Clone)]
pub struct GeocodingService {
    inner: Arc<dyn GeocodeLookup>,
}

impl GeocodingService {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        match config.google_maps_api_key.clone() {
            Some(key) => {
                let http = HttpGeocodingClient::new(
                    key,
                    &config.google_maps_api_base,
                    Duration::from_secs(config.geocoder_timeout_secs),
                )?;
                Ok(Self {
                    inner: Arc::new(http),
                })
            }
            None => {
                warn!("GOOGLE_MAPS_API_KEY is not set; only cached lookups will resolve");
                Ok(Self {
                    inner: Arc::new(DisabledGeocoder),
                })
            }
        }
    }

    pub fn from_lookup(lookup: Arc<dyn GeocodeLookup>) -> Self {
        Self { inner: lookup }
    }

    pub async fn geocode(&self, query: &GeocodeQuery) -> Result<AddressComponents, GeocodeError> {
        self.inner.geocode(query).await
    }
}

/// Google Geocoding API for coordinates and free text, Places Details for
/// customer ids.
pub struct HttpGeocodingClient {
    http: reqwest::Client,
    api_key: SecretString,
    api_base: String,
}

impl HttpGeocodingClient {
    pub fn new(api_key: SecretString, api_base: &str, timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("visited-countries/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_geocode(
        &self,
        params: &[(&str, String)],
    ) -> Result<AddressComponents, GeocodeError> {
        let response: GeocodeResponse = self
            .http
            .get(format!("{}/geocode/json", self.api_base))
            .query(params)
            .query(&[("key", self.api_key.expose_secret())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        check_status(&response.status, response.error_message.as_deref())?;
        let first = response
            .results
            .into_iter()
            .next()
            .ok_or(GeocodeError::NoMatch)?;
        Ok(first.into_components())
    }

    async fn fetch_details(&self, customer_id: u64) -> Result<AddressComponents, GeocodeError> {
        let response: DetailsResponse = self
            .http
            .get(format!("{}/place/details/json", self.api_base))
            .query(&[
                ("cid", customer_id.to_string().as_str()),
                ("fields", DETAIL_FIELDS),
                ("key", self.api_key.expose_secret()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        check_status(&response.status, response.error_message.as_deref())?;
        let result = response.result.ok_or(GeocodeError::NoMatch)?;
        Ok(result.into_components())
    }
}

#[async_trait]
impl GeocodeLookup for HttpGeocodingClient {
    async fn geocode(&self, query: &GeocodeQuery) -> Result<AddressComponents, GeocodeError> {
        trace!(?query, "geocoding request");
        match query {
            GeocodeQuery::Coordinate { lat, lng } => {
                self.fetch_geocode(&[("latlng", format!("{lat},{lng}"))])
                    .await
            }
            GeocodeQuery::Address(address) => {
                self.fetch_geocode(&[("address", address.clone())]).await
            }
            GeocodeQuery::CustomerId(cid) => self.fetch_details(*cid).await,
        }
    }
}

/// Stand-in used without an API key: every miss stays unresolved and is
/// retried on a later run.
struct DisabledGeocoder;

#[async_trait]
impl GeocodeLookup for DisabledGeocoder {
    async fn geocode(&self, _query: &GeocodeQuery) -> Result<AddressComponents, GeocodeError> {
        Err(GeocodeError::Provider(
            "geocoding disabled: GOOGLE_MAPS_API_KEY is not set".into(),
        ))
    }
}

#[derive(Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<ResponseResult>,
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct DetailsResponse {
    status: String,
    result: Option<ResponseResult>,
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct ResponseResult {
    #[serde(default)]
    address_components: Vec<ResponseComponent>,
    geometry: Option<ResponseGeometry>,
}

#[derive(Deserialize)]
struct ResponseComponent {
    long_name: String,
    short_name: Option<String>,
    #[serde(default)]
    types: Vec<String>,
}

#[derive(Deserialize)]
struct ResponseGeometry {
    location: Option<ResponseLocation>,
}

#[derive(Deserialize)]
struct ResponseLocation {
    lat: f64,
    lng: f64,
}

impl ResponseResult {
    fn into_components(self) -> AddressComponents {
        let find = |kind: &str| {
            self.address_components
                .iter()
                .find(|component| component.types.iter().any(|t| t == kind))
                .map(|component| {
                    NamedComponent::new(
                        component.long_name.clone(),
                        component.short_name.as_deref(),
                    )
                })
        };
        AddressComponents {
            country: find(COUNTRY_TYPE),
            admin_area: find(ADMIN_AREA_TYPE),
            location: self
                .geometry
                .as_ref()
                .and_then(|g| g.location.as_ref())
                .map(|loc| (loc.lat, loc.lng)),
        }
    }
}

fn check_status(status: &str, message: Option<&str>) -> Result<(), GeocodeError> {
    match status {
        "OK" => Ok(()),
        "ZERO_RESULTS" | "NOT_FOUND" => Err(GeocodeError::NoMatch),
        other => Err(GeocodeError::Provider(match message {
            Some(message) => format!("{other}: {message}"),
            None => other.to_string(),
        })),
    }
}
