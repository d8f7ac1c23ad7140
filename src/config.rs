use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_API_BASE: &str = "https://maps.googleapis.com/maps/api";
const DEFAULT_MIN_INTERVAL_MS: u64 = 100;
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SHARED_CACHE_FILE: &str = "shared_hex_coord_cache.json";
const DEFAULT_TRACKED_COUNTRIES: &[&str] = &[
    "United States",
    "Canada",
    "Australia",
    "Brazil",
    "Mexico",
    "India",
];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub google_maps_api_key: Option<SecretString>,
    pub google_maps_api_base: String,
    pub geocoder_min_interval_ms: u64,
    pub geocoder_timeout_secs: u64,
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    pub shared_cache_file_name: String,
    pub tracked_countries: TrackedCountries,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub google_maps_api_base: String,
    pub geocoder_min_interval_ms: u64,
    pub geocoder_timeout_secs: u64,
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    pub shared_cache_file_name: String,
    pub tracked_countries: Vec<String>,
    pub has_google_maps_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            google_maps_api_key: env::var("GOOGLE_MAPS_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            google_maps_api_base: env::var("GOOGLE_MAPS_API_BASE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            geocoder_min_interval_ms: parse_u64("GEOCODER_MIN_INTERVAL_MS", DEFAULT_MIN_INTERVAL_MS),
            geocoder_timeout_secs: parse_u64("GEOCODER_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS).max(1),
            cache_dir: env::var("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("cache")),
            output_dir: env::var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("build")),
            shared_cache_file_name: env::var("SHARED_CACHE_FILE_NAME")
                .unwrap_or_else(|_| DEFAULT_SHARED_CACHE_FILE.to_string()),
            tracked_countries: env::var("STATE_TRACKED_COUNTRIES")
                .map(|v| TrackedCountries::parse(&v))
                .unwrap_or_default(),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            google_maps_api_base: self.google_maps_api_base.clone(),
            geocoder_min_interval_ms: self.geocoder_min_interval_ms,
            geocoder_timeout_secs: self.geocoder_timeout_secs,
            cache_dir: self.cache_dir.clone(),
            output_dir: self.output_dir.clone(),
            shared_cache_file_name: self.shared_cache_file_name.clone(),
            tracked_countries: self.tracked_countries.entries().to_vec(),
            has_google_maps_key: self.google_maps_api_key.is_some(),
        }
    }
}

/// Countries whose first-level administrative area (state, province) is recorded.
///
/// Entries are matched case-insensitively against either the country's long
/// name or its ISO short code, so `US` and `United States` are equivalent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedCountries(Vec<String>);

impl TrackedCountries {
    pub fn new<I, S>(countries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            countries
                .into_iter()
                .map(|c| {
                    let c: String = c.into();
                    c.trim().to_string()
                })
                .filter(|c| !c.is_empty())
                .collect(),
        )
    }

    pub fn parse(value: &str) -> Self {
        Self::new(value.split(','))
    }

    pub fn entries(&self) -> &[String] {
        &self.0
    }

    pub fn tracks(&self, long_name: &str, short_name: Option<&str>) -> bool {
        self.0.iter().any(|entry| {
            entry.eq_ignore_ascii_case(long_name)
                || short_name
                    .map(|short| entry.eq_ignore_ascii_case(short))
                    .unwrap_or(false)
        })
    }
}

impl Default for TrackedCountries {
    fn default() -> Self {
        Self::new(DEFAULT_TRACKED_COUNTRIES.iter().copied())
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
