use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::aggregate::{Aggregator, CountryAggregate, FailedLookup};
use crate::cache::{CachePaths, CacheScope, CacheStore, MigrationReport};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::export;
use crate::geocoder::GeocodingService;
use crate::identity;
use crate::ingestion;
use crate::resolver::{ResolutionSource, Resolver};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub input: PathBuf,
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl RunOptions {
    pub fn new(input: impl Into<PathBuf>, config: &AppConfig) -> Self {
        Self {
            input: input.into(),
            cache_dir: config.cache_dir.clone(),
            output_dir: config.output_dir.clone(),
        }
    }
}

/// Every file a run reads or writes, derived from the input's base name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub shared_cache: PathBuf,
    pub place_cache: PathBuf,
    pub legacy_cache: PathBuf,
    pub countries: PathBuf,
    pub failed_lookups: PathBuf,
}

impl RunPaths {
    pub fn derive(options: &RunOptions, shared_cache_file_name: &str) -> AppResult<Self> {
        let basename = options
            .input
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| {
                AppError::Config(format!(
                    "cannot derive a base name from {}",
                    options.input.display()
                ))
            })?;

        Ok(Self {
            shared_cache: options.cache_dir.join(shared_cache_file_name),
            place_cache: options.cache_dir.join(format!("{basename}_place_names.json")),
            legacy_cache: options.cache_dir.join(format!("{basename}.json")),
            countries: options.output_dir.join(format!("{basename}_countries.json")),
            failed_lookups: options
                .output_dir
                .join(format!("{basename}_failed_lookups.json")),
        })
    }

    fn cache_paths(&self) -> CachePaths {
        CachePaths {
            shared: self.shared_cache.clone(),
            per_file: self.place_cache.clone(),
            legacy: Some(self.legacy_cache.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub records: usize,
    pub resolved: usize,
    pub failed: usize,
    /// Records without any usable location reference.
    pub skipped: usize,
    pub cache_hits: usize,
    pub api_calls: usize,
    pub short_circuits: usize,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub countries: Vec<CountryAggregate>,
    pub failed: Vec<FailedLookup>,
    pub stats: RunStats,
    pub interrupted: bool,
    pub paths: RunPaths,
    pub migrations: MigrationReport,
}

/// Processes one location export end to end.
///
/// Records are handled strictly in order. The cancel flag is checked between
/// records; whatever was processed before it tripped is still written out.
pub async fn run(
    config: &AppConfig,
    options: &RunOptions,
    lookup: GeocodingService,
    cancel_flag: Option<Arc<AtomicBool>>,
) -> AppResult<RunReport> {
    if !options.input.is_file() {
        return Err(AppError::InputNotFound(options.input.clone()));
    }

    let paths = RunPaths::derive(options, &config.shared_cache_file_name)?;
    fs::create_dir_all(&options.cache_dir)?;
    fs::create_dir_all(&options.output_dir)?;

    let (store, migrations) = CacheStore::open(&paths.cache_paths(), &config.tracked_countries)?;
    info!(
        shared = store.len(CacheScope::Shared),
        place_names = store.len(CacheScope::PerFile),
        "cache loaded"
    );
    let cache = Arc::new(Mutex::new(store));
    let resolver = Resolver::new(cache, lookup, config);

    let records = ingestion::read_csv_file(&options.input)?;
    let total = records.len();
    info!(input = %options.input.display(), records = total, "processing location export");

    let mut aggregator = Aggregator::new();
    let mut stats = RunStats::default();
    let mut interrupted = false;

    for (position, record) in records.iter().enumerate() {
        if is_cancelled(cancel_flag.as_ref()) {
            warn!(
                processed = position,
                remaining = total - position,
                "interrupted; writing partial results"
            );
            interrupted = true;
            break;
        }
        stats.records += 1;

        let Some(identity) = identity::extract(record) else {
            warn!(row = record.row, title = %record.title, "no usable location reference; skipping");
            stats.skipped += 1;
            continue;
        };

        let resolution = resolver.resolve(&identity).await?;
        match resolution.source {
            ResolutionSource::Cache => stats.cache_hits += 1,
            ResolutionSource::Api => stats.api_calls += 1,
            ResolutionSource::ShortCircuit => stats.short_circuits += 1,
        }

        match resolution.outcome {
            Ok(place) => {
                stats.resolved += 1;
                info!(
                    progress = %format!("{}/{}", position + 1, total),
                    title = record.label(),
                    country = %place.country,
                    state = place.state.as_ref().map(|s| s.name.as_str()).unwrap_or_default(),
                    source = ?resolution.source,
                    "resolved"
                );
                aggregator.add_resolved(&place);
            }
            Err(reason) => {
                stats.failed += 1;
                debug!(
                    row = record.row,
                    reference = %identity.reference,
                    %reason,
                    retry_next_run = !reason.is_terminal(),
                    "lookup failed"
                );
                aggregator.add_failure(record, reason);
            }
        }
    }

    let (countries, failed) = aggregator.into_parts();
    export::write_countries(&paths.countries, &countries)?;
    export::write_failed_lookups(&paths.failed_lookups, &failed)?;

    Ok(RunReport {
        countries,
        failed,
        stats,
        interrupted,
        paths,
        migrations,
    })
}

fn is_cancelled(flag: Option<&Arc<AtomicBool>>) -> bool {
    flag.map(|flag| flag.load(Ordering::SeqCst)).unwrap_or(false)
}
