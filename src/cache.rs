use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::TrackedCountries;
use crate::errors::{AppError, AppResult};
use crate::identity::LocationReference;
use crate::migration::{self, MigrationError};
use crate::place::{ResolvedPlace, UnresolvableReason};

pub const CURRENT_SCHEMA_ID: u32 = 5;

static COORDINATE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?\d+\.\d+,-?\d+\.\d+$").expect("coordinate key pattern"));

const OPAQUE_KEY_PREFIX: &str = "hex:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CacheValue {
    Resolved(ResolvedPlace),
    Unresolvable { reason: UnresolvableReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheScope {
    /// Coordinates and opaque ids; identical everywhere, shared by all inputs.
    Shared,
    /// Free-text names; only meaningful within one input file.
    PerFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub scope: CacheScope,
    pub key: String,
}

impl CacheKey {
    pub fn for_reference(reference: &LocationReference) -> Self {
        match reference {
            LocationReference::Coordinate { lat, lng } => Self {
                scope: CacheScope::Shared,
                key: format!("{lat:.6},{lng:.6}"),
            },
            LocationReference::OpaqueId { id } => Self {
                scope: CacheScope::Shared,
                key: format!("{OPAQUE_KEY_PREFIX}{id}"),
            },
            LocationReference::PlaceName { name } => Self {
                scope: CacheScope::PerFile,
                key: name.trim().to_string(),
            },
        }
    }

    /// Scope a key from the pre-split single-file cache belongs to.
    fn from_legacy(key: String) -> Self {
        let scope = if key.starts_with(OPAQUE_KEY_PREFIX) || COORDINATE_KEY.is_match(&key) {
            CacheScope::Shared
        } else {
            CacheScope::PerFile
        };
        Self { scope, key }
    }
}

#[derive(Debug, Clone)]
pub struct CachePaths {
    pub shared: PathBuf,
    pub per_file: PathBuf,
    /// Single-file cache used before the scopes were split.
    pub legacy: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MigratedFile {
    pub path: PathBuf,
    pub from_schema: u32,
    pub backup: PathBuf,
    pub entries: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub files: Vec<MigratedFile>,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CacheDocument {
    schema_id: u32,
    entries: BTreeMap<String, CacheValue>,
}

#[derive(Serialize)]
struct CacheDocumentRef<'a> {
    schema_id: u32,
    entries: &'a BTreeMap<String, CacheValue>,
}

/// Geocoding memo persisted as one JSON document per scope.
///
/// Every `put` rewrites the affected document before returning, so an
/// interrupted run never loses a completed lookup.
pub struct CacheStore {
    shared: CacheFile,
    per_file: CacheFile,
}

impl CacheStore {
    pub fn open(
        paths: &CachePaths,
        tracked: &TrackedCountries,
    ) -> AppResult<(Self, MigrationReport)> {
        let mut report = MigrationReport::default();
        let shared = CacheFile::load(&paths.shared, tracked, &mut report)?;
        let per_file = CacheFile::load(&paths.per_file, tracked, &mut report)?;
        let mut store = Self { shared, per_file };

        if let Some(legacy) = paths.legacy.as_deref() {
            store.absorb_legacy(legacy, tracked, &mut report)?;
        }

        debug!(
            shared = store.shared.entries.len(),
            per_file = store.per_file.entries.len(),
            "cache store opened"
        );
        Ok((store, report))
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CacheValue> {
        self.file(key.scope).entries.get(&key.key)
    }

    pub fn put(&mut self, key: CacheKey, value: CacheValue) -> AppResult<()> {
        let file = self.file_mut(key.scope);
        file.entries.insert(key.key, value);
        file.persist()
    }

    pub fn len(&self, scope: CacheScope) -> usize {
        self.file(scope).entries.len()
    }

    fn file(&self, scope: CacheScope) -> &CacheFile {
        match scope {
            CacheScope::Shared => &self.shared,
            CacheScope::PerFile => &self.per_file,
        }
    }

    fn file_mut(&mut self, scope: CacheScope) -> &mut CacheFile {
        match scope {
            CacheScope::Shared => &mut self.shared,
            CacheScope::PerFile => &mut self.per_file,
        }
    }

    fn absorb_legacy(
        &mut self,
        legacy: &Path,
        tracked: &TrackedCountries,
        report: &mut MigrationReport,
    ) -> AppResult<()> {
        let Some(document) = read_document(legacy)? else {
            return Ok(());
        };
        let migrated = migration::migrate(document, tracked)
            .map_err(|err| migration_error(legacy, err))?;

        let total = migrated.entries.len();
        let mut touched = (false, false);
        for (key, value) in migrated.entries {
            let key = CacheKey::from_legacy(key);
            let scope = key.scope;
            let file = self.file_mut(scope);
            if file.entries.contains_key(&key.key) {
                continue;
            }
            file.entries.insert(key.key, value);
            match scope {
                CacheScope::Shared => touched.0 = true,
                CacheScope::PerFile => touched.1 = true,
            }
        }
        if touched.0 {
            self.shared.persist()?;
        }
        if touched.1 {
            self.per_file.persist()?;
        }

        let backup = backup_path(legacy, migrated.from_schema);
        fs::rename(legacy, &backup)?;
        info!(
            legacy = %legacy.display(),
            backup = %backup.display(),
            entries = total,
            dropped = migrated.dropped.len(),
            "split legacy cache into shared and per-file scopes"
        );
        report.files.push(MigratedFile {
            path: legacy.to_path_buf(),
            from_schema: migrated.from_schema,
            backup,
            entries: total,
            dropped: migrated.dropped.len(),
        });
        Ok(())
    }
}

struct CacheFile {
    path: PathBuf,
    entries: BTreeMap<String, CacheValue>,
}

impl CacheFile {
    fn load(
        path: &Path,
        tracked: &TrackedCountries,
        report: &mut MigrationReport,
    ) -> AppResult<Self> {
        let Some(document) = read_document(path)? else {
            return Ok(Self {
                path: path.to_path_buf(),
                entries: BTreeMap::new(),
            });
        };

        let stored = migration::stored_schema(&document).map_err(|err| migration_error(path, err))?;
        if stored == CURRENT_SCHEMA_ID {
            let document: CacheDocument =
                serde_json::from_value(document).map_err(|err| AppError::CacheCorrupt {
                    path: path.to_path_buf(),
                    detail: err.to_string(),
                })?;
            return Ok(Self {
                path: path.to_path_buf(),
                entries: document.entries,
            });
        }

        let file = Self::migrate(path, document, tracked, report)?;
        Ok(file)
    }

    /// One-shot upgrade of a stale document: back up the original, rewrite it
    /// in the current schema. Any entry that cannot be converted aborts the run.
    fn migrate(
        path: &Path,
        document: Value,
        tracked: &TrackedCountries,
        report: &mut MigrationReport,
    ) -> AppResult<Self> {
        let migrated =
            migration::migrate(document, tracked).map_err(|err| migration_error(path, err))?;
        let backup = backup_path(path, migrated.from_schema);
        fs::copy(path, &backup)?;

        let file = Self {
            path: path.to_path_buf(),
            entries: migrated.entries,
        };
        file.persist()?;

        info!(
            path = %path.display(),
            backup = %backup.display(),
            from = migrated.from_schema,
            to = CURRENT_SCHEMA_ID,
            entries = file.entries.len(),
            dropped = migrated.dropped.len(),
            "migrated geocoding cache"
        );
        if !migrated.dropped.is_empty() {
            warn!(
                count = migrated.dropped.len(),
                "cache entries without state detail were dropped and will be fetched again"
            );
        }
        report.files.push(MigratedFile {
            path: path.to_path_buf(),
            from_schema: migrated.from_schema,
            backup,
            entries: file.entries.len(),
            dropped: migrated.dropped.len(),
        });
        Ok(file)
    }

    fn persist(&self) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(&CacheDocumentRef {
            schema_id: CURRENT_SCHEMA_ID,
            entries: &self.entries,
        })?;
        let staging = sibling(&self.path, "tmp");
        fs::write(&staging, serialized)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

fn read_document(path: &Path) -> AppResult<Option<Value>> {
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| AppError::CacheCorrupt {
                path: path.to_path_buf(),
                detail: err.to_string(),
            }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(AppError::Io(err)),
    }
}

fn migration_error(path: &Path, err: MigrationError) -> AppError {
    AppError::CacheMigration {
        path: path.to_path_buf(),
        detail: err.to_string(),
    }
}

fn backup_path(path: &Path, from_schema: u32) -> PathBuf {
    sibling(
        path,
        &format!("v{from_schema}-{}.bak", Utc::now().format("%Y%m%d%H%M%S")),
    )
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "cache.json".into());
    path.with_file_name(format!("{name}.{suffix}"))
}
