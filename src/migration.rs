use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::cache::{CacheValue, CURRENT_SCHEMA_ID};
use crate::config::TrackedCountries;
use crate::place::{ResolvedPlace, StateRef, UnresolvableReason};

const LEGACY_VERSION_FIELD: &str = "schema_version";
const SCHEMA_FIELD: &str = "schema_id";
const LEGACY_ENTRY_FIELDS: &[&str] = &["country", "state", "lat", "lng"];
const LEGACY_STATE_FIELDS: &[&str] = &["name", "short_name", "code"];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("cache document is not a JSON object")]
    NotAnObject,
    #[error("invalid schema marker: {0}")]
    InvalidMarker(String),
    #[error("schema {found} is newer than the supported schema {supported}")]
    FutureSchema { found: u32, supported: u32 },
    #[error("entry '{key}' cannot be migrated: {detail}")]
    Entry { key: String, detail: String },
}

#[derive(Debug)]
pub struct Migrated {
    pub from_schema: u32,
    pub entries: BTreeMap<String, CacheValue>,
    /// Keys left out on purpose so they are fetched again with more detail.
    pub dropped: Vec<String>,
}

/// Schema a stored cache document was written with. Documents predating any
/// marker are schema 1.
pub fn stored_schema(document: &Value) -> Result<u32, MigrationError> {
    let object = document.as_object().ok_or(MigrationError::NotAnObject)?;
    let marker = object
        .get(SCHEMA_FIELD)
        .or_else(|| object.get(LEGACY_VERSION_FIELD));
    match marker {
        None => Ok(1),
        Some(value) => value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v >= 1)
            .ok_or_else(|| MigrationError::InvalidMarker(value.to_string())),
    }
}

/// Rewrites every entry of a stored document into the current entry shape.
///
/// Entries are recognized by shape rather than by the version marker, since
/// older generations were partially upgraded in place. Anything not matching
/// a known shape aborts the migration.
pub fn migrate(document: Value, tracked: &TrackedCountries) -> Result<Migrated, MigrationError> {
    let from_schema = stored_schema(&document)?;
    if from_schema > CURRENT_SCHEMA_ID {
        return Err(MigrationError::FutureSchema {
            found: from_schema,
            supported: CURRENT_SCHEMA_ID,
        });
    }

    let Value::Object(mut object) = document else {
        return Err(MigrationError::NotAnObject);
    };

    if from_schema == CURRENT_SCHEMA_ID {
        let entries = object.remove("entries").unwrap_or(Value::Object(Map::new()));
        let entries: BTreeMap<String, CacheValue> =
            serde_json::from_value(entries).map_err(|err| MigrationError::Entry {
                key: "entries".into(),
                detail: err.to_string(),
            })?;
        return Ok(Migrated {
            from_schema,
            entries,
            dropped: Vec::new(),
        });
    }

    object.remove(LEGACY_VERSION_FIELD);
    object.remove(SCHEMA_FIELD);

    let mut entries = BTreeMap::new();
    let mut dropped = Vec::new();
    for (key, value) in object {
        match migrate_entry(&key, value, tracked)? {
            Some(migrated) => {
                entries.insert(key, migrated);
            }
            None => dropped.push(key),
        }
    }

    Ok(Migrated {
        from_schema,
        entries,
        dropped,
    })
}

fn migrate_entry(
    key: &str,
    value: Value,
    tracked: &TrackedCountries,
) -> Result<Option<CacheValue>, MigrationError> {
    let fail = |detail: String| MigrationError::Entry {
        key: key.to_string(),
        detail,
    };

    match value {
        Value::Null => Ok(Some(no_match())),
        Value::String(country) => {
            let country = country.trim().to_string();
            if country.is_empty() {
                return Err(fail("empty country name".into()));
            }
            // Country-only answers for tracked countries lack the state; refetch them.
            if tracked.tracks(&country, None) {
                return Ok(None);
            }
            Ok(Some(CacheValue::Resolved(ResolvedPlace::new(country))))
        }
        Value::Object(fields) => migrate_object(fields).map_err(fail),
        other => Err(fail(format!("unexpected value {other}"))),
    }
}

fn migrate_object(fields: Map<String, Value>) -> Result<Option<CacheValue>, String> {
    if let Some(unknown) = fields
        .keys()
        .find(|field| !LEGACY_ENTRY_FIELDS.contains(&field.as_str()))
    {
        return Err(format!("unexpected field '{unknown}'"));
    }

    let country = match fields.get("country") {
        None | Some(Value::Null) => return Ok(Some(no_match())),
        Some(Value::String(country)) if !country.trim().is_empty() => country.trim().to_string(),
        Some(other) => return Err(format!("invalid country {other}")),
    };

    let state = match fields.get("state") {
        None | Some(Value::Null) => None,
        Some(Value::String(name)) => StateRef::new(name.as_str(), None),
        Some(Value::Object(state)) => migrate_state(state)?,
        Some(other) => return Err(format!("invalid state {other}")),
    };

    let mut place = ResolvedPlace::new(country).with_state(state);
    match (coordinate(fields.get("lat"))?, coordinate(fields.get("lng"))?) {
        (Some(lat), Some(lng)) => place = place.with_coordinates(lat, lng),
        (None, None) => {}
        _ => return Err("only one of lat/lng present".into()),
    }
    Ok(Some(CacheValue::Resolved(place)))
}

fn migrate_state(state: &Map<String, Value>) -> Result<Option<StateRef>, String> {
    if let Some(unknown) = state
        .keys()
        .find(|field| !LEGACY_STATE_FIELDS.contains(&field.as_str()))
    {
        return Err(format!("unexpected state field '{unknown}'"));
    }
    let name = match state.get("name") {
        Some(Value::String(name)) => name.as_str(),
        other => return Err(format!("invalid state name {other:?}")),
    };
    let text = |field: &str| -> Result<Option<String>, String> {
        match state.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(other) => Err(format!("invalid state {field} {other}")),
        }
    };
    let code = text("code")?.or(text("short_name")?);
    Ok(StateRef::new(name, code))
}

fn coordinate(value: Option<&Value>) -> Result<Option<f64>, String> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number
            .as_f64()
            .map(Some)
            .ok_or_else(|| format!("invalid coordinate {number}")),
        Some(Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| format!("invalid coordinate '{text}'")),
        Some(other) => Err(format!("invalid coordinate {other}")),
    }
}

fn no_match() -> CacheValue {
    CacheValue::Unresolvable {
        reason: UnresolvableReason::NoMatch,
    }
}
