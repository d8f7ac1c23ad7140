use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use url::{form_urlencoded, Url};

use crate::ingestion::RawRecord;

static COORDINATE_PAIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(-?\d{1,3}(?:\.\d+)?)\s*,\s*\+?(-?\d{1,3}(?:\.\d+)?)\s*$")
        .expect("coordinate pattern")
});

static HEX_PAIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:1s|ftid=)(0x[0-9a-f]+)(?::|%3a)(0x[0-9a-f]+)").expect("hex pair pattern")
});

/// What a record points at, in decreasing order of trust.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationReference {
    Coordinate { lat: f64, lng: f64 },
    OpaqueId { id: String },
    PlaceName { name: String },
}

impl fmt::Display for LocationReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationReference::Coordinate { lat, lng } => write!(f, "coordinate {lat},{lng}"),
            LocationReference::OpaqueId { id } => write!(f, "place id {id}"),
            LocationReference::PlaceName { name } => write!(f, "place name '{name}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedIdentity {
    pub reference: LocationReference,
    /// Set when an opaque id shares the link with a readable place segment.
    /// The segment is frequently not the place the id refers to.
    pub low_trust: bool,
    pub path_name: Option<String>,
}

pub fn extract(record: &RawRecord) -> Option<ExtractedIdentity> {
    let parsed = parse_link(&record.url);
    let path_name = parsed.as_ref().and_then(place_segment);

    if let Some((lat, lng)) = parsed.as_ref().and_then(embedded_coordinate) {
        return Some(ExtractedIdentity {
            reference: LocationReference::Coordinate { lat, lng },
            low_trust: false,
            path_name,
        });
    }

    if let Some(id) = opaque_id(&record.url) {
        let low_trust = path_name.is_some();
        return Some(ExtractedIdentity {
            reference: LocationReference::OpaqueId { id },
            low_trust,
            path_name,
        });
    }

    let title = record.title.trim();
    let name = if title.is_empty() {
        path_name.clone()?
    } else {
        title.to_string()
    };
    Some(ExtractedIdentity {
        reference: LocationReference::PlaceName { name },
        low_trust: false,
        path_name,
    })
}

/// Decimal customer id carried in the second half of an opaque `0x..:0x..` id.
pub fn customer_id(opaque_id: &str) -> Option<u64> {
    let (_, cid) = opaque_id.split_once(':')?;
    let digits = cid.strip_prefix("0x").or_else(|| cid.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}

// Exports sometimes drop the scheme; those links must still expose their
// place segment so the low-trust check sees it.
fn parse_link(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    Url::parse(raw)
        .ok()
        .or_else(|| Url::parse(&format!("https://{raw}")).ok())
}

fn embedded_coordinate(url: &Url) -> Option<(f64, f64)> {
    let segments = url.path_segments()?.collect::<Vec<_>>();
    let from_path = segments
        .windows(2)
        .filter(|pair| pair[0] == "search")
        .find_map(|pair| parse_coordinate(&decode_component(pair[1])));
    if from_path.is_some() {
        return from_path;
    }

    url.query_pairs()
        .filter(|(key, _)| key == "q" || key == "query")
        .find_map(|(_, value)| parse_coordinate(&value))
}

fn parse_coordinate(text: &str) -> Option<(f64, f64)> {
    let captures = COORDINATE_PAIR.captures(text)?;
    let lat: f64 = captures.get(1)?.as_str().parse().ok()?;
    let lng: f64 = captures.get(2)?.as_str().parse().ok()?;
    if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng) {
        Some((lat, lng))
    } else {
        None
    }
}

fn opaque_id(raw_url: &str) -> Option<String> {
    let captures = HEX_PAIR.captures(raw_url)?;
    Some(format!("{}:{}", captures.get(1)?.as_str(), captures.get(2)?.as_str()))
}

fn place_segment(url: &Url) -> Option<String> {
    let segments = url.path_segments()?.collect::<Vec<_>>();
    segments
        .windows(2)
        .filter(|pair| pair[0] == "place")
        .map(|pair| decode_component(pair[1]))
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty() && !name.starts_with("data=") && !name.starts_with('@'))
}

// `+` is a space in map links, so decode with form rules rather than plain
// percent decoding.
fn decode_component(raw: &str) -> String {
    form_urlencoded::parse(raw.as_bytes())
        .map(|(key, value)| {
            if value.is_empty() {
                key.into_owned()
            } else {
                format!("{key}={value}")
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}
