use std::fmt;

use serde::{Deserialize, Serialize};

/// First-level administrative area of a resolved place.
///
/// `code` is only kept when it adds information: an abbreviation identical to
/// the name (ignoring case) is dropped on construction and on deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StateRefRepr")]
pub struct StateRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl StateRef {
    pub fn new(name: impl Into<String>, code: Option<String>) -> Option<Self> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return None;
        }
        let code = code
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case(&name));
        Some(Self { name, code })
    }
}

#[derive(Deserialize)]
struct StateRefRepr {
    name: String,
    #[serde(default)]
    code: Option<String>,
}

impl From<StateRefRepr> for StateRef {
    fn from(value: StateRefRepr) -> Self {
        let code = value
            .code
            .filter(|c| !c.trim().is_empty() && !c.trim().eq_ignore_ascii_case(value.name.trim()));
        Self {
            name: value.name,
            code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPlace {
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
}

impl ResolvedPlace {
    pub fn new(country: impl Into<String>) -> Self {
        Self {
            country: country.into(),
            state: None,
            lat: None,
            lng: None,
        }
    }

    pub fn with_state(mut self, state: Option<StateRef>) -> Self {
        self.state = state;
        self
    }

    pub fn with_coordinates(mut self, lat: f64, lng: f64) -> Self {
        self.lat = Some(lat);
        self.lng = Some(lng);
        self
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.lat.zip(self.lng)
    }
}

/// Failures that are remembered across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnresolvableReason {
    NoMatch,
    AmbiguousIdentifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    TransientNetwork,
    ProviderError,
    NoMatch,
    AmbiguousIdentifier,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::TransientNetwork => "transient-network",
            FailureReason::ProviderError => "provider-error",
            FailureReason::NoMatch => "no-match",
            FailureReason::AmbiguousIdentifier => "ambiguous-identifier",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FailureReason::NoMatch | FailureReason::AmbiguousIdentifier
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<UnresolvableReason> for FailureReason {
    fn from(value: UnresolvableReason) -> Self {
        match value {
            UnresolvableReason::NoMatch => FailureReason::NoMatch,
            UnresolvableReason::AmbiguousIdentifier => FailureReason::AmbiguousIdentifier,
        }
    }
}
