//! Bulk-publish manifest and entry filtering

use chrono::{DateTime, FixedOffset};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Location,
    Schedule,
    Slot,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Location => "Location",
            ResourceType::Schedule => "Schedule",
            ResourceType::Slot => "Slot",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "transactionTime")]
    pub transaction_time: DateTime<FixedOffset>,
    #[serde(rename = "request")]
    pub request_url: String,
    #[serde(rename = "output")]
    pub entries: Vec<Arc<ManifestEntry>>,
}

/// One NDJSON file listed in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<EntryExtension>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntryExtension {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateList>,
    /// Some publishers put freshness on the file rather than each record.
    #[serde(
        rename = "currentAsOf",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub current_as_of: Option<DateTime<FixedOffset>>,
}

/// States covered by an entry: publishers send either one code or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateList {
    One(String),
    Many(Vec<String>),
}

impl StateList {
    /// Whether this entry may hold data for any of the requested states.
    pub fn intersects(&self, requested: &[String]) -> bool {
        match self {
            StateList::One(state) => requested.iter().any(|r| r == state),
            StateList::Many(states) => states.iter().any(|s| requested.contains(s)),
        }
    }
}

impl ManifestEntry {
    pub fn new(resource_type: ResourceType, url: impl Into<String>) -> Self {
        Self {
            resource_type,
            url: url.into(),
            extension: None,
        }
    }

    pub fn declared_states(&self) -> Option<&StateList> {
        self.extension.as_ref().and_then(|e| e.state.as_ref())
    }

    pub fn current_as_of(&self) -> Option<DateTime<FixedOffset>> {
        self.extension.as_ref().and_then(|e| e.current_as_of)
    }

    /// Declared states, or a single state inferred from the URL path.
    pub fn states(&self) -> Option<StateList> {
        match self.declared_states() {
            Some(states) => Some(states.clone()),
            None => infer_state_from_url(&self.url).map(StateList::One),
        }
    }

    /// Entry-level state filter. Matches unconditionally when either side
    /// has no state information.
    pub fn matches_states(&self, requested: Option<&[String]>) -> bool {
        match (requested, self.states()) {
            (Some(requested), Some(states)) => states.intersects(requested),
            _ => true,
        }
    }
}

const STATE_CODES: &[&str] = &[
    "AK", "AL", "AR", "AS", "AZ", "CA", "CO", "CT", "DC", "DE", "FL", "FM", "GA", "GU", "HI", "IA",
    "ID", "IL", "IN", "KS", "KY", "LA", "MA", "MD", "ME", "MH", "MI", "MN", "MO", "MP", "MS", "MT",
    "NC", "ND", "NE", "NH", "NJ", "NM", "NV", "NY", "OH", "OK", "OR", "PA", "PR", "PW", "RI", "SC",
    "SD", "TN", "TX", "UT", "VA", "VI", "VT", "WA", "WI", "WV", "WY",
];

/// Find the state a resource file covers from its URL.
///
/// Only two forms count: a path segment that is exactly an uppercase state
/// code (`.../NJ/slots.ndjson`) or an uppercase `_XX` / `-XX` suffix on the
/// file stem (`.../slot_AK.ndjson`). Lowercase words like `in`, `me` or `id`
/// are too common in paths to read as states.
pub fn infer_state_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.collect();
    let (file, dirs) = segments.split_last()?;

    let stem = file.split('.').next().unwrap_or(file);
    let suffix = stem
        .rsplit_once(|c: char| c == '_' || c == '-')
        .map(|(_, suffix)| suffix)
        .filter(|suffix| is_state_code(suffix));
    if let Some(state) = suffix {
        return Some(state.to_string());
    }

    dirs.iter()
        .rev()
        .find(|segment| is_state_code(segment))
        .map(|segment| segment.to_string())
}

fn is_state_code(token: &str) -> bool {
    STATE_CODES.contains(&token)
}

impl Manifest {
    /// Entries of one resource type that may cover the requested states.
    pub fn entries_for(
        &self,
        resource_type: ResourceType,
        states: Option<&[String]>,
    ) -> Vec<Arc<ManifestEntry>> {
        self.entries
            .iter()
            .filter(|entry| entry.resource_type == resource_type)
            .filter(|entry| entry.matches_states(states))
            .cloned()
            .collect()
    }
}
