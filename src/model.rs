//! Normalized availability records
//!
//! This is the vendor-agnostic shape every source adapter produces and the
//! remote store accepts. Field names match the API's JSON.

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Vaccine availability at a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Available {
    /// Vaccines are available!
    Yes,
    /// We got good data, but can't clearly tell availability from it.
    Unknown,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocationType {
    Pharmacy,
    MassVax,
    Clinic,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

/// When the availability data was valid. Sources are sometimes only precise
/// to the day, in which case the time is taken as 00:00 UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValidTime {
    DateTime(DateTime<FixedOffset>),
    Date(NaiveDate),
}

impl ValidTime {
    pub fn to_utc(&self) -> DateTime<Utc> {
        match self {
            ValidTime::DateTime(dt) => dt.with_timezone(&Utc),
            ValidTime::Date(date) => start_of_day_utc(*date),
        }
    }
}

impl From<DateTime<Utc>> for ValidTime {
    fn from(dt: DateTime<Utc>) -> Self {
        ValidTime::DateTime(dt.fixed_offset())
    }
}

pub(crate) fn start_of_day_utc(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub start: DateTime<FixedOffset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<FixedOffset>>,
    /// Never `Unknown` for a slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<Available>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unavailable_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub products: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_url: Option<String>,
}

/// Per-day summary, used when a source only reports daily capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityRecord {
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<Available>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unavailable_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub products: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dose: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Availability {
    pub source: String,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_at: Option<ValidTime>,
    pub available: Available,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub products: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doses: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
    /// `Some(vec![])` is meaningful: the source said there are no slots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slots: Option<Vec<SlotRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<Vec<CapacityRecord>>,
}

impl Availability {
    pub fn new(source: impl Into<String>, checked_at: DateTime<Utc>, available: Available) -> Self {
        Self {
            source: source.into(),
            checked_at,
            valid_at: None,
            available,
            available_count: None,
            products: None,
            doses: None,
            is_public: None,
            slots: None,
            capacity: None,
        }
    }
}

/// A location plus its current availability, ready for delivery.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LocationRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_ids: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_type: Option<LocationType>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub address_lines: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub county: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability: Option<Availability>,
}

impl LocationRecord {
    /// Source name from the availability block, if any.
    pub fn source(&self) -> Option<&str> {
        self.availability.as_ref().map(|a| a.source.as_str())
    }

    /// Short human-readable identification for log lines.
    pub fn describe(&self) -> String {
        let mut text = format!("\"{}\"", self.name);
        if let Some((system, value)) = self.external_ids.first() {
            text.push_str(&format!(" ({}:{})", system, value));
        } else if let Some(id) = &self.id {
            text.push_str(&format!(" ({})", id));
        }
        text
    }
}

/// Extra instructions for the remote store sent alongside a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeliveryOptions {
    /// The receiver may also upsert static location metadata.
    #[serde(default)]
    pub update_location: bool,
}

impl DeliveryOptions {
    pub fn update_location() -> Self {
        Self {
            update_location: true,
        }
    }
}

/// What a source adapter yields: a bare record or one with options.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutput {
    Record(LocationRecord),
    WithOptions(LocationRecord, DeliveryOptions),
}

impl SourceOutput {
    /// Normalize to the pair form.
    pub fn into_pair(self) -> (LocationRecord, DeliveryOptions) {
        match self {
            SourceOutput::Record(record) => (record, DeliveryOptions::default()),
            SourceOutput::WithOptions(record, options) => (record, options),
        }
    }
}

impl From<LocationRecord> for SourceOutput {
    fn from(record: LocationRecord) -> Self {
        SourceOutput::Record(record)
    }
}

impl From<(LocationRecord, DeliveryOptions)> for SourceOutput {
    fn from((record, options): (LocationRecord, DeliveryOptions)) -> Self {
        SourceOutput::WithOptions(record, options)
    }
}
