//! Typed SMART SL resource records
//!
//! Deserializing into these structs is the structural validation step: a
//! record missing a required field fails to parse. `Resource::validate`
//! adds the checks serde cannot express (reference formats, cardinality).

use super::manifest::{ManifestEntry, ResourceType};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::ops::Deref;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identifier {
    pub system: String,
    /// Some publishers send null or an error message instead of dropping it.
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactPoint {
    pub system: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub line: Vec<String>,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

/// FHIR extension: a URL plus one `value[x]` property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extension {
    pub url: String,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl Extension {
    /// The `value[x]` payload, whatever its type suffix.
    pub fn value(&self) -> Option<&Value> {
        self.values
            .iter()
            .find(|(key, _)| key.starts_with("value"))
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub reference: String,
}

impl Reference {
    /// Id from a `"<Kind>/<id>"` reference (absolute URLs ending in one
    /// are accepted too).
    pub fn target_id(&self, kind: ResourceType) -> Option<&str> {
        let prefix = format!("{}/", kind.as_str());
        let start = self.reference.rfind(&prefix)? + prefix.len();
        let id = &self.reference[start..];
        if id.is_empty() || id.contains('/') {
            None
        } else {
            Some(id)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coding {
    pub system: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeableConcept {
    pub coding: Vec<Coding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub identifier: Vec<Identifier>,
    pub name: String,
    pub telecom: Vec<ContactPoint>,
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<GeoPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub actor: Vec<Reference>,
    pub service_type: Vec<CodeableConcept>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
}

impl Schedule {
    /// Id of the location this schedule belongs to.
    ///
    /// Only the first actor is considered; publishers put the location there.
    pub fn location_id(&self) -> Option<&str> {
        self.actor.first()?.target_id(ResourceType::Location)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Free,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub id: String,
    pub schedule: Reference,
    pub status: SlotStatus,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
}

impl Slot {
    pub fn schedule_id(&self) -> Option<&str> {
        self.schedule.target_id(ResourceType::Schedule)
    }

    pub fn is_free(&self) -> bool {
        self.status == SlotStatus::Free
    }
}

/// Any record from a resource file, tagged by its `resourceType` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resourceType")]
pub enum Resource {
    Location(Location),
    Schedule(Schedule),
    Slot(Slot),
}

impl Resource {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Resource::Location(_) => ResourceType::Location,
            Resource::Schedule(_) => ResourceType::Schedule,
            Resource::Slot(_) => ResourceType::Slot,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Resource::Location(l) => &l.id,
            Resource::Schedule(s) => &s.id,
            Resource::Slot(s) => &s.id,
        }
    }

    pub fn into_location(self) -> Result<Location, ResourceType> {
        match self {
            Resource::Location(location) => Ok(location),
            other => Err(other.resource_type()),
        }
    }

    pub fn into_schedule(self) -> Result<Schedule, ResourceType> {
        match self {
            Resource::Schedule(schedule) => Ok(schedule),
            other => Err(other.resource_type()),
        }
    }

    pub fn into_slot(self) -> Result<Slot, ResourceType> {
        match self {
            Resource::Slot(slot) => Ok(slot),
            other => Err(other.resource_type()),
        }
    }

    /// Checks beyond field presence and types.
    pub fn validate(&self) -> Result<(), String> {
        if self.id().trim().is_empty() {
            return Err("id must not be empty".to_string());
        }

        match self {
            Resource::Location(_) => Ok(()),
            Resource::Schedule(schedule) => {
                if schedule.actor.len() != 1 {
                    return Err(format!(
                        "actor must have exactly 1 item, got {}",
                        schedule.actor.len()
                    ));
                }
                if schedule.location_id().is_none() {
                    return Err(format!(
                        "actor reference must look like \"Location/<id>\", got {:?}",
                        schedule.actor[0].reference
                    ));
                }
                Ok(())
            }
            Resource::Slot(slot) => {
                if slot.schedule_id().is_none() {
                    return Err(format!(
                        "schedule reference must look like \"Schedule/<id>\", got {:?}",
                        slot.schedule.reference
                    ));
                }
                if slot.end < slot.start {
                    return Err("slot ends before it starts".to_string());
                }
                Ok(())
            }
        }
    }
}

/// A record paired with the manifest entry it was read from.
///
/// The entry is diagnostic context only: it is ignored by `PartialEq` and
/// `Serialize`, so joined records never drag their source along.
#[derive(Debug, Clone)]
pub struct Sourced<T> {
    record: T,
    entry: Arc<ManifestEntry>,
}

impl<T> Sourced<T> {
    pub fn new(record: T, entry: Arc<ManifestEntry>) -> Self {
        Self { record, entry }
    }

    pub fn source_entry(&self) -> &ManifestEntry {
        &self.entry
    }

    pub fn record(&self) -> &T {
        &self.record
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Sourced<U> {
        Sourced {
            record: f(self.record),
            entry: self.entry,
        }
    }
}

impl<T, E> Sourced<Result<T, E>> {
    /// Move a fallible conversion's error out of the wrapper.
    pub fn transpose(self) -> Result<Sourced<T>, E> {
        let Sourced { record, entry } = self;
        record.map(|record| Sourced { record, entry })
    }
}

impl<T> Deref for Sourced<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.record
    }
}

impl<T: PartialEq> PartialEq for Sourced<T> {
    fn eq(&self, other: &Self) -> bool {
        self.record == other.record
    }
}

impl<T: Serialize> Serialize for Sourced<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.record.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reference_target_id() {
        let r = Reference {
            reference: "Location/123".to_string(),
        };
        assert_eq!(r.target_id(ResourceType::Location), Some("123"));
        assert_eq!(r.target_id(ResourceType::Schedule), None);

        let absolute = Reference {
            reference: "https://pub.test/fhir/Schedule/abc".to_string(),
        };
        assert_eq!(absolute.target_id(ResourceType::Schedule), Some("abc"));

        let empty = Reference {
            reference: "Location/".to_string(),
        };
        assert_eq!(empty.target_id(ResourceType::Location), None);
    }

    #[test]
    fn test_resource_tagged_parse_and_validate() {
        let slot: Resource = serde_json::from_value(json!({
            "resourceType": "Slot",
            "id": "s1",
            "schedule": {"reference": "Schedule/sch1"},
            "status": "free",
            "start": "2024-01-10T09:00:00-05:00",
            "end": "2024-01-10T09:15:00-05:00",
            "extension": [{"url": "http://x.test/cap", "valueInteger": 5}]
        }))
        .unwrap();
        assert_eq!(slot.resource_type(), ResourceType::Slot);
        assert!(slot.validate().is_ok());
        if let Resource::Slot(s) = &slot {
            assert_eq!(s.extension[0].value(), Some(&json!(5)));
        }

        let bad_status: Result<Resource, _> = serde_json::from_value(json!({
            "resourceType": "Slot",
            "id": "s1",
            "schedule": {"reference": "Schedule/sch1"},
            "status": "busy-tentative",
            "start": "2024-01-10T09:00:00Z",
            "end": "2024-01-10T09:15:00Z"
        }));
        assert!(bad_status.is_err());

        let schedule: Resource = serde_json::from_value(json!({
            "resourceType": "Schedule",
            "id": "sch1",
            "actor": [{"reference": "Practitioner/9"}],
            "serviceType": []
        }))
        .unwrap();
        assert!(schedule.validate().unwrap_err().contains("Location/<id>"));
    }

    #[test]
    fn test_sourced_ignores_entry_for_eq_and_serialize() {
        let a = Sourced::new(
            "x".to_string(),
            Arc::new(ManifestEntry::new(ResourceType::Slot, "https://a.test/1")),
        );
        let b = Sourced::new(
            "x".to_string(),
            Arc::new(ManifestEntry::new(ResourceType::Slot, "https://a.test/2")),
        );
        assert_eq!(a, b);
        assert_eq!(serde_json::to_value(&a).unwrap(), json!("x"));
        assert_eq!(a.source_entry().url, "https://a.test/1");
    }
}
