//! Join Location, Schedule and Slot streams into per-location aggregates
//!
//! Records never point at each other. The join keeps two short-lived maps
//! (location id -> aggregate, schedule id -> location id) and drops them
//! when it returns.

use super::client::SmartClient;
use super::resources::{Location, Schedule, Slot, Sourced};
use super::{systems, COVID_SERVICE_CODE};
use crate::errors::SmartError;
use futures::TryStreamExt;
use serde::Serialize;
use std::collections::HashMap;

/// Whether a schedule is for COVID-19 vaccinations.
pub fn is_covid_schedule(schedule: &Schedule) -> bool {
    schedule.service_type.iter().any(|service| {
        service.coding.iter().any(|coding| {
            coding.system == systems::HL7_SERVICE_TYPE && coding.code == COVID_SERVICE_CODE
        })
    })
}

/// A location with its COVID schedules and their slots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationAggregate {
    pub location: Sourced<Location>,
    pub schedules: Vec<Sourced<Schedule>>,
    pub slots: Vec<Sourced<Slot>>,
}

impl LocationAggregate {
    pub fn new(location: Sourced<Location>) -> Self {
        Self {
            location,
            schedules: Vec::new(),
            slots: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.location.id
    }
}

/// Aggregates keyed by location id, iterated in the order locations were
/// listed by the publisher.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinedLocations {
    order: Vec<String>,
    by_id: HashMap<String, LocationAggregate>,
}

impl JoinedLocations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an aggregate. A repeated id replaces the earlier aggregate but
    /// keeps its original position.
    pub fn insert(&mut self, aggregate: LocationAggregate) {
        let id = aggregate.id().to_string();
        if self.by_id.insert(id.clone(), aggregate).is_none() {
            self.order.push(id);
        }
    }

    pub fn get(&self, id: &str) -> Option<&LocationAggregate> {
        self.by_id.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut LocationAggregate> {
        self.by_id.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocationAggregate> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    /// Keep only aggregates for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&LocationAggregate) -> bool) {
        let by_id = &mut self.by_id;
        self.order.retain(|id| {
            let kept = by_id.get(id).map_or(false, &mut keep);
            if !kept {
                by_id.remove(id);
            }
            kept
        });
    }
}

impl Serialize for JoinedLocations {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.len()))?;
        for aggregate in self.iter() {
            map.serialize_entry(aggregate.id(), aggregate)?;
        }
        map.end()
    }
}

/// Stream all three resource types from `client` and join them.
///
/// Bad references are logged and the record is skipped; only protocol
/// errors (transport, schema) fail the join.
pub async fn join_locations(
    client: &SmartClient,
    states: Option<&[String]>,
) -> Result<JoinedLocations, SmartError> {
    let mut locations = JoinedLocations::new();

    let stream = client.list_locations(states);
    futures::pin_mut!(stream);
    while let Some(location) = stream.try_next().await? {
        locations.insert(LocationAggregate::new(location));
    }

    // schedule id -> location id, `None` when the schedule cannot carry slots.
    let mut schedule_index: HashMap<String, Option<String>> = HashMap::new();

    let stream = client.list_schedules(states);
    futures::pin_mut!(stream);
    while let Some(schedule) = stream.try_next().await? {
        let (schedule_id, location_id) = link_schedule(&mut locations, schedule);
        schedule_index.insert(schedule_id, location_id);
    }

    let stream = client.list_slots(states);
    futures::pin_mut!(stream);
    while let Some(slot) = stream.try_next().await? {
        let Some(schedule_id) = slot.schedule_id().map(str::to_string) else {
            log::error!(
                "Slot {} has an invalid schedule reference {:?} (from {})",
                slot.id,
                slot.schedule.reference,
                slot.source_entry().url
            );
            continue;
        };

        match schedule_index.get(&schedule_id) {
            Some(Some(location_id)) => {
                if let Some(aggregate) = locations.get_mut(location_id) {
                    aggregate.slots.push(slot);
                }
            }
            Some(None) => {
                log::debug!(
                    "Skipping slot {} for unlinked schedule {}",
                    slot.id,
                    schedule_id
                );
            }
            None => {
                log::error!(
                    "No schedule {} (referenced from slot {}, {})",
                    schedule_id,
                    slot.id,
                    slot.source_entry().url
                );
            }
        }
    }

    // Entry-level state filtering is only as good as the manifest, so check
    // each location's address too. Locations without a state are kept.
    if let Some(states) = states {
        locations.retain(|aggregate| {
            let state = aggregate.location.address.state.trim();
            state.is_empty() || states.iter().any(|s| s == state)
        });
    }

    Ok(locations)
}

/// Attach a schedule to its location. Returns the index entry for it.
fn link_schedule(
    locations: &mut JoinedLocations,
    schedule: Sourced<Schedule>,
) -> (String, Option<String>) {
    let schedule_id = schedule.id.clone();

    if !is_covid_schedule(&schedule) {
        log::warn!(
            "Found non-COVID schedule {}: {}",
            schedule_id,
            serde_json::to_string(&schedule.service_type).unwrap_or_default()
        );
        return (schedule_id, None);
    }

    let Some(location_id) = schedule.location_id().map(str::to_string) else {
        log::error!(
            "Schedule {} has an invalid actor reference (from {})",
            schedule_id,
            schedule.source_entry().url
        );
        return (schedule_id, None);
    };

    match locations.get_mut(&location_id) {
        Some(aggregate) => {
            aggregate.schedules.push(schedule);
            (schedule_id, Some(location_id))
        }
        None => {
            log::error!("Found schedule with unknown location: {}", schedule_id);
            (schedule_id, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smart::fetch::StaticFetcher;
    use serde_json::json;
    use std::sync::Arc;

    const MANIFEST_URL: &str = "https://pub.test/$bulk-publish";

    fn location(id: &str, state: &str) -> serde_json::Value {
        json!({
            "resourceType": "Location",
            "id": id,
            "identifier": [],
            "name": format!("Store {}", id),
            "telecom": [],
            "address": {"line": ["1 Main St"], "city": "Town", "state": state, "postalCode": "00001"}
        })
    }

    fn schedule(id: &str, location_ref: &str, code: &str) -> serde_json::Value {
        json!({
            "resourceType": "Schedule",
            "id": id,
            "actor": [{"reference": location_ref}],
            "serviceType": [{
                "coding": [{"system": systems::HL7_SERVICE_TYPE, "code": code}]
            }]
        })
    }

    fn slot(id: &str, schedule_ref: &str, status: &str, day: &str) -> serde_json::Value {
        json!({
            "resourceType": "Slot",
            "id": id,
            "schedule": {"reference": schedule_ref},
            "status": status,
            "start": format!("{}T09:00:00Z", day),
            "end": format!("{}T09:15:00Z", day)
        })
    }

    fn ndjson(records: &[serde_json::Value]) -> String {
        records
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn client_for(
        locations: &[serde_json::Value],
        schedules: &[serde_json::Value],
        slots: &[serde_json::Value],
    ) -> SmartClient {
        let manifest = json!({
            "transactionTime": "2024-01-10T00:00:00Z",
            "request": MANIFEST_URL,
            "output": [
                {"type": "Location", "url": "https://pub.test/locations.ndjson"},
                {"type": "Schedule", "url": "https://pub.test/schedules.ndjson"},
                {"type": "Slot", "url": "https://pub.test/slots.ndjson"}
            ]
        });
        let fetcher = StaticFetcher::new()
            .with_body(MANIFEST_URL, manifest.to_string())
            .with_body("https://pub.test/locations.ndjson", ndjson(locations))
            .with_body("https://pub.test/schedules.ndjson", ndjson(schedules))
            .with_body("https://pub.test/slots.ndjson", ndjson(slots));
        SmartClient::new(MANIFEST_URL, Arc::new(fetcher))
    }

    #[tokio::test]
    async fn test_join_single_location_with_two_slots() {
        let client = client_for(
            &[location("L1", "NJ")],
            &[schedule("S1", "Location/L1", "57")],
            &[
                slot("slot-free", "Schedule/S1", "free", "2024-01-10"),
                slot("slot-busy", "Schedule/S1", "busy", "2024-01-11"),
            ],
        );

        let joined = client.get_locations(None).await.unwrap();
        assert_eq!(joined.len(), 1);

        let l1 = joined.get("L1").unwrap();
        assert_eq!(l1.location.id, "L1");
        assert_eq!(l1.schedules.len(), 1);
        assert_eq!(l1.schedules[0].id, "S1");
        let slot_ids: Vec<&str> = l1.slots.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(slot_ids, vec!["slot-free", "slot-busy"]);
        assert!(l1.slots[0].is_free());
        assert!(!l1.slots[1].is_free());
    }

    #[tokio::test]
    async fn test_join_skips_bad_references_and_non_covid() {
        let client = client_for(
            &[location("L1", "NJ"), location("L2", "NJ")],
            &[
                schedule("S1", "Location/L1", "57"),
                schedule("FLU", "Location/L2", "58"),
                schedule("S9", "Location/nowhere", "57"),
            ],
            &[
                slot("a", "Schedule/S1", "free", "2024-01-10"),
                slot("b", "Schedule/FLU", "free", "2024-01-10"),
                slot("c", "Schedule/S9", "free", "2024-01-10"),
                slot("d", "Schedule/missing", "free", "2024-01-10"),
            ],
        );

        let joined = client.get_locations(None).await.unwrap();
        let ids: Vec<&str> = joined.ids().collect();
        assert_eq!(ids, vec!["L1", "L2"]);

        let l1 = joined.get("L1").unwrap();
        assert_eq!(l1.slots.len(), 1);
        assert_eq!(l1.slots[0].id, "a");

        let l2 = joined.get("L2").unwrap();
        assert!(l2.schedules.is_empty());
        assert!(l2.slots.is_empty());
    }

    #[tokio::test]
    async fn test_join_final_state_filter_keeps_stateless_locations() {
        let client = client_for(
            &[location("NJ1", "NJ"), location("NY1", "NY"), location("X", "")],
            &[],
            &[],
        );

        let states = vec!["NJ".to_string()];
        let joined = client.get_locations(Some(&states)).await.unwrap();
        let ids: Vec<&str> = joined.ids().collect();
        assert_eq!(ids, vec!["NJ1", "X"]);
    }

    #[test]
    fn test_joined_locations_keep_order_on_replace() {
        let entry = Arc::new(crate::smart::ManifestEntry::new(
            crate::smart::ResourceType::Location,
            "https://pub.test/l.ndjson",
        ));
        let make = |id: &str, name: &str| {
            let mut loc: Location = serde_json::from_value(location(id, "NJ")).unwrap();
            loc.name = name.to_string();
            LocationAggregate::new(Sourced::new(loc, entry.clone()))
        };

        let mut joined = JoinedLocations::new();
        joined.insert(make("b", "first b"));
        joined.insert(make("a", "a"));
        joined.insert(make("b", "second b"));

        let names: Vec<&str> = joined.iter().map(|a| a.location.name.as_str()).collect();
        assert_eq!(names, vec!["second b", "a"]);

        joined.retain(|a| a.id() != "b");
        assert_eq!(joined.ids().collect::<Vec<_>>(), vec!["a"]);
        assert!(!joined.contains("b"));
    }

    #[test]
    fn test_aggregate_serializes_without_source_entries() {
        let entry = Arc::new(crate::smart::ManifestEntry::new(
            crate::smart::ResourceType::Location,
            "https://pub.test/l.ndjson",
        ));
        let loc: Location = serde_json::from_value(location("L1", "NJ")).unwrap();
        let mut joined = JoinedLocations::new();
        joined.insert(LocationAggregate::new(Sourced::new(loc, entry)));

        let value = serde_json::to_value(&joined).unwrap();
        assert_eq!(value["L1"]["location"]["id"], json!("L1"));
        assert_eq!(value["L1"]["schedules"], json!([]));
        assert!(!value.to_string().contains("l.ndjson"));
    }
}
