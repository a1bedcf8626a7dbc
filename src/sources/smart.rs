//! Source adapter for any SMART Scheduling Links publisher
//!
//! Vendors that publish SMART SL feeds differ only in where the manifest
//! lives, what they call themselves and how their store ids look, so one
//! adapter covers all of them through `SmartSourceConfig`.

use crate::errors::LoaderError;
use crate::model::{
    Availability, Available, CapacityRecord, DeliveryOptions, LocationRecord, LocationType,
    Position, SourceOutput, ValidTime,
};
use crate::pipeline::source::{SourceAdapter, SourceContext};
use crate::smart::resources::Identifier;
use crate::smart::{
    extensions, format_external_ids, get_extensions, product_for_cvx, telecom_values, Fetcher,
    IdFormatter, LocationAggregate, SmartClient,
};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const WALGREENS_MANIFEST_URL: &str =
    "https://wbaschedulinglinks.blob.core.windows.net/fhir/$bulk-publish";
pub const KROGER_MANIFEST_URL: &str =
    "https://api.kroger.com/v1/health-wellness/schedules/vaccines/$bulk-publish";
pub const CVS_MANIFEST_URL: &str = "https://www.cvs.com/immunizations/inventory/data/$bulk-publish";

/// System Walgreens uses for its own store numbers.
const WALGREENS_ID_SYSTEM: &str = "https://walgreens.com";

/// Where a record's `valid_at` comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidTimeFrom {
    /// `currentAsOf` on the manifest entry the location's slots came from
    EntryCurrentAsOf,
    /// The manifest's `transactionTime`
    TransactionTime,
}

/// Everything that distinguishes one SMART SL vendor from another.
#[derive(Clone)]
pub struct SmartSourceConfig {
    /// Source name used on the command line and in reports
    pub name: &'static str,
    pub manifest_url: String,
    pub provider: &'static str,
    /// `availability.source` on produced records
    pub availability_source: &'static str,
    /// External id system for the publisher's own location id
    pub smart_id_name: &'static str,
    pub valid_time: ValidTimeFrom,
    /// Refuse to load the whole country when no states were requested
    pub require_states: bool,
    /// Mapping for identifier systems the shared formatter does not know
    pub format_unknown_id: Option<Arc<IdFormatter>>,
    /// Check references and slot times on every record, not just its shape
    pub strict_validation: bool,
}

impl SmartSourceConfig {
    pub fn walgreens() -> Self {
        Self {
            name: "walgreensSmart",
            manifest_url: WALGREENS_MANIFEST_URL.to_string(),
            provider: "walgreens",
            availability_source: "univaf-walgreens-smart",
            smart_id_name: "walgreens_smart",
            valid_time: ValidTimeFrom::EntryCurrentAsOf,
            require_states: true,
            format_unknown_id: Some(Arc::new(walgreens_store_id) as Arc<IdFormatter>),
            strict_validation: true,
        }
    }

    pub fn kroger() -> Self {
        Self {
            name: "krogerSmart",
            manifest_url: KROGER_MANIFEST_URL.to_string(),
            provider: "kroger",
            availability_source: "univaf-kroger-smart",
            smart_id_name: "kroger",
            valid_time: ValidTimeFrom::TransactionTime,
            require_states: false,
            format_unknown_id: None,
            strict_validation: true,
        }
    }

    pub fn cvs() -> Self {
        Self {
            name: "cvsSmart",
            manifest_url: CVS_MANIFEST_URL.to_string(),
            provider: "cvs",
            availability_source: "univaf-cvs-smart",
            smart_id_name: "cvs",
            valid_time: ValidTimeFrom::TransactionTime,
            require_states: true,
            format_unknown_id: None,
            strict_validation: true,
        }
    }

    /// Same vendor settings, different manifest location.
    pub fn with_manifest_url(mut self, url: impl Into<String>) -> Self {
        self.manifest_url = url.into();
        self
    }
}

pub struct SmartSource {
    config: SmartSourceConfig,
    client: SmartClient,
}

impl SmartSource {
    pub fn new(config: SmartSourceConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        let client = SmartClient::new(config.manifest_url.clone(), fetcher)
            .with_validation(config.strict_validation);
        Self { config, client }
    }

    pub fn config(&self) -> &SmartSourceConfig {
        &self.config
    }

    fn format_location(
        &self,
        aggregate: &LocationAggregate,
        transaction_time: DateTime<FixedOffset>,
        checked_at: DateTime<Utc>,
    ) -> LocationRecord {
        let location = aggregate.location.record();
        let address = &location.address;

        let external_ids = format_external_ids(
            location,
            Some(self.config.smart_id_name),
            self.config.format_unknown_id.as_deref(),
        );

        let telecom = telecom_values(&location.telecom);

        // Publishers repeat the same booking links on every slot of a location.
        let slot_extensions = aggregate
            .slots
            .first()
            .map(|slot| get_extensions(&slot.extension))
            .unwrap_or_default();
        let extension_text = |url: &str| {
            slot_extensions
                .get(url)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let valid_at = match self.config.valid_time {
            ValidTimeFrom::EntryCurrentAsOf => aggregate
                .slots
                .first()
                .and_then(|slot| slot.source_entry().current_as_of())
                .map(ValidTime::DateTime)
                .unwrap_or_else(|| checked_at.into()),
            ValidTimeFrom::TransactionTime => ValidTime::DateTime(transaction_time),
        };

        let available = if aggregate.slots.iter().any(|slot| slot.is_free()) {
            Available::Yes
        } else {
            Available::No
        };

        let mut availability = Availability::new(self.config.availability_source, checked_at, available);
        availability.valid_at = Some(valid_at);
        availability.is_public = Some(true);
        availability.products = schedule_products(aggregate);
        availability.capacity = daily_capacity(aggregate);

        LocationRecord {
            name: location.name.clone(),
            external_ids,
            provider: Some(self.config.provider.to_string()),
            location_type: Some(LocationType::Pharmacy),

            address_lines: address.line.clone(),
            city: Some(address.city.clone()),
            state: Some(address.state.clone()),
            postal_code: Some(address.postal_code.clone()),
            county: address
                .district
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(title_case),
            // Altitude is dropped; the store only takes lat/long.
            position: location.position.map(|p| Position {
                latitude: p.latitude,
                longitude: p.longitude,
            }),

            info_phone: telecom.get("phone").cloned(),
            info_url: telecom.get("url").cloned(),
            booking_phone: extension_text(extensions::BOOKING_PHONE),
            booking_url: extension_text(extensions::BOOKING_DEEP_LINK),

            availability: Some(availability),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SourceAdapter for SmartSource {
    fn name(&self) -> &str {
        self.config.name
    }

    async fn check_availability(
        &self,
        ctx: &SourceContext,
    ) -> Result<Vec<SourceOutput>, LoaderError> {
        let states = ctx.states().filter(|states| !states.is_empty());
        if self.config.require_states && states.is_none() {
            log::warn!("⚠️  No states specified for {}", self.config.name);
            return Ok(Vec::new());
        }

        let manifest = self.client.get_manifest().await?;
        let locations = self.client.get_locations(states).await?;
        log::info!(
            "📍 {}: joined {} location(s) from {}",
            self.config.name,
            locations.len(),
            self.client.url()
        );

        let checked_at = Utc::now();
        let outputs = locations
            .iter()
            .filter(|aggregate| !is_test_location(aggregate.id()))
            .map(|aggregate| {
                let record = self.format_location(aggregate, manifest.transaction_time, checked_at);
                SourceOutput::from((record, DeliveryOptions::update_location()))
            })
            .collect();

        Ok(outputs)
    }
}

/// Per-day summary of a location's slots. `None` when there are no slots or
/// a slot spans midnight, since neither can be summarized by day.
fn daily_capacity(aggregate: &LocationAggregate) -> Option<Vec<CapacityRecord>> {
    if aggregate.slots.is_empty() {
        return None;
    }

    let mut by_date: BTreeMap<NaiveDate, CapacityRecord> = BTreeMap::new();
    for slot in &aggregate.slots {
        let date = slot.start.date_naive();
        if slot.end.date_naive() != date {
            return None;
        }

        let capacity = get_extensions(&slot.extension).remove(extensions::CAPACITY);
        let available = match capacity {
            Some(value) if value.as_u64().is_none() => {
                log::warn!("Non-integer capacity {} on slot {}", value, slot.id);
                Available::Unknown
            }
            _ if slot.is_free() => Available::Yes,
            _ => Available::No,
        };

        by_date
            .entry(date)
            .and_modify(|day| {
                if available == Available::Yes {
                    day.available = Some(Available::Yes);
                }
            })
            .or_insert(CapacityRecord {
                date,
                available: Some(available),
                available_count: None,
                unavailable_count: None,
                products: None,
                dose: None,
            });
    }

    Some(by_date.into_values().collect())
}

/// Products named by `vaccine-product` extensions on the location's schedules.
fn schedule_products(aggregate: &LocationAggregate) -> Option<Vec<String>> {
    let products: BTreeSet<&'static str> = aggregate
        .schedules
        .iter()
        .filter_map(|schedule| get_extensions(&schedule.extension).remove(extensions::PRODUCT))
        .filter_map(|value| match value {
            Value::Object(coding) => coding.get("code").and_then(Value::as_str).and_then(product_for_cvx),
            Value::String(code) => product_for_cvx(&code),
            _ => None,
        })
        .collect();

    if products.is_empty() {
        None
    } else {
        Some(products.into_iter().map(str::to_string).collect())
    }
}

/// Ids made only of 9s are publisher test locations.
fn is_test_location(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c == '9')
}

/// Upper-case the first letter of each space-separated word, lower-case the rest.
fn title_case(text: &str) -> String {
    text.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Strip zero padding from a numeric id; other ids are returned as-is.
pub fn unpad_number(value: &str) -> String {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return value.to_string();
    }
    let trimmed = value.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

fn walgreens_store_id(identifier: &Identifier) -> (String, String) {
    let value = identifier.value.clone().unwrap_or_default();
    if identifier.system == WALGREENS_ID_SYSTEM {
        ("walgreens".to_string(), unpad_number(&value))
    } else {
        (identifier.system.clone(), value)
    }
}
