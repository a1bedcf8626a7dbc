//! # SMART Scheduling Links client
//!
//! Loads data from publishers of the SMART Scheduling Links bulk-publish
//! protocol (https://github.com/smart-on-fhir/smart-scheduling-links/).
//!
//! A publisher exposes a manifest (`$bulk-publish`) listing NDJSON files for
//! three resource types:
//!
//! ```text
//! Location  <-  Schedule.actor[0]  ("Location/<id>")
//! Schedule  <-  Slot.schedule      ("Schedule/<id>")
//! ```
//!
//! ## Module Organization
//!
//! - `fetch` - HTTP seam (`Fetcher`) and its reqwest / in-memory impls
//! - `manifest` - manifest document, entry filtering, state inference
//! - `resources` - typed Location / Schedule / Slot records
//! - `client` - manifest cache and lazy record streams
//! - `join` - per-location aggregation of the three streams
//! - `values` - FHIR value-list helpers and external id formatting

pub mod client;
pub mod fetch;
pub mod join;
pub mod manifest;
pub mod resources;
pub mod values;

pub use client::{SmartClient, MANIFEST_CACHE_TIME};
pub use fetch::{Fetcher, HttpFetcher, StaticFetcher};
pub use join::{is_covid_schedule, JoinedLocations, LocationAggregate};
pub use manifest::{Manifest, ManifestEntry, ResourceType, StateList};
pub use resources::{Location, Resource, Schedule, Slot, SlotStatus, Sourced};
pub use values::{
    create_value_object, format_external_ids, get_extensions, telecom_values, IdFormatter,
};

/// Identifiers for coding systems used by SMART SL publishers.
pub mod systems {
    pub const HL7_SERVICE_TYPE: &str = "http://terminology.hl7.org/CodeSystem/service-type";
    /// CDC VTrckS PIN
    pub const VTRCKS: &str = "https://cdc.gov/vaccines/programs/vtrcks";
    /// National Provider ID from United States DHHS
    pub const NPI_USA: &str = "http://hl7.org/fhir/sid/us-npi";
    /// CVX vaccine codes
    pub const CVX: &str = "http://hl7.org/fhir/sid/cvx";
}

/// Extension URLs used on SMART SL records.
pub mod extensions {
    pub const CAPACITY: &str =
        "http://fhir-registry.smarthealthit.org/StructureDefinition/slot-capacity";
    pub const BOOKING_DEEP_LINK: &str =
        "http://fhir-registry.smarthealthit.org/StructureDefinition/booking-deep-link";
    pub const BOOKING_PHONE: &str =
        "http://fhir-registry.smarthealthit.org/StructureDefinition/booking-phone";
    pub const PRODUCT: &str =
        "http://fhir-registry.smarthealthit.org/StructureDefinition/vaccine-product";
}

/// Service-type code for COVID-19 immunization.
pub const COVID_SERVICE_CODE: &str = "57";

/// Map a CVX code (standardized vaccine identifier) to our product id.
pub fn product_for_cvx(code: &str) -> Option<&'static str> {
    match code.trim() {
        "207" => Some("moderna"),
        "208" => Some("pfizer"),
        "210" => Some("astra_zeneca"),
        "211" => Some("novavax"),
        "212" => Some("jj"),
        _ => None,
    }
}
