//! Helpers for FHIR value lists (extensions, telecoms, identifiers)

use super::resources::{ContactPoint, Extension, Identifier, Location};
use super::systems;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Build `{key -> value[x]}` from a list of FHIR value objects.
///
/// `key_name` picks the property used as key (`url` for extensions,
/// `system` for telecoms). Keys may repeat in a value list; only the first
/// value for each key is kept.
pub fn create_value_object(values: &[Value], key_name: &str) -> HashMap<String, Value> {
    let mut result = HashMap::new();

    for item in values {
        let Some(object) = item.as_object() else {
            continue;
        };
        let Some(key) = object.get(key_name).and_then(Value::as_str) else {
            continue;
        };
        if result.contains_key(key) {
            continue;
        }
        result.insert(key.to_string(), first_value(object).cloned().unwrap_or(Value::Null));
    }

    result
}

fn first_value(object: &Map<String, Value>) -> Option<&Value> {
    object
        .iter()
        .find(|(key, _)| key.starts_with("value"))
        .map(|(_, value)| value)
}

/// Extensions as `{url -> value}`. Lossy when an extension repeats: only the
/// first one is kept.
pub fn get_extensions(extensions: &[Extension]) -> HashMap<String, Value> {
    let mut result = HashMap::new();
    for extension in extensions {
        if !result.contains_key(&extension.url) {
            result.insert(
                extension.url.clone(),
                extension.value().cloned().unwrap_or(Value::Null),
            );
        }
    }
    result
}

/// Telecom entries as `{system -> value}` (first of each system wins).
pub fn telecom_values(telecom: &[ContactPoint]) -> HashMap<String, String> {
    let mut result = HashMap::new();
    for contact in telecom {
        if let Some(value) = &contact.value {
            result
                .entry(contact.system.clone())
                .or_insert_with(|| value.clone());
        }
    }
    result
}

/// Turns an identifier the caller does not recognize into `(system, value)`.
pub type IdFormatter = dyn Fn(&Identifier) -> (String, String) + Send + Sync;

/// External ids for a location, in the `(system, value)` form the store uses.
///
/// With `smart_id_name`, the location's own id comes first under that name.
/// VTrckS PINs that are blank or contain "unknown" are dropped.
pub fn format_external_ids(
    location: &Location,
    smart_id_name: Option<&str>,
    format_unknown_id: Option<&IdFormatter>,
) -> Vec<(String, String)> {
    let mut external_ids = Vec::new();

    if let Some(name) = smart_id_name {
        external_ids.push((name.to_string(), location.id.clone()));
    }

    for identifier in &location.identifier {
        let value = identifier.value.clone().unwrap_or_default();

        let pair = match identifier.system.as_str() {
            systems::VTRCKS => {
                // Publishers send "", null, or an error message for a missing PIN.
                if value.is_empty() || value.contains("unknown") {
                    continue;
                }
                ("vtrcks".to_string(), value)
            }
            systems::NPI_USA => ("npi_usa".to_string(), value),
            _ => match format_unknown_id {
                Some(format) => format(identifier),
                None => (identifier.system.clone(), value),
            },
        };

        external_ids.push(pair);
    }

    external_ids
}
