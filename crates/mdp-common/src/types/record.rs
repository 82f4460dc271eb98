//! Raw records produced by source adapters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::checksum::payload_digest;
use crate::error::Result;

/// Broad kind of observation a provider reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCategory {
    /// Species occurrence (registries and biodiversity catalogs)
    Occurrence,
    /// Fixed-platform sensor reading (buoys, moorings)
    Sensor,
    /// Vertical profile level (profiling floats, CTD casts)
    Profile,
}

impl RecordCategory {
    pub fn as_str(&self) -> &str {
        match self {
            RecordCategory::Occurrence => "occurrence",
            RecordCategory::Sensor => "sensor",
            RecordCategory::Profile => "profile",
        }
    }
}

impl std::fmt::Display for RecordCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parameter reading as the provider reported it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMeasurement {
    /// Canonical parameter name chosen by the adapter (e.g. `water_temperature`)
    pub parameter: String,
    /// Raw value; a number or a numeric string
    pub value: Value,
    /// Unit symbol as published by the provider, when it publishes one
    pub unit: Option<String>,
}

impl RawMeasurement {
    pub fn new(parameter: impl Into<String>, value: Value, unit: Option<String>) -> Self {
        Self {
            parameter: parameter.into(),
            value,
            unit,
        }
    }
}

/// Structural view of a provider payload
///
/// Adapters fill these by picking the provider's keys; nothing here has been
/// checked for domain correctness. Values stay as JSON so the validator is the
/// only place that decides what "parseable" means.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFields {
    /// Provider-scoped record identifier
    pub record_id: Option<String>,
    /// Identifier shared across providers (e.g. Darwin Core `occurrenceID`)
    pub shared_id: Option<String>,
    pub latitude: Option<Value>,
    pub longitude: Option<Value>,
    pub observed_at: Option<Value>,
    pub depth: Option<Value>,
    /// Namespaced taxon code, e.g. `worms:127160`
    pub taxon_code: Option<String>,
    pub taxon_name: Option<String>,
    pub measurements: Vec<RawMeasurement>,
}

/// A provider-native record plus provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_id: String,
    pub category: RecordCategory,
    pub fetched_at: DateTime<Utc>,
    /// Opaque cursor of the page this record came from
    pub page_cursor: Option<String>,
    pub payload: Map<String, Value>,
    pub fields: RawFields,
}

impl RawRecord {
    pub fn new(
        source_id: impl Into<String>,
        category: RecordCategory,
        payload: Map<String, Value>,
        fields: RawFields,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            category,
            fetched_at: Utc::now(),
            page_cursor: None,
            payload,
            fields,
        }
    }

    pub fn with_fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = fetched_at;
        self
    }

    pub fn with_page_cursor(mut self, cursor: Option<String>) -> Self {
        self.page_cursor = cursor;
        self
    }

    /// Digest of the provider payload
    pub fn payload_digest(&self) -> Result<String> {
        payload_digest(&self.payload)
    }

    /// Payload as a JSON value, for rejection snapshots
    pub fn payload_snapshot(&self) -> Value {
        Value::Object(self.payload.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_raw_record_digest_is_stable() {
        let a = RawRecord::new(
            "obis",
            RecordCategory::Occurrence,
            payload(json!({"id": "1", "species": "Thunnus albacares"})),
            RawFields::default(),
        );
        let b = a.clone().with_fetched_at(Utc::now() + chrono::Duration::hours(1));
        assert_eq!(a.payload_digest().unwrap(), b.payload_digest().unwrap());
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let s = serde_json::to_string(&RecordCategory::Occurrence).unwrap();
        assert_eq!(s, "\"occurrence\"");
    }
}
