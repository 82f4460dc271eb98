//! Canonical observations, rejections and supersession notices

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::record::RecordCategory;

/// Canonical unit every parameter is converted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanonicalUnit {
    #[serde(rename = "degC")]
    Celsius,
    #[serde(rename = "m")]
    Meters,
    #[serde(rename = "m/s")]
    MetersPerSecond,
    #[serde(rename = "hPa")]
    Hectopascal,
    #[serde(rename = "psu")]
    Psu,
    #[serde(rename = "dbar")]
    Decibar,
    #[serde(rename = "s")]
    Seconds,
    #[serde(rename = "deg")]
    Degrees,
    #[serde(rename = "nmi")]
    NauticalMiles,
}

impl CanonicalUnit {
    pub fn symbol(&self) -> &'static str {
        match self {
            CanonicalUnit::Celsius => "degC",
            CanonicalUnit::Meters => "m",
            CanonicalUnit::MetersPerSecond => "m/s",
            CanonicalUnit::Hectopascal => "hPa",
            CanonicalUnit::Psu => "psu",
            CanonicalUnit::Decibar => "dbar",
            CanonicalUnit::Seconds => "s",
            CanonicalUnit::Degrees => "deg",
            CanonicalUnit::NauticalMiles => "nmi",
        }
    }
}

impl std::fmt::Display for CanonicalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Numeric value tagged with its canonical unit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    pub unit: CanonicalUnit,
}

impl Measurement {
    pub fn new(value: f64, unit: CanonicalUnit) -> Self {
        Self { value, unit }
    }
}

/// Soft-rule annotations on accepted observations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    /// Depth outside the bathymetric bounds known for the location
    OutOfRange,
    /// A value was filled from provider documentation rather than the record
    Interpolated,
    /// A measurement was outside the provider-typical range or unusable
    LowConfidence,
}

impl QualityFlag {
    pub fn as_str(&self) -> &str {
        match self {
            QualityFlag::OutOfRange => "out_of_range",
            QualityFlag::Interpolated => "interpolated",
            QualityFlag::LowConfidence => "low_confidence",
        }
    }
}

/// Where an observation came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    /// SHA-256 of the provider payload
    pub payload_digest: String,
}

/// Validated, normalized observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalObservation {
    pub natural_key: String,
    pub category: RecordCategory,
    pub latitude: f64,
    pub longitude: f64,
    pub observed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth_meters: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub species_code: Option<String>,
    #[serde(default)]
    pub measurements: BTreeMap<String, Measurement>,
    #[serde(default)]
    pub quality_flags: BTreeSet<QualityFlag>,
    /// Rounded space/time/species bucket used for near-duplicate matching
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proximity_key: Option<String>,
    /// Whether `natural_key` came from an identifier shared across providers
    #[serde(default)]
    pub has_shared_id: bool,
    pub provenance: Provenance,
}

impl CanonicalObservation {
    pub fn source_id(&self) -> &str {
        &self.provenance.source_id
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.provenance.fetched_at
    }

    pub fn has_flag(&self, flag: QualityFlag) -> bool {
        self.quality_flags.contains(&flag)
    }
}

/// Why the validator refused a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    MissingCoordinates,
    InvalidCoordinates,
    CoordinatesOutOfRange,
    MissingTimestamp,
    UnparseableTimestamp,
    FutureTimestamp,
    TimestampTooEarly,
    MissingRequiredField,
    UnresolvedTaxon,
}

impl RejectionReason {
    pub fn as_str(&self) -> &str {
        match self {
            RejectionReason::MissingCoordinates => "missing_coordinates",
            RejectionReason::InvalidCoordinates => "invalid_coordinates",
            RejectionReason::CoordinatesOutOfRange => "coordinates_out_of_range",
            RejectionReason::MissingTimestamp => "missing_timestamp",
            RejectionReason::UnparseableTimestamp => "unparseable_timestamp",
            RejectionReason::FutureTimestamp => "future_timestamp",
            RejectionReason::TimestampTooEarly => "timestamp_too_early",
            RejectionReason::MissingRequiredField => "missing_required_field",
            RejectionReason::UnresolvedTaxon => "unresolved_taxon",
        }
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal record of a validation failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionRecord {
    /// Best-effort key; absent when not even an identifier could be derived
    pub natural_key_attempt: Option<String>,
    pub reason: RejectionReason,
    pub detail: String,
    pub raw_payload_snapshot: serde_json::Value,
    pub source_id: String,
    pub rejected_at: DateTime<Utc>,
}

/// Notice that a previously emitted observation was replaced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Supersession {
    pub superseded_key: String,
    pub replacement_key: String,
    /// Source of the replacement
    pub source_id: String,
    pub superseded_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_serializes_as_symbol() {
        let m = Measurement::new(12.5, CanonicalUnit::Celsius);
        let json = serde_json::to_value(m).unwrap();
        assert_eq!(json["unit"], "degC");
        let back: Measurement = serde_json::from_value(json).unwrap();
        assert_eq!(back.unit, CanonicalUnit::Celsius);
    }

    #[test]
    fn test_flags_serialize_snake_case() {
        let json = serde_json::to_string(&QualityFlag::LowConfidence).unwrap();
        assert_eq!(json, "\"low_confidence\"");
        assert_eq!(QualityFlag::OutOfRange.as_str(), "out_of_range");
    }

    #[test]
    fn test_rejection_reason_display() {
        assert_eq!(
            RejectionReason::CoordinatesOutOfRange.to_string(),
            "coordinates_out_of_range"
        );
    }
}
