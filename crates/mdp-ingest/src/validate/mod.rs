//! Record validation and normalization
//!
//! [`Validator::validate`] turns a [`RawRecord`] into either a
//! [`CanonicalObservation`] or a [`RejectionRecord`]. It performs no I/O:
//! "now" is a reference time fixed when the validator is built, taxonomy and
//! bathymetry come from in-memory collaborators.
//!
//! Mandatory rules reject the record:
//!
//! - coordinates present, numeric and in range
//! - `observed_at` parseable, not in the future beyond the clock-skew
//!   tolerance, not before the earliest plausible date
//! - category requirements (a resolvable taxon for occurrences, at least one
//!   usable measurement for sensor and profile records)
//!
//! Soft rules only add [`QualityFlag`]s:
//!
//! - depth beyond the bathymetric bound, or negative: `out_of_range`
//! - measurement outside the typical range, unusable, or in an unknown
//!   unit: `low_confidence`
//! - unit filled from the provider's documented default: `interpolated`

pub mod bathymetry;
pub mod rules;

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use mdp_common::types::{
    CanonicalObservation, Measurement, Provenance, QualityFlag, RawRecord, RecordCategory,
    RejectionReason, RejectionRecord,
};

use crate::config::{IngestConfig, SourceConfig, ValidationConfig, ValueRange};
use crate::taxonomy::{self, TaxonomyResolver};
use crate::units;

pub use bathymetry::{DepthBounds, RegionalDepthBounds};

/// Result of validating one record
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted(CanonicalObservation),
    Rejected(RejectionRecord),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted(_))
    }
}

/// Per-source unit defaults and typical ranges
#[derive(Debug, Clone, Default)]
struct SourceProfile {
    units: BTreeMap<String, String>,
    ranges: BTreeMap<String, ValueRange>,
}

impl SourceProfile {
    fn new(source: &SourceConfig, global_ranges: &BTreeMap<String, ValueRange>) -> Self {
        let mut ranges = global_ranges.clone();
        ranges.extend(source.typical_ranges.clone());
        Self {
            units: source.effective_units(),
            ranges,
        }
    }
}

type RuleResult<T> = std::result::Result<T, (RejectionReason, String)>;

pub struct Validator {
    config: ValidationConfig,
    profiles: HashMap<String, SourceProfile>,
    fallback: SourceProfile,
    taxonomy: Arc<dyn TaxonomyResolver>,
    depth_bounds: Arc<dyn DepthBounds>,
    reference_time: DateTime<Utc>,
}

impl Validator {
    pub fn new(
        config: &IngestConfig,
        taxonomy: Arc<dyn TaxonomyResolver>,
        depth_bounds: Arc<dyn DepthBounds>,
    ) -> Self {
        let global_ranges = &config.validation.typical_ranges;
        let profiles = config
            .sources
            .iter()
            .map(|source| (source.id.clone(), SourceProfile::new(source, global_ranges)))
            .collect();
        Self {
            config: config.validation.clone(),
            profiles,
            fallback: SourceProfile {
                units: BTreeMap::new(),
                ranges: global_ranges.clone(),
            },
            taxonomy,
            depth_bounds,
            reference_time: Utc::now(),
        }
    }

    /// Fix "now" for the future-timestamp rule
    pub fn with_reference_time(mut self, reference_time: DateTime<Utc>) -> Self {
        self.reference_time = reference_time;
        self
    }

    pub fn reference_time(&self) -> DateTime<Utc> {
        self.reference_time
    }

    pub fn validate(&self, record: &RawRecord) -> Verdict {
        match self.check(record) {
            Ok(observation) => Verdict::Accepted(observation),
            Err((reason, detail)) => {
                let fields = &record.fields;
                debug!(
                    source_id = %record.source_id,
                    reason = %reason,
                    detail = %detail,
                    "Rejected record"
                );
                Verdict::Rejected(RejectionRecord {
                    natural_key_attempt: rules::key_attempt(
                        &record.source_id,
                        fields.shared_id.as_deref(),
                        fields.record_id.as_deref(),
                    ),
                    reason,
                    detail,
                    raw_payload_snapshot: record.payload_snapshot(),
                    source_id: record.source_id.clone(),
                    rejected_at: self.reference_time,
                })
            },
        }
    }

    fn profile(&self, source_id: &str) -> &SourceProfile {
        self.profiles.get(source_id).unwrap_or(&self.fallback)
    }

    fn check(&self, record: &RawRecord) -> RuleResult<CanonicalObservation> {
        let fields = &record.fields;
        let mut flags = BTreeSet::new();

        let latitude = rules::coordinate("latitude", fields.latitude.as_ref(), 90.0)?;
        let longitude = rules::coordinate("longitude", fields.longitude.as_ref(), 180.0)?;
        let observed_at = self.check_timestamp(record)?;

        let measurements = self.normalize_measurements(record, &mut flags);
        let species_code = self.check_category(record, &measurements)?;
        let depth_meters = self.check_depth(record, latitude, longitude, &mut flags);

        let natural_key = rules::natural_key(
            &record.source_id,
            fields.shared_id.as_deref(),
            fields.record_id.as_deref(),
            latitude,
            longitude,
            &observed_at,
            species_code.as_deref(),
        );
        let proximity_key = match (&fields.shared_id, &species_code) {
            (None, Some(species)) => Some(rules::proximity_key(latitude, longitude, &observed_at, species)),
            _ => None,
        };

        let payload_digest = record.payload_digest().unwrap_or_else(|e| {
            warn!(source_id = %record.source_id, error = %e, "Failed to digest payload");
            String::new()
        });

        Ok(CanonicalObservation {
            natural_key,
            category: record.category,
            latitude,
            longitude,
            observed_at,
            depth_meters,
            species_code,
            measurements,
            quality_flags: flags,
            proximity_key,
            has_shared_id: fields.shared_id.is_some(),
            provenance: Provenance {
                source_id: record.source_id.clone(),
                fetched_at: record.fetched_at,
                payload_digest,
            },
        })
    }

    fn check_timestamp(&self, record: &RawRecord) -> RuleResult<DateTime<Utc>> {
        let observed_at = rules::timestamp(record.fields.observed_at.as_ref())?;
        let latest = self.reference_time + Duration::seconds(self.config.clock_skew_secs);
        if observed_at > latest {
            return Err((
                RejectionReason::FutureTimestamp,
                format!("observed_at {} is after {}", observed_at.to_rfc3339(), latest.to_rfc3339()),
            ));
        }
        let earliest = self
            .config
            .earliest_date
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc());
        if let Some(earliest) = earliest {
            if observed_at < earliest {
                return Err((
                    RejectionReason::TimestampTooEarly,
                    format!(
                        "observed_at {} is before {}",
                        observed_at.to_rfc3339(),
                        self.config.earliest_date
                    ),
                ));
            }
        }
        Ok(observed_at)
    }

    fn normalize_measurements(
        &self,
        record: &RawRecord,
        flags: &mut BTreeSet<QualityFlag>,
    ) -> BTreeMap<String, Measurement> {
        let profile = self.profile(&record.source_id);
        let mut out = BTreeMap::new();

        for raw in &record.fields.measurements {
            let value = match rules::as_f64(&raw.value) {
                Some(v) if v.is_finite() => v,
                _ => {
                    flags.insert(QualityFlag::LowConfidence);
                    continue;
                },
            };

            let published = raw.unit.as_deref().map(str::trim).filter(|u| !u.is_empty());
            let (unit, interpolated) = match published {
                Some(unit) => (unit, false),
                None => match profile.units.get(&raw.parameter) {
                    Some(unit) => (unit.as_str(), true),
                    None => {
                        flags.insert(QualityFlag::LowConfidence);
                        continue;
                    },
                },
            };

            let measurement = match units::normalize(&raw.parameter, value, unit) {
                Ok(m) => m,
                Err(e) => {
                    debug!(
                        source_id = %record.source_id,
                        parameter = %raw.parameter,
                        error = %e,
                        "Dropping measurement"
                    );
                    flags.insert(QualityFlag::LowConfidence);
                    continue;
                },
            };

            if interpolated {
                flags.insert(QualityFlag::Interpolated);
            }
            if let Some(range) = profile.ranges.get(&raw.parameter) {
                if !range.contains(measurement.value) {
                    flags.insert(QualityFlag::LowConfidence);
                }
            }
            out.insert(raw.parameter.clone(), measurement);
        }
        out
    }

    /// A canonical code wins outright; a provider-specific code only when
    /// the name does not resolve
    fn resolve_taxon(&self, record: &RawRecord) -> Option<String> {
        let fields = &record.fields;
        let by_code = fields
            .taxon_code
            .as_deref()
            .and_then(|code| self.taxonomy.resolve(code));
        if by_code.as_deref().is_some_and(taxonomy::is_canonical) {
            return by_code;
        }
        fields
            .taxon_name
            .as_deref()
            .and_then(|name| self.taxonomy.resolve(name))
            .or(by_code)
    }

    fn check_category(
        &self,
        record: &RawRecord,
        measurements: &BTreeMap<String, Measurement>,
    ) -> RuleResult<Option<String>> {
        let fields = &record.fields;
        match record.category {
            RecordCategory::Occurrence => {
                if fields.taxon_code.is_none() && fields.taxon_name.is_none() {
                    return Err((
                        RejectionReason::MissingRequiredField,
                        "occurrence record has no taxon code or name".to_string(),
                    ));
                }
                self.resolve_taxon(record).map(Some).ok_or_else(|| {
                    (
                        RejectionReason::UnresolvedTaxon,
                        format!(
                            "cannot resolve taxon (code {:?}, name {:?})",
                            fields.taxon_code, fields.taxon_name
                        ),
                    )
                })
            },
            RecordCategory::Sensor | RecordCategory::Profile => {
                if measurements.is_empty() {
                    return Err((
                        RejectionReason::MissingRequiredField,
                        format!("{} record has no usable measurement", record.category),
                    ));
                }
                Ok(self.resolve_taxon(record))
            },
        }
    }

    fn check_depth(
        &self,
        record: &RawRecord,
        latitude: f64,
        longitude: f64,
        flags: &mut BTreeSet<QualityFlag>,
    ) -> Option<f64> {
        let raw = record.fields.depth.as_ref().filter(|v| !v.is_null())?;
        let depth = match rules::as_f64(raw) {
            Some(d) if d.is_finite() => d,
            _ => {
                flags.insert(QualityFlag::LowConfidence);
                return None;
            },
        };
        if depth < 0.0 {
            flags.insert(QualityFlag::OutOfRange);
            return None;
        }
        if let Some(bound) = self.depth_bounds.max_depth_m(latitude, longitude) {
            if depth > bound {
                flags.insert(QualityFlag::OutOfRange);
            }
        }
        Some(depth)
    }
}
