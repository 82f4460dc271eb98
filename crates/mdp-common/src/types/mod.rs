//! Common types used across MDP
//!
//! The ingestion pipeline moves data through three shapes:
//!
//! 1. [`RawRecord`]: what an adapter fetched, plus provenance
//! 2. [`CanonicalObservation`]: what the validator accepted and normalized
//! 3. [`RejectionRecord`]: what the validator refused, with a reason
//!
//! [`Supersession`] notices accompany latest-wins replacements downstream.

pub mod geo;
pub mod observation;
pub mod record;

pub use geo::{haversine_km, BoundingBox};
pub use observation::{
    CanonicalObservation, CanonicalUnit, Measurement, Provenance, QualityFlag, RejectionReason,
    RejectionRecord, Supersession,
};
pub use record::{RawFields, RawMeasurement, RawRecord, RecordCategory};
