//! Field-level parsing rules and key derivation

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use mdp_common::types::RejectionReason;

/// Naive datetime layouts, read as UTC
const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// A number or a numeric string
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse one coordinate and check it against `limit` degrees
pub fn coordinate(
    name: &str,
    raw: Option<&Value>,
    limit: f64,
) -> Result<f64, (RejectionReason, String)> {
    let raw = match raw {
        Some(v) if !v.is_null() => v,
        _ => {
            return Err((
                RejectionReason::MissingCoordinates,
                format!("{} is missing", name),
            ))
        },
    };
    let value = match as_f64(raw) {
        Some(v) if v.is_finite() => v,
        _ => {
            return Err((
                RejectionReason::InvalidCoordinates,
                format!("{} is not a finite number: {}", name, raw),
            ))
        },
    };
    if !(-limit..=limit).contains(&value) {
        return Err((
            RejectionReason::CoordinatesOutOfRange,
            format!("{} {} outside [-{}, {}]", name, value, limit, limit),
        ));
    }
    Ok(value)
}

/// Smallest magnitude read as epoch milliseconds (ten digits); anything
/// shorter is a year or a day count, not an instant
const MIN_EPOCH_MILLIS: u64 = 1_000_000_000;

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    if millis.unsigned_abs() < MIN_EPOCH_MILLIS {
        return None;
    }
    Utc.timestamp_millis_opt(millis).single()
}

fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    // ISO 8601 interval: the start instant is the observation time
    let raw = raw.split('/').next().unwrap_or(raw).trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    if raw.chars().all(|c| c.is_ascii_digit()) {
        return raw.parse().ok().and_then(from_millis);
    }
    None
}

/// Parse an observation timestamp into UTC
///
/// Accepts RFC 3339 with any offset, naive ISO dates and datetimes (UTC),
/// ISO intervals (start used) and epoch milliseconds.
pub fn timestamp(raw: Option<&Value>) -> Result<DateTime<Utc>, (RejectionReason, String)> {
    let missing = || {
        (
            RejectionReason::MissingTimestamp,
            "observed_at is missing".to_string(),
        )
    };
    let raw = raw.ok_or_else(missing)?;
    let parsed = match raw {
        Value::Null => return Err(missing()),
        Value::String(s) if s.trim().is_empty() => return Err(missing()),
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => n.as_i64().and_then(from_millis),
        _ => None,
    };
    parsed.ok_or_else(|| {
        (
            RejectionReason::UnparseableTimestamp,
            format!("cannot parse observed_at {}", raw),
        )
    })
}

/// Hour bucket used in fallback and proximity keys
pub fn hour_bucket(observed_at: &DateTime<Utc>) -> String {
    observed_at.format("%Y%m%d%H").to_string()
}

/// Stable natural key: shared id, then provider id, then a geo/time/species bucket
pub fn natural_key(
    source_id: &str,
    shared_id: Option<&str>,
    record_id: Option<&str>,
    latitude: f64,
    longitude: f64,
    observed_at: &DateTime<Utc>,
    species: Option<&str>,
) -> String {
    if let Some(shared) = shared_id {
        return format!("occ:{}", shared);
    }
    if let Some(id) = record_id {
        return format!("{}:{}", source_id, id);
    }
    format!(
        "geo:{:.3}:{:.3}:{}:{}",
        latitude,
        longitude,
        hour_bucket(observed_at),
        species.unwrap_or("-")
    )
}

/// Best-effort key for a rejection, before anything is validated
pub fn key_attempt(source_id: &str, shared_id: Option<&str>, record_id: Option<&str>) -> Option<String> {
    match (shared_id, record_id) {
        (Some(shared), _) => Some(format!("occ:{}", shared)),
        (None, Some(id)) => Some(format!("{}:{}", source_id, id)),
        (None, None) => None,
    }
}

/// Rounded space/time/species bucket for near-duplicate matching
pub fn proximity_key(latitude: f64, longitude: f64, observed_at: &DateTime<Utc>, species: &str) -> String {
    format!(
        "near:{:.2}:{:.2}:{}:{}",
        latitude,
        longitude,
        hour_bucket(observed_at),
        species
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(v: Value) -> DateTime<Utc> {
        timestamp(Some(&v)).unwrap()
    }

    #[test]
    fn test_timestamp_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap();
        assert_eq!(ts(json!("2024-01-05T10:00:00Z")), expected);
        assert_eq!(ts(json!("2024-01-05T12:00:00+02:00")), expected);
        assert_eq!(ts(json!("2024-01-05T10:00:00")), expected);
        assert_eq!(ts(json!("2024-01-05T10:00")), expected);
        assert_eq!(ts(json!("2024-01-05 10:00:00")), expected);
        assert_eq!(ts(json!("2024-01-05T10:00:00Z/2024-01-06T00:00:00Z")), expected);
        assert_eq!(ts(json!(1_704_448_800_000_i64)), expected);
        assert_eq!(ts(json!("1704448800000")), expected);
        assert_eq!(
            ts(json!("2024-01-05")),
            Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_timestamp_failures() {
        assert_eq!(timestamp(None).unwrap_err().0, RejectionReason::MissingTimestamp);
        assert_eq!(
            timestamp(Some(&json!(""))).unwrap_err().0,
            RejectionReason::MissingTimestamp
        );
        assert_eq!(
            timestamp(Some(&json!("last tuesday"))).unwrap_err().0,
            RejectionReason::UnparseableTimestamp
        );
        assert_eq!(
            timestamp(Some(&json!(true))).unwrap_err().0,
            RejectionReason::UnparseableTimestamp
        );
    }

    #[test]
    fn test_bare_years_are_not_epoch_millis() {
        for raw in [json!(2024), json!("2024"), json!(20240105), json!(-1999)] {
            assert_eq!(
                timestamp(Some(&raw)).unwrap_err().0,
                RejectionReason::UnparseableTimestamp,
                "{} should not parse",
                raw
            );
        }
        assert_eq!(
            ts(json!(-1_000_000_000_i64)),
            Utc.with_ymd_and_hms(1969, 12, 20, 10, 13, 20).unwrap()
        );
    }

    #[test]
    fn test_coordinate_rules() {
        assert_eq!(coordinate("latitude", Some(&json!("45.5")), 90.0).unwrap(), 45.5);
        assert_eq!(
            coordinate("latitude", None, 90.0).unwrap_err().0,
            RejectionReason::MissingCoordinates
        );
        assert_eq!(
            coordinate("latitude", Some(&json!("north")), 90.0).unwrap_err().0,
            RejectionReason::InvalidCoordinates
        );
        assert_eq!(
            coordinate("longitude", Some(&json!(180.5)), 180.0).unwrap_err().0,
            RejectionReason::CoordinatesOutOfRange
        );
    }

    #[test]
    fn test_key_derivation_order() {
        let at = Utc.with_ymd_and_hms(2024, 1, 5, 10, 42, 0).unwrap();
        assert_eq!(
            natural_key("obis", Some("urn:catalog:1"), Some("9"), 1.0, 2.0, &at, None),
            "occ:urn:catalog:1"
        );
        assert_eq!(natural_key("obis", None, Some("9"), 1.0, 2.0, &at, None), "obis:9");
        assert_eq!(
            natural_key("obis", None, None, 30.12345, -140.5, &at, Some("worms:1")),
            "geo:30.123:-140.500:2024010510:worms:1"
        );
        assert_eq!(
            proximity_key(30.12345, -140.5, &at, "worms:1"),
            "near:30.12:-140.50:2024010510:worms:1"
        );
    }
}
