//! Argovis profile selection
//!
//! `GET {base}/selection/profiles?startDate=..&endDate=..&shape=[[[lon,lat],...]]`
//!
//! The filter's date range is walked in windows of `window_days`. A window
//! holding more than `page_size` profiles is emitted over several pages: the
//! cursor is `{window start}` for the first page of a window and
//! `{window start}+{profiles already emitted}` for the ones after it. Each
//! profile is flattened into one record per measurement level.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use mdp_common::types::{RawFields, RawMeasurement, RawRecord, RecordCategory};
use reqwest::Client;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

use super::{http, id_field, json_kind, raw_field, Page, SourceAdapter};
use crate::config::{SourceConfig, SourceFilter};
use crate::error::{FetchError, FetchResult, IngestError};

/// Level keys mapped to parameter names
const LEVEL_PARAMETERS: &[(&str, &str)] = &[("temp", "temperature"), ("psal", "salinity")];

pub struct ArgoAdapter {
    source_id: String,
    base_url: Url,
    filter: SourceFilter,
    window_days: i64,
    max_profiles: usize,
    extra_params: BTreeMap<String, String>,
    client: Client,
}

impl ArgoAdapter {
    pub fn new(config: &SourceConfig, client: Client) -> Result<Self, IngestError> {
        if config.window_days == 0 {
            return Err(IngestError::config(format!(
                "source '{}': window_days must be greater than 0",
                config.id
            )));
        }
        Ok(Self {
            source_id: config.id.clone(),
            base_url: super::parse_base_url(config)?,
            filter: config.filter.clone(),
            window_days: i64::from(config.window_days),
            max_profiles: (config.page_size as usize).max(1),
            extra_params: config.extra_params.clone(),
            client,
        })
    }

    /// `(window start, profile offset)` a cursor points at
    fn position(&self, cursor: Option<&str>) -> FetchResult<(NaiveDate, usize)> {
        let Some(c) = cursor else {
            return Ok((self.filter.start_date, 0));
        };
        let invalid = || FetchError::fatal(format!("invalid Argo window cursor '{}'", c));
        let (date, offset) = c.split_once('+').unwrap_or((c, "0"));
        let start = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| invalid())?;
        let offset = offset.parse::<usize>().map_err(|_| invalid())?;
        Ok((start, offset))
    }

    fn window_end(&self, start: NaiveDate) -> NaiveDate {
        (start + Duration::days(self.window_days - 1)).min(self.filter.end_date)
    }

    /// Inclusive `(start, end)` of the window a cursor points at
    pub fn window(&self, cursor: Option<&str>) -> FetchResult<(NaiveDate, NaiveDate)> {
        let (start, _) = self.position(cursor)?;
        Ok((start, self.window_end(start)))
    }

    pub fn page_url(&self, start: NaiveDate, end: NaiveDate) -> FetchResult<Url> {
        let shape = serde_json::to_string(&[self.filter.bbox.ring()])
            .map_err(|e| FetchError::fatal(format!("failed to encode shape: {}", e)))?;
        let mut url = http::endpoint(&self.base_url, &["selection", "profiles"])?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("startDate", &start.to_string())
                .append_pair("endDate", &end.to_string())
                .append_pair("shape", &shape);
            for (key, value) in &self.extra_params {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Decode one window response into the page a cursor points at
    pub fn parse_page(&self, body: Value, cursor: Option<&str>) -> FetchResult<Page> {
        let (start, offset) = self.position(cursor)?;
        let end = self.window_end(start);
        let profiles = match body {
            Value::Array(profiles) => profiles,
            other => {
                return Err(FetchError::fatal(format!(
                    "malformed Argo response: expected an array, got {}",
                    json_kind(&other)
                )))
            },
        };

        let total = profiles.len();
        let emitted = offset.saturating_add(self.max_profiles);
        let mut records = Vec::new();
        for profile in profiles.into_iter().skip(offset).take(self.max_profiles) {
            self.flatten_profile(profile, cursor, &mut records)?;
        }

        let next_cursor = if emitted < total {
            debug!(
                source_id = %self.source_id,
                %start,
                emitted,
                total,
                "Argo window continues on the next page"
            );
            Some(format!("{}+{}", start.format("%Y-%m-%d"), emitted))
        } else if end < self.filter.end_date {
            Some((end + Duration::days(1)).format("%Y-%m-%d").to_string())
        } else {
            None
        };
        Ok(Page::new(records, next_cursor))
    }

    fn flatten_profile(
        &self,
        profile: Value,
        cursor: Option<&str>,
        records: &mut Vec<RawRecord>,
    ) -> FetchResult<()> {
        let mut profile = match profile {
            Value::Object(obj) => obj,
            other => {
                return Err(FetchError::fatal(format!(
                    "malformed Argo profile: expected an object, got {}",
                    json_kind(&other)
                )))
            },
        };
        let levels = match profile.remove("measurements") {
            Some(Value::Array(levels)) => levels,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(FetchError::fatal(format!(
                    "malformed Argo profile: measurements is {}",
                    json_kind(&other)
                )))
            },
        };
        for (level, values) in levels.into_iter().enumerate() {
            if let Value::Object(values) = values {
                records.push(self.level_record(&profile, level, values, cursor));
            }
        }
        Ok(())
    }

    fn level_record(
        &self,
        profile: &Map<String, Value>,
        level: usize,
        values: Map<String, Value>,
        cursor: Option<&str>,
    ) -> RawRecord {
        let (latitude, longitude) = coordinates(profile);
        let measurements = LEVEL_PARAMETERS
            .iter()
            .filter_map(|(key, parameter)| {
                raw_field(&values, key).map(|v| RawMeasurement::new(*parameter, v, None))
            })
            .collect();

        let fields = RawFields {
            record_id: id_field(profile, "_id").map(|id| format!("{}:{}", id, level)),
            latitude,
            longitude,
            observed_at: raw_field(profile, "date"),
            depth: raw_field(&values, "pres"),
            measurements,
            ..Default::default()
        };

        let mut payload = profile.clone();
        payload.insert("level".to_string(), Value::from(level));
        payload.insert("measurement".to_string(), Value::Object(values));

        RawRecord::new(&self.source_id, RecordCategory::Profile, payload, fields)
            .with_page_cursor(cursor.map(str::to_string))
    }
}

/// `lat`/`lon` fields, or a GeoJSON `geoLocation` point
fn coordinates(profile: &Map<String, Value>) -> (Option<Value>, Option<Value>) {
    let lat = raw_field(profile, "lat");
    let lon = raw_field(profile, "lon");
    if lat.is_some() || lon.is_some() {
        return (lat, lon);
    }
    match profile
        .get("geoLocation")
        .and_then(|g| g.get("coordinates"))
        .and_then(Value::as_array)
    {
        Some(point) if point.len() == 2 => (Some(point[1].clone()), Some(point[0].clone())),
        _ => (None, None),
    }
}

#[async_trait]
impl SourceAdapter for ArgoAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn category(&self) -> RecordCategory {
        RecordCategory::Profile
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> FetchResult<Page> {
        let (start, end) = self.window(cursor)?;
        let url = self.page_url(start, end)?;
        debug!(source_id = %self.source_id, %start, %end, "Fetching Argo window");

        let body = http::get_json(&self.client, url).await?;
        self.parse_page(body, cursor)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::tests::source;
    use crate::config::SourceKind;
    use serde_json::json;

    fn adapter() -> ArgoAdapter {
        ArgoAdapter::new(&source("argo", SourceKind::Argo), Client::new()).unwrap()
    }

    #[test]
    fn test_windows_cover_range() {
        let a = adapter();
        let (start, end) = a.window(None).unwrap();
        assert_eq!(start.to_string(), "2024-01-01");
        assert_eq!(end.to_string(), "2024-01-30");

        let (start, end) = a.window(Some("2024-03-30")).unwrap();
        assert_eq!(start.to_string(), "2024-03-30");
        assert_eq!(end.to_string(), "2024-03-31");
    }

    #[test]
    fn test_page_url_shape() {
        let a = adapter();
        let (start, end) = a.window(None).unwrap();
        let url = a.page_url(start, end).unwrap();
        let pairs: BTreeMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(url.path(), "/v3/selection/profiles");
        assert_eq!(
            pairs["shape"],
            "[[[-150.0,20.0],[-120.0,20.0],[-120.0,50.0],[-150.0,50.0],[-150.0,20.0]]]"
        );
    }

    #[test]
    fn test_profiles_flatten_to_levels() {
        let body = json!([{
            "_id": "4902911_042",
            "lat": 35.2,
            "lon": -130.4,
            "date": "2024-01-10T06:12:00.000Z",
            "measurements": [
                {"pres": 5.0, "temp": 15.2, "psal": 34.1},
                {"pres": 50.0, "temp": 14.0}
            ]
        }]);
        let records = adapter().parse_page(body, None).unwrap().records;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fields.record_id.as_deref(), Some("4902911_042:0"));
        assert_eq!(records[1].fields.depth, Some(json!(50.0)));
        assert_eq!(records[0].fields.measurements.len(), 2);
        assert!(records[0].fields.measurements.iter().all(|m| m.unit.is_none()));
        assert_eq!(records[1].fields.measurements.len(), 1);
    }

    #[test]
    fn test_crowded_window_spans_pages() {
        let mut config = source("argo", SourceKind::Argo);
        config.page_size = 1;
        let a = ArgoAdapter::new(&config, Client::new()).unwrap();
        let body = json!([
            {"_id": "p1", "lat": 35.0, "lon": -130.0, "date": "2024-01-10",
             "measurements": [{"pres": 1.0, "temp": 15.0}]},
            {"_id": "p2", "lat": 35.5, "lon": -130.5, "date": "2024-01-11",
             "measurements": [{"pres": 1.0, "temp": 14.0}, {"pres": 10.0, "temp": 13.5}]}
        ]);

        let first = a.parse_page(body.clone(), None).unwrap();
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.records[0].fields.record_id.as_deref(), Some("p1:0"));
        assert_eq!(first.next_cursor.as_deref(), Some("2024-01-01+1"));
        // Same window, next slice
        assert_eq!(
            a.window(first.next_cursor.as_deref()).unwrap(),
            a.window(None).unwrap()
        );

        let second = a.parse_page(body, first.next_cursor.as_deref()).unwrap();
        let ids: Vec<_> = second
            .records
            .iter()
            .filter_map(|r| r.fields.record_id.as_deref())
            .collect();
        assert_eq!(ids, ["p2:0", "p2:1"]);
        assert_eq!(second.next_cursor.as_deref(), Some("2024-01-31"));
        assert!(a.parse_page(json!([]), Some("2024-01-01+x")).is_err());
    }

    #[test]
    fn test_geolocation_fallback() {
        let body = json!([{
            "_id": "p1",
            "geoLocation": {"type": "Point", "coordinates": [-130.0, 35.0]},
            "date": "2024-01-10",
            "measurements": [{"pres": 1.0, "temp": 15.0}]
        }]);
        let records = adapter().parse_page(body, None).unwrap().records;
        assert_eq!(records[0].fields.latitude, Some(json!(35.0)));
        assert_eq!(records[0].fields.longitude, Some(json!(-130.0)));
    }

    #[test]
    fn test_non_array_is_fatal() {
        let err = adapter().parse_page(json!({"error": "bad"}), None).unwrap_err();
        assert!(matches!(err, FetchError::Fatal(_)));
    }
}
