//! OBIS v3 occurrence API
//!
//! `GET {base}/occurrence?geometry=POLYGON((...))&startdate=..&enddate=..&size=N[&after=<id>]`
//!
//! Pagination is keyset-based: the next cursor is the `id` of the last record
//! of a full page.

use async_trait::async_trait;
use mdp_common::types::{RawFields, RawRecord, RecordCategory};
use reqwest::Client;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

use super::{http, id_field, json_kind, raw_field, text_field, Page, SourceAdapter};
use crate::config::{SourceConfig, SourceFilter};
use crate::error::{FetchError, FetchResult, IngestError};

pub struct ObisAdapter {
    source_id: String,
    base_url: Url,
    filter: SourceFilter,
    page_size: u32,
    extra_params: BTreeMap<String, String>,
    client: Client,
}

impl ObisAdapter {
    pub fn new(config: &SourceConfig, client: Client) -> Result<Self, IngestError> {
        Ok(Self {
            source_id: config.id.clone(),
            base_url: super::parse_base_url(config)?,
            filter: config.filter.clone(),
            page_size: config.page_size,
            extra_params: config.extra_params.clone(),
            client,
        })
    }

    pub fn page_url(&self, cursor: Option<&str>) -> FetchResult<Url> {
        let mut url = http::endpoint(&self.base_url, &["occurrence"])?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("geometry", &self.filter.bbox.to_wkt())
                .append_pair("startdate", &self.filter.start_date.to_string())
                .append_pair("enddate", &self.filter.end_date.to_string())
                .append_pair("size", &self.page_size.to_string());
            if let Some(after) = cursor {
                query.append_pair("after", after);
            }
            for (key, value) in &self.extra_params {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn to_record(&self, item: Map<String, Value>, cursor: Option<&str>) -> RawRecord {
        let fields = RawFields {
            record_id: id_field(&item, "id"),
            shared_id: text_field(&item, "occurrenceID"),
            latitude: raw_field(&item, "decimalLatitude"),
            longitude: raw_field(&item, "decimalLongitude"),
            observed_at: raw_field(&item, "eventDate"),
            depth: raw_field(&item, "depth").or_else(|| raw_field(&item, "minimumDepthInMeters")),
            taxon_code: id_field(&item, "aphiaID").map(|id| format!("worms:{}", id)),
            taxon_name: text_field(&item, "scientificName"),
            measurements: Vec::new(),
        };
        RawRecord::new(&self.source_id, RecordCategory::Occurrence, item, fields)
            .with_page_cursor(cursor.map(str::to_string))
    }

    /// Decode one response body
    pub fn parse_page(&self, body: Value, cursor: Option<&str>) -> FetchResult<Page> {
        let results = match body {
            Value::Object(mut obj) => match obj.remove("results") {
                Some(Value::Array(results)) => results,
                _ => return Err(FetchError::fatal("malformed OBIS page: missing results array")),
            },
            _ => return Err(FetchError::fatal("malformed OBIS page: expected an object")),
        };

        let full_page = results.len() >= self.page_size as usize;
        let mut records = Vec::with_capacity(results.len());
        for item in results {
            match item {
                Value::Object(obj) => records.push(self.to_record(obj, cursor)),
                other => {
                    return Err(FetchError::fatal(format!(
                        "malformed OBIS page: result is {} not an object",
                        json_kind(&other)
                    )))
                },
            }
        }

        let next_cursor = if full_page {
            let last = records.last().and_then(|r| r.fields.record_id.clone());
            if last.is_none() {
                return Err(FetchError::fatal(
                    "malformed OBIS page: last record has no id to continue from",
                ));
            }
            last
        } else {
            None
        };

        Ok(Page::new(records, next_cursor))
    }
}

#[async_trait]
impl SourceAdapter for ObisAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn category(&self) -> RecordCategory {
        RecordCategory::Occurrence
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> FetchResult<Page> {
        let url = self.page_url(cursor)?;
        debug!(source_id = %self.source_id, cursor = ?cursor, "Fetching OBIS page");
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

    fn adapter(page_size: u32) -> ObisAdapter {
        let mut config = source("obis", SourceKind::Obis);
        config.page_size = page_size;
        ObisAdapter::new(&config, Client::new()).unwrap()
    }

    #[test]
    fn test_page_url() {
        let url = adapter(2).page_url(Some("abc")).unwrap();
        let pairs: BTreeMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(url.path(), "/v3/occurrence");
        assert_eq!(pairs["geometry"], "POLYGON((-150 20,-120 20,-120 50,-150 50,-150 20))");
        assert_eq!(pairs["startdate"], "2024-01-01");
        assert_eq!(pairs["enddate"], "2024-03-31");
        assert_eq!(pairs["size"], "2");
        assert_eq!(pairs["after"], "abc");
    }

    #[test]
    fn test_parse_full_page_continues_from_last_id() {
        let body = json!({
            "total": 3,
            "results": [
                {"id": "a1", "occurrenceID": "urn:occ:1", "decimalLatitude": 30.1,
                 "decimalLongitude": -140.2, "eventDate": "2024-01-05", "aphiaID": 127160,
                 "scientificName": "Thunnus albacares", "depth": 12},
                {"id": "a2", "decimalLatitude": 31.0, "decimalLongitude": -141.0,
                 "eventDate": "2024-01-06", "minimumDepthInMeters": 5}
            ]
        });
        let page = adapter(2).parse_page(body, None).unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("a2"));

        let first = &page.records[0].fields;
        assert_eq!(first.shared_id.as_deref(), Some("urn:occ:1"));
        assert_eq!(first.taxon_code.as_deref(), Some("worms:127160"));
        assert_eq!(first.depth, Some(json!(12)));
        assert_eq!(page.records[1].fields.depth, Some(json!(5)));
    }

    #[test]
    fn test_short_page_is_last() {
        let body = json!({"results": [{"id": "z9"}]});
        let page = adapter(2).parse_page(body, Some("a2")).unwrap();
        assert!(page.is_last());
        assert_eq!(page.records[0].page_cursor.as_deref(), Some("a2"));
    }

    #[test]
    fn test_malformed_page_is_fatal() {
        let err = adapter(2).parse_page(json!({"total": 0}), None).unwrap_err();
        assert!(matches!(err, FetchError::Fatal(_)));
        let err = adapter(2).parse_page(json!({"results": [1, 2]}), None).unwrap_err();
        assert!(matches!(err, FetchError::Fatal(_)));
    }
}
