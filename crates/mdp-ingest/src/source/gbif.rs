//! GBIF occurrence search
//!
//! `GET {base}/occurrence/search?decimalLatitude=s,n&decimalLongitude=w,e&eventDate=a,b&offset=..&limit=..`
//!
//! Offset pagination; the cursor is the next offset, until `endOfRecords`.

use async_trait::async_trait;
use mdp_common::types::{RawFields, RawRecord, RecordCategory};
use reqwest::Client;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

use super::{http, id_field, json_kind, raw_field, text_field, Page, SourceAdapter};
use crate::config::{SourceConfig, SourceFilter, GBIF_MAX_PAGE_SIZE};
use crate::error::{FetchError, FetchResult, IngestError};

pub struct GbifAdapter {
    source_id: String,
    base_url: Url,
    filter: SourceFilter,
    limit: u32,
    extra_params: BTreeMap<String, String>,
    client: Client,
}

impl GbifAdapter {
    pub fn new(config: &SourceConfig, client: Client) -> Result<Self, IngestError> {
        Ok(Self {
            source_id: config.id.clone(),
            base_url: super::parse_base_url(config)?,
            filter: config.filter.clone(),
            limit: config.page_size.min(GBIF_MAX_PAGE_SIZE),
            extra_params: config.extra_params.clone(),
            client,
        })
    }

    fn offset(cursor: Option<&str>) -> FetchResult<u64> {
        match cursor {
            None => Ok(0),
            Some(c) => c
                .parse()
                .map_err(|_| FetchError::fatal(format!("invalid GBIF offset cursor '{}'", c))),
        }
    }

    pub fn page_url(&self, cursor: Option<&str>) -> FetchResult<Url> {
        let offset = Self::offset(cursor)?;
        let bbox = &self.filter.bbox;
        let mut url = http::endpoint(&self.base_url, &["occurrence", "search"])?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("decimalLatitude", &format!("{},{}", bbox.south, bbox.north))
                .append_pair("decimalLongitude", &format!("{},{}", bbox.west, bbox.east))
                .append_pair(
                    "eventDate",
                    &format!("{},{}", self.filter.start_date, self.filter.end_date),
                )
                .append_pair("hasCoordinate", "true")
                .append_pair("hasGeospatialIssue", "false")
                .append_pair("offset", &offset.to_string())
                .append_pair("limit", &self.limit.to_string());
            for (key, value) in &self.extra_params {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn to_record(&self, item: Map<String, Value>, cursor: Option<&str>) -> RawRecord {
        let fields = RawFields {
            record_id: id_field(&item, "key"),
            shared_id: text_field(&item, "occurrenceID"),
            latitude: raw_field(&item, "decimalLatitude"),
            longitude: raw_field(&item, "decimalLongitude"),
            observed_at: raw_field(&item, "eventDate"),
            depth: raw_field(&item, "depth"),
            taxon_code: id_field(&item, "taxonKey").map(|key| format!("gbif:{}", key)),
            taxon_name: text_field(&item, "species").or_else(|| text_field(&item, "scientificName")),
            measurements: Vec::new(),
        };
        RawRecord::new(&self.source_id, RecordCategory::Occurrence, item, fields)
            .with_page_cursor(cursor.map(str::to_string))
    }

    pub fn parse_page(&self, body: Value, cursor: Option<&str>) -> FetchResult<Page> {
        let offset = Self::offset(cursor)?;
        let mut obj = match body {
            Value::Object(obj) => obj,
            _ => return Err(FetchError::fatal("malformed GBIF page: expected an object")),
        };
        let results = match obj.remove("results") {
            Some(Value::Array(results)) => results,
            _ => return Err(FetchError::fatal("malformed GBIF page: missing results array")),
        };
        let end_of_records = match obj.get("endOfRecords") {
            Some(Value::Bool(end)) => *end,
            _ => return Err(FetchError::fatal("malformed GBIF page: missing endOfRecords")),
        };

        let mut records = Vec::with_capacity(results.len());
        for item in results {
            match item {
                Value::Object(item) => records.push(self.to_record(item, cursor)),
                other => {
                    return Err(FetchError::fatal(format!(
                        "malformed GBIF page: result is {} not an object",
                        json_kind(&other)
                    )))
                },
            }
        }

        let next_cursor = if end_of_records || records.is_empty() {
            None
        } else {
            Some((offset + u64::from(self.limit)).to_string())
        };

        Ok(Page::new(records, next_cursor))
    }
}

#[async_trait]
impl SourceAdapter for GbifAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn category(&self) -> RecordCategory {
        RecordCategory::Occurrence
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> FetchResult<Page> {
        let url = self.page_url(cursor)?;
        debug!(source_id = %self.source_id, cursor = ?cursor, "Fetching GBIF page");
        let body = http::get_json(&self.client, url).await?;
        self.parse_page(body, cursor)
    }
}
