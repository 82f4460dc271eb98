//! Source adapters
//!
//! One adapter per provider protocol. An adapter turns one page of a
//! provider's API into [`RawRecord`]s plus a continuation cursor; it does
//! structural decoding only and never judges domain correctness.
//!
//! | Kind   | Pagination                                   |
//! |--------|----------------------------------------------|
//! | `obis` | keyset cursor (`after=<last id>`)            |
//! | `gbif` | `offset`/`limit` until `endOfRecords`        |
//! | `ndbc` | station index, then row offset in its feed   |
//! | `argo` | date window, then profile offset in it       |
//!
//! Adapters make a single attempt per `fetch_page`; [`ResilientSource`]
//! puts every call through the source's [`Resilience`] policy.
//!
//! [`erddap`] is not a record source: it searches an ERDDAP server's dataset
//! index so operators can find datasets worth configuring.

pub mod argo;
pub mod erddap;
pub mod gbif;
pub mod http;
pub mod ndbc;
pub mod obis;

use async_trait::async_trait;
use mdp_common::types::{RawRecord, RecordCategory};
use reqwest::Client;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config::{SourceConfig, SourceKind};
use crate::error::{FetchResult, IngestError};
use crate::resilience::Resilience;

pub use argo::ArgoAdapter;
pub use erddap::{DatasetSummary, ErddapCatalog};
pub use gbif::GbifAdapter;
pub use ndbc::NdbcAdapter;
pub use obis::ObisAdapter;

/// One fetched page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// Cursor for the next page; `None` when the source is exhausted
    pub next_cursor: Option<String>,
}

impl Page {
    pub fn new(records: Vec<RawRecord>, next_cursor: Option<String>) -> Self {
        Self {
            records,
            next_cursor,
        }
    }

    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

/// Provider protocol
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    fn category(&self) -> RecordCategory;

    /// Fetch one page; `cursor` is `None` for the first page
    async fn fetch_page(&self, cursor: Option<&str>) -> FetchResult<Page>;
}

/// An adapter whose calls go through its source's resilience policy
pub struct ResilientSource {
    adapter: Arc<dyn SourceAdapter>,
    resilience: Resilience,
}

impl ResilientSource {
    pub fn new(adapter: Arc<dyn SourceAdapter>, resilience: Resilience) -> Self {
        Self {
            adapter,
            resilience,
        }
    }

    pub fn source_id(&self) -> &str {
        self.adapter.source_id()
    }

    pub fn resilience(&self) -> &Resilience {
        &self.resilience
    }

    pub async fn fetch_page(&self, cursor: Option<&str>) -> FetchResult<Page> {
        self.resilience
            .call(|| self.adapter.fetch_page(cursor))
            .await
    }
}

/// Construct the adapter for a configured source
pub fn build_adapter(
    config: &SourceConfig,
    client: Client,
) -> Result<Arc<dyn SourceAdapter>, IngestError> {
    let adapter: Arc<dyn SourceAdapter> = match config.kind {
        SourceKind::Obis => Arc::new(ObisAdapter::new(config, client)?),
        SourceKind::Gbif => Arc::new(GbifAdapter::new(config, client)?),
        SourceKind::Ndbc => Arc::new(NdbcAdapter::new(config, client)?),
        SourceKind::Argo => Arc::new(ArgoAdapter::new(config, client)?),
    };
    Ok(adapter)
}

/// Build adapters for every enabled source, sharing one HTTP client
pub fn build_adapters(
    config: &crate::config::IngestConfig,
) -> Result<Vec<Arc<dyn SourceAdapter>>, IngestError> {
    let client = http::build_client(config.resilience.call_timeout())
        .map_err(|e| IngestError::config(format!("failed to build HTTP client: {}", e)))?;
    config
        .enabled_sources()
        .map(|source| build_adapter(source, client.clone()))
        .collect()
}

pub(crate) fn parse_base_url(config: &SourceConfig) -> Result<url::Url, IngestError> {
    config
        .parsed_base_url()
        .map_err(|e| IngestError::config(e.to_string()))
}

/// Read an identifier that providers publish as either a string or a number
pub(crate) fn id_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A non-null field, kept as raw JSON
pub(crate) fn raw_field(obj: &Map<String, Value>, key: &str) -> Option<Value> {
    obj.get(key).filter(|v| !v.is_null()).cloned()
}

/// Short description of a JSON value's type, for error messages
pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A non-empty string field
pub(crate) fn text_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_id_field_accepts_numbers_and_strings() {
        let obj = json!({"key": 1234, "id": " abc ", "empty": "", "null": null});
        let obj = obj.as_object().cloned().unwrap_or_default();
        assert_eq!(id_field(&obj, "key").as_deref(), Some("1234"));
        assert_eq!(id_field(&obj, "id").as_deref(), Some("abc"));
        assert_eq!(id_field(&obj, "empty"), None);
        assert_eq!(id_field(&obj, "null"), None);
        assert_eq!(raw_field(&obj, "null"), None);
    }
}
