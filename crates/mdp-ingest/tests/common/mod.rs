//! Shared helpers for integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use mdp_common::types::{BoundingBox, RawFields, RawRecord, RecordCategory};
use mdp_ingest::config::{
    IngestConfig, ResilienceConfig, RunConfig, SourceConfig, SourceFilter, SourceKind,
};
use mdp_ingest::{FetchError, FetchResult, Page, SourceAdapter};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::Instant;

/// Adapter that replays a fixed script of page results
pub struct ScriptedAdapter {
    id: String,
    category: RecordCategory,
    script: Mutex<VecDeque<FetchResult<Page>>>,
    /// Returned once the script runs out
    exhausted: FetchResult<Page>,
    calls: Mutex<Vec<(Option<String>, Instant)>>,
}

impl ScriptedAdapter {
    pub fn new(id: &str, script: Vec<FetchResult<Page>>) -> Self {
        Self {
            id: id.to_string(),
            category: RecordCategory::Occurrence,
            script: Mutex::new(script.into()),
            exhausted: Err(FetchError::fatal("script exhausted")),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Keep returning `result` after the script
    pub fn then_always(mut self, result: FetchResult<Page>) -> Self {
        self.exhausted = result;
        self
    }

    /// Cursors requested, in order
    pub fn cursors(&self) -> Vec<Option<String>> {
        self.calls.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> RecordCategory {
        self.category
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> FetchResult<Page> {
        self.calls
            .lock()
            .unwrap()
            .push((cursor.map(str::to_string), Instant::now()));
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.exhausted.clone())
    }
}

pub fn t(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 5, hour, minute, 0).unwrap()
}

pub fn reference_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

/// Well-formed occurrence record
pub fn occurrence(source: &str, id: &str, lat: f64, lon: f64, observed_at: DateTime<Utc>) -> RawRecord {
    let mut payload = Map::new();
    payload.insert("id".to_string(), json!(id));
    payload.insert("decimalLatitude".to_string(), json!(lat));
    payload.insert("decimalLongitude".to_string(), json!(lon));
    let fields = RawFields {
        record_id: Some(id.to_string()),
        latitude: Some(json!(lat)),
        longitude: Some(json!(lon)),
        observed_at: Some(Value::String(observed_at.to_rfc3339())),
        taxon_code: Some("worms:127027".to_string()),
        taxon_name: Some("Thunnus albacares".to_string()),
        ..Default::default()
    };
    RawRecord::new(source, RecordCategory::Occurrence, payload, fields)
}

pub fn page(records: Vec<RawRecord>, next: Option<&str>) -> FetchResult<Page> {
    Ok(Page::new(records, next.map(str::to_string)))
}

/// Fast, deterministic resilience settings
pub fn quick_resilience() -> ResilienceConfig {
    ResilienceConfig {
        max_retries: 2,
        base_delay_ms: 10,
        max_delay_ms: 100,
        jitter: false,
        failure_threshold: 3,
        cooldown_secs: 1,
        call_timeout_secs: 5,
        max_rate_limit_waits: 3,
        requests_per_minute: None,
    }
}

pub fn source_config(id: &str, kind: SourceKind, base_url: &str) -> SourceConfig {
    SourceConfig {
        id: id.to_string(),
        kind,
        base_url: base_url.to_string(),
        filter: SourceFilter {
            bbox: BoundingBox::new(-150.0, -120.0, 20.0, 50.0),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        },
        page_size: 2,
        extra_params: Default::default(),
        resilience: None,
        default_units: Default::default(),
        typical_ranges: Default::default(),
        stations: Vec::new(),
        window_days: 30,
        enabled: true,
    }
}

pub fn config() -> IngestConfig {
    IngestConfig {
        run: RunConfig {
            cancel_grace_secs: 1,
            ..Default::default()
        },
        resilience: quick_resilience(),
        ..Default::default()
    }
}
