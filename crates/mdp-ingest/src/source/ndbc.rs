//! NOAA NDBC realtime buoy feed
//!
//! `GET {base}/data/realtime2/{station}.txt` returns a fixed-width text table:
//!
//! ```text
//! #YY  MM DD hh mm WDIR WSPD GST  WVHT   DPD   APD MWD   PRES  ATMP  WTMP  DEWP  VIS PTDY  TIDE
//! #yr  mo dy hr mn degT m/s  m/s     m   sec   sec degT   hPa  degC  degC  degC  nmi  hPa    ft
//! 2024 01 15 12 00 270  5.0  7.0   1.2   8.0   6.0 280 1013.2  12.3  14.1  10.0   MM   MM    MM
//! ```
//!
//! `MM` marks a missing value. Stations are walked in configured order and
//! each feed is split into pages of `page_size` rows. The cursor is
//! `{station}` for the start of a feed or `{station}:{row}` inside one. Feeds
//! list the newest row first, so rows added between two pages of the same
//! feed shift the offset onto rows already emitted, never past unseen ones.

use async_trait::async_trait;
use mdp_common::types::{RawFields, RawMeasurement, RawRecord, RecordCategory};
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use super::{http, Page, SourceAdapter};
use crate::config::{SourceConfig, StationConfig};
use crate::error::{FetchError, FetchResult, IngestError};

/// Marker for a missing value
const MISSING: &str = "MM";

/// Feed columns mapped to parameter names; unlisted columns stay payload-only
const PARAMETERS: &[(&str, &str)] = &[
    ("WDIR", "wind_direction"),
    ("WSPD", "wind_speed"),
    ("GST", "wind_gust"),
    ("WVHT", "wave_height"),
    ("DPD", "dominant_wave_period"),
    ("APD", "average_wave_period"),
    ("MWD", "wave_direction"),
    ("PRES", "air_pressure"),
    ("ATMP", "air_temperature"),
    ("WTMP", "water_temperature"),
    ("DEWP", "dew_point"),
    ("VIS", "visibility"),
    ("TIDE", "tide_level"),
];

const TIME_COLUMNS: [&str; 5] = ["YY", "MM", "DD", "hh", "mm"];

pub struct NdbcAdapter {
    source_id: String,
    base_url: Url,
    stations: Vec<StationConfig>,
    max_rows: usize,
    client: Client,
}

/// Header columns and data rows of one feed
struct Feed<'a> {
    names: Vec<String>,
    units: Vec<String>,
    time_idx: Vec<usize>,
    rows: Vec<&'a str>,
}

impl NdbcAdapter {
    pub fn new(config: &SourceConfig, client: Client) -> Result<Self, IngestError> {
        if config.stations.is_empty() {
            return Err(IngestError::config(format!(
                "source '{}': ndbc sources need at least one station",
                config.id
            )));
        }
        Ok(Self {
            source_id: config.id.clone(),
            base_url: super::parse_base_url(config)?,
            stations: config.stations.clone(),
            max_rows: (config.page_size as usize).max(1),
            client,
        })
    }

    /// `(station index, row offset)` a cursor points at
    fn position(&self, cursor: Option<&str>) -> FetchResult<(usize, usize)> {
        let (index, row) = match cursor {
            None => (0, 0),
            Some(c) => {
                let invalid = || FetchError::fatal(format!("invalid NDBC cursor '{}'", c));
                let (index, row) = c.split_once(':').unwrap_or((c, "0"));
                (
                    index.parse::<usize>().map_err(|_| invalid())?,
                    row.parse::<usize>().map_err(|_| invalid())?,
                )
            },
        };
        if index >= self.stations.len() {
            return Err(FetchError::fatal(format!(
                "NDBC station cursor {} out of range",
                index
            )));
        }
        Ok((index, row))
    }

    pub fn station_url(&self, station: &StationConfig) -> FetchResult<Url> {
        http::endpoint(
            &self.base_url,
            &["data", "realtime2", &format!("{}.txt", station.id)],
        )
    }

    fn read_feed<'a>(station: &StationConfig, body: &'a str) -> FetchResult<Feed<'a>> {
        let mut lines = body.lines().filter(|l| !l.trim().is_empty());
        let (names, units) = match (lines.next(), lines.next()) {
            (Some(n), Some(u)) if n.starts_with('#') && u.starts_with('#') => {
                (header_tokens(n), header_tokens(u))
            },
            _ => {
                return Err(FetchError::fatal(format!(
                    "malformed NDBC feed for station {}: expected two header lines",
                    station.id
                )))
            },
        };

        let time_idx: Vec<usize> = TIME_COLUMNS
            .iter()
            .map(|col| {
                names.iter().position(|n| n == col).ok_or_else(|| {
                    FetchError::fatal(format!(
                        "malformed NDBC feed for station {}: missing column {}",
                        station.id, col
                    ))
                })
            })
            .collect::<FetchResult<_>>()?;

        Ok(Feed {
            names,
            units,
            time_idx,
            rows: lines.filter(|l| !l.starts_with('#')).collect(),
        })
    }

    fn records(
        &self,
        station: &StationConfig,
        feed: &Feed<'_>,
        rows: &[&str],
        cursor: Option<&str>,
    ) -> FetchResult<Vec<RawRecord>> {
        let mut records = Vec::with_capacity(rows.len());
        for line in rows {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() != feed.names.len() {
                return Err(FetchError::fatal(format!(
                    "malformed NDBC feed for station {}: row has {} columns, header has {}",
                    station.id,
                    tokens.len(),
                    feed.names.len()
                )));
            }
            records.push(self.to_record(station, feed, &tokens, cursor));
        }
        Ok(records)
    }

    /// Decode every row of one station's feed
    pub fn parse_feed(
        &self,
        station: &StationConfig,
        body: &str,
        cursor: Option<&str>,
    ) -> FetchResult<Vec<RawRecord>> {
        let feed = Self::read_feed(station, body)?;
        self.records(station, &feed, &feed.rows, cursor)
    }

    /// Decode the slice of a feed a cursor points at
    pub fn parse_page(&self, body: &str, cursor: Option<&str>) -> FetchResult<Page> {
        let (index, offset) = self.position(cursor)?;
        let station = &self.stations[index];
        let feed = Self::read_feed(station, body)?;

        let end = offset.saturating_add(self.max_rows).min(feed.rows.len());
        let rows = feed.rows.get(offset..end).unwrap_or_default();
        let records = self.records(station, &feed, rows, cursor)?;

        let next_cursor = if end < feed.rows.len() {
            Some(format!("{}:{}", index, end))
        } else if index + 1 < self.stations.len() {
            Some((index + 1).to_string())
        } else {
            None
        };
        Ok(Page::new(records, next_cursor))
    }

    fn to_record(
        &self,
        station: &StationConfig,
        feed: &Feed<'_>,
        tokens: &[&str],
        cursor: Option<&str>,
    ) -> RawRecord {
        let t = |i: usize| tokens[feed.time_idx[i]];
        let observed_at = format!("{}-{}-{}T{}:{}:00Z", t(0), t(1), t(2), t(3), t(4));
        let stamp = format!("{}{}{}{}{}", t(0), t(1), t(2), t(3), t(4));

        let mut payload = Map::new();
        payload.insert("station".to_string(), Value::from(station.id.clone()));
        let mut measurements = Vec::new();

        for (i, (name, token)) in feed.names.iter().zip(tokens).enumerate() {
            if *token == MISSING {
                continue;
            }
            payload.insert(name.clone(), Value::from(*token));
            if let Some((_, parameter)) = PARAMETERS.iter().find(|(col, _)| col == name) {
                measurements.push(RawMeasurement::new(
                    *parameter,
                    Value::from(*token),
                    feed.units.get(i).cloned(),
                ));
            }
        }

        let fields = RawFields {
            record_id: Some(format!("{}:{}", station.id, stamp)),
            latitude: Some(Value::from(station.latitude)),
            longitude: Some(Value::from(station.longitude)),
            observed_at: Some(Value::from(observed_at)),
            measurements,
            ..Default::default()
        };

        RawRecord::new(&self.source_id, RecordCategory::Sensor, payload, fields)
            .with_page_cursor(cursor.map(str::to_string))
    }
}

fn header_tokens(line: &str) -> Vec<String> {
    line.trim_start_matches('#')
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl SourceAdapter for NdbcAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn category(&self) -> RecordCategory {
        RecordCategory::Sensor
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> FetchResult<Page> {
        let (index, row) = self.position(cursor)?;
        let station = &self.stations[index];
        let url = self.station_url(station)?;
        debug!(source_id = %self.source_id, station = %station.id, row, "Fetching NDBC station feed");

        let body = http::get_text(&self.client, url).await?;
        self.parse_page(&body, cursor)
    }
}
