//! ERDDAP dataset search
//!
//! `GET {base}/search/index.json?page=N&itemsPerPage=M&searchFor=<keywords>`
//!
//! The response is an ERDDAP table: `table.columnNames` plus `table.rows` of
//! strings, with `""` for an empty cell. Columns are looked up by name since
//! servers differ in which ones they publish. ERDDAP answers a search with no
//! (more) matches with a 404.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use super::{http, json_kind};
use crate::error::{FetchError, FetchResult, IngestError};
use crate::resilience::Resilience;

pub const DEFAULT_ERDDAP_URL: &str = "https://coastwatch.pfeg.noaa.gov/erddap";
pub const DEFAULT_ITEMS_PER_PAGE: u32 = 100;

/// One search hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub dataset_id: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub institution: Option<String>,
    /// Tabular access URL, when the dataset is served through tabledap
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tabledap: Option<String>,
}

pub struct ErddapCatalog {
    base_url: Url,
    items_per_page: u32,
    client: Client,
}

impl ErddapCatalog {
    pub fn new(base_url: &str, client: Client) -> Result<Self, IngestError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| IngestError::config(format!("invalid ERDDAP URL '{}': {}", base_url, e)))?;
        Ok(Self {
            base_url,
            items_per_page: DEFAULT_ITEMS_PER_PAGE,
            client,
        })
    }

    pub fn with_items_per_page(mut self, items_per_page: u32) -> Self {
        self.items_per_page = items_per_page.max(1);
        self
    }

    pub fn search_url(&self, keywords: &str, page: u32) -> FetchResult<Url> {
        let mut url = http::endpoint(&self.base_url, &["search", "index.json"])?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("itemsPerPage", &self.items_per_page.to_string())
            .append_pair("searchFor", keywords);
        Ok(url)
    }

    /// One page of results; empty once the server runs out of matches
    pub async fn search_page(&self, keywords: &str, page: u32) -> FetchResult<Vec<DatasetSummary>> {
        let url = self.search_url(keywords, page)?;
        debug!(keywords, page, "Searching ERDDAP datasets");
        match http::get_json_if_found(&self.client, url).await? {
            Some(body) => parse_search(body),
            None => Ok(Vec::new()),
        }
    }

    /// Up to `limit` matches, paging through the shared resilience policy
    pub async fn search(
        &self,
        resilience: &Resilience,
        keywords: &str,
        limit: usize,
    ) -> FetchResult<Vec<DatasetSummary>> {
        let mut found = Vec::new();
        let mut page = 1u32;
        while found.len() < limit {
            let batch = resilience.call(|| self.search_page(keywords, page)).await?;
            let exhausted = batch.len() < self.items_per_page as usize;
            found.extend(batch);
            if exhausted {
                break;
            }
            page += 1;
        }
        found.truncate(limit);
        info!(keywords, count = found.len(), "ERDDAP search complete");
        Ok(found)
    }
}

fn cell(row: &[Value], index: Option<usize>) -> Option<String> {
    row.get(index?)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Decode a search response table
pub fn parse_search(body: Value) -> FetchResult<Vec<DatasetSummary>> {
    let table = body
        .get("table")
        .ok_or_else(|| FetchError::fatal("malformed ERDDAP search: missing table"))?;
    let columns: Vec<&str> = table
        .get("columnNames")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::fatal("malformed ERDDAP search: missing columnNames"))?
        .iter()
        .filter_map(Value::as_str)
        .collect();
    let column = |name: &str| columns.iter().position(|c| *c == name);

    let id_col = column("Dataset ID");
    if id_col.is_none() {
        return Err(FetchError::fatal("malformed ERDDAP search: no Dataset ID column"));
    }
    let (title, summary, institution, tabledap) = (
        column("Title"),
        column("Summary"),
        column("Institution"),
        column("tabledap"),
    );

    let rows = match table.get("rows") {
        Some(Value::Array(rows)) => rows,
        Some(other) => {
            return Err(FetchError::fatal(format!(
                "malformed ERDDAP search: rows is {}",
                json_kind(other)
            )))
        },
        None => return Err(FetchError::fatal("malformed ERDDAP search: missing rows")),
    };

    let mut datasets = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(row) = row.as_array() else {
            continue;
        };
        let Some(dataset_id) = cell(row, id_col) else {
            continue;
        };
        datasets.push(DatasetSummary {
            dataset_id,
            title: cell(row, title),
            summary: cell(row, summary),
            institution: cell(row, institution),
            tabledap: cell(row, tabledap),
        });
    }
    Ok(datasets)
}
