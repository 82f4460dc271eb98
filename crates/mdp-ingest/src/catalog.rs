//! Dataset catalog for a finished run
//!
//! Written next to `run_report.json` as `catalog.json`. Where the run report
//! is an operational record, the catalog describes what data a run produced:
//! one entry per configured source, grouped by record category.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

use crate::config::{IngestConfig, SourceKind};
use crate::error::Result;
use crate::stats::{RunReport, SourceStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub source_id: String,
    pub kind: SourceKind,
    pub status: SourceStatus,
    pub pages: u64,
    /// Records fetched, before validation and deduplication
    pub record_count: u64,
    pub start_date: chrono::NaiveDate,
    pub end_date: chrono::NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSummary {
    pub total_datasets: u64,
    pub total_records: u64,
    /// Observations written after validation and deduplication
    pub total_accepted: u64,
    /// Categories with at least one dataset
    pub data_sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataCatalog {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// category -> source id -> entry
    pub datasets: BTreeMap<String, BTreeMap<String, DatasetEntry>>,
    pub summary: CatalogSummary,
}

impl DataCatalog {
    /// Sources in the report without a configuration entry are left out
    pub fn from_report(report: &RunReport, config: &IngestConfig) -> Self {
        let mut datasets: BTreeMap<String, BTreeMap<String, DatasetEntry>> = BTreeMap::new();
        let mut summary = CatalogSummary {
            total_accepted: report.stats.accepted,
            ..Default::default()
        };

        for source in &report.sources {
            let Some(source_config) = config.sources.iter().find(|s| s.id == source.source_id) else {
                tracing::debug!(source_id = %source.source_id, "Source not configured, left out of catalog");
                continue;
            };
            let entry = DatasetEntry {
                source_id: source.source_id.clone(),
                kind: source_config.kind,
                status: source.status,
                pages: source.pages,
                record_count: source.records,
                start_date: source_config.filter.start_date,
                end_date: source_config.filter.end_date,
            };
            summary.total_datasets += 1;
            summary.total_records += source.records;
            datasets
                .entry(source_config.kind.category().to_string())
                .or_default()
                .insert(entry.source_id.clone(), entry);
        }

        summary.data_sources = datasets.keys().cloned().collect();
        Self {
            run_id: report.run_id,
            created_at: report.finished_at,
            datasets,
            summary,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
