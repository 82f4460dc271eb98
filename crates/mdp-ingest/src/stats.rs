//! Run-level counters and the terminal run report
//!
//! One [`RunStats`] is created per run by the orchestrator and handed
//! explicitly to every component that records something. Counters are atomic
//! so recording never contends with I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Live counters for one run
#[derive(Debug, Default)]
pub struct RunStats {
    fetched: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    duplicates_dropped: AtomicU64,
    superseded: AtomicU64,
    retries_issued: AtomicU64,
    rate_limited: AtomicU64,
    circuit_breaks: AtomicU64,
    pages_fetched: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_fetched, fetched);
    counter!(record_accepted, accepted);
    counter!(record_rejected, rejected);
    counter!(record_duplicates, duplicates_dropped);
    counter!(record_superseded, superseded);
    counter!(record_retries, retries_issued);
    counter!(record_rate_limited, rate_limited);
    counter!(record_circuit_breaks, circuit_breaks);
    counter!(record_pages, pages_fetched);

    pub fn snapshot(&self) -> RunStatsSnapshot {
        RunStatsSnapshot {
            fetched: self.fetched.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            retries_issued: self.retries_issued.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            circuit_breaks: self.circuit_breaks.load(Ordering::Relaxed),
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
        }
    }
}

/// Read-only copy of [`RunStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatsSnapshot {
    pub fetched: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub duplicates_dropped: u64,
    pub superseded: u64,
    pub retries_issued: u64,
    pub rate_limited: u64,
    pub circuit_breaks: u64,
    pub pages_fetched: u64,
}

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &str {
        match self {
            RunState::Created => "created",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Cancelled => "cancelled",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Cancelled | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a single source ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Per-source summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source_id: String,
    pub status: SourceStatus,
    pub pages: u64,
    pub records: u64,
    /// Pagination stopped because the page budget ran out
    pub page_budget_exhausted: bool,
    pub circuit_trips: u32,
    pub last_error: Option<String>,
}

impl SourceReport {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            status: SourceStatus::Completed,
            pages: 0,
            records: 0,
            page_budget_exhausted: false,
            circuit_trips: 0,
            last_error: None,
        }
    }
}

/// Overall verdict for operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    PartialSuccess,
    AllSourcesFailed,
}

/// Snapshot returned once a run reaches a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: RunStatsSnapshot,
    pub sources: Vec<SourceReport>,
    /// Run-scoped failure, set when `state` is `Failed`
    pub failure: Option<String>,
}

impl RunReport {
    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources
            .iter()
            .filter(|s| s.status == SourceStatus::Failed)
    }

    pub fn outcome(&self) -> RunOutcome {
        let failed = self.failed_sources().count();
        if !self.sources.is_empty() && failed == self.sources.len() {
            RunOutcome::AllSourcesFailed
        } else if failed > 0 || self.state != RunState::Completed {
            RunOutcome::PartialSuccess
        } else {
            RunOutcome::Success
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(statuses: &[SourceStatus], state: RunState) -> RunReport {
        RunReport {
            run_id: Uuid::new_v4(),
            state,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            stats: RunStatsSnapshot::default(),
            sources: statuses
                .iter()
                .enumerate()
                .map(|(i, status)| SourceReport {
                    status: *status,
                    ..SourceReport::new(format!("s{}", i))
                })
                .collect(),
            failure: None,
        }
    }

    #[test]
    fn test_counters_accumulate() {
        let stats = RunStats::new();
        stats.record_fetched(10);
        stats.record_fetched(5);
        stats.record_accepted(12);
        stats.record_retries(1);
        let snap = stats.snapshot();
        assert_eq!(snap.fetched, 15);
        assert_eq!(snap.accepted, 12);
        assert_eq!(snap.retries_issued, 1);
        assert_eq!(snap.circuit_breaks, 0);
    }

    #[test]
    fn test_outcome() {
        use SourceStatus::*;
        assert_eq!(
            report(&[Completed, Completed], RunState::Completed).outcome(),
            RunOutcome::Success
        );
        assert_eq!(
            report(&[Completed, Failed], RunState::Completed).outcome(),
            RunOutcome::PartialSuccess
        );
        assert_eq!(
            report(&[Failed, Failed], RunState::Completed).outcome(),
            RunOutcome::AllSourcesFailed
        );
        assert_eq!(
            report(&[Completed, Cancelled], RunState::Cancelled).outcome(),
            RunOutcome::PartialSuccess
        );
    }
}
