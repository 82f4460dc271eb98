//! Run orchestration
//!
//! One [`Orchestrator`] drives one run through
//! `Created -> Running -> (Completed | Cancelled | Failed)`.
//!
//! Every registered source becomes a unit of work on a [`JoinSet`], admitted
//! by a [`Semaphore`] sized `min(sources, max_concurrency)`. Inside a unit a
//! fetch loop pages the adapter through its [`Resilience`] policy while a
//! processing loop validates, deduplicates and writes the previous page; the
//! two are joined by a bounded channel.
//!
//! Source-scoped failures (fatal errors, exhausted rate limiting, an
//! exhausted circuit breaker) only fail that source. Run-scoped failures
//! (sink errors, a poisoned deduplicator) stop every unit and fail the run.

use chrono::{DateTime, Utc};
use futures::future;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use mdp_common::types::{RawRecord, Supersession};

use crate::config::{IngestConfig, ResilienceConfig};
use crate::dedup::{DedupOutcome, Deduplicator, ExistingKeyLookup};
use crate::error::{FetchError, IngestError, Result};
use crate::resilience::{Backoff, Resilience};
use crate::sink::OutputSink;
use crate::source::{Page, ResilientSource, SourceAdapter};
use crate::stats::{RunReport, RunState, RunStats, SourceReport, SourceStatus};
use crate::taxonomy::{StaticTaxonomy, TaxonomyResolver};
use crate::validate::{DepthBounds, RegionalDepthBounds, Validator, Verdict};

// ============================================================================
// Builder
// ============================================================================

/// Collects collaborators for a run
pub struct OrchestratorBuilder {
    config: IngestConfig,
    sources: Vec<Arc<dyn SourceAdapter>>,
    sink: Option<Arc<dyn OutputSink>>,
    taxonomy: Option<Arc<dyn TaxonomyResolver>>,
    depth_bounds: Option<Arc<dyn DepthBounds>>,
    existing_keys: Option<Arc<dyn ExistingKeyLookup>>,
    reference_time: Option<DateTime<Utc>>,
}

impl OrchestratorBuilder {
    pub fn source(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.sources.push(adapter);
        self
    }

    pub fn sources(mut self, adapters: impl IntoIterator<Item = Arc<dyn SourceAdapter>>) -> Self {
        self.sources.extend(adapters);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Defaults to a [`StaticTaxonomy`] built from `[taxonomy]`
    pub fn taxonomy(mut self, taxonomy: Arc<dyn TaxonomyResolver>) -> Self {
        self.taxonomy = Some(taxonomy);
        self
    }

    /// Defaults to [`RegionalDepthBounds`] built from `[validation]`
    pub fn depth_bounds(mut self, depth_bounds: Arc<dyn DepthBounds>) -> Self {
        self.depth_bounds = Some(depth_bounds);
        self
    }

    pub fn existing_keys(mut self, lookup: Arc<dyn ExistingKeyLookup>) -> Self {
        self.existing_keys = Some(lookup);
        self
    }

    /// "Now" for timestamp validation; defaults to the build time
    pub fn reference_time(mut self, reference_time: DateTime<Utc>) -> Self {
        self.reference_time = Some(reference_time);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let sink = self
            .sink
            .ok_or_else(|| IngestError::config("an output sink is required"))?;

        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.source_id().to_string()) {
                return Err(IngestError::config(format!(
                    "source '{}' registered twice",
                    source.source_id()
                )));
            }
        }

        let taxonomy = match self.taxonomy {
            Some(taxonomy) => taxonomy,
            None => Arc::new(
                StaticTaxonomy::from_config(&self.config.taxonomy)
                    .map_err(|e| IngestError::config(format!("{:#}", e)))?,
            ),
        };
        let depth_bounds = self
            .depth_bounds
            .unwrap_or_else(|| Arc::new(RegionalDepthBounds::from_config(&self.config.validation)));
        let validator = Validator::new(&self.config, taxonomy, depth_bounds)
            .with_reference_time(self.reference_time.unwrap_or_else(Utc::now));

        let cancel = CancellationToken::new();
        let stats = Arc::new(RunStats::new());
        let context = RunContext {
            validator,
            dedup: Mutex::new(Deduplicator::new(self.config.dedup.clone())),
            sink,
            existing_keys: self.existing_keys,
            stats,
            cancel: cancel.clone(),
            stop: cancel.child_token(),
            failure: Mutex::new(None),
        };

        Ok(Orchestrator {
            run_id: Uuid::new_v4(),
            config: self.config,
            sources: self.sources,
            context: Arc::new(context),
            state: Mutex::new(RunState::Created),
        })
    }
}

// ============================================================================
// Shared run state
// ============================================================================

struct RunContext {
    validator: Validator,
    /// Single serialization point for the in-run key map
    dedup: Mutex<Deduplicator>,
    sink: Arc<dyn OutputSink>,
    existing_keys: Option<Arc<dyn ExistingKeyLookup>>,
    stats: Arc<RunStats>,
    /// External cancellation
    cancel: CancellationToken,
    /// Child of `cancel`, also tripped by run-scoped failures
    stop: CancellationToken,
    failure: Mutex<Option<String>>,
}

impl RunContext {
    fn fail(&self, err: &IngestError) {
        error!(error = %err, "Run-scoped failure, stopping all sources");
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert_with(|| err.to_string());
        }
        self.stop.cancel();
    }

    fn failure(&self) -> Option<String> {
        match self.failure.lock() {
            Ok(failure) => failure.clone(),
            Err(_) => Some("failure slot poisoned".to_string()),
        }
    }

    async fn already_stored(&self, keys: [Option<&str>; 2]) -> Result<bool> {
        let Some(ref lookup) = self.existing_keys else {
            return Ok(false);
        };
        for key in keys.into_iter().flatten() {
            if lookup.exists(key).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Validate, deduplicate and emit one record
    async fn process(&self, record: &RawRecord) -> Result<()> {
        let obs = match self.validator.validate(record) {
            Verdict::Rejected(rejection) => {
                self.stats.record_rejected(1);
                return self.sink.write_rejection(&rejection).await;
            },
            Verdict::Accepted(obs) => obs,
        };

        let stored = self
            .already_stored([Some(obs.natural_key.as_str()), obs.proximity_key.as_deref()])
            .await?;

        let outcome = {
            let mut dedup = self
                .dedup
                .lock()
                .map_err(|_| IngestError::internal("deduplicator lock poisoned"))?;
            dedup.offer_with(&obs, stored)
        };

        match outcome {
            DedupOutcome::Accepted => {
                self.sink.write(&obs).await?;
                self.stats.record_accepted(1);
            },
            DedupOutcome::Superseded { previous_source_id } => {
                debug!(
                    natural_key = %obs.natural_key,
                    previous_source_id = %previous_source_id,
                    "Superseding observation"
                );
                self.sink.write(&obs).await?;
                self.sink
                    .write_superseded(&Supersession {
                        superseded_key: obs.natural_key.clone(),
                        replacement_key: obs.natural_key.clone(),
                        source_id: obs.source_id().to_string(),
                        superseded_at: Utc::now(),
                    })
                    .await?;
                self.stats.record_accepted(1);
                self.stats.record_superseded(1);
            },
            DedupOutcome::Duplicate { .. } | DedupOutcome::AlreadyStored => {
                self.stats.record_duplicates(1);
            },
        }
        Ok(())
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Settings each unit needs, copied out of the run config
#[derive(Debug, Clone)]
struct UnitSettings {
    resilience: ResilienceConfig,
    page_budget: Option<u32>,
    page_buffer: usize,
    max_circuit_trips: u32,
}

pub struct Orchestrator {
    run_id: Uuid,
    config: IngestConfig,
    sources: Vec<Arc<dyn SourceAdapter>>,
    context: Arc<RunContext>,
    state: Mutex<RunState>,
}

impl Orchestrator {
    pub fn builder(config: IngestConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            sources: Vec::new(),
            sink: None,
            taxonomy: None,
            depth_bounds: None,
            existing_keys: None,
            reference_time: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Token that cancels the run cooperatively
    pub fn cancel_token(&self) -> CancellationToken {
        self.context.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(RunState::Failed)
    }

    fn transition(&self, from: RunState, to: RunState) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| IngestError::internal("run state lock poisoned"))?;
        if *state != from {
            return Err(IngestError::InvalidState(format!(
                "cannot move run from {} to {}",
                *state, to
            )));
        }
        *state = to;
        Ok(())
    }

    fn unit_settings(&self, source_id: &str) -> UnitSettings {
        let resilience = self
            .config
            .sources
            .iter()
            .find(|s| s.id == source_id)
            .map(|s| s.effective_resilience(&self.config.resilience))
            .unwrap_or(&self.config.resilience)
            .clone();
        UnitSettings {
            resilience,
            page_budget: self.config.run.page_budget,
            page_buffer: self.config.run.page_buffer.max(1),
            max_circuit_trips: self.config.run.max_circuit_trips,
        }
    }

    /// Run to a terminal state; may only be called once
    pub async fn run(&self) -> Result<RunReport> {
        self.transition(RunState::Created, RunState::Running)?;
        let started_at = Utc::now();
        let ctx = &self.context;

        let limit = self.sources.len().min(self.config.run.max_concurrency).max(1);
        info!(
            run_id = %self.run_id,
            sources = self.sources.len(),
            concurrency = limit,
            "Starting ingestion run"
        );

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut units: JoinSet<SourceReport> = JoinSet::new();
        for adapter in &self.sources {
            let source_id = adapter.source_id().to_string();
            let unit = run_source(
                Arc::clone(ctx),
                Arc::clone(adapter),
                self.unit_settings(&source_id),
                Arc::clone(&semaphore),
            )
            .instrument(info_span!("source", source_id = %source_id));
            units.spawn(unit);
        }

        let mut reports = Vec::with_capacity(self.sources.len());
        tokio::select! {
            _ = drain(&mut units, &mut reports) => {},
            _ = ctx.stop.cancelled() => {
                let grace = self.config.run.cancel_grace();
                info!(grace_secs = grace.as_secs(), "Stopping, draining in-flight work");
                if tokio::time::timeout(grace, drain(&mut units, &mut reports)).await.is_err() {
                    warn!("Grace period elapsed, abandoning in-flight work");
                    units.abort_all();
                    drain(&mut units, &mut reports).await;
                }
            },
        }

        if let Err(e) = ctx.sink.flush().await {
            ctx.fail(&e);
        }

        let failure = ctx.failure();
        let state = if failure.is_some() {
            RunState::Failed
        } else if ctx.cancel.is_cancelled() {
            RunState::Cancelled
        } else {
            RunState::Completed
        };
        let sources = self.ordered_reports(reports, state);
        self.transition(RunState::Running, state)?;

        let report = RunReport {
            run_id: self.run_id,
            state,
            started_at,
            finished_at: Utc::now(),
            stats: ctx.stats.snapshot(),
            sources,
            failure,
        };
        info!(
            run_id = %self.run_id,
            state = %report.state,
            outcome = ?report.outcome(),
            fetched = report.stats.fetched,
            accepted = report.stats.accepted,
            rejected = report.stats.rejected,
            duplicates = report.stats.duplicates_dropped,
            failed_sources = report.failed_sources().count(),
            "Ingestion run finished"
        );
        Ok(report)
    }

    /// Reports in registration order; units that never reported are
    /// accounted for as abandoned
    fn ordered_reports(&self, mut reports: Vec<SourceReport>, state: RunState) -> Vec<SourceReport> {
        self.sources
            .iter()
            .map(|adapter| {
                let id = adapter.source_id();
                match reports.iter().position(|r| r.source_id == id) {
                    Some(i) => reports.swap_remove(i),
                    None => {
                        let mut report = SourceReport::new(id);
                        report.status = if state == RunState::Completed {
                            SourceStatus::Failed
                        } else {
                            SourceStatus::Cancelled
                        };
                        report.last_error = Some("unit did not report".to_string());
                        report
                    },
                }
            })
            .collect()
    }
}

async fn drain(units: &mut JoinSet<SourceReport>, reports: &mut Vec<SourceReport>) {
    while let Some(joined) = units.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) if e.is_cancelled() => {},
            Err(e) => error!(error = %e, "Source unit panicked"),
        }
    }
}

// ============================================================================
// Per-source unit
// ============================================================================

async fn run_source(
    ctx: Arc<RunContext>,
    adapter: Arc<dyn SourceAdapter>,
    settings: UnitSettings,
    semaphore: Arc<Semaphore>,
) -> SourceReport {
    let mut report = SourceReport::new(adapter.source_id());

    let _permit = tokio::select! {
        _ = ctx.stop.cancelled() => {
            report.status = SourceStatus::Cancelled;
            return report;
        },
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(e) => {
                report.status = SourceStatus::Failed;
                report.last_error = Some(format!("scheduler closed: {}", e));
                return report;
            },
        },
    };

    let resilience = Resilience::new(
        adapter.source_id(),
        settings.resilience.clone(),
        Arc::clone(&ctx.stats),
        ctx.stop.clone(),
    );
    let source = ResilientSource::new(adapter, resilience);
    let (tx, rx) = mpsc::channel::<Page>(settings.page_buffer);

    info!("Source started");
    let (report, ()) = future::join(
        fetch_pages(&ctx, &source, &settings, tx, report),
        process_pages(&ctx, rx),
    )
    .await;

    match report.status {
        SourceStatus::Completed => info!(
            pages = report.pages,
            records = report.records,
            budget_exhausted = report.page_budget_exhausted,
            "Source completed"
        ),
        SourceStatus::Failed => error!(
            pages = report.pages,
            error = report.last_error.as_deref().unwrap_or("unknown"),
            "Source failed"
        ),
        SourceStatus::Cancelled => info!(pages = report.pages, "Source cancelled"),
    }
    report
}

/// Page the source until exhaustion, failure, budget or cancellation
async fn fetch_pages(
    ctx: &RunContext,
    source: &ResilientSource,
    settings: &UnitSettings,
    tx: mpsc::Sender<Page>,
    mut report: SourceReport,
) -> SourceReport {
    let mut cursor: Option<String> = None;
    let backoff = Backoff::from_config(&settings.resilience);
    // Consecutive times the current page came back with its retries spent
    let mut reissues: u32 = 0;

    loop {
        if ctx.stop.is_cancelled() {
            report.status = SourceStatus::Cancelled;
            break;
        }
        if let Some(budget) = settings.page_budget {
            if report.pages >= u64::from(budget) {
                info!(budget, "Page budget exhausted");
                report.page_budget_exhausted = true;
                break;
            }
        }

        match source.fetch_page(cursor.as_deref()).await {
            Ok(page) => {
                reissues = 0;
                let count = page.records.len() as u64;
                report.pages += 1;
                report.records += count;
                ctx.stats.record_pages(1);
                ctx.stats.record_fetched(count);
                debug!(page = report.pages, records = count, "Fetched page");

                let next = page.next_cursor.clone();
                if tx.send(page).await.is_err() {
                    report.status = SourceStatus::Cancelled;
                    break;
                }
                match next {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            },
            Err(FetchError::Transient(msg)) => {
                let delay = backoff.delay(reissues);
                reissues = reissues.saturating_add(1);
                debug!(
                    error = %msg,
                    reissues,
                    delay_ms = delay.as_millis() as u64,
                    "Retry budget spent, re-issuing page after backoff"
                );
                report.last_error = Some(msg);
                if source.resilience().pause(delay).await.is_err() {
                    report.status = SourceStatus::Cancelled;
                    break;
                }
            },
            Err(FetchError::CircuitOpen { retry_in, .. }) => {
                report.circuit_trips += 1;
                if report.circuit_trips > settings.max_circuit_trips {
                    report.status = SourceStatus::Failed;
                    report.last_error = Some(format!(
                        "circuit breaker exhausted after {} trips",
                        report.circuit_trips
                    ));
                    break;
                }
                warn!(
                    trips = report.circuit_trips,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Circuit open, waiting for cooldown"
                );
                if source.resilience().pause(retry_in).await.is_err() {
                    report.status = SourceStatus::Cancelled;
                    break;
                }
            },
            Err(FetchError::Cancelled) => {
                report.status = SourceStatus::Cancelled;
                break;
            },
            Err(e @ (FetchError::Fatal(_) | FetchError::RateLimited { .. })) => {
                report.status = SourceStatus::Failed;
                report.last_error = Some(e.to_string());
                break;
            },
        }
    }
    report
}

/// Validate and emit pages in arrival order
async fn process_pages(ctx: &RunContext, mut rx: mpsc::Receiver<Page>) {
    while let Some(page) = rx.recv().await {
        for record in &page.records {
            if let Err(e) = ctx.process(record).await {
                ctx.fail(&e);
                return;
            }
        }
    }
}
