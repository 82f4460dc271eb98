//! Output collaborators
//!
//! The pipeline streams every accepted observation, rejection and
//! supersession notice to an [`OutputSink`] as soon as it is produced. Sinks
//! are append-only; supersession notices tell downstream which previously
//! written observation was replaced.

use async_trait::async_trait;
use mdp_common::types::{CanonicalObservation, RejectionRecord, Supersession};
use serde::Serialize;
use serde_jsonlines::JsonLinesWriter;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::{IngestError, Result};

pub const OBSERVATIONS_FILE: &str = "observations.jsonl";
pub const REJECTIONS_FILE: &str = "rejections.jsonl";
pub const SUPERSEDED_FILE: &str = "superseded.jsonl";

#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn write(&self, observation: &CanonicalObservation) -> Result<()>;

    async fn write_rejection(&self, rejection: &RejectionRecord) -> Result<()>;

    async fn write_superseded(&self, notice: &Supersession) -> Result<()>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| IngestError::internal(format!("{} lock poisoned", what)))
}

// ============================================================================
// JSON lines
// ============================================================================

type Writer = JsonLinesWriter<BufWriter<File>>;

/// Three append-only JSON-lines files in one directory
pub struct JsonLinesSink {
    dir: PathBuf,
    observations: Mutex<Writer>,
    rejections: Mutex<Writer>,
    superseded: Mutex<Writer>,
}

impl JsonLinesSink {
    /// Open (or create) the output files under `dir`
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            observations: Mutex::new(Self::open(&dir.join(OBSERVATIONS_FILE))?),
            rejections: Mutex::new(Self::open(&dir.join(REJECTIONS_FILE))?),
            superseded: Mutex::new(Self::open(&dir.join(SUPERSEDED_FILE))?),
        })
    }

    fn open(path: &Path) -> Result<Writer> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!(path = %path.display(), "Opened output file");
        Ok(JsonLinesWriter::new(BufWriter::new(file)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn observations_path(&self) -> PathBuf {
        self.dir.join(OBSERVATIONS_FILE)
    }

    fn append<T: Serialize>(writer: &Mutex<Writer>, what: &str, value: &T) -> Result<()> {
        lock(writer, what)?
            .write(value)
            .map_err(|e| IngestError::sink(format!("failed to write {}: {}", what, e)))
    }

    fn flush_one(writer: &Mutex<Writer>, what: &str) -> Result<()> {
        lock(writer, what)?
            .flush()
            .map_err(|e| IngestError::sink(format!("failed to flush {}: {}", what, e)))
    }
}

#[async_trait]
impl OutputSink for JsonLinesSink {
    async fn write(&self, observation: &CanonicalObservation) -> Result<()> {
        Self::append(&self.observations, "observations", observation)
    }

    async fn write_rejection(&self, rejection: &RejectionRecord) -> Result<()> {
        Self::append(&self.rejections, "rejections", rejection)
    }

    async fn write_superseded(&self, notice: &Supersession) -> Result<()> {
        Self::append(&self.superseded, "superseded", notice)
    }

    async fn flush(&self) -> Result<()> {
        Self::flush_one(&self.observations, "observations")?;
        Self::flush_one(&self.rejections, "rejections")?;
        Self::flush_one(&self.superseded, "superseded")
    }
}

// ============================================================================
// In memory
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    written: usize,
    /// Final view: superseded observations are replaced in place
    observations: HashMap<String, CanonicalObservation>,
    rejections: Vec<RejectionRecord>,
    superseded: Vec<Supersession>,
}

/// Sink that materializes the final view in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observations in the final view, sorted by natural key
    pub fn observations(&self) -> Vec<CanonicalObservation> {
        let mut out: Vec<_> = self
            .state
            .lock()
            .map(|s| s.observations.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
        out
    }

    pub fn observation(&self, natural_key: &str) -> Option<CanonicalObservation> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.observations.get(natural_key).cloned())
    }

    /// Total `write` calls, including ones later superseded
    pub fn written(&self) -> usize {
        self.state.lock().map(|s| s.written).unwrap_or_default()
    }

    pub fn rejections(&self) -> Vec<RejectionRecord> {
        self.state
            .lock()
            .map(|s| s.rejections.clone())
            .unwrap_or_default()
    }

    pub fn superseded(&self) -> Vec<Supersession> {
        self.state
            .lock()
            .map(|s| s.superseded.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn write(&self, observation: &CanonicalObservation) -> Result<()> {
        let mut state = lock(&self.state, "memory sink")?;
        state.written += 1;
        state
            .observations
            .insert(observation.natural_key.clone(), observation.clone());
        Ok(())
    }

    async fn write_rejection(&self, rejection: &RejectionRecord) -> Result<()> {
        lock(&self.state, "memory sink")?.rejections.push(rejection.clone());
        Ok(())
    }

    async fn write_superseded(&self, notice: &Supersession) -> Result<()> {
        lock(&self.state, "memory sink")?.superseded.push(notice.clone());
        Ok(())
    }
}
