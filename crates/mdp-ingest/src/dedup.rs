//! Deduplication
//!
//! Exact collisions are decided by natural key and the configured
//! [`DedupPolicy`]. Records without a shared identifier additionally go
//! through a best-effort near-duplicate search: space/time cells sized to the
//! tolerance, confirmed by great-circle distance, time difference and exact
//! species match. Near-duplicate matching only collapses records coming from
//! different sources and always keeps the first-seen observation.
//!
//! Cross-run suppression goes through [`ExistingKeyLookup`]; [`KeyIndex`]
//! rebuilds one from a previous run's `observations.jsonl`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mdp_common::types::{haversine_km, CanonicalObservation};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use tracing::{debug, info};

use crate::config::{DedupConfig, DedupPolicy};
use crate::error::{IngestError, Result};

/// Kilometers per degree of latitude
const KM_PER_DEGREE: f64 = 111.32;

/// What the deduplicator decided for one observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First time this observation is seen
    Accepted,
    /// Replaced an observation with the same natural key (latest wins)
    Superseded { previous_source_id: String },
    /// Dropped; `kept_key` is the observation that stays
    Duplicate { kept_key: String },
    /// Dropped; already present downstream from an earlier run
    AlreadyStored,
}

impl DedupOutcome {
    /// Whether the observation should be written downstream
    pub fn accepted(&self) -> bool {
        matches!(self, DedupOutcome::Accepted | DedupOutcome::Superseded { .. })
    }
}

#[derive(Debug, Clone)]
struct Entry {
    source_id: String,
    fetched_at: DateTime<Utc>,
    digest: String,
    latitude: f64,
    longitude: f64,
    observed_at: DateTime<Utc>,
    /// Species for near-duplicate matching; `None` when the record is not eligible
    species: Option<String>,
    /// Registered from an earlier run rather than emitted by this one
    stored: bool,
}

impl Entry {
    fn from_observation(obs: &CanonicalObservation, stored: bool) -> Self {
        Self {
            source_id: obs.source_id().to_string(),
            fetched_at: obs.fetched_at(),
            digest: obs.provenance.payload_digest.clone(),
            latitude: obs.latitude,
            longitude: obs.longitude,
            observed_at: obs.observed_at,
            species: obs
                .proximity_key
                .as_ref()
                .and(obs.species_code.clone()),
            stored,
        }
    }
}

type Cell = (i64, i64, i64);

/// In-run key map
///
/// Not synchronized; the orchestrator keeps it behind a single mutex.
#[derive(Debug)]
pub struct Deduplicator {
    config: DedupConfig,
    entries: HashMap<String, Entry>,
    cells: HashMap<Cell, Vec<String>>,
    cell_degrees: f64,
    /// Longitude cells divide the full circle evenly so the index wraps at ±180
    lon_cells: i64,
    lon_cell_degrees: f64,
    cell_seconds: i64,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        let cell_degrees = (config.tolerance_km / KM_PER_DEGREE).max(1e-6);
        let cell_seconds = (config.tolerance_minutes * 60).max(1);
        let lon_cells = ((360.0 / cell_degrees).floor() as i64).max(1);
        Self {
            config,
            entries: HashMap::new(),
            cells: HashMap::new(),
            cell_degrees,
            lon_cells,
            lon_cell_degrees: 360.0 / lon_cells as f64,
            cell_seconds,
        }
    }

    pub fn policy(&self) -> DedupPolicy {
        self.config.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, natural_key: &str) -> bool {
        self.entries.contains_key(natural_key)
    }

    /// Offer an observation that is not known downstream
    pub fn offer(&mut self, obs: &CanonicalObservation) -> DedupOutcome {
        self.offer_with(obs, false)
    }

    /// Offer an observation; `already_stored` marks it as present downstream
    pub fn offer_with(&mut self, obs: &CanonicalObservation, already_stored: bool) -> DedupOutcome {
        if let Some(existing) = self.entries.get(&obs.natural_key) {
            if existing.stored {
                return DedupOutcome::AlreadyStored;
            }
            let duplicate = DedupOutcome::Duplicate {
                kept_key: obs.natural_key.clone(),
            };
            if existing.digest == obs.provenance.payload_digest {
                return duplicate;
            }
            return match self.config.policy {
                DedupPolicy::FirstWins => duplicate,
                DedupPolicy::LatestWins if obs.fetched_at() >= existing.fetched_at => {
                    let previous_source_id = existing.source_id.clone();
                    self.remove(&obs.natural_key);
                    self.insert(obs, false);
                    DedupOutcome::Superseded { previous_source_id }
                },
                DedupPolicy::LatestWins => duplicate,
            };
        }

        if already_stored {
            self.insert(obs, true);
            return DedupOutcome::AlreadyStored;
        }

        if self.config.near_duplicates {
            if let Some(kept_key) = self.find_near_duplicate(obs) {
                let stored = self.entries.get(&kept_key).is_some_and(|e| e.stored);
                debug!(
                    natural_key = %obs.natural_key,
                    kept_key = %kept_key,
                    source_id = %obs.source_id(),
                    "Near-duplicate dropped"
                );
                return if stored {
                    DedupOutcome::AlreadyStored
                } else {
                    DedupOutcome::Duplicate { kept_key }
                };
            }
        }

        self.insert(obs, false);
        DedupOutcome::Accepted
    }

    fn cell_of(&self, latitude: f64, longitude: f64, observed_at: &DateTime<Utc>) -> Cell {
        (
            (latitude / self.cell_degrees).floor() as i64,
            self.wrap_lon(((longitude + 180.0) / self.lon_cell_degrees).floor() as i64),
            observed_at.timestamp().div_euclid(self.cell_seconds),
        )
    }

    fn wrap_lon(&self, cell: i64) -> i64 {
        cell.rem_euclid(self.lon_cells)
    }

    /// Longitude cells to search on each side, so the search still spans
    /// the tolerance where meridians converge
    fn longitude_span(&self, latitude: f64) -> i64 {
        let max_span = (self.lon_cells / 2).max(1);
        let cos = latitude.to_radians().cos().abs();
        if cos < 1e-9 {
            return max_span;
        }
        ((1.0 / cos).ceil() as i64).clamp(1, max_span)
    }

    fn insert(&mut self, obs: &CanonicalObservation, stored: bool) {
        let entry = Entry::from_observation(obs, stored);
        if entry.species.is_some() {
            let cell = self.cell_of(entry.latitude, entry.longitude, &entry.observed_at);
            self.cells.entry(cell).or_default().push(obs.natural_key.clone());
        }
        self.entries.insert(obs.natural_key.clone(), entry);
    }

    fn remove(&mut self, natural_key: &str) {
        let Some(entry) = self.entries.remove(natural_key) else {
            return;
        };
        if entry.species.is_some() {
            let cell = self.cell_of(entry.latitude, entry.longitude, &entry.observed_at);
            if let Some(keys) = self.cells.get_mut(&cell) {
                keys.retain(|k| k != natural_key);
                if keys.is_empty() {
                    self.cells.remove(&cell);
                }
            }
        }
    }

    fn find_near_duplicate(&self, obs: &CanonicalObservation) -> Option<String> {
        obs.proximity_key.as_ref()?;
        let species = obs.species_code.as_deref()?;
        let (lat_cell, lon_cell, time_cell) = self.cell_of(obs.latitude, obs.longitude, &obs.observed_at);
        let lon_span = self.longitude_span(obs.latitude);
        let tolerance = self.config.tolerance();

        for dt in -1..=1 {
            for dlat in -1..=1 {
                for dlon in -lon_span..=lon_span {
                    let cell = (lat_cell + dlat, self.wrap_lon(lon_cell + dlon), time_cell + dt);
                    let Some(keys) = self.cells.get(&cell) else {
                        continue;
                    };
                    for key in keys {
                        let Some(candidate) = self.entries.get(key) else {
                            continue;
                        };
                        if candidate.source_id == obs.source_id()
                            || candidate.species.as_deref() != Some(species)
                        {
                            continue;
                        }
                        let within_time = (candidate.observed_at - obs.observed_at).abs() <= tolerance;
                        let distance = haversine_km(
                            candidate.latitude,
                            candidate.longitude,
                            obs.latitude,
                            obs.longitude,
                        );
                        if within_time && distance <= self.config.tolerance_km {
                            return Some(key.clone());
                        }
                    }
                }
            }
        }
        None
    }
}

// ============================================================================
// Cross-run key lookup
// ============================================================================

/// Keys already present downstream from earlier runs
#[async_trait]
pub trait ExistingKeyLookup: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Natural and proximity keys of a previous run's output
#[derive(Debug, Clone, Default)]
pub struct KeyIndex {
    keys: HashSet<String>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every observation in an `observations.jsonl` file
    ///
    /// A missing file yields an empty index.
    pub fn load(path: &Path) -> Result<Self> {
        let mut index = Self::new();
        let lines = match serde_jsonlines::json_lines::<CanonicalObservation, _>(path) {
            Ok(lines) => lines,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No previous output, starting with an empty key index");
                return Ok(index);
            },
            Err(e) => return Err(e.into()),
        };
        for (line, obs) in lines.enumerate() {
            let obs = obs.map_err(|e| {
                IngestError::config(format!(
                    "invalid observation in {} line {}: {}",
                    path.display(),
                    line + 1,
                    e
                ))
            })?;
            index.insert_observation(&obs);
        }
        info!(path = %path.display(), keys = index.len(), "Loaded existing keys");
        Ok(index)
    }

    pub fn insert(&mut self, key: impl Into<String>) {
        self.keys.insert(key.into());
    }

    pub fn insert_observation(&mut self, obs: &CanonicalObservation) {
        self.insert(obs.natural_key.clone());
        if let Some(ref proximity) = obs.proximity_key {
            self.insert(proximity.clone());
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl ExistingKeyLookup for KeyIndex {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.contains(key))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use mdp_common::types::{Provenance, RecordCategory};
    use std::collections::{BTreeMap, BTreeSet};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap()
    }

    fn obs(key: &str, source: &str, digest: &str, lat: f64, lon: f64) -> CanonicalObservation {
        CanonicalObservation {
            natural_key: key.to_string(),
            category: RecordCategory::Occurrence,
            latitude: lat,
            longitude: lon,
            observed_at: t0(),
            depth_meters: None,
            species_code: Some("worms:127027".to_string()),
            measurements: BTreeMap::new(),
            quality_flags: BTreeSet::new(),
            proximity_key: Some(format!("near:{:.2}:{:.2}:2024010510:worms:127027", lat, lon)),
            has_shared_id: false,
            provenance: Provenance {
                source_id: source.to_string(),
                fetched_at: t0(),
                payload_digest: digest.to_string(),
            },
        }
    }

    fn dedup(policy: DedupPolicy) -> Deduplicator {
        Deduplicator::new(DedupConfig {
            policy,
            ..Default::default()
        })
    }

    #[test]
    fn test_latest_wins_replaces_on_key_collision() {
        let mut d = dedup(DedupPolicy::LatestWins);
        let first = obs("obis:1", "obis", "aaa", 30.0, -140.0);
        let mut second = obs("obis:1", "obis", "bbb", 30.0, -140.0);
        second.provenance.fetched_at = t0() + Duration::minutes(5);

        assert_eq!(d.offer(&first), DedupOutcome::Accepted);
        assert_eq!(
            d.offer(&second),
            DedupOutcome::Superseded {
                previous_source_id: "obis".to_string()
            }
        );
        // An older copy arriving late does not win
        assert!(!d.offer(&first).accepted());
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_first_wins_and_identical_payloads() {
        let mut d = dedup(DedupPolicy::FirstWins);
        let first = obs("obis:1", "obis", "aaa", 30.0, -140.0);
        let mut second = obs("obis:1", "obis", "bbb", 30.0, -140.0);
        second.provenance.fetched_at = t0() + Duration::minutes(5);
        assert!(d.offer(&first).accepted());
        assert!(!d.offer(&second).accepted());

        let mut d = dedup(DedupPolicy::LatestWins);
        assert!(d.offer(&first).accepted());
        assert!(matches!(d.offer(&first), DedupOutcome::Duplicate { .. }));
    }

    #[test]
    fn test_near_duplicate_across_sources() {
        let mut d = dedup(DedupPolicy::LatestWins);
        // ~500 m apart, 20 minutes apart
        let a = obs("obis:1", "obis", "aaa", 30.0, -140.0);
        let mut b = obs("gbif:9", "gbif", "bbb", 30.0045, -140.0);
        b.observed_at = t0() + Duration::minutes(20);

        assert!(d.offer(&a).accepted());
        assert_eq!(
            d.offer(&b),
            DedupOutcome::Duplicate {
                kept_key: "obis:1".to_string()
            }
        );
    }

    #[test]
    fn test_near_duplicate_respects_tolerances() {
        let mut d = dedup(DedupPolicy::LatestWins);
        let a = obs("obis:1", "obis", "aaa", 30.0, -140.0);
        // ~2.2 km away
        let far = obs("gbif:1", "gbif", "bbb", 30.02, -140.0);
        // two hours later
        let mut late = obs("gbif:2", "gbif", "ccc", 30.0, -140.0);
        late.observed_at = t0() + Duration::hours(2);
        // other species
        let mut other = obs("gbif:3", "gbif", "ddd", 30.0, -140.0);
        other.species_code = Some("worms:127405".to_string());
        // same source
        let same_source = obs("obis:2", "obis", "eee", 30.0, -140.0);

        assert!(d.offer(&a).accepted());
        assert!(d.offer(&far).accepted());
        assert!(d.offer(&late).accepted());
        assert!(d.offer(&other).accepted());
        assert!(d.offer(&same_source).accepted());
    }

    #[test]
    fn test_near_duplicate_at_high_latitude() {
        let mut d = dedup(DedupPolicy::LatestWins);
        // At 80N, 0.04 degrees of longitude is ~0.77 km
        let a = obs("obis:1", "obis", "aaa", 80.0, 10.0);
        let b = obs("gbif:1", "gbif", "bbb", 80.0, 10.04);
        assert!(d.offer(&a).accepted());
        assert!(!d.offer(&b).accepted());
    }

    #[test]
    fn test_near_duplicate_across_antimeridian() {
        let mut d = dedup(DedupPolicy::LatestWins);
        // ~110 m apart on either side of 180
        let east = obs("obis:1", "obis", "aaa", -16.0, 179.9995);
        let west = obs("gbif:1", "gbif", "bbb", -16.0, -179.9995);
        assert!(d.offer(&east).accepted());
        assert_eq!(
            d.offer(&west),
            DedupOutcome::Duplicate {
                kept_key: "obis:1".to_string()
            }
        );

        let exact = obs("argo:1", "argo", "ccc", 10.0, 180.0);
        let wrapped = obs("gbif:2", "gbif", "ddd", 10.0, -180.0);
        assert!(d.offer(&exact).accepted());
        assert!(!d.offer(&wrapped).accepted());
    }

    #[test]
    fn test_already_stored_entries_suppress_near_duplicates() {
        let mut d = dedup(DedupPolicy::LatestWins);
        let stored = obs("obis:1", "obis", "aaa", 30.0, -140.0);
        assert_eq!(d.offer_with(&stored, true), DedupOutcome::AlreadyStored);

        let near = obs("gbif:1", "gbif", "bbb", 30.001, -140.0);
        assert_eq!(d.offer(&near), DedupOutcome::AlreadyStored);
        assert_eq!(d.offer(&stored), DedupOutcome::AlreadyStored);
    }

    #[test]
    fn test_shared_id_records_skip_proximity_matching() {
        let mut d = dedup(DedupPolicy::LatestWins);
        let a = obs("obis:1", "obis", "aaa", 30.0, -140.0);
        let mut b = obs("occ:urn:x", "gbif", "bbb", 30.0, -140.0);
        b.proximity_key = None;
        b.has_shared_id = true;
        assert!(d.offer(&a).accepted());
        assert!(d.offer(&b).accepted());
    }

    #[test]
    fn test_key_index_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observations.jsonl");
        let a = obs("obis:1", "obis", "aaa", 30.0, -140.0);
        serde_jsonlines::write_json_lines(&path, [&a]).unwrap();

        let index = KeyIndex::load(&path).unwrap();
        assert!(index.contains("obis:1"));
        assert!(index.contains("near:30.00:-140.00:2024010510:worms:127027"));
        assert_eq!(index.len(), 2);

        let missing = KeyIndex::load(&dir.path().join("nope.jsonl")).unwrap();
        assert!(missing.is_empty());
    }
}
