//! Configuration management
//!
//! A run is configured once, up front, by a static [`IngestConfig`]. Values are
//! layered with figment: built-in defaults, then an optional TOML file, then
//! `MDP_`-prefixed environment variables (`__` separates nested keys, e.g.
//! `MDP_RUN__MAX_CONCURRENCY=4`). The merged result is checked by
//! [`IngestConfig::validate`] before anything runs.

use anyhow::{bail, Context};
use chrono::NaiveDate;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use mdp_common::types::{BoundingBox, RecordCategory};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

// ============================================================================
// Run Configuration Constants
// ============================================================================

/// Default cap on concurrently running sources.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Default number of fetched pages buffered ahead of validation per source.
pub const DEFAULT_PAGE_BUFFER: usize = 2;

/// Default grace period for in-flight fetches after cancellation, in seconds.
pub const DEFAULT_CANCEL_GRACE_SECS: u64 = 10;

/// Default number of breaker openings tolerated before a source is failed.
pub const DEFAULT_MAX_CIRCUIT_TRIPS: u32 = 3;

// ============================================================================
// Resilience Constants
// ============================================================================

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_COOLDOWN_SECS: u64 = 60;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_RATE_LIMIT_WAITS: u32 = 20;

// ============================================================================
// Validation / Dedup Constants
// ============================================================================

/// Tolerated clock skew for "future" timestamps, in seconds.
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 300;

/// Deepest known ocean point (Challenger Deep), in meters.
pub const DEFAULT_MAX_OCEAN_DEPTH_M: f64 = 11_034.0;

pub const DEFAULT_TOLERANCE_KM: f64 = 1.0;
pub const DEFAULT_TOLERANCE_MINUTES: i64 = 60;

/// Default page size when a source does not set one.
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// GBIF rejects `limit` above this.
pub const GBIF_MAX_PAGE_SIZE: u32 = 300;

pub const DEFAULT_ARGO_WINDOW_DAYS: u32 = 30;

/// Root configuration object
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub run: RunConfig,
    pub resilience: ResilienceConfig,
    pub validation: ValidationConfig,
    pub dedup: DedupConfig,
    pub taxonomy: TaxonomyConfig,
    pub sources: Vec<SourceConfig>,
}

/// Run-level scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Upper bound on sources running at once; effective limit is `min(sources, this)`
    pub max_concurrency: usize,
    /// Pages fetched per source before stopping; unlimited when absent
    pub page_budget: Option<u32>,
    pub page_buffer: usize,
    pub cancel_grace_secs: u64,
    pub max_circuit_trips: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            page_budget: None,
            page_buffer: DEFAULT_PAGE_BUFFER,
            cancel_grace_secs: DEFAULT_CANCEL_GRACE_SECS,
            max_circuit_trips: DEFAULT_MAX_CIRCUIT_TRIPS,
        }
    }
}

impl RunConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

/// Retry, backoff, circuit-breaker and rate-limit settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Add random jitter in `[0, delay/2)`; disable for deterministic schedules
    pub jitter: bool,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub call_timeout_secs: u64,
    pub max_rate_limit_waits: u32,
    /// Token-bucket quota; no client-side limiting when absent
    pub requests_per_minute: Option<u32>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: true,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            max_rate_limit_waits: DEFAULT_MAX_RATE_LIMIT_WAITS,
            requests_per_minute: None,
        }
    }
}

impl ResilienceConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    fn validate(&self, scope: &str) -> anyhow::Result<()> {
        if self.base_delay_ms == 0 {
            bail!("{}: base_delay_ms must be greater than 0", scope);
        }
        if self.max_delay_ms < self.base_delay_ms {
            bail!(
                "{}: max_delay_ms ({}) cannot be less than base_delay_ms ({})",
                scope,
                self.max_delay_ms,
                self.base_delay_ms
            );
        }
        if self.failure_threshold == 0 {
            bail!("{}: failure_threshold must be greater than 0", scope);
        }
        if self.call_timeout_secs == 0 {
            bail!("{}: call_timeout_secs must be greater than 0", scope);
        }
        if self.requests_per_minute == Some(0) {
            bail!("{}: requests_per_minute must be greater than 0 when set", scope);
        }
        Ok(())
    }
}

/// Inclusive plausible range for a parameter, in its canonical unit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Region with a known maximum depth
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthRegion {
    pub name: String,
    pub bbox: BoundingBox,
    pub max_depth_m: f64,
}

/// Validator rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub clock_skew_secs: i64,
    pub earliest_date: NaiveDate,
    /// Provider-typical ranges by parameter name
    pub typical_ranges: BTreeMap<String, ValueRange>,
    pub max_ocean_depth_m: f64,
    pub depth_regions: Vec<DepthRegion>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            clock_skew_secs: DEFAULT_CLOCK_SKEW_SECS,
            earliest_date: NaiveDate::from_ymd_opt(1800, 1, 1).unwrap_or_default(),
            typical_ranges: default_typical_ranges(),
            max_ocean_depth_m: DEFAULT_MAX_OCEAN_DEPTH_M,
            depth_regions: Vec::new(),
        }
    }
}

fn default_typical_ranges() -> BTreeMap<String, ValueRange> {
    [
        ("wave_height", ValueRange::new(0.0, 30.0)),
        ("water_temperature", ValueRange::new(-2.5, 40.0)),
        ("temperature", ValueRange::new(-2.5, 40.0)),
        ("air_temperature", ValueRange::new(-60.0, 60.0)),
        ("salinity", ValueRange::new(0.0, 42.0)),
        ("wind_speed", ValueRange::new(0.0, 80.0)),
        ("wind_gust", ValueRange::new(0.0, 100.0)),
        ("air_pressure", ValueRange::new(850.0, 1090.0)),
        ("dominant_wave_period", ValueRange::new(0.0, 30.0)),
    ]
    .into_iter()
    .map(|(name, range)| (name.to_string(), range))
    .collect()
}

/// Collision policy for natural keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    #[default]
    LatestWins,
    FirstWins,
}

/// Deduplicator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub policy: DedupPolicy,
    pub tolerance_km: f64,
    pub tolerance_minutes: i64,
    /// Enable best-effort near-duplicate matching for records without a shared id
    pub near_duplicates: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            policy: DedupPolicy::LatestWins,
            tolerance_km: DEFAULT_TOLERANCE_KM,
            tolerance_minutes: DEFAULT_TOLERANCE_MINUTES,
            near_duplicates: true,
        }
    }
}

impl DedupConfig {
    pub fn tolerance(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.tolerance_minutes)
    }
}

/// Settings for the bundled static taxonomy resolver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxonomyConfig {
    /// Name or code -> canonical species code
    pub aliases: BTreeMap<String, String>,
    /// JSON object file with more aliases
    pub alias_file: Option<PathBuf>,
    /// Code namespaces accepted as-is (e.g. `worms:127160`)
    pub trusted_namespaces: Vec<String>,
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        Self {
            aliases: BTreeMap::new(),
            alias_file: None,
            trusted_namespaces: vec!["worms".to_string(), "gbif".to_string(), "itis".to_string()],
        }
    }
}

/// Provider protocol implemented by an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Obis,
    Gbif,
    Ndbc,
    Argo,
}

impl SourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            SourceKind::Obis => "obis",
            SourceKind::Gbif => "gbif",
            SourceKind::Ndbc => "ndbc",
            SourceKind::Argo => "argo",
        }
    }

    /// Kind of record the provider publishes
    pub fn category(&self) -> RecordCategory {
        match self {
            SourceKind::Obis | SourceKind::Gbif => RecordCategory::Occurrence,
            SourceKind::Ndbc => RecordCategory::Sensor,
            SourceKind::Argo => RecordCategory::Profile,
        }
    }

    /// Units the provider documents for measurements it publishes without unit metadata
    pub fn documented_units(&self) -> BTreeMap<String, String> {
        let pairs: &[(&str, &str)] = match self {
            SourceKind::Argo => &[("temperature", "degC"), ("salinity", "psu")],
            SourceKind::Ndbc => &[
                ("wind_speed", "m/s"),
                ("wind_gust", "m/s"),
                ("wave_height", "m"),
                ("air_pressure", "hPa"),
                ("air_temperature", "degC"),
                ("water_temperature", "degC"),
            ],
            SourceKind::Obis | SourceKind::Gbif => &[],
        };
        pairs
            .iter()
            .map(|(p, u)| (p.to_string(), u.to_string()))
            .collect()
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query region and date range for a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFilter {
    #[serde(default = "BoundingBox::world")]
    pub bbox: BoundingBox,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Fixed station of a sensor network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// One registered source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub kind: SourceKind,
    pub base_url: String,
    pub filter: SourceFilter,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Appended verbatim to every request
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
    /// Replaces the global resilience section for this source
    #[serde(default)]
    pub resilience: Option<ResilienceConfig>,
    /// Overrides the provider's documented units
    #[serde(default)]
    pub default_units: BTreeMap<String, String>,
    /// Overrides the global typical ranges for this source
    #[serde(default)]
    pub typical_ranges: BTreeMap<String, ValueRange>,
    /// Sensor stations (ndbc)
    #[serde(default)]
    pub stations: Vec<StationConfig>,
    /// Date window per request (argo)
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_window_days() -> u32 {
    DEFAULT_ARGO_WINDOW_DAYS
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    /// Resilience settings in effect for this source
    pub fn effective_resilience<'a>(&'a self, global: &'a ResilienceConfig) -> &'a ResilienceConfig {
        self.resilience.as_ref().unwrap_or(global)
    }

    /// Documented units merged with configured overrides
    pub fn effective_units(&self) -> BTreeMap<String, String> {
        let mut units = self.kind.documented_units();
        units.extend(self.default_units.clone());
        units
    }

    pub fn parsed_base_url(&self) -> anyhow::Result<Url> {
        let url = Url::parse(&self.base_url)
            .with_context(|| format!("source '{}': invalid base_url '{}'", self.id, self.base_url))?;
        if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
            bail!("source '{}': base_url must be an http(s) URL", self.id);
        }
        Ok(url)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.id.trim().is_empty() {
            bail!("source id cannot be empty");
        }
        self.parsed_base_url()?;
        self.filter
            .bbox
            .validate()
            .with_context(|| format!("source '{}': invalid bbox", self.id))?;
        if self.filter.start_date > self.filter.end_date {
            bail!(
                "source '{}': start_date ({}) is after end_date ({})",
                self.id,
                self.filter.start_date,
                self.filter.end_date
            );
        }
        if self.page_size == 0 {
            bail!("source '{}': page_size must be greater than 0", self.id);
        }
        if self.kind == SourceKind::Gbif && self.page_size > GBIF_MAX_PAGE_SIZE {
            bail!(
                "source '{}': gbif page_size cannot exceed {}",
                self.id,
                GBIF_MAX_PAGE_SIZE
            );
        }
        if self.kind == SourceKind::Ndbc && self.stations.is_empty() {
            bail!("source '{}': ndbc sources need at least one station", self.id);
        }
        if self.kind == SourceKind::Argo && self.window_days == 0 {
            bail!("source '{}': window_days must be greater than 0", self.id);
        }
        for station in &self.stations {
            if !(-90.0..=90.0).contains(&station.latitude)
                || !(-180.0..=180.0).contains(&station.longitude)
            {
                bail!(
                    "source '{}': station '{}' has out-of-range coordinates",
                    self.id,
                    station.id
                );
            }
        }
        validate_ranges(&self.typical_ranges, &self.id)?;
        if let Some(ref resilience) = self.resilience {
            resilience.validate(&format!("source '{}'", self.id))?;
        }
        Ok(())
    }
}

fn validate_ranges(ranges: &BTreeMap<String, ValueRange>, scope: &str) -> anyhow::Result<()> {
    for (name, range) in ranges {
        if range.min > range.max {
            bail!(
                "{}: typical range for '{}' has min ({}) > max ({})",
                scope,
                name,
                range.min,
                range.max
            );
        }
    }
    Ok(())
}

impl IngestConfig {
    /// Load configuration from defaults, an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut figment = Figment::from(Serialized::defaults(IngestConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            figment = figment.merge(Toml::file(path));
        }
        let config: IngestConfig = figment
            .merge(Env::prefixed("MDP_").split("__"))
            .extract()
            .context("Failed to parse ingestion configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Sources that take part in a run
    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.run.max_concurrency == 0 {
            bail!("run.max_concurrency must be greater than 0");
        }
        if self.run.page_buffer == 0 {
            bail!("run.page_buffer must be greater than 0");
        }
        if self.run.page_budget == Some(0) {
            bail!("run.page_budget must be greater than 0 when set");
        }

        self.resilience.validate("resilience")?;

        if self.validation.clock_skew_secs < 0 {
            bail!("validation.clock_skew_secs cannot be negative");
        }
        if self.validation.max_ocean_depth_m <= 0.0 {
            bail!("validation.max_ocean_depth_m must be positive");
        }
        validate_ranges(&self.validation.typical_ranges, "validation")?;
        for region in &self.validation.depth_regions {
            region
                .bbox
                .validate()
                .with_context(|| format!("depth region '{}': invalid bbox", region.name))?;
        }

        if self.dedup.tolerance_km.is_nan() || self.dedup.tolerance_km <= 0.0 {
            bail!("dedup.tolerance_km must be positive");
        }
        if self.dedup.tolerance_minutes <= 0 {
            bail!("dedup.tolerance_minutes must be positive");
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.id.as_str()) {
                bail!("Duplicate source id '{}'", source.id);
            }
            source.validate()?;
        }

        if self.enabled_sources().next().is_none() {
            tracing::warn!("No enabled sources configured - a run will complete immediately");
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn source(id: &str, kind: SourceKind) -> SourceConfig {
        SourceConfig {
            id: id.to_string(),
            kind,
            base_url: "https://api.example.org/v3".to_string(),
            filter: SourceFilter {
                bbox: BoundingBox::new(-150.0, -120.0, 20.0, 50.0),
                start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            },
            page_size: 100,
            extra_params: BTreeMap::new(),
            resilience: None,
            default_units: BTreeMap::new(),
            typical_ranges: BTreeMap::new(),
            stations: vec![StationConfig {
                id: "46042".to_string(),
                latitude: 36.785,
                longitude: -122.398,
            }],
            window_days: 30,
            enabled: true,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.resilience.max_retries, 3);
        assert_eq!(config.resilience.base_delay(), Duration::from_millis(500));
        assert_eq!(config.dedup.policy, DedupPolicy::LatestWins);
        assert_eq!(config.validation.earliest_date.to_string(), "1800-01-01");
    }

    #[test]
    fn test_duplicate_source_ids_rejected() {
        let config = IngestConfig {
            sources: vec![source("obis", SourceKind::Obis), source("obis", SourceKind::Gbif)],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate source id"));
    }

    #[test]
    fn test_source_validation() {
        let mut bad_dates = source("obis", SourceKind::Obis);
        bad_dates.filter.start_date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        assert!(bad_dates.validate().is_err());

        let mut big_gbif = source("gbif", SourceKind::Gbif);
        big_gbif.page_size = 1000;
        assert!(big_gbif.validate().is_err());

        let mut no_stations = source("ndbc", SourceKind::Ndbc);
        no_stations.stations.clear();
        assert!(no_stations.validate().is_err());

        let mut bad_url = source("argo", SourceKind::Argo);
        bad_url.base_url = "ftp://example.org".to_string();
        assert!(bad_url.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = IngestConfig::default();
        config.run.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_units_merge_overrides() {
        let mut argo = source("argo", SourceKind::Argo);
        argo.default_units
            .insert("temperature".to_string(), "degF".to_string());
        let units = argo.effective_units();
        assert_eq!(units["temperature"], "degF");
        assert_eq!(units["salinity"], "psu");
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[run]
max_concurrency = 2

[dedup]
policy = "first_wins"

[[sources]]
id = "obis"
kind = "obis"
base_url = "https://api.obis.org/v3"
page_size = 200

[sources.filter]
start_date = "2024-01-01"
end_date = "2024-01-31"
bbox = {{ west = -150.0, east = -120.0, south = 20.0, north = 50.0 }}
"#
        )
        .unwrap();

        let config = IngestConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.run.max_concurrency, 2);
        assert_eq!(config.run.page_buffer, DEFAULT_PAGE_BUFFER);
        assert_eq!(config.dedup.policy, DedupPolicy::FirstWins);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].kind, SourceKind::Obis);
        assert_eq!(config.sources[0].window_days, DEFAULT_ARGO_WINDOW_DAYS);
        assert!(config.validation.typical_ranges.contains_key("wave_height"));
    }

    #[test]
    fn test_missing_config_file() {
        assert!(IngestConfig::load(Some(Path::new("/nonexistent/mdp.toml"))).is_err());
    }
}
