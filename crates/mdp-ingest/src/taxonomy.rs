//! Taxonomy resolution
//!
//! The validator only depends on [`TaxonomyResolver`]. The bundled
//! [`StaticTaxonomy`] resolves without I/O at validation time:
//!
//! 1. alias table lookup (case-insensitive, whitespace-normalized)
//! 2. WoRMS LSIDs `urn:lsid:marinespecies.org:taxname:N` become `worms:N`
//! 3. `namespace:id` codes from a trusted namespace are accepted as-is
//!
//! WoRMS is the canonical namespace. A code from any other namespace is only
//! a fallback: the validator prefers whatever the record's name resolves to,
//! so the same animal reported by OBIS (`worms:`) and GBIF (`gbif:`) ends up
//! with one species code.

use anyhow::Context;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use crate::config::TaxonomyConfig;

const WORMS_LSID_PREFIX: &str = "urn:lsid:marinespecies.org:taxname:";

/// Namespace species codes are unified on
pub const CANONICAL_NAMESPACE: &str = "worms";

/// Whether `code` is already in the canonical namespace
pub fn is_canonical(code: &str) -> bool {
    code.split_once(':')
        .map(|(namespace, _)| namespace.eq_ignore_ascii_case(CANONICAL_NAMESPACE))
        .unwrap_or(false)
}

/// Maps a species name or provider code to a canonical species code
pub trait TaxonomyResolver: Send + Sync {
    /// `None` when the name or code is unknown
    fn resolve(&self, name_or_code: &str) -> Option<String>;
}

/// In-memory resolver built from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticTaxonomy {
    aliases: HashMap<String, String>,
    trusted_namespaces: HashSet<String>,
}

fn normalize_key(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl StaticTaxonomy {
    pub fn new<I, S>(trusted_namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            aliases: HashMap::new(),
            trusted_namespaces: trusted_namespaces
                .into_iter()
                .map(|ns| ns.as_ref().to_lowercase())
                .collect(),
        }
    }

    /// Build from the `[taxonomy]` section, reading `alias_file` if set
    pub fn from_config(config: &TaxonomyConfig) -> anyhow::Result<Self> {
        let mut taxonomy = Self::new(&config.trusted_namespaces);
        if let Some(ref path) = config.alias_file {
            taxonomy.load_alias_file(path)?;
        }
        for (alias, code) in &config.aliases {
            taxonomy.add_alias(alias, code);
        }
        Ok(taxonomy)
    }

    pub fn with_alias(mut self, alias: &str, code: &str) -> Self {
        self.add_alias(alias, code);
        self
    }

    pub fn add_alias(&mut self, alias: &str, code: &str) {
        self.aliases.insert(normalize_key(alias), code.trim().to_string());
    }

    /// Merge a JSON object of `alias -> code` pairs
    pub fn load_alias_file(&mut self, path: &Path) -> anyhow::Result<usize> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read alias file {}", path.display()))?;
        let aliases: BTreeMap<String, String> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse alias file {}", path.display()))?;
        let count = aliases.len();
        for (alias, code) in &aliases {
            self.add_alias(alias, code);
        }
        tracing::debug!(path = %path.display(), count, "Loaded taxonomy aliases");
        Ok(count)
    }

    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }

    fn trusted_code(&self, raw: &str) -> Option<String> {
        let (namespace, id) = raw.split_once(':')?;
        let namespace = namespace.trim().to_lowercase();
        let id = id.trim();
        if id.is_empty() || !self.trusted_namespaces.contains(&namespace) {
            return None;
        }
        Some(format!("{}:{}", namespace, id))
    }
}

impl TaxonomyResolver for StaticTaxonomy {
    fn resolve(&self, name_or_code: &str) -> Option<String> {
        let key = normalize_key(name_or_code);
        if key.is_empty() {
            return None;
        }
        if let Some(code) = self.aliases.get(&key) {
            return Some(code.clone());
        }
        if let Some(id) = key.strip_prefix(WORMS_LSID_PREFIX) {
            if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
                let code = format!("worms:{}", id);
                return Some(self.aliases.get(&code).cloned().unwrap_or(code));
            }
            return None;
        }
        self.trusted_code(&key)
    }
}
