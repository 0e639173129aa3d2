//! Translation between canonical dotted tool names and the flattened names
//! model providers accept (`[A-Za-z0-9_-]` only).
//!
//! The forward direction flattens structurally. When two registered names
//! flatten to the same string, the ones that changed under flattening get a
//! short hash of their canonical name appended, so every registered name has
//! its own provider name. The reverse direction first tries exact inverses
//! over the registry, then a bounded similarity search, and finally the
//! naive inverse. Every non-exact decision is logged.

use crate::registry::ToolRegistry;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Minimum similarity for a fuzzy reverse match to be accepted.
pub const SIMILARITY_THRESHOLD: f64 = 0.8;

/// Second-level store for name translations shared between processes.
pub trait NameCache: Send + Sync {
    fn get(&self, flat: &str) -> Option<String>;
    fn put(&self, flat: &str, canonical: &str);
}

/// How a flattened name was resolved back to a canonical one.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Inverse of a registered name.
    Exact,
    /// Similarity match above the threshold.
    Fuzzy { score: f64 },
    /// Naive inverse of an unregistered name.
    Fallback,
}

pub struct NameMapper {
    registry: Arc<ToolRegistry>,
    // flat -> canonical, filled by `to_provider`
    memo: RwLock<HashMap<String, String>>,
    external: Option<Arc<dyn NameCache>>,
}

impl NameMapper {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            memo: RwLock::new(HashMap::new()),
            external: None,
        }
    }

    pub fn with_external_cache(mut self, cache: Arc<dyn NameCache>) -> Self {
        self.external = Some(cache);
        self
    }

    /// Canonical → provider-safe name, unique among registered tools.
    pub fn to_provider(&self, canonical: &str) -> String {
        let flat = self.assign(canonical, &self.registry.names());
        self.memo
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(flat.clone(), canonical.to_string());
        if let Some(cache) = &self.external {
            cache.put(&flat, canonical);
        }
        flat
    }

    /// Provider name for `canonical` given the registered `names`. A name
    /// that already maps to itself, or that was handed out before, keeps
    /// its plain flattening.
    fn assign(&self, canonical: &str, names: &[String]) -> String {
        let plain = flatten(canonical);
        if plain == canonical {
            return plain;
        }
        let owner = self
            .memo
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&plain)
            .cloned();
        let taken = match owner {
            Some(owner) => owner != canonical,
            None => {
                self.registry.has(&plain)
                    || names.iter().any(|n| n != canonical && flatten(n) == plain)
            }
        };
        if taken {
            let flat = disambiguate(&plain, canonical);
            debug!(canonical, flat = %flat, "Provider name collision, added suffix");
            flat
        } else {
            plain
        }
    }

    /// Provider-safe → canonical name.
    pub fn to_canonical(&self, flat: &str) -> String {
        self.resolve(flat).0
    }

    /// Like [`to_canonical`](Self::to_canonical), also reporting how the name was found.
    pub fn resolve(&self, flat: &str) -> (String, Resolution) {
        if self.registry.has(flat) {
            return (flat.to_string(), Resolution::Exact);
        }

        let remembered = self
            .memo
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(flat)
            .cloned()
            .or_else(|| self.external.as_ref().and_then(|c| c.get(flat)));
        if let Some(canonical) = remembered {
            if self.registry.has(&canonical) {
                return (canonical, Resolution::Exact);
            }
        }

        let names = self.registry.names();
        if let Some(canonical) = names.iter().find(|n| self.assign(n, &names) == flat) {
            self.remember(flat, canonical);
            return (canonical.clone(), Resolution::Exact);
        }

        let naive = naive_inverse(flat);
        if self.registry.has(&naive) {
            self.remember(flat, &naive);
            return (naive, Resolution::Exact);
        }

        if let Some((candidate, score)) = best_match(flat, &names) {
            warn!(
                requested = flat,
                resolved = %candidate,
                score,
                "Recovered tool name by similarity"
            );
            return (candidate, Resolution::Fuzzy { score });
        }

        warn!(
            requested = flat,
            fallback = %naive,
            "Tool name not registered, using naive inverse"
        );
        (naive, Resolution::Fallback)
    }

    fn remember(&self, flat: &str, canonical: &str) {
        debug!(flat, canonical, "Cached reverse name mapping");
        self.memo
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(flat.to_string(), canonical.to_string());
        if let Some(cache) = &self.external {
            cache.put(flat, canonical);
        }
    }
}

/// Deterministic structural transform: `.` and any other unsafe character
/// become `_`.
pub fn flatten(canonical: &str) -> String {
    canonical
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// `plain` plus the first six hex digits of the SHA-256 of `canonical`.
fn disambiguate(plain: &str, canonical: &str) -> String {
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{plain}_{:02x}{:02x}{:02x}", digest[0], digest[1], digest[2])
}

/// First `_` becomes the namespace separator.
fn naive_inverse(flat: &str) -> String {
    flat.replacen('_', ".", 1)
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn tokens(name: &str) -> BTreeSet<String> {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
        .collect()
}

/// Similarity in `[0, 1]`: the better of the containment ratio of the
/// normalized names and the Dice coefficient of their tokens.
pub fn similarity(a: &str, b: &str) -> f64 {
    let (na, nb) = (normalize(a), normalize(b));
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    if na == nb {
        return 1.0;
    }

    let (short, long) = if na.len() <= nb.len() { (&na, &nb) } else { (&nb, &na) };
    let containment = if long.contains(short.as_str()) {
        short.len() as f64 / long.len() as f64
    } else {
        0.0
    };

    let (ta, tb) = (tokens(a), tokens(b));
    let overlap = if ta.is_empty() || tb.is_empty() {
        0.0
    } else {
        let shared = ta.intersection(&tb).count() as f64;
        2.0 * shared / (ta.len() + tb.len()) as f64
    };

    containment.max(overlap)
}

fn best_match(flat: &str, names: &[String]) -> Option<(String, f64)> {
    let mut best: Option<(String, f64)> = None;
    // `names` is sorted, so strict `>` keeps the lexicographically first on ties
    for name in names {
        let score = similarity(flat, name);
        if score < SIMILARITY_THRESHOLD {
            continue;
        }
        if best.as_ref().map_or(true, |(_, s)| score > *s) {
            best = Some((name.clone(), score));
        }
    }
    best
}
