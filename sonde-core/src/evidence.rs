//! Claim-to-source evidence tracking.
//!
//! The `EvidenceIndex` maps normalized claim text to the set of sources
//! supporting it. It is append-only for the lifetime of a task: report
//! text gets rewritten freely across rounds and refinement iterations,
//! but recorded evidence never shrinks, so citations stay stable while
//! the prose churns. Shared across concurrent synthesis branches via
//! interior mutability.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::types::SourceRef;

/// Stable ordinal id for a registered source, rendered as `S1`, `S2`, ...
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct SourceId(pub u32);

impl SourceId {
    pub fn label(&self) -> String {
        format!("S{}", self.0)
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// A source as registered in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredSource {
    pub id: SourceId,
    pub title: String,
    pub url: String,
}

/// One claim and the sources supporting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceEntry {
    /// Claim text as first recorded (normalization only affects keying).
    pub claim: String,
    pub source_ids: BTreeSet<SourceId>,
}

/// Immutable citation snapshot for rendering. Entries appear in
/// first-recorded order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EvidenceSnapshot {
    pub entries: Vec<EvidenceEntry>,
    pub sources: Vec<RegisteredSource>,
}

impl EvidenceSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn source(&self, id: SourceId) -> Option<&RegisteredSource> {
        self.sources.iter().find(|s| s.id == id)
    }
}

#[derive(Default)]
struct IndexInner {
    sources: Vec<RegisteredSource>,
    by_url: HashMap<String, SourceId>,
    entries: Vec<EvidenceEntry>,
    by_claim: HashMap<String, usize>,
}

/// Append-only claim-to-source index.
#[derive(Default)]
pub struct EvidenceIndex {
    inner: Mutex<IndexInner>,
}

impl EvidenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source, deduplicating by URL, and return its stable id.
    /// Sources without a URL are deduplicated by title instead.
    pub fn register_source(&self, source: &SourceRef) -> SourceId {
        let mut inner = self.inner.lock().unwrap();
        let key = if source.url.is_empty() {
            format!("title:{}", source.title)
        } else {
            source.url.clone()
        };
        if let Some(id) = inner.by_url.get(&key) {
            return *id;
        }
        let id = SourceId(inner.sources.len() as u32 + 1);
        inner.sources.push(RegisteredSource {
            id,
            title: source.title.clone(),
            url: source.url.clone(),
        });
        inner.by_url.insert(key, id);
        id
    }

    /// Record a claim with its supporting sources.
    ///
    /// Keyed by normalized claim text: re-recording the same claim (in
    /// any punctuation or casing) merges source ids into the existing
    /// entry. Recording is idempotent; entries are never removed.
    pub fn record(&self, claim: &str, source_ids: &[SourceId]) {
        let key = normalize_claim(claim);
        if key.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.by_claim.get(&key) {
            Some(&idx) => {
                inner.entries[idx].source_ids.extend(source_ids.iter());
            }
            None => {
                let idx = inner.entries.len();
                inner.entries.push(EvidenceEntry {
                    claim: claim.trim().to_string(),
                    source_ids: source_ids.iter().copied().collect(),
                });
                inner.by_claim.insert(key, idx);
            }
        }
    }

    /// Sources currently recorded for a claim, if any.
    pub fn sources_for(&self, claim: &str) -> Option<BTreeSet<SourceId>> {
        let key = normalize_claim(claim);
        let inner = self.inner.lock().unwrap();
        inner
            .by_claim
            .get(&key)
            .map(|&idx| inner.entries[idx].source_ids.clone())
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn source_count(&self) -> usize {
        self.inner.lock().unwrap().sources.len()
    }

    /// Clone out an immutable snapshot for report rendering.
    pub fn snapshot(&self) -> EvidenceSnapshot {
        let inner = self.inner.lock().unwrap();
        EvidenceSnapshot {
            entries: inner.entries.clone(),
            sources: inner.sources.clone(),
        }
    }
}

/// Normalize claim text for keying: lowercase, punctuation stripped,
/// whitespace collapsed.
pub fn normalize_claim(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}
