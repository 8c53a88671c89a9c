//! The alias dictionary: surface form → canonical concept name.
//!
//! Entries are append-only. Stages 1 and 2 add them automatically
//! (parenthesis definitions, accepted links); Stage 8 adds them through
//! feedback, including negative entries that block a resolution in one
//! document's context. Resolution is most-recent wins, confidence breaking
//! ties, with document-local entries taking precedence over global ones.
//!
//! A running ingestion must see a consistent dictionary, so readers take an
//! immutable [`AliasSnapshot`] up front; writers copy-on-write and swap. New
//! entries therefore take effect on the next build, never mid-run.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One dictionary row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasEntry {
    pub surface_form: String,
    /// Target concept name. For a negative entry, the name the surface must
    /// no longer resolve to.
    pub canonical: String,
    /// Present for document-local aliases (and for negative entries, which
    /// are always document-scoped).
    pub doc_id: Option<String>,
    pub confidence: f32,
    #[serde(default)]
    pub negative: bool,
    pub created_at: DateTime<Utc>,
}

impl AliasEntry {
    pub fn global(surface: impl Into<String>, canonical: impl Into<String>, confidence: f32) -> Self {
        AliasEntry {
            surface_form: surface.into(),
            canonical: canonical.into(),
            doc_id: None,
            confidence,
            negative: false,
            created_at: Utc::now(),
        }
    }

    pub fn local(
        surface: impl Into<String>,
        canonical: impl Into<String>,
        doc_id: impl Into<String>,
        confidence: f32,
    ) -> Self {
        AliasEntry {
            doc_id: Some(doc_id.into()),
            ..AliasEntry::global(surface, canonical, confidence)
        }
    }

    /// A blocking entry produced by `unlink` feedback.
    pub fn negative(
        surface: impl Into<String>,
        canonical: impl Into<String>,
        doc_id: impl Into<String>,
    ) -> Self {
        AliasEntry {
            negative: true,
            ..AliasEntry::local(surface, canonical, doc_id, 1.0)
        }
    }
}

fn normalize_surface(surface: &str) -> String {
    surface.trim().to_lowercase()
}

/// Immutable view of the dictionary held for the duration of one build.
#[derive(Debug, Default, Clone)]
pub struct AliasSnapshot {
    by_surface: FxHashMap<String, Vec<AliasEntry>>,
}

impl AliasSnapshot {
    /// Resolve a surface form to its canonical concept name.
    ///
    /// Document-local entries for `doc_id` outrank global ones; within a
    /// scope the newest entry wins, with confidence breaking timestamp ties.
    /// A matching negative entry vetoes the canonical it names.
    pub fn resolve(&self, surface: &str, doc_id: Option<&str>) -> Option<&AliasEntry> {
        let entries = self.by_surface.get(&normalize_surface(surface))?;
        let in_scope = |entry: &AliasEntry| {
            entry.doc_id.is_none() || entry.doc_id.as_deref() == doc_id
        };
        let vetoed = |entry: &AliasEntry| {
            entries.iter().any(|other| {
                other.negative
                    && other.canonical == entry.canonical
                    && other.doc_id.as_deref() == doc_id
                    && other.created_at >= entry.created_at
            })
        };
        entries
            .iter()
            .filter(|entry| !entry.negative && in_scope(entry) && !vetoed(entry))
            .max_by(|a, b| {
                let scope_a = a.doc_id.is_some();
                let scope_b = b.doc_id.is_some();
                scope_a
                    .cmp(&scope_b)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(
                        a.confidence
                            .partial_cmp(&b.confidence)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
            })
    }

    /// All surface forms, for the linker's mention detector.
    pub fn surfaces(&self) -> impl Iterator<Item = &str> {
        self.by_surface
            .values()
            .flat_map(|entries| entries.iter())
            .filter(|entry| !entry.negative)
            .map(|entry| entry.surface_form.as_str())
    }

    /// Every entry pointing at `canonical` (used by merge feedback).
    pub fn entries_for_canonical(&self, canonical: &str) -> Vec<AliasEntry> {
        self.by_surface
            .values()
            .flat_map(|entries| entries.iter())
            .filter(|entry| entry.canonical == canonical && !entry.negative)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_surface.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_surface.is_empty()
    }
}

/// The shared, versioned dictionary handle.
#[derive(Debug, Default, Clone)]
pub struct AliasDictionary {
    inner: Arc<RwLock<Arc<AliasSnapshot>>>,
}

impl AliasDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// The snapshot a build should hold for its whole run.
    pub fn snapshot(&self) -> Arc<AliasSnapshot> {
        self.inner.read().clone()
    }

    /// Append entries; visible to snapshots taken after this call.
    pub fn insert_all(&self, entries: impl IntoIterator<Item = AliasEntry>) {
        let mut guard = self.inner.write();
        let mut next = (**guard).clone();
        for entry in entries {
            next.by_surface
                .entry(normalize_surface(&entry.surface_form))
                .or_default()
                .push(entry);
        }
        *guard = Arc::new(next);
    }

    pub fn insert(&self, entry: AliasEntry) {
        self.insert_all([entry]);
    }

    /// Merge feedback: re-point every alias of `source` at `target` by
    /// appending fresher rows (the dictionary itself stays append-only).
    pub fn repoint_canonical(&self, source: &str, target: &str) {
        let snapshot = self.snapshot();
        let repointed: Vec<AliasEntry> = snapshot
            .entries_for_canonical(source)
            .into_iter()
            .map(|mut entry| {
                entry.canonical = target.to_string();
                entry.created_at = Utc::now();
                entry
            })
            .collect();
        // The old name itself becomes an alias of the survivor.
        let mut entries = repointed;
        entries.push(AliasEntry::global(source, target, 1.0));
        self.insert_all(entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_latest_entry() {
        let dict = AliasDictionary::new();
        dict.insert(AliasEntry::global("ai", "Artificial Intelligence", 0.7));
        dict.insert(AliasEntry::global("ai", "人工智能", 0.9));
        let snapshot = dict.snapshot();
        assert_eq!(snapshot.resolve("AI", None).unwrap().canonical, "人工智能");
    }

    #[test]
    fn local_entries_outrank_global() {
        let dict = AliasDictionary::new();
        dict.insert(AliasEntry::global("transformer", "Transformer (model)", 0.9));
        dict.insert(AliasEntry::local("transformer", "Transformer (film)", "doc-9", 0.6));
        let snapshot = dict.snapshot();
        assert_eq!(
            snapshot.resolve("transformer", Some("doc-9")).unwrap().canonical,
            "Transformer (film)"
        );
        assert_eq!(
            snapshot.resolve("transformer", Some("doc-1")).unwrap().canonical,
            "Transformer (model)"
        );
    }

    #[test]
    fn negative_entry_blocks_in_its_document_only() {
        let dict = AliasDictionary::new();
        dict.insert(AliasEntry::global("bert", "BERT", 0.9));
        dict.insert(AliasEntry::negative("bert", "BERT", "doc-3"));
        let snapshot = dict.snapshot();
        assert!(snapshot.resolve("bert", Some("doc-3")).is_none());
        assert!(snapshot.resolve("bert", Some("doc-4")).is_some());
        assert!(snapshot.resolve("bert", None).is_some());
    }

    #[test]
    fn snapshots_are_immutable_under_writes() {
        let dict = AliasDictionary::new();
        dict.insert(AliasEntry::global("gpt", "GPT", 0.9));
        let before = dict.snapshot();
        dict.insert(AliasEntry::global("llm", "Large Language Model", 0.9));
        assert_eq!(before.len(), 1);
        assert_eq!(dict.snapshot().len(), 2);
    }

    #[test]
    fn repoint_moves_aliases_and_old_name() {
        let dict = AliasDictionary::new();
        dict.insert(AliasEntry::global("vit", "Vision Transformer", 0.8));
        dict.repoint_canonical("Vision Transformer", "ViT");
        let snapshot = dict.snapshot();
        assert_eq!(snapshot.resolve("vit", None).unwrap().canonical, "ViT");
        assert_eq!(
            snapshot.resolve("Vision Transformer", None).unwrap().canonical,
            "ViT"
        );
    }
}
