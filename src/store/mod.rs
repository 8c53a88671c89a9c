//! Property-graph storage backends.
//!
//! The [`GraphStore`] trait is the crate's distillation of the store
//! contract: labeled nodes, typed edges, property maps, uniqueness
//! constraints, vector similarity over node embeddings, and
//! delete-by-build-version. All mutation flows through [`GraphStore::apply`]
//! with a [`WriteBatch`], which commits atomically; per-document
//! transactions and rollback purity both hang off that guarantee.
//!
//! MERGE semantics are implemented once, in [`plan_batch`], and shared by
//! every backend: a batch is resolved against committed state (plus its own
//! pending writes) into plain inserts/updates. Uniqueness constraints
//! arbitrate concurrent writers: when a merge collides with an existing
//! unique value, the op is re-pointed at the surviving node and every later
//! edge in the batch follows via the remap table.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::model::{JsonMap, NodeLabel};
use crate::text::short_hash;

pub use memory::MemoryGraphStore;
pub use sqlite::SqliteGraphStore;

/// Backend failure. `Transient` is retried by the graph service under its
/// backoff budget; everything else fails the document transaction.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("store error: {0}")]
    Backend(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("corrupt graph data: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

// ── Records ────────────────────────────────────────────────────────────

/// A stored node. `props` holds everything except the embedding, which
/// backends keep in their vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: String,
    pub label: NodeLabel,
    pub props: JsonMap,
    pub build_version: String,
}

impl NodeRecord {
    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(Value::as_str)
    }

    pub fn prop_f64(&self, key: &str) -> Option<f64> {
        self.props.get(key).and_then(Value::as_f64)
    }

    pub fn prop_strings(&self, key: &str) -> Vec<String> {
        self.props
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A stored edge. Identity is `(src, kind, dst)` plus an optional
/// disambiguator (two MENTIONS of the same concept in one chunk differ only
/// by their sentence spans).
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRecord {
    pub key: String,
    pub src: String,
    pub kind: String,
    pub dst: String,
    pub disambiguator: Option<String>,
    pub props: JsonMap,
    pub build_version: String,
}

impl EdgeRecord {
    pub fn new(
        src: impl Into<String>,
        kind: impl Into<String>,
        dst: impl Into<String>,
        disambiguator: Option<String>,
        props: JsonMap,
        build_version: impl Into<String>,
    ) -> Self {
        let src = src.into();
        let kind = kind.into();
        let dst = dst.into();
        let key = Self::identity(&src, &kind, &dst, disambiguator.as_deref());
        EdgeRecord {
            key,
            src,
            kind,
            dst,
            disambiguator,
            props,
            build_version: build_version.into(),
        }
    }

    pub fn identity(src: &str, kind: &str, dst: &str, disambiguator: Option<&str>) -> String {
        short_hash(&[src, kind, dst, disambiguator.unwrap_or("")])
    }
}

/// Traversal direction for [`GraphStore::neighbors`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
    Both,
}

// ── Write batches ──────────────────────────────────────────────────────

/// One mutation in a batch. Everything is a merge; plain inserts do not
/// exist at this layer.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Merge a node by id, falling back to the label's uniqueness
    /// constraints. `union_props` names array-valued props that are unioned
    /// instead of overwritten on match (claim `sentence_ids`).
    MergeNode {
        node: NodeRecord,
        union_props: Vec<String>,
        embedding: Option<Vec<f32>>,
    },
    /// Merge an edge by its identity key. Endpoints are translated through
    /// the batch's remap table before the key is computed.
    MergeEdge { edge: EdgeRecord },
    /// Overwrite individual props on an existing node.
    SetNodeProps { id: String, props: JsonMap },
}

/// An atomic unit of graph mutation; applied in order, all or nothing.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge_node(&mut self, node: NodeRecord, embedding: Option<Vec<f32>>) {
        self.ops.push(WriteOp::MergeNode {
            node,
            union_props: Vec::new(),
            embedding,
        });
    }

    pub fn merge_node_union(
        &mut self,
        node: NodeRecord,
        union_props: Vec<String>,
        embedding: Option<Vec<f32>>,
    ) {
        self.ops.push(WriteOp::MergeNode {
            node,
            union_props,
            embedding,
        });
    }

    pub fn merge_edge(&mut self, edge: EdgeRecord) {
        self.ops.push(WriteOp::MergeEdge { edge });
    }

    pub fn set_node_props(&mut self, id: impl Into<String>, props: JsonMap) {
        self.ops.push(WriteOp::SetNodeProps {
            id: id.into(),
            props,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// What a committed batch did, including the id remaps forced by
/// uniqueness constraints (proposed id → surviving id).
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub nodes_inserted: usize,
    pub nodes_updated: usize,
    pub edges_inserted: usize,
    pub edges_updated: usize,
    pub remapped: FxHashMap<String, String>,
}

/// Rollback result for one build version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub nodes_deleted: usize,
    pub edges_deleted: usize,
    /// Nodes of the purged version kept alive because other builds still
    /// hold edges to them.
    pub nodes_retained: usize,
}

/// Node/edge totals, by label.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GraphCounts {
    pub nodes: usize,
    pub edges: usize,
    pub nodes_by_label: BTreeMap<String, usize>,
}

// ── The store contract ─────────────────────────────────────────────────

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Atomically apply a batch with MERGE semantics. Either every op
    /// commits or none do.
    async fn apply(&self, batch: WriteBatch) -> Result<BatchOutcome, StoreError>;

    async fn get_node(&self, id: &str) -> Result<Option<NodeRecord>, StoreError>;

    /// Look a node up by a (label, prop, value) triple, the read side of a
    /// uniqueness constraint.
    async fn find_node(
        &self,
        label: NodeLabel,
        prop: &str,
        value: &str,
    ) -> Result<Option<NodeRecord>, StoreError>;

    async fn nodes_by_label(&self, label: NodeLabel) -> Result<Vec<NodeRecord>, StoreError>;

    async fn get_edge(&self, key: &str) -> Result<Option<EdgeRecord>, StoreError>;

    /// Edges incident to `id`, filtered by kind when `kinds` is non-empty.
    async fn neighbors(
        &self,
        id: &str,
        kinds: &[String],
        direction: Direction,
    ) -> Result<Vec<(EdgeRecord, NodeRecord)>, StoreError>;

    async fn edges_by_kind(&self, kind: &str) -> Result<Vec<EdgeRecord>, StoreError>;

    async fn node_embedding(&self, id: &str) -> Result<Option<Vec<f32>>, StoreError>;

    /// Exact cosine top-k over the embeddings of `label` nodes.
    async fn vector_search(
        &self,
        label: NodeLabel,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(NodeRecord, f32)>, StoreError>;

    /// Number of edges (either direction) touching the node.
    async fn degree(&self, id: &str) -> Result<usize, StoreError>;

    /// Delete everything stamped with `build_version`, retaining nodes that
    /// other builds still reference through surviving edges.
    async fn delete_build_version(&self, build_version: &str) -> Result<PurgeReport, StoreError>;

    /// Hard-delete nodes (orphan cleanup). Incident edges go with them.
    async fn delete_nodes(&self, ids: &[String]) -> Result<usize, StoreError>;

    async fn delete_edge(&self, key: &str) -> Result<bool, StoreError>;

    async fn counts(&self) -> Result<GraphCounts, StoreError>;
}

// ── Shared MERGE planner ───────────────────────────────────────────────

/// A batch resolved into concrete writes; backends execute these verbatim
/// inside their transaction.
#[derive(Debug, Clone)]
pub enum ResolvedOp {
    InsertNode(NodeRecord, Option<Vec<f32>>),
    /// `props` is the complete post-merge map; `build_version` keeps the
    /// original writer's stamp.
    UpdateNode {
        id: String,
        props: JsonMap,
        embedding: Option<Vec<f32>>,
    },
    InsertEdge(EdgeRecord),
    UpdateEdge { key: String, props: JsonMap },
}

/// The uniqueness constraints every backend enforces.
pub fn default_constraints() -> Vec<(NodeLabel, String)> {
    vec![(NodeLabel::Concept, "name".to_string())]
}

/// Resolve a batch against current state into concrete operations.
///
/// `get_node`, `find_unique`, and `get_edge` read committed state; pending
/// writes from earlier in the same batch shadow them. Returns the ops plus
/// the outcome (with the remap table callers need to learn the surviving
/// ids).
pub fn plan_batch(
    batch: &WriteBatch,
    constraints: &[(NodeLabel, String)],
    mut get_node: impl FnMut(&str) -> Result<Option<NodeRecord>, StoreError>,
    mut find_unique: impl FnMut(NodeLabel, &str, &str) -> Result<Option<String>, StoreError>,
    mut get_edge: impl FnMut(&str) -> Result<Option<EdgeRecord>, StoreError>,
) -> Result<(Vec<ResolvedOp>, BatchOutcome), StoreError> {
    let mut resolved = Vec::with_capacity(batch.ops.len());
    let mut outcome = BatchOutcome::default();

    // Pending state: writes earlier in this batch.
    let mut pending_nodes: FxHashMap<String, NodeRecord> = FxHashMap::default();
    let mut pending_unique: FxHashMap<(NodeLabel, String, String), String> = FxHashMap::default();
    let mut pending_edges: FxHashMap<String, EdgeRecord> = FxHashMap::default();
    let mut inserted_nodes: rustc_hash::FxHashSet<String> = rustc_hash::FxHashSet::default();
    let mut inserted_edges: rustc_hash::FxHashSet<String> = rustc_hash::FxHashSet::default();

    for op in &batch.ops {
        match op {
            WriteOp::MergeNode {
                node,
                union_props,
                embedding,
            } => {
                // Uniqueness arbitration: if a constrained prop value already
                // names another node, that node survives and this id remaps.
                let mut target_id = outcome
                    .remapped
                    .get(&node.id)
                    .cloned()
                    .unwrap_or_else(|| node.id.clone());
                for (label, prop) in constraints {
                    if *label != node.label {
                        continue;
                    }
                    let Some(value) = node.props.get(prop).and_then(Value::as_str) else {
                        continue;
                    };
                    let unique_key = (*label, prop.clone(), value.to_string());
                    let existing = match pending_unique.get(&unique_key) {
                        Some(id) => Some(id.clone()),
                        None => find_unique(*label, prop, value)?,
                    };
                    if let Some(existing_id) = existing
                        && existing_id != target_id
                    {
                        outcome.remapped.insert(node.id.clone(), existing_id.clone());
                        target_id = existing_id;
                    }
                    pending_unique.insert(unique_key, target_id.clone());
                }

                let current = match pending_nodes.get(&target_id) {
                    Some(record) => Some(record.clone()),
                    None => get_node(&target_id)?,
                };
                match current {
                    Some(existing) => {
                        if existing.label != node.label {
                            return Err(StoreError::Constraint(format!(
                                "node {target_id} is a {}, not a {}",
                                existing.label.as_str(),
                                node.label.as_str()
                            )));
                        }
                        let mut props = existing.props.clone();
                        for (key, value) in &node.props {
                            if union_props.contains(key) {
                                let merged = union_arrays(props.get(key), value);
                                props.insert(key.clone(), merged);
                            } else if key == "created_at" && props.contains_key("created_at") {
                                // Creation timestamps are write-once.
                            } else {
                                props.insert(key.clone(), value.clone());
                            }
                        }
                        let updated = NodeRecord {
                            id: target_id.clone(),
                            label: existing.label,
                            props: props.clone(),
                            build_version: existing.build_version.clone(),
                        };
                        pending_nodes.insert(target_id.clone(), updated);
                        if inserted_nodes.contains(&target_id) {
                            // Collapse repeat merges of a node first seen in
                            // this batch into its insert.
                            rewrite_pending_insert(
                                &mut resolved,
                                &target_id,
                                props,
                                embedding.clone(),
                            );
                        } else {
                            outcome.nodes_updated += 1;
                            resolved.push(ResolvedOp::UpdateNode {
                                id: target_id.clone(),
                                props,
                                embedding: embedding.clone(),
                            });
                        }
                    }
                    None => {
                        let record = NodeRecord {
                            id: target_id.clone(),
                            label: node.label,
                            props: node.props.clone(),
                            build_version: node.build_version.clone(),
                        };
                        pending_nodes.insert(target_id.clone(), record.clone());
                        inserted_nodes.insert(target_id.clone());
                        outcome.nodes_inserted += 1;
                        resolved.push(ResolvedOp::InsertNode(record, embedding.clone()));
                    }
                }
            }
            WriteOp::MergeEdge { edge } => {
                let src = outcome
                    .remapped
                    .get(&edge.src)
                    .cloned()
                    .unwrap_or_else(|| edge.src.clone());
                let dst = outcome
                    .remapped
                    .get(&edge.dst)
                    .cloned()
                    .unwrap_or_else(|| edge.dst.clone());
                let translated = EdgeRecord::new(
                    src,
                    edge.kind.clone(),
                    dst,
                    edge.disambiguator.clone(),
                    edge.props.clone(),
                    edge.build_version.clone(),
                );
                let current = match pending_edges.get(&translated.key) {
                    Some(record) => Some(record.clone()),
                    None => get_edge(&translated.key)?,
                };
                match current {
                    Some(existing) => {
                        let mut props = existing.props.clone();
                        for (key, value) in &translated.props {
                            props.insert(key.clone(), value.clone());
                        }
                        pending_edges.insert(
                            translated.key.clone(),
                            EdgeRecord {
                                props: props.clone(),
                                ..existing
                            },
                        );
                        if !inserted_edges.contains(&translated.key) {
                            outcome.edges_updated += 1;
                            resolved.push(ResolvedOp::UpdateEdge {
                                key: translated.key.clone(),
                                props,
                            });
                        }
                    }
                    None => {
                        pending_edges.insert(translated.key.clone(), translated.clone());
                        inserted_edges.insert(translated.key.clone());
                        outcome.edges_inserted += 1;
                        resolved.push(ResolvedOp::InsertEdge(translated));
                    }
                }
            }
            WriteOp::SetNodeProps { id, props } => {
                let target_id = outcome.remapped.get(id).cloned().unwrap_or_else(|| id.clone());
                let current = match pending_nodes.get(&target_id) {
                    Some(record) => Some(record.clone()),
                    None => get_node(&target_id)?,
                };
                let Some(existing) = current else {
                    return Err(StoreError::Constraint(format!(
                        "cannot set props on missing node {target_id}"
                    )));
                };
                let mut merged = existing.props.clone();
                for (key, value) in props {
                    merged.insert(key.clone(), value.clone());
                }
                pending_nodes.insert(
                    target_id.clone(),
                    NodeRecord {
                        props: merged.clone(),
                        ..existing
                    },
                );
                if inserted_nodes.contains(&target_id) {
                    rewrite_pending_insert(&mut resolved, &target_id, merged, None);
                } else {
                    outcome.nodes_updated += 1;
                    resolved.push(ResolvedOp::UpdateNode {
                        id: target_id,
                        props: merged,
                        embedding: None,
                    });
                }
            }
        }
    }

    Ok((resolved, outcome))
}

fn union_arrays(existing: Option<&Value>, incoming: &Value) -> Value {
    let mut merged: Vec<Value> = existing
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if let Some(items) = incoming.as_array() {
        for item in items {
            if !merged.contains(item) {
                merged.push(item.clone());
            }
        }
    } else if !merged.contains(incoming) {
        merged.push(incoming.clone());
    }
    Value::Array(merged)
}

fn rewrite_pending_insert(
    resolved: &mut [ResolvedOp],
    id: &str,
    props: JsonMap,
    embedding: Option<Vec<f32>>,
) {
    for op in resolved.iter_mut().rev() {
        if let ResolvedOp::InsertNode(record, stored_embedding) = op
            && record.id == id
        {
            record.props = props;
            if embedding.is_some() {
                *stored_embedding = embedding;
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, label: NodeLabel, props: JsonMap) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            label,
            props,
            build_version: "v1".to_string(),
        }
    }

    fn props(pairs: &[(&str, Value)]) -> JsonMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn unique_collision_remaps_later_edges() {
        let mut batch = WriteBatch::new();
        batch.merge_node(
            node(
                "con-new",
                NodeLabel::Concept,
                props(&[("name", json!("Transformer"))]),
            ),
            None,
        );
        batch.merge_edge(EdgeRecord::new(
            "chunk-1",
            "MENTIONS",
            "con-new",
            None,
            JsonMap::new(),
            "v1",
        ));

        let constraints = default_constraints();
        let (resolved, outcome) = plan_batch(
            &batch,
            &constraints,
            |_| Ok(None),
            |label, prop, value| {
                if label == NodeLabel::Concept && prop == "name" && value == "Transformer" {
                    Ok(Some("con-existing".to_string()))
                } else {
                    Ok(None)
                }
            },
            |_| Ok(None),
        )
        .unwrap();

        assert_eq!(outcome.remapped.get("con-new").unwrap(), "con-existing");
        assert_eq!(outcome.nodes_inserted, 0);
        let edge = resolved
            .iter()
            .find_map(|op| match op {
                ResolvedOp::InsertEdge(edge) => Some(edge),
                _ => None,
            })
            .unwrap();
        assert_eq!(edge.dst, "con-existing");
    }

    #[test]
    fn union_props_accumulate_without_duplicates() {
        let mut batch = WriteBatch::new();
        batch.merge_node_union(
            node(
                "claim-1",
                NodeLabel::Claim,
                props(&[("sentence_ids", json!(["s1", "s2"]))]),
            ),
            vec!["sentence_ids".to_string()],
            None,
        );

        let existing = node(
            "claim-1",
            NodeLabel::Claim,
            props(&[("sentence_ids", json!(["s0", "s1"]))]),
        );
        let (resolved, outcome) = plan_batch(
            &batch,
            &[],
            move |id| {
                if id == "claim-1" {
                    Ok(Some(existing.clone()))
                } else {
                    Ok(None)
                }
            },
            |_, _, _| Ok(None),
            |_| Ok(None),
        )
        .unwrap();

        assert_eq!(outcome.nodes_updated, 1);
        let ResolvedOp::UpdateNode { props, .. } = &resolved[0] else {
            panic!("expected update");
        };
        assert_eq!(props.get("sentence_ids").unwrap(), &json!(["s0", "s1", "s2"]));
    }

    #[test]
    fn repeated_merge_in_one_batch_collapses_to_one_insert() {
        let mut batch = WriteBatch::new();
        let first = node(
            "con-1",
            NodeLabel::Concept,
            props(&[("name", json!("BERT")), ("importance", json!(0.5))]),
        );
        let second = node(
            "con-1",
            NodeLabel::Concept,
            props(&[("name", json!("BERT")), ("importance", json!(0.9))]),
        );
        batch.merge_node(first, None);
        batch.merge_node(second, None);

        let constraints = default_constraints();
        let (resolved, outcome) =
            plan_batch(&batch, &constraints, |_| Ok(None), |_, _, _| Ok(None), |_| Ok(None))
                .unwrap();

        assert_eq!(outcome.nodes_inserted, 1);
        assert_eq!(outcome.nodes_updated, 0);
        assert_eq!(resolved.len(), 1);
        let ResolvedOp::InsertNode(record, _) = &resolved[0] else {
            panic!("expected insert");
        };
        assert_eq!(record.props.get("importance").unwrap(), &json!(0.9));
    }

    #[test]
    fn edge_identity_distinguishes_disambiguators() {
        let a = EdgeRecord::identity("c1", "MENTIONS", "x", Some("s1:0-4"));
        let b = EdgeRecord::identity("c1", "MENTIONS", "x", Some("s2:0-4"));
        let c = EdgeRecord::identity("c1", "MENTIONS", "x", None);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
