//! In-memory graph store.
//!
//! The default backend for tests and embedded runs. All state sits behind a
//! single `RwLock`, so [`GraphStore::apply`] is trivially atomic: the plan
//! is computed and executed under one write guard.
//!
//! A failure-injection hook lets tests exercise the graph service's
//! transient-retry path without a real flaky backend.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{
    BatchOutcome, Direction, EdgeRecord, GraphCounts, GraphStore, NodeRecord, PurgeReport,
    ResolvedOp, StoreError, WriteBatch, default_constraints, plan_batch,
};
use crate::model::NodeLabel;
use crate::text::cosine_similarity;

#[derive(Default)]
struct GraphData {
    nodes: FxHashMap<String, NodeRecord>,
    edges: FxHashMap<String, EdgeRecord>,
    embeddings: FxHashMap<String, Vec<f32>>,
    out_edges: FxHashMap<String, Vec<String>>,
    in_edges: FxHashMap<String, Vec<String>>,
    unique: FxHashMap<(NodeLabel, String, String), String>,
}

impl GraphData {
    fn index_unique(&mut self, constraints: &[(NodeLabel, String)], node: &NodeRecord) {
        for (label, prop) in constraints {
            if *label != node.label {
                continue;
            }
            if let Some(value) = node.props.get(prop).and_then(serde_json::Value::as_str) {
                self.unique
                    .insert((*label, prop.clone(), value.to_string()), node.id.clone());
            }
        }
    }

    fn unindex_unique(&mut self, constraints: &[(NodeLabel, String)], node: &NodeRecord) {
        for (label, prop) in constraints {
            if *label != node.label {
                continue;
            }
            if let Some(value) = node.props.get(prop).and_then(serde_json::Value::as_str) {
                self.unique.remove(&(*label, prop.clone(), value.to_string()));
            }
        }
    }

    fn detach_edge(&mut self, edge: &EdgeRecord) {
        if let Some(keys) = self.out_edges.get_mut(&edge.src) {
            keys.retain(|k| k != &edge.key);
        }
        if let Some(keys) = self.in_edges.get_mut(&edge.dst) {
            keys.retain(|k| k != &edge.key);
        }
    }

    fn degree_of(&self, id: &str) -> usize {
        self.out_edges.get(id).map_or(0, Vec::len) + self.in_edges.get(id).map_or(0, Vec::len)
    }
}

#[derive(Clone, Default)]
pub struct MemoryGraphStore {
    data: Arc<RwLock<GraphData>>,
    constraints: Arc<Vec<(NodeLabel, String)>>,
    transient_failures: Arc<AtomicUsize>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        MemoryGraphStore {
            data: Arc::new(RwLock::new(GraphData::default())),
            constraints: Arc::new(default_constraints()),
            transient_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make the next `n` `apply` calls fail with a transient error.
    pub fn inject_transient_failures(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn apply(&self, batch: WriteBatch) -> Result<BatchOutcome, StoreError> {
        if self.take_injected_failure() {
            return Err(StoreError::Transient("injected failure".to_string()));
        }
        let mut data = self.data.write();
        let (resolved, outcome) = plan_batch(
            &batch,
            &self.constraints,
            |id| Ok(data.nodes.get(id).cloned()),
            |label, prop, value| {
                Ok(data
                    .unique
                    .get(&(label, prop.to_string(), value.to_string()))
                    .cloned())
            },
            |key| Ok(data.edges.get(key).cloned()),
        )?;

        for op in resolved {
            match op {
                ResolvedOp::InsertNode(node, embedding) => {
                    data.index_unique(&self.constraints, &node);
                    if let Some(vector) = embedding {
                        data.embeddings.insert(node.id.clone(), vector);
                    }
                    data.nodes.insert(node.id.clone(), node);
                }
                ResolvedOp::UpdateNode {
                    id,
                    props,
                    embedding,
                } => {
                    let Some(existing) = data.nodes.get(&id).cloned() else {
                        return Err(StoreError::Corrupt(format!(
                            "planned update of missing node {id}"
                        )));
                    };
                    data.unindex_unique(&self.constraints, &existing);
                    let updated = NodeRecord { props, ..existing };
                    data.index_unique(&self.constraints, &updated);
                    if let Some(vector) = embedding {
                        data.embeddings.insert(id.clone(), vector);
                    }
                    data.nodes.insert(id, updated);
                }
                ResolvedOp::InsertEdge(edge) => {
                    data.out_edges
                        .entry(edge.src.clone())
                        .or_default()
                        .push(edge.key.clone());
                    data.in_edges
                        .entry(edge.dst.clone())
                        .or_default()
                        .push(edge.key.clone());
                    data.edges.insert(edge.key.clone(), edge);
                }
                ResolvedOp::UpdateEdge { key, props } => {
                    let Some(edge) = data.edges.get_mut(&key) else {
                        return Err(StoreError::Corrupt(format!(
                            "planned update of missing edge {key}"
                        )));
                    };
                    edge.props = props;
                }
            }
        }
        Ok(outcome)
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeRecord>, StoreError> {
        Ok(self.data.read().nodes.get(id).cloned())
    }

    async fn find_node(
        &self,
        label: NodeLabel,
        prop: &str,
        value: &str,
    ) -> Result<Option<NodeRecord>, StoreError> {
        let data = self.data.read();
        if let Some(id) = data
            .unique
            .get(&(label, prop.to_string(), value.to_string()))
        {
            return Ok(data.nodes.get(id).cloned());
        }
        // Unconstrained props fall back to a scan.
        Ok(data
            .nodes
            .values()
            .find(|node| {
                node.label == label
                    && node.props.get(prop).and_then(serde_json::Value::as_str) == Some(value)
            })
            .cloned())
    }

    async fn nodes_by_label(&self, label: NodeLabel) -> Result<Vec<NodeRecord>, StoreError> {
        let mut nodes: Vec<NodeRecord> = self
            .data
            .read()
            .nodes
            .values()
            .filter(|node| node.label == label)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn get_edge(&self, key: &str) -> Result<Option<EdgeRecord>, StoreError> {
        Ok(self.data.read().edges.get(key).cloned())
    }

    async fn neighbors(
        &self,
        id: &str,
        kinds: &[String],
        direction: Direction,
    ) -> Result<Vec<(EdgeRecord, NodeRecord)>, StoreError> {
        let data = self.data.read();
        let mut results = Vec::new();
        let mut push = |edge_key: &String, toward_dst: bool| {
            if let Some(edge) = data.edges.get(edge_key) {
                if !kinds.is_empty() && !kinds.iter().any(|k| k == &edge.kind) {
                    return;
                }
                let other_id = if toward_dst { &edge.dst } else { &edge.src };
                if let Some(node) = data.nodes.get(other_id) {
                    results.push((edge.clone(), node.clone()));
                }
            }
        };
        if matches!(direction, Direction::Out | Direction::Both)
            && let Some(keys) = data.out_edges.get(id)
        {
            for key in keys {
                push(key, true);
            }
        }
        if matches!(direction, Direction::In | Direction::Both)
            && let Some(keys) = data.in_edges.get(id)
        {
            for key in keys {
                push(key, false);
            }
        }
        results.sort_by(|(a, _), (b, _)| a.key.cmp(&b.key));
        Ok(results)
    }

    async fn edges_by_kind(&self, kind: &str) -> Result<Vec<EdgeRecord>, StoreError> {
        let mut edges: Vec<EdgeRecord> = self
            .data
            .read()
            .edges
            .values()
            .filter(|edge| edge.kind == kind)
            .cloned()
            .collect();
        edges.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(edges)
    }

    async fn node_embedding(&self, id: &str) -> Result<Option<Vec<f32>>, StoreError> {
        Ok(self.data.read().embeddings.get(id).cloned())
    }

    async fn vector_search(
        &self,
        label: NodeLabel,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(NodeRecord, f32)>, StoreError> {
        let data = self.data.read();
        let mut scored: Vec<(NodeRecord, f32)> = data
            .nodes
            .values()
            .filter(|node| node.label == label)
            .filter_map(|node| {
                let vector = data.embeddings.get(&node.id)?;
                Some((node.clone(), cosine_similarity(query, vector)))
            })
            .collect();
        scored.sort_by(|(na, sa), (nb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| na.id.cmp(&nb.id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn degree(&self, id: &str) -> Result<usize, StoreError> {
        Ok(self.data.read().degree_of(id))
    }

    async fn delete_build_version(&self, build_version: &str) -> Result<PurgeReport, StoreError> {
        let mut data = self.data.write();
        let mut report = PurgeReport::default();

        let edge_keys: Vec<String> = data
            .edges
            .values()
            .filter(|edge| edge.build_version == build_version)
            .map(|edge| edge.key.clone())
            .collect();
        for key in edge_keys {
            if let Some(edge) = data.edges.remove(&key) {
                data.detach_edge(&edge);
                report.edges_deleted += 1;
            }
        }

        let node_ids: Vec<String> = data
            .nodes
            .values()
            .filter(|node| node.build_version == build_version)
            .map(|node| node.id.clone())
            .collect();
        for id in node_ids {
            if data.degree_of(&id) > 0 {
                report.nodes_retained += 1;
                continue;
            }
            if let Some(node) = data.nodes.remove(&id) {
                let constraints = self.constraints.clone();
                data.unindex_unique(&constraints, &node);
                data.embeddings.remove(&id);
                data.out_edges.remove(&id);
                data.in_edges.remove(&id);
                report.nodes_deleted += 1;
            }
        }
        Ok(report)
    }

    async fn delete_nodes(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut data = self.data.write();
        let mut deleted = 0;
        for id in ids {
            let incident: Vec<String> = data
                .out_edges
                .get(id)
                .into_iter()
                .chain(data.in_edges.get(id))
                .flatten()
                .cloned()
                .collect();
            for key in incident {
                if let Some(edge) = data.edges.remove(&key) {
                    data.detach_edge(&edge);
                }
            }
            if let Some(node) = data.nodes.remove(id) {
                let constraints = self.constraints.clone();
                data.unindex_unique(&constraints, &node);
                data.embeddings.remove(id);
                data.out_edges.remove(id);
                data.in_edges.remove(id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete_edge(&self, key: &str) -> Result<bool, StoreError> {
        let mut data = self.data.write();
        if let Some(edge) = data.edges.remove(key) {
            data.detach_edge(&edge);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn counts(&self) -> Result<GraphCounts, StoreError> {
        let data = self.data.read();
        let mut counts = GraphCounts {
            nodes: data.nodes.len(),
            edges: data.edges.len(),
            ..Default::default()
        };
        for node in data.nodes.values() {
            *counts
                .nodes_by_label
                .entry(node.label.as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JsonMap;
    use serde_json::json;

    fn concept(id: &str, name: &str, version: &str) -> NodeRecord {
        let mut props = JsonMap::new();
        props.insert("name".to_string(), json!(name));
        NodeRecord {
            id: id.to_string(),
            label: NodeLabel::Concept,
            props,
            build_version: version.to_string(),
        }
    }

    #[tokio::test]
    async fn merge_by_unique_name_is_idempotent() {
        let store = MemoryGraphStore::new();
        let mut batch = WriteBatch::new();
        batch.merge_node(concept("con-a", "Transformer", "v1"), None);
        let first = store.apply(batch).await.unwrap();
        assert_eq!(first.nodes_inserted, 1);

        // Different proposed id, same unique name: merges, no second node.
        let mut batch = WriteBatch::new();
        batch.merge_node(concept("con-b", "Transformer", "v2"), None);
        let second = store.apply(batch).await.unwrap();
        assert_eq!(second.nodes_inserted, 0);
        assert_eq!(second.remapped.get("con-b").unwrap(), "con-a");

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.nodes, 1);
        // First writer keeps the stamp.
        let node = store.get_node("con-a").await.unwrap().unwrap();
        assert_eq!(node.build_version, "v1");
    }

    #[tokio::test]
    async fn duplicate_edges_collapse() {
        let store = MemoryGraphStore::new();
        let mut batch = WriteBatch::new();
        batch.merge_node(concept("con-a", "BERT", "v1"), None);
        batch.merge_node(concept("con-b", "Attention", "v1"), None);
        let edge = EdgeRecord::new("con-a", "USES", "con-b", None, JsonMap::new(), "v1");
        batch.merge_edge(edge.clone());
        batch.merge_edge(edge);
        store.apply(batch).await.unwrap();
        assert_eq!(store.counts().await.unwrap().edges, 1);
    }

    #[tokio::test]
    async fn rollback_retains_cross_build_referenced_nodes() {
        let store = MemoryGraphStore::new();

        let mut batch = WriteBatch::new();
        batch.merge_node(concept("con-a", "Transformer", "v1"), None);
        store.apply(batch).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.merge_node(concept("chunk-1", "chunk", "v2"), None);
        batch.merge_edge(EdgeRecord::new(
            "chunk-1",
            "MENTIONS",
            "con-a",
            None,
            JsonMap::new(),
            "v2",
        ));
        store.apply(batch).await.unwrap();

        // v1's concept survives the v1 purge because v2 still points at it.
        let report = store.delete_build_version("v1").await.unwrap();
        assert_eq!(report.nodes_deleted, 0);
        assert_eq!(report.nodes_retained, 1);
        assert!(store.get_node("con-a").await.unwrap().is_some());

        // After v2 is gone too, the concept is unreferenced and purges.
        store.delete_build_version("v2").await.unwrap();
        let report = store.delete_build_version("v1").await.unwrap();
        assert_eq!(report.nodes_deleted, 1);
        assert_eq!(store.counts().await.unwrap().nodes, 0);
    }

    #[tokio::test]
    async fn vector_search_orders_by_similarity() {
        let store = MemoryGraphStore::new();
        let mut batch = WriteBatch::new();
        batch.merge_node(concept("con-a", "A", "v1"), Some(vec![1.0, 0.0]));
        batch.merge_node(concept("con-b", "B", "v1"), Some(vec![0.0, 1.0]));
        batch.merge_node(concept("con-c", "C", "v1"), Some(vec![0.9, 0.1]));
        store.apply(batch).await.unwrap();

        let hits = store
            .vector_search(NodeLabel::Concept, &[1.0, 0.0], 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.id, "con-a");
        assert_eq!(hits[1].0.id, "con-c");
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = MemoryGraphStore::new();
        store.inject_transient_failures(1);
        let mut batch = WriteBatch::new();
        batch.merge_node(concept("con-a", "A", "v1"), None);
        let err = store.apply(batch.clone()).await.unwrap_err();
        assert!(err.is_transient());
        store.apply(batch).await.unwrap();
    }
}
