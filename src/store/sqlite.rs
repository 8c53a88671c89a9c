//! SQLite-backed graph store.
//!
//! Nodes, edges, embeddings, and the uniqueness index live in four tables;
//! props are JSON text. [`GraphStore::apply`] runs the shared MERGE plan
//! inside a single SQLite transaction, which is what makes per-document
//! ingestion atomic on this backend. Vector similarity is an exact cosine
//! scan over the embeddings table, adequate for the graph sizes a single
//! SQLite file holds, and ANN infrastructure is explicitly out of scope.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_rusqlite::{Connection, OptionalExtension};

use super::{
    BatchOutcome, Direction, EdgeRecord, GraphCounts, GraphStore, NodeRecord, PurgeReport,
    ResolvedOp, StoreError, WriteBatch, default_constraints, plan_batch,
};
use crate::model::{JsonMap, NodeLabel};
use crate::text::cosine_similarity;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nodes (
    id            TEXT PRIMARY KEY,
    label         TEXT NOT NULL,
    props         TEXT NOT NULL,
    build_version TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_nodes_label ON nodes(label);
CREATE INDEX IF NOT EXISTS idx_nodes_build ON nodes(build_version);
CREATE TABLE IF NOT EXISTS edges (
    key           TEXT PRIMARY KEY,
    src           TEXT NOT NULL,
    kind          TEXT NOT NULL,
    dst           TEXT NOT NULL,
    disambiguator TEXT,
    props         TEXT NOT NULL,
    build_version TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_edges_src ON edges(src);
CREATE INDEX IF NOT EXISTS idx_edges_dst ON edges(dst);
CREATE INDEX IF NOT EXISTS idx_edges_kind ON edges(kind);
CREATE INDEX IF NOT EXISTS idx_edges_build ON edges(build_version);
CREATE TABLE IF NOT EXISTS node_embeddings (
    node_id TEXT PRIMARY KEY,
    vector  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS unique_props (
    label   TEXT NOT NULL,
    prop    TEXT NOT NULL,
    value   TEXT NOT NULL,
    node_id TEXT NOT NULL,
    PRIMARY KEY (label, prop, value)
);
";

fn store_err(err: tokio_rusqlite::Error) -> StoreError {
    let message = err.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("locked") || lowered.contains("busy") {
        StoreError::Transient(message)
    } else {
        StoreError::Backend(message)
    }
}

fn sql(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn node_from_parts(
    id: String,
    label: String,
    props: String,
    build_version: String,
) -> Result<NodeRecord, StoreError> {
    let label = NodeLabel::parse(&label)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown node label '{label}'")))?;
    let props: JsonMap = serde_json::from_str(&props)
        .map_err(|err| StoreError::Corrupt(format!("node {id} props: {err}")))?;
    Ok(NodeRecord {
        id,
        label,
        props,
        build_version,
    })
}

type EdgeParts = (String, String, String, String, Option<String>, String, String);

fn edge_from_parts(parts: EdgeParts) -> Result<EdgeRecord, StoreError> {
    let (key, src, kind, dst, disambiguator, props, build_version) = parts;
    let props: JsonMap = serde_json::from_str(&props)
        .map_err(|err| StoreError::Corrupt(format!("edge {key} props: {err}")))?;
    Ok(EdgeRecord {
        key,
        src,
        kind,
        dst,
        disambiguator,
        props,
        build_version,
    })
}

#[derive(Clone)]
pub struct SqliteGraphStore {
    conn: Connection,
    constraints: Arc<Vec<(NodeLabel, String)>>,
}

impl SqliteGraphStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .await
            .map_err(|err| store_err(err.into()))?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|err| store_err(err.into()))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)
                ?;
            Ok(())
        })
        .await
        .map_err(store_err)?;
        Ok(SqliteGraphStore {
            conn,
            constraints: Arc::new(default_constraints()),
        })
    }
}

/// Plan a batch against the open transaction's state.
fn plan_tx(
    tx: &tokio_rusqlite::Transaction<'_>,
    batch: &WriteBatch,
    constraints: &[(NodeLabel, String)],
) -> Result<(Vec<ResolvedOp>, BatchOutcome), StoreError> {
    plan_batch(
        batch,
        constraints,
        |id| {
            tx.query_row(
                "SELECT id, label, props, build_version FROM nodes WHERE id = ?1",
                (id,),
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(sql)?
            .map(|(id, label, props, version)| node_from_parts(id, label, props, version))
            .transpose()
        },
        |label, prop, value| {
            tx.query_row(
                "SELECT node_id FROM unique_props WHERE label = ?1 AND prop = ?2 AND value = ?3",
                (label.as_str(), prop, value),
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(sql)
        },
        |key| {
            tx.query_row(
                "SELECT key, src, kind, dst, disambiguator, props, build_version \
                 FROM edges WHERE key = ?1",
                (key,),
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(sql)?
            .map(edge_from_parts)
            .transpose()
        },
    )
}

/// Execute planned ops inside the transaction.
fn execute_resolved(
    tx: &tokio_rusqlite::Transaction<'_>,
    constraints: &[(NodeLabel, String)],
    resolved: Vec<ResolvedOp>,
) -> Result<(), StoreError> {
    for op in resolved {
        match op {
            ResolvedOp::InsertNode(node, embedding) => {
                let props = serde_json::to_string(&node.props).map_err(sql)?;
                tx.execute(
                    "INSERT INTO nodes (id, label, props, build_version) \
                     VALUES (?1, ?2, ?3, ?4)",
                    (&node.id, node.label.as_str(), &props, &node.build_version),
                )
                .map_err(sql)?;
                index_unique(tx, constraints, &node)?;
                if let Some(vector) = embedding {
                    upsert_embedding(tx, &node.id, &vector)?;
                }
            }
            ResolvedOp::UpdateNode {
                id,
                props,
                embedding,
            } => {
                tx.execute("DELETE FROM unique_props WHERE node_id = ?1", (&id,))
                    .map_err(sql)?;
                let serialized = serde_json::to_string(&props).map_err(sql)?;
                tx.execute("UPDATE nodes SET props = ?2 WHERE id = ?1", (&id, &serialized))
                    .map_err(sql)?;
                let node = tx
                    .query_row(
                        "SELECT id, label, props, build_version FROM nodes WHERE id = ?1",
                        (&id,),
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, String>(3)?,
                            ))
                        },
                    )
                    .map_err(sql)
                    .and_then(|(id, label, props, version)| {
                        node_from_parts(id, label, props, version)
                    })?;
                index_unique(tx, constraints, &node)?;
                if let Some(vector) = embedding {
                    upsert_embedding(tx, &id, &vector)?;
                }
            }
            ResolvedOp::InsertEdge(edge) => {
                let props = serde_json::to_string(&edge.props).map_err(sql)?;
                tx.execute(
                    "INSERT INTO edges (key, src, kind, dst, disambiguator, props, build_version) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    (
                        &edge.key,
                        &edge.src,
                        &edge.kind,
                        &edge.dst,
                        &edge.disambiguator,
                        &props,
                        &edge.build_version,
                    ),
                )
                .map_err(sql)?;
            }
            ResolvedOp::UpdateEdge { key, props } => {
                let serialized = serde_json::to_string(&props).map_err(sql)?;
                tx.execute("UPDATE edges SET props = ?2 WHERE key = ?1", (&key, &serialized))
                    .map_err(sql)?;
            }
        }
    }
    Ok(())
}

fn index_unique(
    tx: &tokio_rusqlite::Transaction<'_>,
    constraints: &[(NodeLabel, String)],
    node: &NodeRecord,
) -> Result<(), StoreError> {
    for (label, prop) in constraints {
        if *label != node.label {
            continue;
        }
        if let Some(value) = node.props.get(prop).and_then(serde_json::Value::as_str) {
            tx.execute(
                "INSERT OR REPLACE INTO unique_props (label, prop, value, node_id) \
                 VALUES (?1, ?2, ?3, ?4)",
                (label.as_str(), prop, value, &node.id),
            )
            .map_err(sql)?;
        }
    }
    Ok(())
}

fn upsert_embedding(
    tx: &tokio_rusqlite::Transaction<'_>,
    node_id: &str,
    vector: &[f32],
) -> Result<(), StoreError> {
    let serialized = serde_json::to_string(vector).map_err(sql)?;
    tx.execute(
        "INSERT OR REPLACE INTO node_embeddings (node_id, vector) VALUES (?1, ?2)",
        (node_id, &serialized),
    )
    .map_err(sql)?;
    Ok(())
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn apply(&self, batch: WriteBatch) -> Result<BatchOutcome, StoreError> {
        let constraints = self.constraints.clone();
        self.conn
            .call(move |conn| {
                let result = (|| -> Result<BatchOutcome, StoreError> {
                    let tx = conn.transaction().map_err(sql)?;
                    let (resolved, outcome) = plan_tx(&tx, &batch, &constraints)?;
                    execute_resolved(&tx, &constraints, resolved)?;
                    tx.commit().map_err(sql)?;
                    Ok(outcome)
                })();
                Ok(result)
            })
            .await
            .map_err(store_err)?
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeRecord>, StoreError> {
        let id = id.to_string();
        let parts = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, label, props, build_version FROM nodes WHERE id = ?1",
                    (&id,),
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()
                
            })
            .await
            .map_err(store_err)?;
        parts
            .map(|(id, label, props, version)| node_from_parts(id, label, props, version))
            .transpose()
    }

    async fn find_node(
        &self,
        label: NodeLabel,
        prop: &str,
        value: &str,
    ) -> Result<Option<NodeRecord>, StoreError> {
        let prop = prop.to_string();
        let value = value.to_string();
        let label_str = label.as_str();
        let id = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT node_id FROM unique_props \
                     WHERE label = ?1 AND prop = ?2 AND value = ?3",
                    (label_str, &prop, &value),
                    |row| row.get::<_, String>(0),
                )
                .optional()
                
            })
            .await
            .map_err(store_err)?;
        match id {
            Some(id) => self.get_node(&id).await,
            None => Ok(None),
        }
    }

    async fn nodes_by_label(&self, label: NodeLabel) -> Result<Vec<NodeRecord>, StoreError> {
        let label_str = label.as_str();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, label, props, build_version FROM nodes \
                         WHERE label = ?1 ORDER BY id",
                    )
                    ?;
                let rows = stmt
                    .query_map((label_str,), |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })
                    ?;
                let mut collected = Vec::new();
                for row in rows {
                    collected.push(row?);
                }
                Ok(collected)
            })
            .await
            .map_err(store_err)?;
        rows.into_iter()
            .map(|(id, label, props, version)| node_from_parts(id, label, props, version))
            .collect()
    }

    async fn get_edge(&self, key: &str) -> Result<Option<EdgeRecord>, StoreError> {
        let key = key.to_string();
        let parts = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT key, src, kind, dst, disambiguator, props, build_version \
                     FROM edges WHERE key = ?1",
                    (&key,),
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                        ))
                    },
                )
                .optional()
                
            })
            .await
            .map_err(store_err)?;
        parts.map(edge_from_parts).transpose()
    }

    async fn neighbors(
        &self,
        id: &str,
        kinds: &[String],
        direction: Direction,
    ) -> Result<Vec<(EdgeRecord, NodeRecord)>, StoreError> {
        let id = id.to_string();
        let kinds = kinds.to_vec();
        let rows = self
            .conn
            .call(move |conn| {
                let clause = match direction {
                    Direction::Out => "e.src = ?1",
                    Direction::In => "e.dst = ?1",
                    Direction::Both => "(e.src = ?1 OR e.dst = ?1)",
                };
                let query = format!(
                    "SELECT e.key, e.src, e.kind, e.dst, e.disambiguator, e.props, \
                     e.build_version, n.id, n.label, n.props, n.build_version \
                     FROM edges e JOIN nodes n \
                     ON n.id = CASE WHEN e.src = ?1 THEN e.dst ELSE e.src END \
                     WHERE {clause} ORDER BY e.key"
                );
                let mut stmt = conn
                    .prepare(&query)
                    ?;
                let rows = stmt
                    .query_map((&id,), |row| {
                        Ok((
                            (
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, String>(3)?,
                                row.get::<_, Option<String>>(4)?,
                                row.get::<_, String>(5)?,
                                row.get::<_, String>(6)?,
                            ),
                            (
                                row.get::<_, String>(7)?,
                                row.get::<_, String>(8)?,
                                row.get::<_, String>(9)?,
                                row.get::<_, String>(10)?,
                            ),
                        ))
                    })
                    ?;
                let mut collected = Vec::new();
                for row in rows {
                    collected.push(row?);
                }
                Ok(collected)
            })
            .await
            .map_err(store_err)?;

        let mut results = Vec::with_capacity(rows.len());
        for (edge_parts, (node_id, label, props, version)) in rows {
            let edge = edge_from_parts(edge_parts)?;
            if !kinds.is_empty() && !kinds.iter().any(|k| k == &edge.kind) {
                continue;
            }
            results.push((edge, node_from_parts(node_id, label, props, version)?));
        }
        Ok(results)
    }

    async fn edges_by_kind(&self, kind: &str) -> Result<Vec<EdgeRecord>, StoreError> {
        let kind = kind.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT key, src, kind, dst, disambiguator, props, build_version \
                         FROM edges WHERE kind = ?1 ORDER BY key",
                    )
                    ?;
                let rows = stmt
                    .query_map((&kind,), |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                        ))
                    })
                    ?;
                let mut collected = Vec::new();
                for row in rows {
                    collected.push(row?);
                }
                Ok(collected)
            })
            .await
            .map_err(store_err)?;
        rows.into_iter().map(edge_from_parts).collect()
    }

    async fn node_embedding(&self, id: &str) -> Result<Option<Vec<f32>>, StoreError> {
        let id = id.to_string();
        let raw = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT vector FROM node_embeddings WHERE node_id = ?1",
                    (&id,),
                    |row| row.get::<_, String>(0),
                )
                .optional()
                
            })
            .await
            .map_err(store_err)?;
        raw.map(|json| {
            serde_json::from_str(&json)
                .map_err(|err| StoreError::Corrupt(format!("embedding: {err}")))
        })
        .transpose()
    }

    async fn vector_search(
        &self,
        label: NodeLabel,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(NodeRecord, f32)>, StoreError> {
        let label_str = label.as_str();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT n.id, n.label, n.props, n.build_version, e.vector \
                         FROM nodes n JOIN node_embeddings e ON n.id = e.node_id \
                         WHERE n.label = ?1",
                    )
                    ?;
                let rows = stmt
                    .query_map((label_str,), |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    })
                    ?;
                let mut collected = Vec::new();
                for row in rows {
                    collected.push(row?);
                }
                Ok(collected)
            })
            .await
            .map_err(store_err)?;

        let mut scored = Vec::with_capacity(rows.len());
        for (id, label, props, version, vector_json) in rows {
            let vector: Vec<f32> = serde_json::from_str(&vector_json)
                .map_err(|err| StoreError::Corrupt(format!("embedding for {id}: {err}")))?;
            let node = node_from_parts(id, label, props, version)?;
            scored.push((node, cosine_similarity(query, &vector)));
        }
        scored.sort_by(|(na, sa), (nb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| na.id.cmp(&nb.id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn degree(&self, id: &str) -> Result<usize, StoreError> {
        let id = id.to_string();
        let count = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM edges WHERE src = ?1 OR dst = ?1",
                    (&id,),
                    |row| row.get::<_, i64>(0),
                )
                
            })
            .await
            .map_err(store_err)?;
        Ok(count as usize)
    }

    async fn delete_build_version(&self, build_version: &str) -> Result<PurgeReport, StoreError> {
        let version = build_version.to_string();
        self.conn
            .call(move |conn| {
                let result = (|| -> Result<PurgeReport, StoreError> {
                    let tx = conn.transaction().map_err(sql)?;
                    let mut report = PurgeReport::default();

                    report.edges_deleted = tx
                        .execute("DELETE FROM edges WHERE build_version = ?1", (&version,))
                        .map_err(sql)?;

                    let node_ids: Vec<String> = {
                        let mut stmt = tx
                            .prepare("SELECT id FROM nodes WHERE build_version = ?1")
                            .map_err(sql)?;
                        let rows = stmt
                            .query_map((&version,), |row| row.get::<_, String>(0))
                            .map_err(sql)?;
                        let mut ids = Vec::new();
                        for row in rows {
                            ids.push(row.map_err(sql)?);
                        }
                        ids
                    };

                    for id in node_ids {
                        let degree: i64 = tx
                            .query_row(
                                "SELECT COUNT(*) FROM edges WHERE src = ?1 OR dst = ?1",
                                (&id,),
                                |row| row.get(0),
                            )
                            .map_err(sql)?;
                        if degree > 0 {
                            report.nodes_retained += 1;
                            continue;
                        }
                        tx.execute("DELETE FROM nodes WHERE id = ?1", (&id,))
                            .map_err(sql)?;
                        tx.execute("DELETE FROM unique_props WHERE node_id = ?1", (&id,))
                            .map_err(sql)?;
                        tx.execute("DELETE FROM node_embeddings WHERE node_id = ?1", (&id,))
                            .map_err(sql)?;
                        report.nodes_deleted += 1;
                    }

                    tx.commit().map_err(sql)?;
                    Ok(report)
                })();
                Ok(result)
            })
            .await
            .map_err(store_err)?
    }

    async fn delete_nodes(&self, ids: &[String]) -> Result<usize, StoreError> {
        let ids = ids.to_vec();
        self.conn
            .call(move |conn| {
                let result = (|| -> Result<usize, StoreError> {
                    let tx = conn.transaction().map_err(sql)?;
                    let mut deleted = 0;
                    for id in &ids {
                        tx.execute("DELETE FROM edges WHERE src = ?1 OR dst = ?1", (id,))
                            .map_err(sql)?;
                        let n = tx
                            .execute("DELETE FROM nodes WHERE id = ?1", (id,))
                            .map_err(sql)?;
                        tx.execute("DELETE FROM unique_props WHERE node_id = ?1", (id,))
                            .map_err(sql)?;
                        tx.execute("DELETE FROM node_embeddings WHERE node_id = ?1", (id,))
                            .map_err(sql)?;
                        deleted += n;
                    }
                    tx.commit().map_err(sql)?;
                    Ok(deleted)
                })();
                Ok(result)
            })
            .await
            .map_err(store_err)?
    }

    async fn delete_edge(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        let deleted = self
            .conn
            .call(move |conn| {
                conn.execute("DELETE FROM edges WHERE key = ?1", (&key,))
                    
            })
            .await
            .map_err(store_err)?;
        Ok(deleted > 0)
    }

    async fn counts(&self) -> Result<GraphCounts, StoreError> {
        self.conn
            .call(|conn| {
                let result = (|| -> Result<GraphCounts, StoreError> {
                    let nodes: i64 = conn
                        .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))
                        .map_err(sql)?;
                    let edges: i64 = conn
                        .query_row("SELECT COUNT(*) FROM edges", [], |row| row.get(0))
                        .map_err(sql)?;
                    let mut counts = GraphCounts {
                        nodes: nodes as usize,
                        edges: edges as usize,
                        ..Default::default()
                    };
                    let mut stmt = conn
                        .prepare("SELECT label, COUNT(*) FROM nodes GROUP BY label")
                        .map_err(sql)?;
                    let rows = stmt
                        .query_map([], |row| {
                            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                        })
                        .map_err(sql)?;
                    for row in rows {
                        let (label, count) = row.map_err(sql)?;
                        counts.nodes_by_label.insert(label, count as usize);
                    }
                    Ok(counts)
                })();
                Ok(result)
            })
            .await
            .map_err(store_err)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

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
    async fn merge_is_idempotent_on_disk() {
        let dir = tempdir().unwrap();
        let store = SqliteGraphStore::open(dir.path().join("graph.db"))
            .await
            .unwrap();

        let mut batch = WriteBatch::new();
        batch.merge_node(concept("con-a", "Transformer", "v1"), Some(vec![0.5, 0.5]));
        batch.merge_edge(EdgeRecord::new(
            "chunk-1",
            "MENTIONS",
            "con-a",
            None,
            JsonMap::new(),
            "v1",
        ));
        let mut chunk_props = JsonMap::new();
        chunk_props.insert("text".to_string(), json!("some text"));
        batch.merge_node(
            NodeRecord {
                id: "chunk-1".to_string(),
                label: NodeLabel::Chunk,
                props: chunk_props,
                build_version: "v1".to_string(),
            },
            None,
        );

        let first = store.apply(batch.clone()).await.unwrap();
        assert_eq!(first.nodes_inserted, 2);
        assert_eq!(first.edges_inserted, 1);

        let second = store.apply(batch).await.unwrap();
        assert_eq!(second.nodes_inserted, 0);
        assert_eq!(second.edges_inserted, 0);

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.nodes, 2);
        assert_eq!(counts.edges, 1);
    }

    #[tokio::test]
    async fn unique_name_arbitrates_across_batches() {
        let store = SqliteGraphStore::open_in_memory().await.unwrap();

        let mut batch = WriteBatch::new();
        batch.merge_node(concept("con-a", "BERT", "v1"), None);
        store.apply(batch).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.merge_node(concept("con-other", "BERT", "v2"), None);
        let outcome = store.apply(batch).await.unwrap();
        assert_eq!(outcome.remapped.get("con-other").unwrap(), "con-a");
        assert_eq!(store.counts().await.unwrap().nodes, 1);

        let found = store
            .find_node(NodeLabel::Concept, "name", "BERT")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "con-a");
    }

    #[tokio::test]
    async fn purge_and_neighbors_round_trip() {
        let store = SqliteGraphStore::open_in_memory().await.unwrap();

        let mut batch = WriteBatch::new();
        batch.merge_node(concept("con-a", "A", "v1"), Some(vec![1.0, 0.0]));
        batch.merge_node(concept("con-b", "B", "v1"), Some(vec![0.0, 1.0]));
        batch.merge_edge(EdgeRecord::new(
            "con-a",
            "USES",
            "con-b",
            None,
            JsonMap::new(),
            "v1",
        ));
        store.apply(batch).await.unwrap();

        let out = store
            .neighbors("con-a", &["USES".to_string()], Direction::Out)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.id, "con-b");

        let hits = store
            .vector_search(NodeLabel::Concept, &[1.0, 0.0], 1)
            .await
            .unwrap();
        assert_eq!(hits[0].0.id, "con-a");

        let report = store.delete_build_version("v1").await.unwrap();
        assert_eq!(report.edges_deleted, 1);
        assert_eq!(report.nodes_deleted, 2);
        assert_eq!(store.counts().await.unwrap().nodes, 0);
    }
}
