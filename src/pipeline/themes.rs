//! Stage 4: topic communities over the concept/claim subgraph.
//!
//! The concepts a document touched (plus, optionally, its claims joined by
//! shared-concept co-membership) are projected into a petgraph undirected
//! graph together with the concept-concept edges already persisted. A
//! deterministic greedy modularity pass (a single-level Louvain) yields
//! coarse communities; communities big enough are re-partitioned for the
//! fine level. Each surviving community becomes a Theme with a model-
//! generated label and summary, TF-IDF keywords, and a deterministic id
//! hashed from its sorted member ids and level.

use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::context::PipelineContext;
use crate::diagnostics::{JobDiagnostics, StageName};
use crate::model::{Claim, NodeLabel, Theme, ThemeLevel};
use crate::providers::ChatMessage;
use crate::store::Direction;
use crate::text::{short_hash, tfidf_keywords};
use crate::types::LoomError;

/// A theme plus the node ids that belong to it.
#[derive(Debug, Clone)]
pub struct ThemeArtifact {
    pub theme: Theme,
    pub members: Vec<String>,
}

/// A concept entering the projection: its node id plus the text used for
/// labeling and keywords. The runner supplies these so concepts proposed in
/// this very build (not yet persisted) participate too.
#[derive(Debug, Clone)]
pub struct ThemeSeed {
    pub id: String,
    pub text: String,
}

/// A projection node: a concept or a (canonical) claim.
#[derive(Debug, Clone)]
struct ProjectionNode {
    id: String,
    text: String,
    is_concept: bool,
}

#[derive(Debug, Deserialize)]
struct LlmThemeSummary {
    label: String,
    summary: String,
}

/// Build themes for the given concept seeds (typically one document's, but
/// a whole-graph run just passes every concept).
pub async fn build_themes(
    ctx: &PipelineContext,
    seeds: &[ThemeSeed],
    claims: &[Claim],
    diagnostics: &mut JobDiagnostics,
) -> Result<Vec<ThemeArtifact>, LoomError> {
    ctx.check_cancelled()?;
    if !ctx.config.enable_community_detection || seeds.is_empty() {
        return Ok(Vec::new());
    }
    let config = &ctx.config.themes;

    // ── Projection ─────────────────────────────────────────────────
    let mut graph: UnGraph<ProjectionNode, f32> = UnGraph::new_undirected();
    let mut index_of: FxHashMap<String, NodeIndex> = FxHashMap::default();

    let mut sorted_seeds: Vec<&ThemeSeed> = seeds.iter().collect();
    sorted_seeds.sort_by(|a, b| a.id.cmp(&b.id));
    sorted_seeds.dedup_by(|a, b| a.id == b.id);
    for seed in &sorted_seeds {
        let index = graph.add_node(ProjectionNode {
            id: seed.id.clone(),
            text: seed.text.clone(),
            is_concept: true,
        });
        index_of.insert(seed.id.clone(), index);
    }

    // Concept-concept edges already persisted inside the projection.
    for seed in &sorted_seeds {
        let Some(&src_index) = index_of.get(&seed.id) else {
            continue;
        };
        for (edge, neighbor) in ctx
            .store()
            .neighbors(&seed.id, &[], Direction::Out)
            .await?
        {
            if neighbor.label != NodeLabel::Concept {
                continue;
            }
            if let Some(&dst_index) = index_of.get(&neighbor.id)
                && graph.find_edge(src_index, dst_index).is_none()
            {
                let weight = edge.props.get("confidence").and_then(|v| v.as_f64()).unwrap_or(1.0);
                graph.add_edge(src_index, dst_index, weight as f32);
            }
        }
    }

    // Claims join the projection through shared concepts.
    if config.include_claims {
        let mut claims_by_chunk: FxHashMap<&str, Vec<&Claim>> = FxHashMap::default();
        for claim in claims.iter().filter(|c| c.canonical_id.is_none()) {
            claims_by_chunk.entry(claim.chunk_id.as_str()).or_default().push(claim);
        }
        for chunk_claims in claims_by_chunk.values() {
            for claim in chunk_claims {
                let index = graph.add_node(ProjectionNode {
                    id: claim.id.clone(),
                    text: claim.text.clone(),
                    is_concept: false,
                });
                index_of.insert(claim.id.clone(), index);
            }
            // Same chunk → shared concepts → co-membership edges.
            for pair in chunk_claims.windows(2) {
                if let (Some(&a), Some(&b)) =
                    (index_of.get(&pair[0].id), index_of.get(&pair[1].id))
                {
                    graph.add_edge(a, b, 0.5);
                }
            }
        }
    }

    if graph.node_count() == 0 {
        return Ok(Vec::new());
    }

    // ── Communities ────────────────────────────────────────────────
    let coarse = detect_communities(&graph);
    let mut artifacts = Vec::new();
    let mut community_counter = 0_usize;

    for community in &coarse {
        if community.len() < config.min_community_size {
            continue;
        }
        artifacts.push(
            summarize_community(ctx, &graph, community, ThemeLevel::Coarse, community_counter, diagnostics)
                .await?,
        );
        community_counter += 1;

        // Fine level: split large communities again.
        if community.len() >= config.min_community_size * 2 {
            let subgraph = induced_subgraph(&graph, community);
            let fine = detect_communities(&subgraph);
            if fine.len() > 1 {
                for sub in fine {
                    if sub.len() < config.min_community_size {
                        continue;
                    }
                    artifacts.push(
                        summarize_community(
                            ctx,
                            &subgraph,
                            &sub,
                            ThemeLevel::Fine,
                            community_counter,
                            diagnostics,
                        )
                        .await?,
                    );
                    community_counter += 1;
                }
            }
        }
    }

    // Theme summaries are embedded in one batch for retrieval.
    let summaries: Vec<String> = artifacts
        .iter()
        .map(|a| format!("{} {}", a.theme.label, a.theme.summary))
        .collect();
    if ctx.config.enable_vector_search && !summaries.is_empty() {
        let vectors = ctx.embed(&summaries).await?;
        for (artifact, vector) in artifacts.iter_mut().zip(vectors) {
            artifact.theme.embedding = Some(vector);
        }
    }
    Ok(artifacts)
}

/// Deterministic single-level Louvain: repeatedly move each node to the
/// neighbor community with the best positive modularity gain, visiting
/// nodes in index order, until a full pass moves nothing.
fn detect_communities(graph: &UnGraph<ProjectionNode, f32>) -> Vec<Vec<NodeIndex>> {
    let node_count = graph.node_count();
    if node_count == 0 {
        return Vec::new();
    }
    let total_weight: f32 = graph.edge_indices().map(|e| graph[e]).sum::<f32>().max(1e-6);
    let degree: Vec<f32> = graph
        .node_indices()
        .map(|n| graph.edges(n).map(|e| *e.weight()).sum())
        .collect();

    let mut community: Vec<usize> = (0..node_count).collect();
    // Total degree per community.
    let mut community_degree: Vec<f32> = degree.clone();

    for _ in 0..10 {
        let mut moved = false;
        for node in graph.node_indices() {
            let current = community[node.index()];
            let k_i = degree[node.index()];

            // Weight from this node into each neighboring community.
            let mut weight_to: FxHashMap<usize, f32> = FxHashMap::default();
            for edge in graph.edges(node) {
                let other = if edge.source() == node {
                    edge.target()
                } else {
                    edge.source()
                };
                *weight_to.entry(community[other.index()]).or_insert(0.0) += *edge.weight();
            }

            community_degree[current] -= k_i;
            let gain = |target: usize| {
                let w = weight_to.get(&target).copied().unwrap_or(0.0);
                w - community_degree[target] * k_i / (2.0 * total_weight)
            };
            let stay_gain = gain(current);
            let mut best = (current, stay_gain);
            let mut targets: Vec<usize> = weight_to.keys().copied().collect();
            targets.sort_unstable();
            for target in targets {
                let g = gain(target);
                if g > best.1 + 1e-6 {
                    best = (target, g);
                }
            }
            community_degree[best.0] += k_i;
            if best.0 != current {
                community[node.index()] = best.0;
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }

    let mut grouped: FxHashMap<usize, Vec<NodeIndex>> = FxHashMap::default();
    for node in graph.node_indices() {
        grouped.entry(community[node.index()]).or_default().push(node);
    }
    let mut communities: Vec<Vec<NodeIndex>> = grouped.into_values().collect();
    for members in &mut communities {
        members.sort_by_key(|n| n.index());
    }
    communities.sort_by_key(|members| members[0].index());
    communities
}

fn induced_subgraph(
    graph: &UnGraph<ProjectionNode, f32>,
    members: &[NodeIndex],
) -> UnGraph<ProjectionNode, f32> {
    let mut subgraph = UnGraph::new_undirected();
    let mut mapping: FxHashMap<NodeIndex, NodeIndex> = FxHashMap::default();
    for &index in members {
        mapping.insert(index, subgraph.add_node(graph[index].clone()));
    }
    for edge in graph.edge_indices() {
        if let Some((a, b)) = graph.edge_endpoints(edge)
            && let (Some(&sa), Some(&sb)) = (mapping.get(&a), mapping.get(&b))
        {
            subgraph.add_edge(sa, sb, graph[edge]);
        }
    }
    subgraph
}

async fn summarize_community(
    ctx: &PipelineContext,
    graph: &UnGraph<ProjectionNode, f32>,
    members: &[NodeIndex],
    level: ThemeLevel,
    community_id: usize,
    diagnostics: &mut JobDiagnostics,
) -> Result<ThemeArtifact, LoomError> {
    let config = &ctx.config.themes;

    // Top-degree concepts anchor the label; member claims flavor it.
    let mut by_degree: Vec<&NodeIndex> = members.iter().collect();
    by_degree.sort_by_key(|&&n| (std::cmp::Reverse(graph.edges(n).count()), n.index()));
    let concept_names: Vec<&str> = by_degree
        .iter()
        .filter(|&&&n| graph[n].is_concept)
        .take(config.label_sample_size)
        .map(|&&n| graph[n].text.as_str())
        .collect();
    let claim_samples: Vec<&str> = by_degree
        .iter()
        .filter(|&&&n| !graph[n].is_concept)
        .take(config.label_sample_size)
        .map(|&&n| graph[n].text.as_str())
        .collect();

    let member_ids: Vec<String> = members.iter().map(|&n| graph[n].id.clone()).collect();
    let mut sorted_ids = member_ids.clone();
    sorted_ids.sort();
    let level_tag = match level {
        ThemeLevel::Coarse => "coarse",
        ThemeLevel::Fine => "fine",
    };
    let id_parts: Vec<&str> = sorted_ids
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(level_tag))
        .collect();
    let theme_id = format!("thm-{}", short_hash(&id_parts));

    let prompt = ctx
        .config
        .prompts
        .theme_summary
        .replace("{concepts}", &concept_names.join("; "))
        .replace("{claims}", &claim_samples.join("\n"));

    let (label, summary) = match ctx.chat(vec![ChatMessage::user(prompt)]).await {
        Ok(reply) => match parse_summary(&reply) {
            Some(parsed) => (parsed.label, parsed.summary),
            None => {
                diagnostics.record(
                    &theme_id,
                    StageName::Themes,
                    "unparseable theme summary, using fallback label",
                );
                fallback_label(&concept_names)
            }
        },
        Err(LoomError::Cancelled) => return Err(LoomError::Cancelled),
        Err(err) => {
            diagnostics.record(&theme_id, StageName::Themes, err.to_string());
            fallback_label(&concept_names)
        }
    };

    let member_texts: Vec<String> = members.iter().map(|&n| graph[n].text.clone()).collect();
    let keywords = tfidf_keywords(&member_texts, config.keywords_per_theme);

    Ok(ThemeArtifact {
        theme: Theme {
            id: theme_id,
            label,
            summary,
            level,
            keywords,
            community_id,
            member_count: members.len(),
            embedding: None,
        },
        members: member_ids,
    })
}

fn parse_summary(reply: &str) -> Option<LlmThemeSummary> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}

fn fallback_label(concept_names: &[&str]) -> (String, String) {
    let label = concept_names
        .iter()
        .take(3)
        .map(|name| name.split_whitespace().next().unwrap_or(name))
        .collect::<Vec<_>>()
        .join(" / ");
    let label = if label.is_empty() {
        "untitled theme".to_string()
    } else {
        label
    };
    (label.clone(), label)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> ProjectionNode {
        ProjectionNode {
            id: id.to_string(),
            text: id.to_string(),
            is_concept: true,
        }
    }

    #[test]
    fn two_cliques_separate_into_two_communities() {
        let mut graph: UnGraph<ProjectionNode, f32> = UnGraph::new_undirected();
        let a: Vec<NodeIndex> = (0..4).map(|i| graph.add_node(node(&format!("a{i}")))).collect();
        let b: Vec<NodeIndex> = (0..4).map(|i| graph.add_node(node(&format!("b{i}")))).collect();
        for group in [&a, &b] {
            for i in 0..group.len() {
                for j in (i + 1)..group.len() {
                    graph.add_edge(group[i], group[j], 1.0);
                }
            }
        }
        // A single weak bridge between the cliques.
        graph.add_edge(a[0], b[0], 0.1);

        let communities = detect_communities(&graph);
        let sizeable: Vec<_> = communities.iter().filter(|c| c.len() >= 3).collect();
        assert_eq!(sizeable.len(), 2, "expected the two cliques, got {communities:?}");
    }

    #[test]
    fn detection_is_deterministic() {
        let build = || {
            let mut graph: UnGraph<ProjectionNode, f32> = UnGraph::new_undirected();
            let nodes: Vec<NodeIndex> =
                (0..6).map(|i| graph.add_node(node(&format!("n{i}")))).collect();
            graph.add_edge(nodes[0], nodes[1], 1.0);
            graph.add_edge(nodes[1], nodes[2], 1.0);
            graph.add_edge(nodes[3], nodes[4], 1.0);
            graph.add_edge(nodes[4], nodes[5], 1.0);
            detect_communities(&graph)
                .into_iter()
                .map(|c| c.into_iter().map(|n| n.index()).collect::<Vec<_>>())
                .collect::<Vec<_>>()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn singleton_graph_is_one_community() {
        let mut graph: UnGraph<ProjectionNode, f32> = UnGraph::new_undirected();
        graph.add_node(node("only"));
        let communities = detect_communities(&graph);
        assert_eq!(communities.len(), 1);
        assert_eq!(communities[0].len(), 1);
    }

    #[test]
    fn fallback_label_uses_top_concepts() {
        let (label, _) = fallback_label(&["Transformer architecture", "Attention mechanism"]);
        assert_eq!(label, "Transformer / Attention");
    }
}
