//! Hierarchical navigable small-world graph for approximate nearest neighbor
//! search.
//!
//! The graph lives in memory per `(tenant, schema)` and mirrors every
//! mutation into the `hnsw_graph` column family through the caller's write
//! batch, so adjacency survives restarts and rides the same atomic commit as
//! the entity write.

use crate::embeddings::cosine_distance;
use crate::storage::batch::BatchBuilder;
use crate::storage::column_families::CF_HNSW;
use crate::storage::keys;
use crate::types::{DatabaseError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use uuid::Uuid;

/// Tuning parameters, persisted in `meta` per index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HnswParams {
    /// Vector dimensionality; fixed for the index lifetime.
    pub dim: usize,
    /// Max neighbors per node on non-bottom layers.
    pub m: usize,
    /// Max neighbors on the bottom layer.
    pub m0: usize,
    /// Beam width during construction.
    pub ef_construction: usize,
    /// Level multiplier for the exponential layer distribution.
    pub ml: f64,
    /// Default beam width during search.
    pub ef_search: usize,
}

impl HnswParams {
    pub fn new(dim: usize) -> Self {
        let m = 16usize;
        Self {
            dim,
            m,
            m0: m * 2,
            ef_construction: 200,
            ml: 1.0 / (m as f64).ln(),
            ef_search: 100,
        }
    }

    fn max_neighbors(&self, layer: u8) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }
}

/// Per-node state persisted at the node key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub top_layer: u8,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
struct Node {
    top_layer: u8,
    deleted: bool,
    /// Neighbor lists indexed by layer, `0..=top_layer`.
    neighbors: Vec<Vec<Uuid>>,
    vector: Vec<f32>,
}

/// Max-heap entry ordered by distance (peek = farthest).
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    dist: f32,
    id: Uuid,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist.total_cmp(&other.dist)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The in-memory HNSW graph for one `(tenant, schema)` index.
pub struct HnswIndex {
    tenant: String,
    schema: String,
    params: HnswParams,
    entry: Option<(Uuid, u8)>,
    nodes: HashMap<Uuid, Node>,
}

impl HnswIndex {
    pub fn new(tenant: String, schema: String, params: HnswParams) -> Self {
        Self {
            tenant,
            schema,
            params,
            entry: None,
            nodes: HashMap::new(),
        }
    }

    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    pub fn entry_point(&self) -> Option<(Uuid, u8)> {
        self.entry
    }

    /// Number of nodes, tombstones included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Restore a node while loading the graph from storage.
    pub fn load_node(
        &mut self,
        id: Uuid,
        state: NodeState,
        neighbors: Vec<Vec<Uuid>>,
        vector: Vec<f32>,
    ) {
        self.nodes.insert(
            id,
            Node {
                top_layer: state.top_layer,
                deleted: state.deleted,
                neighbors,
                vector,
            },
        );
    }

    /// Restore the entry point while loading.
    pub fn load_entry(&mut self, entry: Option<(Uuid, u8)>) {
        self.entry = entry;
    }

    /// Layer for a new node: exponential distribution with parameter `ml`,
    /// derived from the node id so a rebuild reproduces the same structure.
    fn sample_layer(&self, id: Uuid) -> u8 {
        let hash = blake3::hash(id.as_bytes());
        let raw = u64::from_le_bytes(hash.as_bytes()[..8].try_into().unwrap_or([0u8; 8]));
        // Uniform in (0, 1]; never exactly zero so ln() stays finite.
        let uniform = (raw as f64 + 1.0) / (u64::MAX as f64 + 2.0);
        let level = (-uniform.ln() * self.params.ml).floor() as i64;
        level.clamp(0, 31) as u8
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        cosine_distance(a, b)
    }

    /// Greedy 1-neighbor descent at one layer.
    fn greedy_search_layer(&self, query: &[f32], start: Uuid, layer: u8) -> Uuid {
        let mut current = start;
        let mut current_dist = match self.nodes.get(&current) {
            Some(node) => self.distance(query, &node.vector),
            None => return current,
        };

        loop {
            let mut improved = false;
            if let Some(node) = self.nodes.get(&current) {
                if let Some(neighbors) = node.neighbors.get(layer as usize) {
                    for &neighbor in neighbors {
                        if let Some(n) = self.nodes.get(&neighbor) {
                            let d = self.distance(query, &n.vector);
                            if d < current_dist {
                                current = neighbor;
                                current_dist = d;
                                improved = true;
                            }
                        }
                    }
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search at one layer, returning up to `ef` candidates sorted by
    /// ascending distance. Tombstoned nodes are traversed (they still route)
    /// but the caller filters them from results.
    fn search_layer(&self, query: &[f32], start: Uuid, ef: usize, layer: u8) -> Vec<Candidate> {
        let start_dist = match self.nodes.get(&start) {
            Some(node) => self.distance(query, &node.vector),
            None => return Vec::new(),
        };

        let mut visited: HashSet<Uuid> = HashSet::new();
        visited.insert(start);

        // Min-heap of frontier candidates (closest first, via Reverse).
        let mut frontier: BinaryHeap<std::cmp::Reverse<Candidate>> = BinaryHeap::new();
        frontier.push(std::cmp::Reverse(Candidate {
            dist: start_dist,
            id: start,
        }));

        // Max-heap of the best `ef` found so far (farthest on top).
        let mut best: BinaryHeap<Candidate> = BinaryHeap::new();
        best.push(Candidate {
            dist: start_dist,
            id: start,
        });

        while let Some(std::cmp::Reverse(candidate)) = frontier.pop() {
            let farthest = best.peek().map(|c| c.dist).unwrap_or(f32::INFINITY);
            if candidate.dist > farthest && best.len() >= ef {
                break;
            }

            if let Some(node) = self.nodes.get(&candidate.id) {
                if let Some(neighbors) = node.neighbors.get(layer as usize) {
                    for &neighbor in neighbors {
                        if !visited.insert(neighbor) {
                            continue;
                        }
                        let Some(n) = self.nodes.get(&neighbor) else {
                            continue;
                        };
                        let d = self.distance(query, &n.vector);
                        let farthest = best.peek().map(|c| c.dist).unwrap_or(f32::INFINITY);
                        if best.len() < ef || d < farthest {
                            frontier.push(std::cmp::Reverse(Candidate { dist: d, id: neighbor }));
                            best.push(Candidate { dist: d, id: neighbor });
                            if best.len() > ef {
                                best.pop();
                            }
                        }
                    }
                }
            }
        }

        let mut result = best.into_vec();
        result.sort();
        result
    }

    /// Heuristic neighbor selection: keep a candidate only if it is closer to
    /// the query than to every already-selected neighbor, preferring diverse
    /// directions over raw proximity.
    fn select_neighbors(&self, candidates: &[Candidate], m: usize) -> Vec<Uuid> {
        let mut selected: Vec<Candidate> = Vec::with_capacity(m);
        for &candidate in candidates {
            if selected.len() >= m {
                break;
            }
            let Some(node) = self.nodes.get(&candidate.id) else {
                continue;
            };
            let diverse = selected.iter().all(|kept| {
                let Some(kept_node) = self.nodes.get(&kept.id) else {
                    return true;
                };
                self.distance(&node.vector, &kept_node.vector) > candidate.dist
            });
            if diverse {
                selected.push(candidate);
            }
        }

        // Backfill with nearest remaining candidates if diversity starved us.
        if selected.len() < m {
            for &candidate in candidates {
                if selected.len() >= m {
                    break;
                }
                if !selected.iter().any(|c| c.id == candidate.id) {
                    selected.push(candidate);
                }
            }
        }

        selected.into_iter().map(|c| c.id).collect()
    }

    /// Re-prune a node's neighbor list at `layer` down to capacity.
    fn prune_neighbors(&mut self, id: Uuid, layer: u8) {
        let max = self.params.max_neighbors(layer);
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let current = match node.neighbors.get(layer as usize) {
            Some(list) if list.len() > max => list.clone(),
            _ => return,
        };

        let base = node.vector.clone();
        let mut candidates: Vec<Candidate> = current
            .iter()
            .filter_map(|&n| {
                self.nodes.get(&n).map(|node| Candidate {
                    dist: self.distance(&base, &node.vector),
                    id: n,
                })
            })
            .collect();
        candidates.sort();

        let pruned = self.select_neighbors(&candidates, max);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.neighbors[layer as usize] = pruned;
        }
    }

    /// Insert a vector, staging every touched adjacency list into `batch`.
    pub fn insert(&mut self, id: Uuid, vector: Vec<f32>, batch: &mut BatchBuilder) -> Result<()> {
        if vector.len() != self.params.dim {
            return Err(DatabaseError::SchemaInvalid(format!(
                "vector dimension {} does not match index dimension {}",
                vector.len(),
                self.params.dim
            )));
        }

        // Re-insert of an existing node: replace the vector in place and
        // clear any tombstone; links stay valid.
        if self.nodes.contains_key(&id) {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.vector = vector;
                node.deleted = false;
            }
            self.stage_node(id, batch);
            return Ok(());
        }

        let level = self.sample_layer(id);
        let node = Node {
            top_layer: level,
            deleted: false,
            neighbors: vec![Vec::new(); level as usize + 1],
            vector: vector.clone(),
        };
        self.nodes.insert(id, node);

        let mut touched: HashSet<Uuid> = HashSet::new();
        touched.insert(id);

        match self.entry {
            None => {
                self.entry = Some((id, level));
            }
            Some((entry_id, entry_layer)) => {
                let mut ep = entry_id;

                // Greedy descent through layers above the insertion level.
                let mut layer = entry_layer;
                while layer > level {
                    ep = self.greedy_search_layer(&vector, ep, layer);
                    layer -= 1;
                }

                // Beam search and bidirectional linking from min(level,
                // entry_layer) down to 0.
                let mut layer = level.min(entry_layer);
                loop {
                    let candidates =
                        self.search_layer(&vector, ep, self.params.ef_construction, layer);
                    let max = self.params.max_neighbors(layer);
                    let selected = self.select_neighbors(&candidates, max);

                    if let Some(best) = candidates.first() {
                        ep = best.id;
                    }

                    if let Some(node) = self.nodes.get_mut(&id) {
                        node.neighbors[layer as usize] = selected.clone();
                    }
                    for neighbor in selected {
                        if let Some(n) = self.nodes.get_mut(&neighbor) {
                            if let Some(list) = n.neighbors.get_mut(layer as usize) {
                                if !list.contains(&id) {
                                    list.push(id);
                                }
                            }
                        }
                        self.prune_neighbors(neighbor, layer);
                        touched.insert(neighbor);
                    }

                    if layer == 0 {
                        break;
                    }
                    layer -= 1;
                }

                if level > entry_layer {
                    self.entry = Some((id, level));
                }
            }
        }

        for node_id in touched {
            self.stage_node(node_id, batch);
        }
        self.stage_entry(batch)?;
        Ok(())
    }

    /// Top-k search with beam width `max(ef, k)`. Tombstones are skipped.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Result<Vec<(Uuid, f32)>> {
        if query.len() != self.params.dim {
            return Err(DatabaseError::SchemaInvalid(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.params.dim
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let Some((entry_id, entry_layer)) = self.entry else {
            return Ok(Vec::new());
        };

        let mut ep = entry_id;
        let mut layer = entry_layer;
        while layer > 0 {
            ep = self.greedy_search_layer(query, ep, layer);
            layer -= 1;
        }

        let beam = ef.max(k);
        let candidates = self.search_layer(query, ep, beam, 0);
        Ok(candidates
            .into_iter()
            .filter(|c| {
                self.nodes
                    .get(&c.id)
                    .map(|n| !n.deleted)
                    .unwrap_or(false)
            })
            .take(k)
            .map(|c| (c.id, c.dist))
            .collect())
    }

    /// Tombstone a node. Searches skip it; vacuum removes it.
    pub fn mark_deleted(&mut self, id: Uuid, batch: &mut BatchBuilder) -> bool {
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        node.deleted = true;
        self.stage_node(id, batch);
        true
    }

    /// Physically remove a tombstoned node, relinking its neighbors through
    /// each other so the graph stays navigable.
    pub fn remove(&mut self, id: Uuid, batch: &mut BatchBuilder) -> Result<()> {
        let Some(node) = self.nodes.remove(&id) else {
            return Ok(());
        };

        let mut touched: HashSet<Uuid> = HashSet::new();
        for (layer, neighbors) in node.neighbors.iter().enumerate() {
            let layer = layer as u8;
            for &a in neighbors {
                if !self.nodes.contains_key(&a) {
                    continue;
                }
                // Bridge across the removed node: its other neighbors become
                // candidates for `a`.
                let bridges: Vec<Uuid> = neighbors
                    .iter()
                    .copied()
                    .filter(|&b| b != a && self.nodes.contains_key(&b))
                    .collect();
                if let Some(n) = self.nodes.get_mut(&a) {
                    if let Some(list) = n.neighbors.get_mut(layer as usize) {
                        list.retain(|&x| x != id);
                        for b in bridges {
                            if !list.contains(&b) {
                                list.push(b);
                            }
                        }
                    }
                }
                self.prune_neighbors(a, layer);
                touched.insert(a);
            }
        }

        // Stage deletes for every persisted piece of the removed node.
        batch.delete(CF_HNSW, keys::hnsw_node_key(&self.tenant, &self.schema, id));
        for layer in 0..=node.top_layer {
            batch.delete(
                CF_HNSW,
                keys::hnsw_adjacency_key(&self.tenant, &self.schema, layer, id),
            );
        }
        for node_id in touched {
            self.stage_node(node_id, batch);
        }

        // Pick a replacement entry point if we removed it.
        if self.entry.map(|(e, _)| e) == Some(id) {
            self.entry = self
                .nodes
                .iter()
                .filter(|(_, n)| !n.deleted)
                .max_by_key(|(_, n)| n.top_layer)
                .map(|(&id, n)| (id, n.top_layer));
            self.stage_entry(batch)?;
        }
        Ok(())
    }

    /// Ids of tombstoned nodes (vacuum input).
    pub fn tombstones(&self) -> Vec<Uuid> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.deleted)
            .map(|(&id, _)| id)
            .collect()
    }

    fn stage_node(&self, id: Uuid, batch: &mut BatchBuilder) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let state = NodeState {
            top_layer: node.top_layer,
            deleted: node.deleted,
        };
        if let Ok(encoded) = bincode::serialize(&state) {
            batch.put(
                CF_HNSW,
                keys::hnsw_node_key(&self.tenant, &self.schema, id),
                encoded,
            );
        }
        for (layer, neighbors) in node.neighbors.iter().enumerate() {
            if let Ok(encoded) = bincode::serialize(neighbors) {
                batch.put(
                    CF_HNSW,
                    keys::hnsw_adjacency_key(&self.tenant, &self.schema, layer as u8, id),
                    encoded,
                );
            }
        }
    }

    fn stage_entry(&self, batch: &mut BatchBuilder) -> Result<()> {
        use crate::storage::column_families::CF_META;
        let key = keys::meta_hnsw_entry_key(&self.tenant, &self.schema);
        match self.entry {
            Some(entry) => batch.put(CF_META, key, serde_json::to_vec(&entry)?),
            None => batch.delete(CF_META, key),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(dim: usize) -> HnswIndex {
        HnswIndex::new("t1".into(), "article".into(), HnswParams::new(dim))
    }

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }

    #[test]
    fn test_insert_and_exact_search() {
        let mut idx = index(3);
        let mut batch = BatchBuilder::new();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        idx.insert(a, unit(vec![1.0, 0.0, 0.0]), &mut batch).unwrap();
        idx.insert(b, unit(vec![0.0, 1.0, 0.0]), &mut batch).unwrap();
        idx.insert(c, unit(vec![0.9, 0.1, 0.0]), &mut batch).unwrap();

        let hits = idx.search(&unit(vec![1.0, 0.0, 0.0]), 2, 50).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, a);
        assert_eq!(hits[1].0, c);
        assert!(hits[0].1 <= hits[1].1);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut idx = index(3);
        let mut batch = BatchBuilder::new();
        let err = idx.insert(Uuid::new_v4(), vec![1.0, 0.0], &mut batch);
        assert!(matches!(err, Err(DatabaseError::SchemaInvalid(_))));
        assert!(matches!(
            idx.search(&[1.0, 0.0], 1, 10),
            Err(DatabaseError::SchemaInvalid(_))
        ));
    }

    #[test]
    fn test_top_k_zero_returns_empty() {
        let mut idx = index(2);
        let mut batch = BatchBuilder::new();
        idx.insert(Uuid::new_v4(), vec![1.0, 0.0], &mut batch).unwrap();
        assert!(idx.search(&[1.0, 0.0], 0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_tombstone_skipped_then_removed() {
        let mut idx = index(2);
        let mut batch = BatchBuilder::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        idx.insert(a, vec![1.0, 0.0], &mut batch).unwrap();
        idx.insert(b, vec![0.0, 1.0], &mut batch).unwrap();

        idx.mark_deleted(a, &mut batch);
        let hits = idx.search(&[1.0, 0.0], 2, 10).unwrap();
        assert_eq!(hits.iter().filter(|(id, _)| *id == a).count(), 0);
        assert_eq!(hits.len(), 1);

        idx.remove(a, &mut batch).unwrap();
        assert!(!idx.contains(a));
        let hits = idx.search(&[0.0, 1.0], 1, 10).unwrap();
        assert_eq!(hits[0].0, b);
    }

    #[test]
    fn test_reinsert_replaces_vector() {
        let mut idx = index(2);
        let mut batch = BatchBuilder::new();
        let a = Uuid::new_v4();
        idx.insert(a, vec![1.0, 0.0], &mut batch).unwrap();
        idx.insert(a, vec![0.0, 1.0], &mut batch).unwrap();
        assert_eq!(idx.len(), 1);

        let hits = idx.search(&[0.0, 1.0], 1, 10).unwrap();
        assert_eq!(hits[0].0, a);
        assert!(hits[0].1 < 0.01);
    }

    #[test]
    fn test_recall_on_random_points() {
        // Property 8 at reduced scale: hash-derived pseudo-random points,
        // recall of top-10 against exhaustive scan must clear 0.9.
        let dim = 8;
        let n = 300;
        let mut idx = index(dim);
        let mut batch = BatchBuilder::new();

        let mut points: Vec<(Uuid, Vec<f32>)> = Vec::new();
        for i in 0..n {
            let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("pt-{i}").as_bytes());
            let hash = blake3::hash(format!("vec-{i}").as_bytes());
            let v: Vec<f32> = hash.as_bytes()[..dim]
                .iter()
                .map(|&b| (b as f32 / 255.0) * 2.0 - 1.0)
                .collect();
            let v = unit(v);
            idx.insert(id, v.clone(), &mut batch).unwrap();
            points.push((id, v));
        }

        let mut total_recall = 0.0;
        let queries = 20;
        for q in 0..queries {
            let hash = blake3::hash(format!("query-{q}").as_bytes());
            let query: Vec<f32> = hash.as_bytes()[..dim]
                .iter()
                .map(|&b| (b as f32 / 255.0) * 2.0 - 1.0)
                .collect();
            let query = unit(query);

            let mut exact: Vec<(Uuid, f32)> = points
                .iter()
                .map(|(id, v)| (*id, cosine_distance(&query, v)))
                .collect();
            exact.sort_by(|a, b| a.1.total_cmp(&b.1));
            let exact_top: HashSet<Uuid> = exact.iter().take(10).map(|(id, _)| *id).collect();

            let approx = idx.search(&query, 10, 100).unwrap();
            let found = approx
                .iter()
                .filter(|(id, _)| exact_top.contains(id))
                .count();
            total_recall += found as f64 / 10.0;
        }

        let recall = total_recall / queries as f64;
        assert!(recall >= 0.9, "recall {recall} below floor");
    }
}
