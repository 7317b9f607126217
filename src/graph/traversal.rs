//! Graph traversal (BFS) over the edge column families.

use crate::graph::edges::EdgeManager;
use crate::types::Result;
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

/// Traversal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalDirection {
    /// Follow outgoing edges
    Out,
    /// Follow incoming edges
    In,
    /// Follow both directions
    Both,
}

impl std::str::FromStr for TraversalDirection {
    type Err = crate::types::DatabaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "out" => Ok(TraversalDirection::Out),
            "in" => Ok(TraversalDirection::In),
            "both" => Ok(TraversalDirection::Both),
            other => Err(crate::types::DatabaseError::BadQuery(format!(
                "invalid direction: {other} (expected out|in|both)"
            ))),
        }
    }
}

/// Cap on neighbors expanded per hop, so one dense node cannot blow up the
/// frontier.
const PER_HOP_CAP: usize = 1_000;

/// Breadth-first traversal engine.
pub struct GraphTraversal<'a> {
    edges: &'a EdgeManager,
}

impl<'a> GraphTraversal<'a> {
    pub fn new(edges: &'a EdgeManager) -> Self {
        Self { edges }
    }

    /// BFS from `start`, up to `depth` hops, in visit order.
    ///
    /// The start entity itself is not included. Depth 0 returns nothing;
    /// `limit` truncates the result.
    pub fn bfs(
        &self,
        tenant: &str,
        start: Uuid,
        direction: TraversalDirection,
        depth: usize,
        edge_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Uuid>> {
        let mut visited: HashSet<Uuid> = HashSet::new();
        visited.insert(start);

        let mut queue: VecDeque<(Uuid, usize)> = VecDeque::new();
        queue.push_back((start, 0));

        let mut result = Vec::new();

        while let Some((current, hops)) = queue.pop_front() {
            if hops >= depth || result.len() >= limit {
                continue;
            }

            let mut neighbors: Vec<Uuid> = Vec::new();
            if matches!(direction, TraversalDirection::Out | TraversalDirection::Both) {
                for edge in self.edges.outgoing(tenant, current, edge_type)? {
                    neighbors.push(edge.dst);
                }
            }
            if matches!(direction, TraversalDirection::In | TraversalDirection::Both) {
                for edge in self.edges.incoming(tenant, current, edge_type)? {
                    neighbors.push(edge.src);
                }
            }
            neighbors.truncate(PER_HOP_CAP);

            for neighbor in neighbors {
                if result.len() >= limit {
                    break;
                }
                if visited.insert(neighbor) {
                    result.push(neighbor);
                    queue.push_back((neighbor, hops + 1));
                }
            }
        }

        Ok(result)
    }
}
