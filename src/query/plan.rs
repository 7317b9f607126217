//! The discriminated plan tree compiled from a query.

use crate::graph::TraversalDirection;
use crate::types::Entity;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single WHERE predicate, always ANDed with its siblings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub column: String,
    pub op: PredicateOp,
}

/// Supported predicate operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Eq(serde_json::Value),
    In(Vec<serde_json::Value>),
    Lt(serde_json::Value),
    Lte(serde_json::Value),
    Gt(serde_json::Value),
    Gte(serde_json::Value),
    /// `LIKE 'prefix%'`
    LikePrefix(String),
    IsNull,
    IsNotNull,
}

impl Predicate {
    /// Whether an index scan over `column` can serve this predicate.
    pub fn index_eligible(&self) -> bool {
        !matches!(self.op, PredicateOp::IsNotNull)
    }

    /// Residual in-memory evaluation against an entity.
    pub fn matches(&self, entity: &Entity) -> bool {
        let value = entity
            .property(&self.column)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        match &self.op {
            PredicateOp::Eq(expected) => json_eq(&value, expected),
            PredicateOp::In(options) => options.iter().any(|o| json_eq(&value, o)),
            PredicateOp::Lt(bound) => json_cmp(&value, bound) == Some(std::cmp::Ordering::Less),
            PredicateOp::Lte(bound) => matches!(
                json_cmp(&value, bound),
                Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
            ),
            PredicateOp::Gt(bound) => json_cmp(&value, bound) == Some(std::cmp::Ordering::Greater),
            PredicateOp::Gte(bound) => matches!(
                json_cmp(&value, bound),
                Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
            ),
            PredicateOp::LikePrefix(prefix) => value
                .as_str()
                .map(|s| s.starts_with(prefix.as_str()))
                .unwrap_or(false),
            PredicateOp::IsNull => value.is_null(),
            PredicateOp::IsNotNull => !value.is_null(),
        }
    }
}

/// Numeric-aware equality: `3` and `3.0` are the same value.
fn json_eq(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering for homogeneous scalar pairs.
pub(crate) fn json_cmp(a: &serde_json::Value, b: &serde_json::Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    None
}

/// What a SELECT returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    All,
    Columns(Vec<String>),
    CountStar,
}

/// ORDER BY clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

/// The compiled plan tree.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    /// Exact match on the schema's key field.
    Lookup { schema: String, key: String },
    /// Vector ANN search.
    Search {
        schema: String,
        query_text: String,
        top_k: usize,
        ef: Option<usize>,
    },
    /// BFS over the edge column families.
    Traverse {
        start_id: Uuid,
        direction: TraversalDirection,
        depth: usize,
        edge_type: Option<String>,
        limit: usize,
    },
    /// Scan or index-driven structured query.
    Sql {
        schema: String,
        projection: Projection,
        predicates: Vec<Predicate>,
        order_by: Option<OrderBy>,
        limit: Option<usize>,
        /// Index-eligible column chosen by the planner; `None` = full scan.
        index_column: Option<String>,
    },
    /// Vector + BM25 legs fused with reciprocal rank fusion.
    Hybrid {
        schema: String,
        query_text: String,
        top_k: usize,
    },
}

impl QueryPlan {
    /// Display tag for logs and the CLI.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryPlan::Lookup { .. } => "LOOKUP",
            QueryPlan::Search { .. } => "SEARCH",
            QueryPlan::Traverse { .. } => "TRAVERSE",
            QueryPlan::Sql { .. } => "SQL",
            QueryPlan::Hybrid { .. } => "HYBRID",
        }
    }
}

/// A plan plus the planner's confidence and optional fallback.
#[derive(Debug, Clone)]
pub struct PlannedQuery {
    pub plan: QueryPlan,
    pub confidence: f64,
    pub fallback: Option<Box<QueryPlan>>,
}

impl PlannedQuery {
    pub fn certain(plan: QueryPlan) -> Self {
        Self {
            plan,
            confidence: 1.0,
            fallback: None,
        }
    }
}
