//! Plan execution over the index managers.
//!
//! Every path fetches entities through a snapshot taken at the start of the
//! query, so mid-query writes do not perturb results. Hybrid plans run their
//! vector and BM25 legs concurrently and fuse with reciprocal rank fusion.

use crate::embeddings::ProviderRegistry;
use crate::graph::{EdgeManager, GraphTraversal};
use crate::index::{ColumnIndex, InvertedIndex, KeyIndex, VectorIndexManager};
use crate::query::plan::{
    json_cmp, OrderBy, PlannedQuery, Predicate, PredicateOp, Projection, QueryPlan,
};
use crate::schema::SchemaRegistry;
use crate::storage::column_families::CF_ENTITIES;
use crate::storage::db::StorageSnapshot;
use crate::storage::{keys, Storage};
use crate::types::{DatabaseError, Entity, Result};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Reciprocal rank fusion constant.
const RRF_K: f32 = 60.0;

/// Result floor below which the fallback plan runs.
const RESULT_FLOOR: usize = 1;

/// Edit distance allowed by the fuzzy lookup fallback.
const FUZZY_DISTANCE: usize = 2;

/// One result row.
#[derive(Debug, Clone)]
pub struct ScoredEntity {
    pub entity: Entity,
    pub score: Option<f32>,
}

/// Output of a query: rows, or a count for `COUNT(*)`.
#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub rows: Vec<ScoredEntity>,
    pub count: Option<u64>,
    /// Plan tag actually executed (for logs and the CLI).
    pub plan_kind: &'static str,
    /// Column projection, when the query named columns.
    pub columns: Option<Vec<String>>,
}

/// Executes plan trees.
pub struct QueryExecutor {
    storage: Storage,
    registry: Arc<SchemaRegistry>,
    key_index: KeyIndex,
    col_index: ColumnIndex,
    inverted: InvertedIndex,
    vectors: Arc<VectorIndexManager>,
    edges: EdgeManager,
    providers: Arc<ProviderRegistry>,
}

impl QueryExecutor {
    pub fn new(
        storage: Storage,
        registry: Arc<SchemaRegistry>,
        vectors: Arc<VectorIndexManager>,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            key_index: KeyIndex::new(storage.clone()),
            col_index: ColumnIndex::new(storage.clone()),
            inverted: InvertedIndex::new(storage.clone()),
            edges: EdgeManager::new(storage.clone()),
            storage,
            registry,
            vectors,
            providers,
        }
    }

    /// Execute a planned query, running the fallback when the primary plan
    /// comes back under the result floor.
    pub async fn execute(&self, tenant: &str, planned: &PlannedQuery) -> Result<QueryOutput> {
        let primary = self.execute_plan(tenant, &planned.plan).await?;
        if primary.count.is_some() || primary.rows.len() >= RESULT_FLOOR {
            return Ok(primary);
        }

        let Some(fallback) = &planned.fallback else {
            return Ok(primary);
        };
        tracing::debug!(
            plan = planned.plan.kind(),
            fallback = fallback.kind(),
            "primary plan under result floor, running fallback"
        );

        let secondary = self.execute_plan(tenant, fallback).await?;
        Ok(merge_outputs(primary, secondary))
    }

    async fn execute_plan(&self, tenant: &str, plan: &QueryPlan) -> Result<QueryOutput> {
        match plan {
            QueryPlan::Lookup { schema, key } => self.execute_lookup(tenant, schema, key),
            QueryPlan::Search {
                schema,
                query_text,
                top_k,
                ef,
            } => {
                self.execute_search(tenant, schema, query_text, *top_k, *ef)
                    .await
            }
            QueryPlan::Traverse {
                start_id,
                direction,
                depth,
                edge_type,
                limit,
            } => self.execute_traverse(tenant, *start_id, *direction, *depth, edge_type.as_deref(), *limit),
            QueryPlan::Sql {
                schema,
                projection,
                predicates,
                order_by,
                limit,
                index_column,
            } => self.execute_sql(
                tenant,
                schema,
                projection,
                predicates,
                order_by.as_ref(),
                *limit,
                index_column.as_deref(),
            ),
            QueryPlan::Hybrid {
                schema,
                query_text,
                top_k,
            } => self.execute_hybrid(tenant, schema, query_text, *top_k).await,
        }
    }

    fn fetch_live(
        &self,
        snapshot: &StorageSnapshot<'_>,
        tenant: &str,
        id: Uuid,
    ) -> Result<Option<Entity>> {
        match snapshot.get(CF_ENTITIES, &keys::entity_key(tenant, id))? {
            Some(bytes) => {
                let entity: Entity = serde_json::from_slice(&bytes)?;
                Ok((!entity.is_deleted()).then_some(entity))
            }
            None => Ok(None),
        }
    }

    fn execute_lookup(&self, tenant: &str, schema: &str, key: &str) -> Result<QueryOutput> {
        let snapshot = self.storage.snapshot();

        if let Some(id) = self.key_index.lookup(tenant, schema, key)? {
            if let Some(entity) = self.fetch_live(&snapshot, tenant, id)? {
                return Ok(rows_output("LOOKUP", vec![ScoredEntity { entity, score: None }]));
            }
        }

        // Exact miss: bounded-edit-distance fallback.
        for (_key, id) in self.key_index.fuzzy_lookup(tenant, schema, key, FUZZY_DISTANCE)? {
            if let Some(entity) = self.fetch_live(&snapshot, tenant, id)? {
                return Ok(rows_output("LOOKUP", vec![ScoredEntity { entity, score: None }]));
            }
        }

        Ok(rows_output("LOOKUP", Vec::new()))
    }

    async fn execute_search(
        &self,
        tenant: &str,
        schema: &str,
        query_text: &str,
        top_k: usize,
        ef: Option<usize>,
    ) -> Result<QueryOutput> {
        let resolved = self.registry.get(tenant, schema)?;
        if top_k == 0 || !resolved.has_embeddings() {
            // A schema without embedding fields never touches the vector
            // index.
            return Ok(rows_output("SEARCH", Vec::new()));
        }

        let provider_tag = resolved.extensions.default_embedding_provider.as_deref();
        let embeddings = self
            .providers
            .embed(provider_tag, &[query_text.to_string()])
            .await?;
        let query_vector = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| DatabaseError::EmbeddingError("empty embedding response".to_string()))?;

        let ef = ef.unwrap_or(100).max(top_k);
        let hits = self.vectors.search(tenant, schema, &query_vector, top_k, ef)?;

        let snapshot = self.storage.snapshot();
        let mut rows = Vec::with_capacity(hits.len());
        for (id, distance) in hits {
            if let Some(entity) = self.fetch_live(&snapshot, tenant, id)? {
                rows.push(ScoredEntity {
                    entity,
                    score: Some(1.0 - distance),
                });
            }
        }
        Ok(rows_output("SEARCH", rows))
    }

    fn execute_traverse(
        &self,
        tenant: &str,
        start_id: Uuid,
        direction: crate::graph::TraversalDirection,
        depth: usize,
        edge_type: Option<&str>,
        limit: usize,
    ) -> Result<QueryOutput> {
        let snapshot = self.storage.snapshot();

        // Depth 0 returns only the start entity.
        if depth == 0 {
            let rows = self
                .fetch_live(&snapshot, tenant, start_id)?
                .map(|entity| vec![ScoredEntity { entity, score: None }])
                .unwrap_or_default();
            return Ok(rows_output("TRAVERSE", rows));
        }

        let traversal = GraphTraversal::new(&self.edges);
        let ids = traversal.bfs(tenant, start_id, direction, depth, edge_type, limit)?;

        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entity) = self.fetch_live(&snapshot, tenant, id)? {
                rows.push(ScoredEntity { entity, score: None });
            }
        }
        Ok(rows_output("TRAVERSE", rows))
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_sql(
        &self,
        tenant: &str,
        schema: &str,
        projection: &Projection,
        predicates: &[Predicate],
        order_by: Option<&OrderBy>,
        limit: Option<usize>,
        index_column: Option<&str>,
    ) -> Result<QueryOutput> {
        self.registry.get(tenant, schema)?;
        let snapshot = self.storage.snapshot();

        let mut entities: Vec<Entity> = match index_column {
            Some(column) => {
                let predicate = predicates
                    .iter()
                    .find(|p| p.column == column && p.index_eligible())
                    .ok_or_else(|| {
                        DatabaseError::InternalError(format!(
                            "planner chose unindexable column {column}"
                        ))
                    })?;
                let ids = self.index_scan(tenant, schema, predicate)?;
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(entity) = self.fetch_live(&snapshot, tenant, id)? {
                        out.push(entity);
                    }
                }
                out
            }
            None => {
                // Full tenant+schema scan.
                let prefix = keys::entity_prefix(tenant);
                let mut out = Vec::new();
                for (_key, value) in snapshot.prefix_iter(CF_ENTITIES, &prefix)? {
                    let entity: Entity = serde_json::from_slice(&value)?;
                    if entity.system.schema_name == schema && !entity.is_deleted() {
                        out.push(entity);
                    }
                }
                out
            }
        };

        // Residual predicates (including the indexed one; re-checking it is
        // harmless and covers stale index races).
        entities.retain(|entity| predicates.iter().all(|p| p.matches(entity)));

        if let Some(order) = order_by {
            entities.sort_by(|a, b| {
                let left = a.property(&order.column).cloned().unwrap_or(serde_json::Value::Null);
                let right = b.property(&order.column).cloned().unwrap_or(serde_json::Value::Null);
                let ordering = json_cmp(&left, &right).unwrap_or(std::cmp::Ordering::Equal);
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        if let Some(limit) = limit {
            entities.truncate(limit);
        }

        if *projection == Projection::CountStar {
            return Ok(QueryOutput {
                count: Some(entities.len() as u64),
                rows: Vec::new(),
                plan_kind: "SQL",
                columns: None,
            });
        }

        let columns = match projection {
            Projection::Columns(columns) => Some(columns.clone()),
            _ => None,
        };
        Ok(QueryOutput {
            rows: entities
                .into_iter()
                .map(|entity| ScoredEntity { entity, score: None })
                .collect(),
            count: None,
            plan_kind: "SQL",
            columns,
        })
    }

    /// Ids matching one predicate through the column index.
    fn index_scan(&self, tenant: &str, schema: &str, predicate: &Predicate) -> Result<Vec<Uuid>> {
        match &predicate.op {
            PredicateOp::Eq(value) => self.col_index.scan_eq(tenant, schema, &predicate.column, value),
            PredicateOp::IsNull => {
                self.col_index
                    .scan_eq(tenant, schema, &predicate.column, &serde_json::Value::Null)
            }
            PredicateOp::In(values) => {
                let mut ids = Vec::new();
                let mut seen = HashSet::new();
                for value in values {
                    for id in self.col_index.scan_eq(tenant, schema, &predicate.column, value)? {
                        if seen.insert(id) {
                            ids.push(id);
                        }
                    }
                }
                Ok(ids)
            }
            PredicateOp::Lt(value) => {
                self.col_index
                    .scan_range(tenant, schema, &predicate.column, None, Some((value, false)))
            }
            PredicateOp::Lte(value) => {
                self.col_index
                    .scan_range(tenant, schema, &predicate.column, None, Some((value, true)))
            }
            PredicateOp::Gt(value) => {
                self.col_index
                    .scan_range(tenant, schema, &predicate.column, Some((value, false)), None)
            }
            PredicateOp::Gte(value) => {
                self.col_index
                    .scan_range(tenant, schema, &predicate.column, Some((value, true)), None)
            }
            PredicateOp::LikePrefix(prefix) => {
                self.col_index
                    .scan_string_prefix(tenant, schema, &predicate.column, prefix)
            }
            PredicateOp::IsNotNull => Err(DatabaseError::InternalError(
                "IS NOT NULL is not index-eligible".to_string(),
            )),
        }
    }

    async fn execute_hybrid(
        &self,
        tenant: &str,
        schema: &str,
        query_text: &str,
        top_k: usize,
    ) -> Result<QueryOutput> {
        if top_k == 0 {
            return Ok(rows_output("HYBRID", Vec::new()));
        }

        // Both legs over-fetch so fusion has enough candidates.
        let leg_k = top_k.saturating_mul(4).max(20);

        let vector_leg = self.execute_search(tenant, schema, query_text, leg_k, None);
        let sparse_leg = async { self.inverted.search(tenant, schema, query_text, leg_k) };
        let (vector_out, sparse_hits) = tokio::join!(vector_leg, sparse_leg);

        // A down embedding provider degrades hybrid to its sparse leg.
        let vector_ranked: Vec<Uuid> = match vector_out {
            Ok(output) => output.rows.iter().map(|r| r.entity.system.id).collect(),
            Err(DatabaseError::DependencyUnavailable(reason)) => {
                tracing::warn!(reason, "vector leg unavailable, fusing sparse only");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        let sparse_ranked: Vec<Uuid> = sparse_hits?.into_iter().map(|(id, _)| id).collect();

        let fused = reciprocal_rank_fusion(&[vector_ranked, sparse_ranked]);

        let snapshot = self.storage.snapshot();
        let mut rows = Vec::new();
        for (id, score) in fused {
            if rows.len() >= top_k {
                break;
            }
            if let Some(entity) = self.fetch_live(&snapshot, tenant, id)? {
                rows.push(ScoredEntity {
                    entity,
                    score: Some(score),
                });
            }
        }
        Ok(rows_output("HYBRID", rows))
    }
}

fn rows_output(plan_kind: &'static str, rows: Vec<ScoredEntity>) -> QueryOutput {
    QueryOutput {
        rows,
        count: None,
        plan_kind,
        columns: None,
    }
}

/// RRF: `score(d) = Σ 1/(k + rank_i(d))`, ranks 1-based, sorted descending.
pub fn reciprocal_rank_fusion(rankings: &[Vec<Uuid>]) -> Vec<(Uuid, f32)> {
    let mut scores: std::collections::HashMap<Uuid, f32> = std::collections::HashMap::new();
    for ranking in rankings {
        for (rank, id) in ranking.iter().enumerate() {
            *scores.entry(*id).or_insert(0.0) += 1.0 / (RRF_K + rank as f32 + 1.0);
        }
    }
    let mut fused: Vec<(Uuid, f32)> = scores.into_iter().collect();
    fused.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    fused
}

/// Merge fallback results behind the primary's, deduplicating by entity id.
fn merge_outputs(primary: QueryOutput, secondary: QueryOutput) -> QueryOutput {
    let mut seen: HashSet<Uuid> = primary.rows.iter().map(|r| r.entity.system.id).collect();
    let mut rows = primary.rows;
    for row in secondary.rows {
        if seen.insert(row.entity.system.id) {
            rows.push(row);
        }
    }
    QueryOutput {
        rows,
        count: primary.count,
        plan_kind: primary.plan_kind,
        columns: primary.columns,
    }
}
