//! Plan selection: which index serves a query, with what confidence.

use crate::index::ColumnIndex;
use crate::query::plan::{PlannedQuery, Predicate, PredicateOp, QueryPlan};
use crate::schema::SchemaRegistry;
use crate::types::{DatabaseError, Result};
use std::sync::Arc;

/// Maximum age of column stats before the planner refreshes them.
const STATS_MAX_AGE_SECS: i64 = 300;

/// Compiles a parsed plan into an executable one: validates it against the
/// schema registry, picks an index for SQL predicates, assigns confidence and
/// a fallback.
pub struct QueryPlanner {
    registry: Arc<SchemaRegistry>,
    col_index: ColumnIndex,
}

impl QueryPlanner {
    pub fn new(registry: Arc<SchemaRegistry>, col_index: ColumnIndex) -> Self {
        Self { registry, col_index }
    }

    /// Validate and finalize a plan.
    ///
    /// Also used for plans produced by an external `QueryPlanner` capability:
    /// nothing executes without passing through here.
    pub fn plan(&self, tenant: &str, plan: QueryPlan) -> Result<PlannedQuery> {
        match plan {
            QueryPlan::Lookup { schema, key } => {
                let resolved = self.registry.get(tenant, &schema)?;
                if resolved.extensions.key_field.is_none() {
                    return Err(DatabaseError::BadQuery(format!(
                        "schema {schema} has no key field; LOOKUP is not available"
                    )));
                }
                Ok(PlannedQuery::certain(QueryPlan::Lookup { schema, key }))
            }

            QueryPlan::Search {
                schema,
                query_text,
                top_k,
                ef,
            } => {
                self.registry.get(tenant, &schema)?;
                let fallback = QueryPlan::Search {
                    schema: schema.clone(),
                    query_text: query_text.clone(),
                    top_k: top_k.saturating_mul(2),
                    ef: Some(ef.unwrap_or(100).saturating_mul(2)),
                };
                Ok(PlannedQuery {
                    plan: QueryPlan::Search {
                        schema,
                        query_text,
                        top_k,
                        ef,
                    },
                    confidence: 0.9,
                    fallback: Some(Box::new(fallback)),
                })
            }

            QueryPlan::Traverse { .. } => Ok(PlannedQuery::certain(plan)),

            QueryPlan::Hybrid {
                schema,
                query_text,
                top_k,
            } => {
                let resolved = self.registry.get(tenant, &schema)?;
                if !resolved.extensions.enable_bm25 {
                    // Without an inverted index the sparse leg has nothing to
                    // score; degenerate to pure vector search.
                    return self.plan(
                        tenant,
                        QueryPlan::Search {
                            schema,
                            query_text,
                            top_k,
                            ef: None,
                        },
                    );
                }
                Ok(PlannedQuery {
                    plan: QueryPlan::Hybrid {
                        schema,
                        query_text,
                        top_k,
                    },
                    confidence: 0.9,
                    fallback: None,
                })
            }

            QueryPlan::Sql {
                schema,
                projection,
                predicates,
                order_by,
                limit,
                ..
            } => {
                let resolved = self.registry.get(tenant, &schema)?;
                let index_column = self.choose_index(
                    tenant,
                    &schema,
                    &resolved.extensions.indexed_columns,
                    &predicates,
                )?;

                let (confidence, fallback) = if index_column.is_some() || predicates.is_empty() {
                    (0.9, None)
                } else {
                    // Full scan with residual predicates: keep a widened
                    // variant that drops the least selective predicate.
                    let mut widened = predicates.clone();
                    widened.pop();
                    let fallback = QueryPlan::Sql {
                        schema: schema.clone(),
                        projection: projection.clone(),
                        predicates: widened,
                        order_by: order_by.clone(),
                        limit,
                        index_column: None,
                    };
                    (0.6, Some(Box::new(fallback)))
                };

                Ok(PlannedQuery {
                    plan: QueryPlan::Sql {
                        schema,
                        projection,
                        predicates,
                        order_by,
                        limit,
                        index_column,
                    },
                    confidence,
                    fallback,
                })
            }
        }
    }

    /// Pick the index-eligible predicate with the smallest estimated
    /// cardinality.
    fn choose_index(
        &self,
        tenant: &str,
        schema: &str,
        indexed_columns: &[String],
        predicates: &[Predicate],
    ) -> Result<Option<String>> {
        let eligible: Vec<&Predicate> = predicates
            .iter()
            .filter(|p| p.index_eligible() && indexed_columns.contains(&p.column))
            .collect();

        match eligible.len() {
            0 => Ok(None),
            1 => Ok(Some(eligible[0].column.clone())),
            _ => {
                let mut best: Option<(f64, String)> = None;
                for predicate in eligible {
                    let estimate = self.estimate(tenant, schema, predicate)?;
                    let better = best
                        .as_ref()
                        .map(|(current, _)| estimate < *current)
                        .unwrap_or(true);
                    if better {
                        best = Some((estimate, predicate.column.clone()));
                    }
                }
                Ok(best.map(|(_, column)| column))
            }
        }
    }

    /// Estimated matching rows for one predicate, from the lazily refreshed
    /// per-column stats.
    fn estimate(&self, tenant: &str, schema: &str, predicate: &Predicate) -> Result<f64> {
        let stats = match self.col_index.stats(tenant, schema, &predicate.column)? {
            Some(stats) if fresh(&stats.refreshed_at) => stats,
            _ => self.col_index.refresh_stats(tenant, schema, &predicate.column)?,
        };

        let per_value = stats.estimated_rows_per_value();
        Ok(match &predicate.op {
            PredicateOp::Eq(_) | PredicateOp::IsNull => per_value,
            PredicateOp::In(values) => per_value * values.len() as f64,
            PredicateOp::LikePrefix(_) => stats.rows as f64 / 4.0,
            _ => stats.rows as f64 / 3.0,
        })
    }
}

fn fresh(refreshed_at: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(refreshed_at)
        .map(|t| (chrono::Utc::now() - t.with_timezone(&chrono::Utc)).num_seconds() < STATS_MAX_AGE_SECS)
        .unwrap_or(false)
}
