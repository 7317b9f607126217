//! Natural-language query planning capability.
//!
//! The core does not talk to a language model itself. An external
//! collaborator implements [`NlQueryPlanner`] and registers it by name; plans
//! it returns are validated against the schema registry before execution,
//! exactly like hand-written queries.

use crate::query::plan::QueryPlan;
use crate::types::{DatabaseError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Turns natural language into a plan tree.
#[async_trait]
pub trait NlQueryPlanner: Send + Sync {
    /// Planner tag, unique within the registry.
    fn name(&self) -> &str;

    /// Compile a natural-language question into a plan.
    ///
    /// `schema_hint` narrows the search space when the caller knows the
    /// target schema.
    async fn plan(&self, natural_language: &str, schema_hint: Option<&str>) -> Result<QueryPlan>;
}

/// Name-keyed planner registry.
#[derive(Default)]
pub struct PlannerRegistry {
    planners: RwLock<HashMap<String, Arc<dyn NlQueryPlanner>>>,
    default_tag: RwLock<Option<String>>,
}

impl PlannerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a planner; the first registration becomes the default.
    pub fn register(&self, planner: Arc<dyn NlQueryPlanner>) {
        let name = planner.name().to_string();
        if let Ok(mut planners) = self.planners.write() {
            planners.insert(name.clone(), planner);
        }
        if let Ok(mut default) = self.default_tag.write() {
            default.get_or_insert(name);
        }
    }

    /// Resolve a planner by tag, or the default.
    pub fn get(&self, tag: Option<&str>) -> Result<Arc<dyn NlQueryPlanner>> {
        let default = self
            .default_tag
            .read()
            .ok()
            .and_then(|d| d.clone());
        let tag = tag
            .map(String::from)
            .or(default)
            .ok_or_else(|| {
                DatabaseError::DependencyUnavailable("no query planner registered".to_string())
            })?;
        self.planners
            .read()
            .ok()
            .and_then(|p| p.get(&tag).cloned())
            .ok_or_else(|| {
                DatabaseError::DependencyUnavailable(format!("no such planner: {tag}"))
            })
    }

    pub fn is_empty(&self) -> bool {
        self.planners.read().map(|p| p.is_empty()).unwrap_or(true)
    }
}
