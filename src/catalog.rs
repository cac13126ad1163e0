use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::db::Database;
use crate::error::GatewayError;

/// Cached assignment lists live for one day.
const CACHE_TTL_SECS: u64 = 24 * 60 * 60;

/// Pattern matching every cached assignment list.
pub const CACHE_KEY_PATTERN: &str = "model:*:assignments";

fn cache_key(model_name: &str) -> String {
    format!("model:{model_name}:assignments")
}

/// A backend deployment capable of serving a model: endpoint, the GPU set it
/// needs to run one inference, and a preference weight (higher first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub name: String,
    pub ip_addr: String,
    pub port: u16,
    pub gpu_ids: Vec<String>,
    pub weight: f64,
}

/// Raw store row. `gpu_ids` arrives as the GROUP_CONCAT comma string and is
/// parsed into the ordered set form at this boundary.
#[derive(Debug, FromRow)]
struct AssignmentRow {
    name: String,
    port: i32,
    ip_addr: String,
    gpu_ids: String,
    weight: f64,
}

impl From<AssignmentRow> for Assignment {
    fn from(row: AssignmentRow) -> Self {
        Assignment {
            name: row.name,
            ip_addr: row.ip_addr,
            port: row.port as u16,
            gpu_ids: parse_gpu_ids(&row.gpu_ids),
            weight: row.weight,
        }
    }
}

fn parse_gpu_ids(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Stable weight-descending sort. The store query already orders rows this
/// way; re-sorting here keeps the ordering invariant even for cache entries.
fn sort_by_weight_desc(assignments: &mut [Assignment]) {
    assignments.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(Ordering::Equal));
}

const ASSIGNMENTS_QUERY: &str = "\
    SELECT \
        a.name, \
        a.port, \
        c.ip_addr, \
        GROUP_CONCAT(DISTINCT g.id) AS gpu_ids, \
        AVG(g.weight) AS weight \
    FROM \
        assignments a \
        JOIN assignment_gpus ag ON a.id = ag.assignment_id \
        JOIN gpus g ON ag.gpu_id = g.id \
        JOIN computers c ON g.computer_id = c.id \
    WHERE \
        a.model_name = ? \
    GROUP BY \
        a.id, a.name, a.port, c.ip_addr \
    ORDER BY \
        weight DESC";

/// Resolves a model name to its ordered assignment list, read-through cached.
///
/// Cloning is cheap — clones share the same store and cache handles.
#[derive(Debug, Clone)]
pub struct AssignmentCatalog {
    inner: Inner,
}

#[derive(Debug, Clone)]
enum Inner {
    Live { db: Database, cache: Cache },
    #[cfg(test)]
    Fixed(std::sync::Arc<tokio::sync::RwLock<std::collections::HashMap<String, Vec<Assignment>>>>),
}

impl AssignmentCatalog {
    pub fn new(db: Database, cache: Cache) -> Self {
        Self {
            inner: Inner::Live { db, cache },
        }
    }

    /// A catalog over fixed in-memory data, for tests that must not require
    /// running MySQL/Redis.
    #[cfg(test)]
    pub fn fixed(models: std::collections::HashMap<String, Vec<Assignment>>) -> Self {
        Self {
            inner: Inner::Fixed(std::sync::Arc::new(tokio::sync::RwLock::new(models))),
        }
    }

    /// Resolve a model name to its assignments, weight-descending.
    ///
    /// Cache hits return directly; misses and any cache-side failure fall
    /// through to the store, whose errors are fatal. A successful store read
    /// is written back with a TTL; write failures are logged and ignored.
    pub async fn resolve(&self, model_name: &str) -> Result<Vec<Assignment>, GatewayError> {
        match &self.inner {
            Inner::Live { db, cache } => {
                let key = cache_key(model_name);

                match cache.get(&key).await {
                    Ok(Some(raw)) => match serde_json::from_str::<Vec<Assignment>>(&raw) {
                        Ok(mut assignments) => {
                            sort_by_weight_desc(&mut assignments);
                            return Ok(assignments);
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                        }
                    },
                    Ok(None) => {}
                    Err(e) => {
                        warn!(key = %key, error = %e, "Cache read failed; falling back to store");
                    }
                }

                let rows: Vec<AssignmentRow> = sqlx::query_as(ASSIGNMENTS_QUERY)
                    .bind(model_name)
                    .fetch_all(&db.pool)
                    .await?;

                let mut assignments: Vec<Assignment> =
                    rows.into_iter().map(Assignment::from).collect();
                sort_by_weight_desc(&mut assignments);

                match serde_json::to_string(&assignments) {
                    Ok(serialized) => {
                        if let Err(e) = cache.set_ex(&key, &serialized, CACHE_TTL_SECS).await {
                            warn!(key = %key, error = %e, "Failed to cache assignments");
                        }
                    }
                    Err(e) => warn!(key = %key, error = %e, "Failed to serialize assignments"),
                }

                Ok(assignments)
            }
            #[cfg(test)]
            Inner::Fixed(models) => {
                let mut assignments = models
                    .read()
                    .await
                    .get(model_name)
                    .cloned()
                    .unwrap_or_default();
                sort_by_weight_desc(&mut assignments);
                Ok(assignments)
            }
        }
    }

    /// Drop every cached assignment list. The next `resolve` for any model
    /// reads from the store again.
    pub async fn invalidate(&self) -> Result<u64, GatewayError> {
        match &self.inner {
            Inner::Live { cache, .. } => {
                let deleted = cache.delete_matching(CACHE_KEY_PATTERN).await?;
                debug!(deleted, "Assignment cache invalidated");
                Ok(deleted)
            }
            #[cfg(test)]
            Inner::Fixed(models) => {
                let mut models = models.write().await;
                let deleted = models.len() as u64;
                models.clear();
                Ok(deleted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(name: &str, gpu_ids: &[&str], weight: f64) -> Assignment {
        Assignment {
            name: name.to_string(),
            ip_addr: "10.0.0.1".to_string(),
            port: 4000,
            gpu_ids: gpu_ids.iter().map(|s| s.to_string()).collect(),
            weight,
        }
    }

    #[test]
    fn parse_gpu_ids_splits_on_comma() {
        assert_eq!(parse_gpu_ids("0,1,2"), vec!["0", "1", "2"]);
    }

    #[test]
    fn parse_gpu_ids_trims_and_drops_empties() {
        assert_eq!(parse_gpu_ids(" 0, 1 ,,2 "), vec!["0", "1", "2"]);
        assert!(parse_gpu_ids("").is_empty());
    }

    #[test]
    fn sort_is_weight_descending_and_stable() {
        let mut list = vec![
            assignment("low", &["3"], 1.0),
            assignment("first-high", &["0"], 2.0),
            assignment("second-high", &["1"], 2.0),
        ];
        sort_by_weight_desc(&mut list);
        assert_eq!(list[0].name, "first-high");
        assert_eq!(list[1].name, "second-high");
        assert_eq!(list[2].name, "low");
    }

    #[test]
    fn cached_form_round_trips() {
        let original = vec![
            assignment("a", &["0", "1"], 2.0),
            assignment("b", &["2"], 1.0),
        ];
        let raw = serde_json::to_string(&original).unwrap();
        let parsed: Vec<Assignment> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, original);
    }

    #[tokio::test]
    async fn fixed_catalog_resolves_known_model() {
        let mut models = std::collections::HashMap::new();
        models.insert("llama".to_string(), vec![assignment("a", &["0"], 1.0)]);
        let catalog = AssignmentCatalog::fixed(models);

        let resolved = catalog.resolve("llama").await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "a");
    }

    #[tokio::test]
    async fn fixed_catalog_unknown_model_is_empty() {
        let catalog = AssignmentCatalog::fixed(Default::default());
        assert!(catalog.resolve("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalidate_forces_reread_of_backing_data() {
        let mut models = std::collections::HashMap::new();
        models.insert("llama".to_string(), vec![assignment("a", &["0"], 1.0)]);
        let catalog = AssignmentCatalog::fixed(models);

        assert_eq!(catalog.invalidate().await.unwrap(), 1);
        assert!(catalog.resolve("llama").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolve_orders_fixed_data_by_weight() {
        let mut models = std::collections::HashMap::new();
        models.insert(
            "llama".to_string(),
            vec![
                assignment("light", &["2"], 1.0),
                assignment("heavy", &["0", "1"], 2.0),
            ],
        );
        let catalog = AssignmentCatalog::fixed(models);

        let resolved = catalog.resolve("llama").await.unwrap();
        assert_eq!(resolved[0].name, "heavy");
        assert_eq!(resolved[1].name, "light");
    }
}
