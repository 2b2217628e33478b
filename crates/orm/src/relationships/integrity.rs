//! Delete-time integrity enforcement and consistency scanning
//!
//! Integrity runs above the adapter contract: the cascade walks the
//! association graph in-process so it behaves identically on backends with
//! and without native foreign keys.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::backends::{Adapter, QueryOptions};
use crate::error::{OrmError, OrmResult};
use crate::schema::ModelSchema;

use super::{AssociationType, IntegrityPolicy};

type ModelMap = HashMap<String, Arc<ModelSchema>>;

/// Apply integrity policies for a pending delete of `ids` on `model`,
/// recursing through `Delete` edges before the owning delete executes.
pub fn cascade_delete<'a>(
    adapter: &'a dyn Adapter,
    models: &'a ModelMap,
    model: &'a str,
    ids: Vec<JsonValue>,
) -> Pin<Box<dyn Future<Output = OrmResult<()>> + Send + 'a>> {
    Box::pin(async move {
        if ids.is_empty() {
            return Ok(());
        }
        let schema = models
            .get(model)
            .ok_or_else(|| OrmError::backend_message(format!("unknown model '{model}'")))?;
        for association in &schema.associations {
            if !matches!(
                association.association_type,
                AssociationType::HasMany | AssociationType::HasOne
            ) {
                continue;
            }
            let Some(child) = models.get(&association.target_model) else {
                continue;
            };
            let fk = &association.foreign_key;
            let conditions = json!({ fk.as_str(): { "$in": ids.clone() } });
            match association.integrity {
                IntegrityPolicy::Ignore => {}
                IntegrityPolicy::Nullify => {
                    let storage = child.storage_name(fk)?.to_string();
                    let affected = adapter
                        .update_partial(
                            child,
                            Some(&conditions),
                            &json!({ storage: JsonValue::Null }),
                        )
                        .await?;
                    debug!(model = %child.name, affected, "nullified dependents");
                }
                IntegrityPolicy::Restrict => {
                    if adapter.count(child, Some(&conditions)).await? > 0 {
                        return Err(OrmError::IntegrityViolation(child.name.clone()));
                    }
                }
                IntegrityPolicy::Delete => {
                    let rows = adapter
                        .find(
                            child,
                            &QueryOptions {
                                conditions: Some(conditions.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                    let child_ids: Vec<JsonValue> = rows
                        .iter()
                        .filter_map(|row| row.get("id").cloned())
                        .collect();
                    cascade_delete(adapter, models, &child.name, child_ids).await?;
                    let affected = adapter.delete(child, Some(&conditions)).await?;
                    debug!(model = %child.name, affected, "cascaded delete to dependents");
                }
            }
        }
        Ok(())
    })
}

/// Scan every association edge for dependents whose foreign key points at a
/// missing owner. A belongsTo declaration is the child-side view of the same
/// edge, so edges declared on both sides are scanned once. Returns orphaned
/// record ids keyed by model name.
pub async fn get_inconsistencies(
    adapter: &dyn Adapter,
    models: &ModelMap,
) -> OrmResult<HashMap<String, Vec<JsonValue>>> {
    let mut report: HashMap<String, Vec<JsonValue>> = HashMap::new();
    let mut scanned: HashSet<(String, String, String)> = HashSet::new();
    let mut model_names: Vec<&String> = models.keys().collect();
    model_names.sort();
    for name in model_names {
        let schema = &models[name];
        for association in &schema.associations {
            let (owner, child) = match association.association_type {
                AssociationType::HasMany | AssociationType::HasOne => {
                    let Some(child) = models.get(&association.target_model) else {
                        continue;
                    };
                    (schema, child)
                }
                AssociationType::BelongsTo => {
                    let Some(owner) = models.get(&association.target_model) else {
                        continue;
                    };
                    (owner, schema)
                }
            };
            if !scanned.insert((
                owner.name.clone(),
                child.name.clone(),
                association.foreign_key.clone(),
            )) {
                continue;
            }
            let owner_ids: HashSet<String> = adapter
                .find(owner, &QueryOptions::default())
                .await?
                .iter()
                .filter_map(|row| row.get("id").map(JsonValue::to_string))
                .collect();
            let fk_storage = child.storage_name(&association.foreign_key)?.to_string();
            for row in adapter.find(child, &QueryOptions::default()).await? {
                let fk_value = row.get(fk_storage.as_str()).cloned().unwrap_or(JsonValue::Null);
                if fk_value.is_null() {
                    continue;
                }
                if !owner_ids.contains(&fk_value.to_string()) {
                    if let Some(id) = row.get("id") {
                        report
                            .entry(child.name.clone())
                            .or_default()
                            .push(id.clone());
                    }
                }
            }
        }
    }
    Ok(report)
}

/// Order models so that every foreign-key target comes before the models
/// pointing at it. Self references are skipped; on a cycle the remaining
/// models keep their name order.
pub fn topological_order(models: &ModelMap) -> Vec<String> {
    let mut names: Vec<String> = models.keys().cloned().collect();
    names.sort();

    // child -> set of parents that must come first
    let mut parents: HashMap<String, HashSet<String>> = names
        .iter()
        .map(|name| (name.clone(), HashSet::new()))
        .collect();
    for (name, schema) in models {
        for association in &schema.associations {
            let (parent, child) = match association.association_type {
                AssociationType::HasMany | AssociationType::HasOne => {
                    (name.clone(), association.target_model.clone())
                }
                AssociationType::BelongsTo => (association.target_model.clone(), name.clone()),
            };
            if parent == child {
                continue;
            }
            if let Some(set) = parents.get_mut(&child) {
                set.insert(parent);
            }
        }
    }

    let mut ordered = Vec::with_capacity(names.len());
    let mut placed: HashSet<String> = HashSet::new();
    while ordered.len() < names.len() {
        let mut advanced = false;
        for name in &names {
            if placed.contains(name) {
                continue;
            }
            if parents[name].iter().all(|p| placed.contains(p)) {
                ordered.push(name.clone());
                placed.insert(name.clone());
                advanced = true;
            }
        }
        if !advanced {
            // Cycle: emit the rest in name order
            for name in &names {
                if !placed.contains(name) {
                    ordered.push(name.clone());
                    placed.insert(name.clone());
                }
            }
        }
    }
    ordered
}
