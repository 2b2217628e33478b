//! Schema reconciliation
//!
//! Diffs the declared model graph against the backend's live schema and
//! produces an ordered change plan. Only additive changes are executable;
//! drift that would need destructive DDL is reported as ignorable and never
//! applied.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::info;

use crate::backends::{Adapter, LiveSchema};
use crate::error::OrmResult;
use crate::relationships::AssociationType;
use crate::schema::ModelSchema;

/// One executable change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    CreateTable {
        model: String,
    },
    AddColumn {
        model: String,
        column: String,
    },
    CreateIndex {
        model: String,
        index: String,
    },
    CreateForeignKey {
        model: String,
        column: String,
        referenced_table: String,
    },
}

/// One entry of the reconciliation plan
#[derive(Debug, Clone)]
pub struct SchemaChange {
    pub message: String,
    /// Model the change belongs to, when there is one
    pub model: Option<String>,
    /// Ignorable changes describe drift the engine will not touch
    pub ignorable: bool,
    /// The executable operation; `None` for pure drift reports
    pub op: Option<ChangeOp>,
}

impl SchemaChange {
    fn op(model: &str, message: String, op: ChangeOp) -> Self {
        Self {
            message,
            model: Some(model.to_string()),
            ignorable: false,
            op: Some(op),
        }
    }

    fn drift(model: Option<&str>, message: String) -> Self {
        Self {
            message,
            model: model.map(str::to_string),
            ignorable: true,
            op: None,
        }
    }
}

/// Diff declared models against the live schema.
///
/// `models` must come in topological order so foreign-key targets are
/// created before their dependents. Phases are fixed: new columns, new
/// tables, indexes, foreign keys, then drift reports; within each phase the
/// model order is preserved.
pub fn diff(
    models: &[Arc<ModelSchema>],
    live: &LiveSchema,
    native_foreign_keys: bool,
) -> Vec<SchemaChange> {
    let mut columns = Vec::new();
    let mut tables = Vec::new();
    let mut indexes = Vec::new();
    let mut foreign_keys = Vec::new();
    let mut drift = Vec::new();

    for schema in models {
        let live_table = live.tables.get(&schema.table_name);
        match live_table {
            None => {
                tables.push(SchemaChange::op(
                    &schema.name,
                    format!("create table '{}'", schema.table_name),
                    ChangeOp::CreateTable {
                        model: schema.name.clone(),
                    },
                ));
            }
            Some(live_table) => {
                if live.schema_aware {
                    for column in &schema.columns {
                        match live_table.columns.get(&column.storage_name) {
                            None => columns.push(SchemaChange::op(
                                &schema.name,
                                format!(
                                    "add column '{}' to '{}'",
                                    column.storage_name, schema.table_name
                                ),
                                ChangeOp::AddColumn {
                                    model: schema.name.clone(),
                                    column: column.name.clone(),
                                },
                            )),
                            Some(live_column) => {
                                if live_column.required != column.required {
                                    drift.push(SchemaChange::drift(
                                        Some(&schema.name),
                                        format!(
                                            "column '{}' on '{}' differs in required",
                                            column.storage_name, schema.table_name
                                        ),
                                    ));
                                }
                            }
                        }
                    }
                    let declared: HashSet<&str> = schema
                        .columns
                        .iter()
                        .map(|c| c.storage_name.as_str())
                        .collect();
                    for live_column in live_table.columns.keys() {
                        if !declared.contains(live_column.as_str()) {
                            drift.push(SchemaChange::drift(
                                Some(&schema.name),
                                format!(
                                    "column '{live_column}' on '{}' is not declared",
                                    schema.table_name
                                ),
                            ));
                        }
                    }
                }
            }
        }

        for index in &schema.indexes {
            let exists = live_table
                .map(|t| t.indexes.contains(&index.name))
                .unwrap_or(false);
            if !exists {
                indexes.push(SchemaChange::op(
                    &schema.name,
                    format!("create index '{}' on '{}'", index.name, schema.table_name),
                    ChangeOp::CreateIndex {
                        model: schema.name.clone(),
                        index: index.name.clone(),
                    },
                ));
            }
        }
    }

    if native_foreign_keys && live.schema_aware {
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for schema in models {
            for association in &schema.associations {
                let (owner, referenced) = match association.association_type {
                    AssociationType::HasMany | AssociationType::HasOne => {
                        (&association.target_model, &association.source_model)
                    }
                    AssociationType::BelongsTo => {
                        (&association.source_model, &association.target_model)
                    }
                };
                let Some(owner_schema) = models.iter().find(|m| &m.name == owner) else {
                    continue;
                };
                let Some(referenced_schema) = models.iter().find(|m| &m.name == referenced) else {
                    continue;
                };
                let Ok(fk_storage) = owner_schema.storage_name(&association.foreign_key) else {
                    continue;
                };
                if !seen.insert((owner.clone(), fk_storage.to_string())) {
                    continue;
                }
                let constraint = format!("fk_{}_{fk_storage}", owner_schema.table_name);
                let exists = live
                    .tables
                    .get(&owner_schema.table_name)
                    .map(|t| t.foreign_keys.contains(&constraint))
                    .unwrap_or(false);
                if !exists {
                    foreign_keys.push(SchemaChange::op(
                        owner,
                        format!(
                            "add foreign key '{fk_storage}' on '{}' referencing '{}'",
                            owner_schema.table_name, referenced_schema.table_name
                        ),
                        ChangeOp::CreateForeignKey {
                            model: owner.clone(),
                            column: fk_storage.to_string(),
                            referenced_table: referenced_schema.table_name.clone(),
                        },
                    ));
                }
            }
        }
    }

    if live.schema_aware {
        let declared_tables: HashSet<&str> =
            models.iter().map(|m| m.table_name.as_str()).collect();
        for live_name in live.tables.keys() {
            if !declared_tables.contains(live_name.as_str()) {
                drift.push(SchemaChange::drift(
                    None,
                    format!("table '{live_name}' is not declared"),
                ));
            }
        }
    }

    let mut plan = columns;
    plan.extend(tables);
    plan.extend(indexes);
    plan.extend(foreign_keys);
    plan.extend(drift);
    plan
}

/// Execute the non-ignorable part of a plan against the backend
pub async fn apply(
    adapter: &dyn Adapter,
    models: &[Arc<ModelSchema>],
    plan: &[SchemaChange],
) -> OrmResult<u64> {
    let model_by_name = |name: &str| models.iter().find(|m| m.name == name);
    let mut applied = 0;
    for change in plan {
        let Some(op) = &change.op else { continue };
        info!(change = %change.message, "applying schema change");
        match op {
            ChangeOp::CreateTable { model } => {
                if let Some(schema) = model_by_name(model) {
                    adapter.create_table(schema).await?;
                }
            }
            ChangeOp::AddColumn { model, column } => {
                if let Some(schema) = model_by_name(model) {
                    if let Some(column) = schema.column(column) {
                        adapter.add_column(schema, column).await?;
                    }
                }
            }
            ChangeOp::CreateIndex { model, index } => {
                if let Some(schema) = model_by_name(model) {
                    if let Some(index) = schema.indexes.iter().find(|i| &i.name == index) {
                        adapter.create_index(schema, index).await?;
                    }
                }
            }
            ChangeOp::CreateForeignKey {
                model,
                column,
                referenced_table,
            } => {
                if let Some(schema) = model_by_name(model) {
                    adapter
                        .create_foreign_key(schema, column, referenced_table)
                        .await?;
                }
            }
        }
        applied += 1;
    }
    Ok(applied)
}

/// Render a plan as human-readable lines, the shape `diff` callers log
pub fn describe(plan: &[SchemaChange]) -> Vec<JsonValue> {
    plan.iter()
        .map(|change| {
            serde_json::json!({
                "message": change.message,
                "ignorable": change.ignorable,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{LiveColumn, LiveTable};
    use crate::schema::{ColumnType, SchemaBuilder};
    use std::collections::HashMap;

    fn user_model() -> Arc<ModelSchema> {
        let mut builder = SchemaBuilder::new("User", "users");
        builder.column("name", ColumnType::String(None));
        builder.column("age", ColumnType::Integer);
        builder.index(&["age"]);
        Arc::new(builder.freeze(Vec::new()))
    }

    #[test]
    fn missing_table_yields_create_table_and_index() {
        let live = LiveSchema {
            schema_aware: true,
            tables: HashMap::new(),
        };
        let plan = diff(&[user_model()], &live, false);
        assert!(matches!(plan[0].op, Some(ChangeOp::CreateTable { .. })));
        assert!(matches!(plan[1].op, Some(ChangeOp::CreateIndex { .. })));
        assert!(plan.iter().all(|c| !c.ignorable));
    }

    #[test]
    fn missing_column_is_additive_and_drift_is_ignorable() {
        let mut table = LiveTable::default();
        table.columns.insert("id".into(), LiveColumn { required: true });
        table.columns.insert("name".into(), LiveColumn { required: false });
        table.columns.insert("legacy".into(), LiveColumn { required: false });
        table.indexes.insert("users_age".into());
        let live = LiveSchema {
            schema_aware: true,
            tables: HashMap::from([("users".to_string(), table)]),
        };
        let plan = diff(&[user_model()], &live, false);
        let add: Vec<_> = plan.iter().filter(|c| c.op.is_some()).collect();
        assert_eq!(add.len(), 1);
        assert!(matches!(
            add[0].op,
            Some(ChangeOp::AddColumn { ref column, .. }) if column == "age"
        ));
        assert!(plan
            .iter()
            .any(|c| c.ignorable && c.message.contains("legacy")));
    }

    #[test]
    fn schemaless_backends_diff_tables_and_indexes_only() {
        let live = LiveSchema::schemaless();
        let plan = diff(&[user_model()], &live, false);
        assert_eq!(plan.len(), 2);
        assert!(matches!(plan[0].op, Some(ChangeOp::CreateTable { .. })));
        assert!(matches!(plan[1].op, Some(ChangeOp::CreateIndex { .. })));
    }
}
