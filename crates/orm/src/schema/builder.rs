//! Two-phase schema construction
//!
//! Models are declared on a mutable [`SchemaBuilder`] and frozen into an
//! immutable [`ModelSchema`] on first real use. After the freeze the schema
//! is handed out as shared `Arc` references and never changes again.

use serde::{Deserialize, Serialize};

use crate::error::{OrmError, OrmResult};
use crate::relationships::{Association, AssociationDecl, AssociationType, IntegrityPolicy};

use super::column::{ColumnSchema, ColumnType, IndexSchema};

/// Mutable declaration surface for one model
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    pub name: String,
    pub table_name: String,
    pub columns: Vec<ColumnSchema>,
    pub indexes: Vec<IndexSchema>,
    pub associations: Vec<AssociationDecl>,
}

impl SchemaBuilder {
    pub fn new(name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_name: table_name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            associations: Vec::new(),
        }
    }

    /// Declare a column with default options
    pub fn column(&mut self, name: &str, column_type: ColumnType) -> &mut Self {
        self.columns.push(ColumnSchema::new(name, column_type));
        self
    }

    /// Declare a column from a fully configured [`ColumnSchema`]
    pub fn column_schema(&mut self, column: ColumnSchema) -> &mut Self {
        self.columns.push(column);
        self
    }

    /// Declare an index over the given columns
    pub fn index(&mut self, columns: &[&str]) -> &mut Self {
        let name = format!("{}_{}", self.table_name, columns.join("_"));
        self.indexes.push(IndexSchema::new(
            name,
            columns.iter().map(|c| (*c).to_string()).collect(),
        ));
        self
    }

    /// Declare a unique index over the given columns
    pub fn unique_index(&mut self, columns: &[&str]) -> &mut Self {
        let name = format!("{}_{}", self.table_name, columns.join("_"));
        self.indexes.push(
            IndexSchema::new(name, columns.iter().map(|c| (*c).to_string()).collect()).unique(),
        );
        self
    }

    /// Declare a one-to-many edge; the foreign key lands on the target model
    pub fn has_many(&mut self, alias: &str, options: AssociationOptions) -> &mut Self {
        self.associations.push(AssociationDecl {
            association_type: AssociationType::HasMany,
            alias: alias.to_string(),
            target_model: options.target_model,
            foreign_key: options.foreign_key,
            integrity: options.integrity,
        });
        self
    }

    /// Declare a one-to-one edge; the foreign key lands on the target model
    pub fn has_one(&mut self, alias: &str, options: AssociationOptions) -> &mut Self {
        self.associations.push(AssociationDecl {
            association_type: AssociationType::HasOne,
            alias: alias.to_string(),
            target_model: options.target_model,
            foreign_key: options.foreign_key,
            integrity: options.integrity,
        });
        self
    }

    /// Declare a many-to-one edge; the foreign key lands on this model
    pub fn belongs_to(&mut self, alias: &str, options: AssociationOptions) -> &mut Self {
        self.associations.push(AssociationDecl {
            association_type: AssociationType::BelongsTo,
            alias: alias.to_string(),
            target_model: options.target_model,
            foreign_key: options.foreign_key,
            integrity: options.integrity,
        });
        self
    }

    /// Freeze into an immutable schema. The implicit `id` column is
    /// materialized here; association foreign keys are materialized by the
    /// association resolver before this call.
    pub fn freeze(self, associations: Vec<Association>) -> ModelSchema {
        let mut columns = Vec::with_capacity(self.columns.len() + 1);
        if !self.columns.iter().any(|c| c.name == "id") {
            columns.push(ColumnSchema::new("id", ColumnType::RecordId));
        }
        columns.extend(self.columns);
        ModelSchema {
            name: self.name,
            table_name: self.table_name,
            columns,
            indexes: self.indexes,
            associations,
        }
    }
}

/// Options for association declarations
#[derive(Debug, Clone, Default)]
pub struct AssociationOptions {
    /// Explicit target model name; inferred from the alias when absent
    pub target_model: Option<String>,
    /// Explicit foreign-key column name; inferred when absent
    pub foreign_key: Option<String>,
    /// Delete-time policy for the edge
    pub integrity: IntegrityPolicy,
}

impl AssociationOptions {
    pub fn integrity(policy: IntegrityPolicy) -> Self {
        Self {
            integrity: policy,
            ..Default::default()
        }
    }

    pub fn target(model: &str) -> Self {
        Self {
            target_model: Some(model.to_string()),
            ..Default::default()
        }
    }

    pub fn with_integrity(mut self, policy: IntegrityPolicy) -> Self {
        self.integrity = policy;
        self
    }
}

/// Frozen, immutable schema for one model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSchema {
    pub name: String,
    pub table_name: String,
    pub columns: Vec<ColumnSchema>,
    pub indexes: Vec<IndexSchema>,
    pub associations: Vec<Association>,
}

impl ModelSchema {
    /// Look up a column by logical name
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Resolve a logical column name to its storage name, or fail with
    /// [`OrmError::UnknownColumn`]
    pub fn storage_name(&self, name: &str) -> OrmResult<&str> {
        self.column(name)
            .map(|c| c.storage_name.as_str())
            .ok_or_else(|| OrmError::UnknownColumn(name.to_string()))
    }

    /// Resolve a column or fail with [`OrmError::UnknownColumn`]
    pub fn require_column(&self, name: &str) -> OrmResult<&ColumnSchema> {
        self.column(name)
            .ok_or_else(|| OrmError::UnknownColumn(name.to_string()))
    }

    /// Look up an association by alias
    pub fn association(&self, alias: &str) -> Option<&Association> {
        self.associations.iter().find(|a| a.alias == alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_adds_implicit_id_column() {
        let mut builder = SchemaBuilder::new("User", "users");
        builder.column("name", ColumnType::String(None));
        let schema = builder.freeze(Vec::new());
        assert_eq!(schema.columns[0].name, "id");
        assert_eq!(schema.columns[0].column_type, ColumnType::RecordId);
        assert!(schema.column("name").is_some());
    }

    #[test]
    fn freeze_keeps_explicit_id_column() {
        let mut builder = SchemaBuilder::new("User", "users");
        builder.column("id", ColumnType::BigInteger);
        let schema = builder.freeze(Vec::new());
        assert_eq!(
            schema.columns.iter().filter(|c| c.name == "id").count(),
            1
        );
    }

    #[test]
    fn unknown_column_lookup_fails() {
        let schema = SchemaBuilder::new("User", "users").freeze(Vec::new());
        let err = schema.storage_name("missing").unwrap_err();
        assert!(matches!(err, OrmError::UnknownColumn(name) if name == "missing"));
    }
}
