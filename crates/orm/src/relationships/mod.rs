//! Associations between models
//!
//! Declarations are collected on the schema builders and resolved into
//! concrete [`Association`] edges when the model graph freezes: target
//! models are inferred from aliases, foreign-key columns are materialized,
//! and delete-time integrity policies attach to each edge.

pub mod accessor;
pub mod integrity;
pub mod resolve;

use serde::{Deserialize, Serialize};

pub use accessor::RelationHandle;
pub use integrity::{cascade_delete, get_inconsistencies, topological_order};
pub use resolve::resolve_associations;

/// The three association shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssociationType {
    /// One source record owns many target records
    HasMany,
    /// One source record owns at most one target record
    HasOne,
    /// The source record points at one target record
    BelongsTo,
}

/// What happens to dependent records when their owner is deleted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrityPolicy {
    /// Leave dependents untouched
    #[default]
    Ignore,
    /// Null out the dependents' foreign keys
    Nullify,
    /// Refuse the delete while dependents exist
    Restrict,
    /// Delete dependents recursively
    Delete,
}

/// An association as declared, before target and foreign-key inference
#[derive(Debug, Clone)]
pub struct AssociationDecl {
    pub association_type: AssociationType,
    pub alias: String,
    /// Explicit target model name; inferred from the alias when `None`
    pub target_model: Option<String>,
    /// Explicit foreign-key column; inferred when `None`
    pub foreign_key: Option<String>,
    pub integrity: IntegrityPolicy,
}

/// A fully resolved association edge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Association {
    pub association_type: AssociationType,
    pub source_model: String,
    pub target_model: String,
    /// Logical name of the foreign-key column. Lives on the target model
    /// for has-many/has-one, on the source model for belongs-to.
    pub foreign_key: String,
    pub alias: String,
    pub integrity: IntegrityPolicy,
}

impl Association {
    /// The model the foreign-key column lives on
    pub fn foreign_key_owner(&self) -> &str {
        match self.association_type {
            AssociationType::HasMany | AssociationType::HasOne => &self.target_model,
            AssociationType::BelongsTo => &self.source_model,
        }
    }
}
