//! Schema model: declared column/type/association/index metadata per model

pub mod builder;
pub mod coerce;
pub mod column;

pub use builder::{AssociationOptions, ModelSchema, SchemaBuilder};
pub use coerce::{coerce_array, coerce_value};
pub use column::{ColumnSchema, ColumnType, IndexSchema};
