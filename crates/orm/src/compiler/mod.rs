//! Condition/aggregation compilers
//!
//! One compiler per backend family: `sql` renders parameter-bound fragments
//! per dialect, `document` renders native filter documents, `eval` executes
//! filter documents and group specs in-process for the backends that filter
//! client-side.

pub mod document;
pub mod eval;
pub mod group;
pub mod sql;

pub use document::DocumentCompiler;
pub use group::{parse_group, Aggregate, AggregateSource, GroupField, GroupSpec};
pub use sql::{SqlCompiler, SqlFragment};
