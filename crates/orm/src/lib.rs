//! Multi-backend data-access layer
//!
//! Models are declared on a connection, frozen into immutable schemas on
//! first use, and queried through a backend-agnostic condition tree. Five
//! backends ship built in: PostgreSQL, MySQL and SQLite over sqlx, plus
//! in-process document and key-value stores. Everything above the adapter
//! contract is backend-neutral; adapters advertise capability flags and the
//! upper layers branch on those, never on backend identity.
//!
//! ```no_run
//! use serde_json::json;
//! use strata_orm::Connection;
//!
//! # async fn demo() -> strata_orm::OrmResult<()> {
//! let conn = Connection::connect("memory://").await?;
//! conn.define("User", "users", |m| {
//!     m.column("name", strata_orm::ColumnType::String(None));
//!     m.column("age", strata_orm::ColumnType::Integer);
//! })?;
//! conn.apply_schemas().await?;
//! conn.create("User", &json!({"name": "ada", "age": 36})).await?;
//! let adults = conn
//!     .query("User")?
//!     .filter(json!({"age": {"$gte": 18}}))
//!     .order("-age")
//!     .exec()
//!     .await?;
//! # let _ = adults;
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod compiler;
pub mod conditions;
pub mod connection;
pub mod error;
pub mod manipulate;
pub mod query;
pub mod reconcile;
pub mod relationships;
pub mod schema;
pub mod transaction;

pub use backends::{
    Adapter, AdapterCapabilities, BackendRegistry, BackendType, ConnectionSettings, QueryOptions,
};
pub use connection::{ConnectOptions, Connection};
pub use error::{OrmError, OrmResult};
pub use query::{ModelInstance, Query};
pub use reconcile::{ChangeOp, SchemaChange};
pub use relationships::{Association, AssociationType, IntegrityPolicy, RelationHandle};
pub use schema::{
    AssociationOptions, ColumnSchema, ColumnType, IndexSchema, ModelSchema, SchemaBuilder,
};
pub use transaction::{IsolationLevel, Transaction, TransactionState};
