//! Connection: the owning handle over one backend
//!
//! A connection carries the adapter, the model graph and the reconciliation
//! state. Models are declared while the graph is mutable; the first real
//! use freezes it, resolves associations, and hands out immutable schemas
//! from then on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use rand::Rng;
use serde_json::{Map, Value as JsonValue};
use tracing::{info, warn};

use crate::backends::{Adapter, BackendRegistry, ConnectionSettings};
use crate::error::{OrmError, OrmResult};
use crate::manipulate;
use crate::query::Query;
use crate::reconcile::{self, SchemaChange};
use crate::relationships::{self, resolve_associations};
use crate::schema::{coerce_value, ModelSchema, SchemaBuilder};
use crate::transaction::{IsolationLevel, Transaction};

const MAX_CONNECT_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Connection construction options
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub url: String,
    /// Read-replica URLs; reads round-robin across them when present
    pub replicas: Vec<String>,
}

struct ModelState {
    builders: HashMap<String, SchemaBuilder>,
    models: HashMap<String, Arc<ModelSchema>>,
    frozen: bool,
}

struct Inner {
    adapter: Arc<dyn Adapter>,
    replicas: Vec<Arc<dyn Adapter>>,
    replica_cursor: AtomicUsize,
    state: RwLock<ModelState>,
    apply_lock: tokio::sync::Mutex<()>,
    pending_generation: AtomicU64,
    applied_generation: AtomicU64,
}

/// Cheaply clonable handle over one backend and its model graph
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connect to the backend named by the URL scheme, with the built-in
    /// registry
    pub async fn connect(url: &str) -> OrmResult<Connection> {
        Self::connect_with(
            &BackendRegistry::with_builtins(),
            ConnectOptions {
                url: url.to_string(),
                ..Default::default()
            },
        )
        .await
    }

    /// Connect with an explicit registry and options
    pub async fn connect_with(
        registry: &BackendRegistry,
        options: ConnectOptions,
    ) -> OrmResult<Connection> {
        let backend = BackendRegistry::detect_from_url(&options.url)?;
        let mut settings = ConnectionSettings::from_url(&options.url)?;
        settings.replicas = options.replicas.clone();
        let adapter = registry.create(&backend, &settings)?;
        connect_with_retry(adapter.as_ref(), &settings).await?;
        let mut replicas = Vec::with_capacity(options.replicas.len());
        for replica_url in &options.replicas {
            let replica_settings = ConnectionSettings::from_url(replica_url)?;
            let replica = registry.create(&backend, &replica_settings)?;
            connect_with_retry(replica.as_ref(), &replica_settings).await?;
            replicas.push(replica);
        }
        info!(backend = %backend, replicas = replicas.len(), "connected");
        Ok(Self::assemble(adapter, replicas))
    }

    /// Wrap an already constructed adapter; used for custom backends
    pub fn from_adapter(adapter: Arc<dyn Adapter>) -> Connection {
        Self::assemble(adapter, Vec::new())
    }

    fn assemble(adapter: Arc<dyn Adapter>, replicas: Vec<Arc<dyn Adapter>>) -> Connection {
        Connection {
            inner: Arc::new(Inner {
                adapter,
                replicas,
                replica_cursor: AtomicUsize::new(0),
                state: RwLock::new(ModelState {
                    builders: HashMap::new(),
                    models: HashMap::new(),
                    frozen: false,
                }),
                apply_lock: tokio::sync::Mutex::new(()),
                pending_generation: AtomicU64::new(0),
                applied_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Declare a model. Fails once the graph has frozen.
    pub fn define<F>(&self, name: &str, table_name: &str, configure: F) -> OrmResult<()>
    where
        F: FnOnce(&mut SchemaBuilder),
    {
        let mut state = self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if state.frozen {
            return Err(OrmError::backend_message(
                "models cannot be defined after the graph has frozen",
            ));
        }
        let mut builder = SchemaBuilder::new(name, table_name);
        configure(&mut builder);
        state.builders.insert(name.to_string(), builder);
        Ok(())
    }

    /// Freeze the model graph, resolving associations. Idempotent.
    pub fn ensure_frozen(&self) -> OrmResult<()> {
        let mut state = self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if state.frozen {
            return Ok(());
        }
        let mut builders = std::mem::take(&mut state.builders);
        let mut resolved = match resolve_associations(&mut builders) {
            Ok(resolved) => resolved,
            Err(e) => {
                state.builders = builders;
                return Err(e);
            }
        };
        for (name, builder) in builders {
            let associations = resolved.remove(&name).unwrap_or_default();
            state
                .models
                .insert(name, Arc::new(builder.freeze(associations)));
        }
        state.frozen = true;
        Ok(())
    }

    /// Look up a frozen model schema
    pub fn model(&self, name: &str) -> OrmResult<Arc<ModelSchema>> {
        self.ensure_frozen()?;
        let state = self
            .inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        state
            .models
            .get(name)
            .cloned()
            .ok_or_else(|| OrmError::backend_message(format!("unknown model '{name}'")))
    }

    /// The full frozen model map
    pub fn models(&self) -> OrmResult<HashMap<String, Arc<ModelSchema>>> {
        self.ensure_frozen()?;
        let state = self
            .inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(state.models.clone())
    }

    /// The primary adapter
    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.inner.adapter
    }

    /// The adapter serving the next read: round-robin over replicas, the
    /// primary when there are none
    pub fn read_adapter(&self) -> &Arc<dyn Adapter> {
        if self.inner.replicas.is_empty() {
            return &self.inner.adapter;
        }
        let cursor = self.inner.replica_cursor.fetch_add(1, Ordering::Relaxed);
        &self.inner.replicas[cursor % self.inner.replicas.len()]
    }

    /// Insert one record after required-field validation and coercion
    pub async fn create(&self, model: &str, data: &JsonValue) -> OrmResult<JsonValue> {
        let schema = self.model(model)?;
        validate_required(&schema, data)?;
        let storage = to_storage(&schema, data)?;
        let created = self.inner.adapter.create(&schema, &storage).await?;
        Ok(to_logical(&schema, created))
    }

    /// Insert many records; validation failures abort before any insert
    pub async fn create_bulk(
        &self,
        model: &str,
        rows: &[JsonValue],
    ) -> OrmResult<Vec<JsonValue>> {
        let schema = self.model(model)?;
        let mut storage_rows = Vec::with_capacity(rows.len());
        for row in rows {
            validate_required(&schema, row)?;
            storage_rows.push(to_storage(&schema, row)?);
        }
        let created = self.inner.adapter.create_bulk(&schema, &storage_rows).await?;
        Ok(created
            .into_iter()
            .map(|row| to_logical(&schema, row))
            .collect())
    }

    /// Fetch one record by id, or [`OrmError::NotFound`]
    pub async fn get(&self, model: &str, id: &JsonValue) -> OrmResult<JsonValue> {
        let schema = self.model(model)?;
        let row = self.read_adapter().find_by_id(&schema, id).await?;
        Ok(to_logical(&schema, row))
    }

    /// Replace a record wholesale, keyed by its `id`
    pub async fn update(&self, model: &str, record: &JsonValue) -> OrmResult<()> {
        let schema = self.model(model)?;
        validate_required(&schema, record)?;
        let mut storage = to_storage(&schema, record)?;
        if let (JsonValue::Object(map), Some(id)) = (&mut storage, record.get("id")) {
            map.insert("id".to_string(), id.clone());
        }
        self.inner.adapter.update(&schema, &storage).await
    }

    /// Start a query over one model
    pub fn query(&self, model: &str) -> OrmResult<Query> {
        let schema = self.model(model)?;
        Ok(Query::new(self.clone(), schema))
    }

    /// Begin a transaction on the primary
    pub async fn transaction(
        &self,
        isolation: Option<IsolationLevel>,
    ) -> OrmResult<Transaction> {
        Transaction::setup(self.inner.adapter.as_ref(), isolation).await
    }

    /// Declared models in dependency order
    pub fn ordered_models(&self) -> OrmResult<Vec<Arc<ModelSchema>>> {
        let models = self.models()?;
        Ok(relationships::topological_order(&models)
            .into_iter()
            .filter_map(|name| models.get(&name).cloned())
            .collect())
    }

    /// Compute the reconciliation plan without applying it
    pub async fn diff_schemas(&self) -> OrmResult<Vec<SchemaChange>> {
        let models = self.ordered_models()?;
        let live = self.inner.adapter.get_schemas().await?;
        Ok(reconcile::diff(
            &models,
            &live,
            self.inner.adapter.capabilities().native_foreign_keys,
        ))
    }

    /// Apply pending schema changes. Concurrent callers coalesce: whoever
    /// holds the lock applies, and callers that arrived before that apply
    /// finished return without re-diffing.
    pub async fn apply_schemas(&self) -> OrmResult<u64> {
        self.ensure_frozen()?;
        let requested = self.inner.pending_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = self.inner.apply_lock.lock().await;
        if self.inner.applied_generation.load(Ordering::SeqCst) >= requested {
            return Ok(0);
        }
        let models = self.ordered_models()?;
        let live = self.inner.adapter.get_schemas().await?;
        let plan = reconcile::diff(
            &models,
            &live,
            self.inner.adapter.capabilities().native_foreign_keys,
        );
        let applied = reconcile::apply(self.inner.adapter.as_ref(), &models, &plan).await?;
        self.inner.applied_generation.store(
            self.inner.pending_generation.load(Ordering::SeqCst),
            Ordering::SeqCst,
        );
        Ok(applied)
    }

    /// Scan for records whose foreign keys point at missing owners
    pub async fn get_inconsistencies(
        &self,
    ) -> OrmResult<HashMap<String, Vec<JsonValue>>> {
        let models = self.models()?;
        relationships::get_inconsistencies(self.inner.adapter.as_ref(), &models).await
    }

    /// Delete every record of every model, dependents first
    pub async fn delete_all(&self) -> OrmResult<u64> {
        let mut deleted = 0;
        for schema in self.ordered_models()?.iter().rev() {
            deleted += self.inner.adapter.delete(schema, None).await?;
        }
        Ok(deleted)
    }

    /// Drop every model's table, dependents first
    pub async fn drop_all(&self) -> OrmResult<()> {
        for schema in self.ordered_models()?.iter().rev() {
            self.inner.adapter.drop_table(schema).await?;
        }
        Ok(())
    }

    /// Run a batch of data-manipulation directives
    pub async fn manipulate(
        &self,
        directives: &[JsonValue],
    ) -> OrmResult<HashMap<String, JsonValue>> {
        manipulate::run(self, directives).await
    }
}

async fn connect_with_retry(
    adapter: &dyn Adapter,
    settings: &ConnectionSettings,
) -> OrmResult<()> {
    let mut delay = INITIAL_BACKOFF;
    for attempt in 1..=MAX_CONNECT_ATTEMPTS {
        match adapter.connect(settings).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < MAX_CONNECT_ATTEMPTS => {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50));
                warn!(attempt, error = %e, "connect failed; retrying");
                tokio::time::sleep(delay + jitter).await;
                delay = (delay * 2).min(MAX_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("retry loop returns on the final attempt")
}

/// Map a logical-keyed record to storage keys, coercing values on the way
pub(crate) fn to_storage(schema: &ModelSchema, data: &JsonValue) -> OrmResult<JsonValue> {
    let map = match data {
        JsonValue::Object(map) => map,
        other => {
            return Err(OrmError::backend_message(format!(
                "record data must be an object, got {other}"
            )))
        }
    };
    let mut out = Map::new();
    for (key, value) in map {
        if key == "id" {
            continue;
        }
        let column = schema.require_column(key)?;
        out.insert(column.storage_name.clone(), coerce_value(column, value)?);
    }
    Ok(JsonValue::Object(out))
}

/// Map a storage-keyed row back to logical keys
pub(crate) fn to_logical(schema: &ModelSchema, row: JsonValue) -> JsonValue {
    let JsonValue::Object(map) = row else { return row };
    let mut out = Map::new();
    for column in &schema.columns {
        if let Some(value) = map.get(&column.storage_name) {
            out.insert(column.name.clone(), value.clone());
        }
    }
    JsonValue::Object(out)
}

/// Enforce required columns before any insert
pub(crate) fn validate_required(schema: &ModelSchema, data: &JsonValue) -> OrmResult<()> {
    for column in &schema.columns {
        if !column.required || column.name == "id" {
            continue;
        }
        let present = data
            .get(&column.name)
            .map(|v| !v.is_null())
            .unwrap_or(false);
        if !present {
            return Err(OrmError::RequiredFieldMissing(format!(
                "'{}' is required on {}",
                column.name, schema.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::DocumentAdapter;
    use crate::schema::{ColumnSchema, ColumnType};
    use serde_json::json;

    fn document_connection() -> Connection {
        Connection::from_adapter(Arc::new(DocumentAdapter::new()))
    }

    #[tokio::test]
    async fn define_then_create_round_trips() {
        let conn = document_connection();
        conn.define("User", "users", |m| {
            m.column_schema(ColumnSchema::new("name", ColumnType::String(None)).required());
            m.column("age", ColumnType::Integer);
        })
        .unwrap();
        let record = conn
            .create("User", &json!({"name": "ada", "age": 36}))
            .await
            .unwrap();
        assert_eq!(record["id"], json!(1));
        let fetched = conn.get("User", &json!(1)).await.unwrap();
        assert_eq!(fetched["name"], json!("ada"));
    }

    #[tokio::test]
    async fn missing_required_field_is_rejected() {
        let conn = document_connection();
        conn.define("User", "users", |m| {
            m.column_schema(ColumnSchema::new("name", ColumnType::String(None)).required());
        })
        .unwrap();
        let err = conn.create("User", &json!({})).await.unwrap_err();
        assert!(matches!(err, OrmError::RequiredFieldMissing(_)));
    }

    #[tokio::test]
    async fn define_after_freeze_is_rejected() {
        let conn = document_connection();
        conn.define("User", "users", |m| {
            m.column("name", ColumnType::String(None));
        })
        .unwrap();
        conn.ensure_frozen().unwrap();
        assert!(conn.define("Late", "lates", |_| {}).is_err());
    }

    #[tokio::test]
    async fn unknown_field_on_create_is_rejected() {
        let conn = document_connection();
        conn.define("User", "users", |m| {
            m.column("name", ColumnType::String(None));
        })
        .unwrap();
        let err = conn
            .create("User", &json!({"nome": "ada"}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::UnknownColumn(c) if c == "nome"));
    }
}
