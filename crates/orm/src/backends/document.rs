//! In-process document store backend
//!
//! Stores nested JSON documents per collection, compiles conditions to
//! native filter documents and evaluates them in-process. Supports geo
//! `$near` ordering, native upsert and snapshot transactions. Schema-less:
//! `get_schemas` reports collections and indexes but no column metadata.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};

use crate::compiler::{eval, DocumentCompiler, GroupSpec};
use crate::conditions::parse_orders;
use crate::error::{OrmError, OrmResult};
use crate::schema::{ColumnSchema, IndexSchema, ModelSchema};
use crate::transaction::IsolationLevel;

use super::core::{
    Adapter, AdapterCapabilities, AdapterTransaction, ConnectionSettings, LiveSchema, LiveTable,
    QueryOptions,
};
use super::BackendType;

#[derive(Debug, Clone, Default)]
struct Collection {
    next_id: i64,
    rows: BTreeMap<i64, JsonValue>,
    indexes: HashSet<String>,
}

type Store = HashMap<String, Collection>;

/// The document store adapter
pub struct DocumentAdapter {
    store: Arc<RwLock<Store>>,
    /// Serializes transactions; snapshot semantics need exclusive access
    tx_lock: Arc<Mutex<()>>,
    compiler: DocumentCompiler,
    capabilities: AdapterCapabilities,
}

impl DocumentAdapter {
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
            tx_lock: Arc::new(Mutex::new(())),
            compiler: DocumentCompiler::new(),
            capabilities: AdapterCapabilities {
                nested_documents: true,
                geopoint: true,
                native_upsert: true,
                string_length: false,
                native_foreign_keys: false,
                isolation_levels: Vec::new(),
            },
        }
    }

    fn compile_conditions(
        &self,
        schema: &ModelSchema,
        conditions: Option<&JsonValue>,
    ) -> OrmResult<JsonValue> {
        match conditions {
            Some(tree) => self.compiler.compile(schema, tree),
            None => Ok(JsonValue::Object(Map::new())),
        }
    }

    async fn matching_rows(
        &self,
        schema: &ModelSchema,
        options: &QueryOptions,
    ) -> OrmResult<Vec<JsonValue>> {
        let filter = self.compile_conditions(schema, options.conditions.as_ref())?;
        let (near, rest) = eval::extract_near(&filter);
        let orders = parse_orders(schema, &options.orders)?;
        let select = match &options.select {
            Some(columns) => Some(crate::conditions::resolve_select(schema, columns)?),
            None => None,
        };

        let store = self.store.read().await;
        let mut rows: Vec<JsonValue> = store
            .get(&schema.table_name)
            .map(|collection| {
                collection
                    .rows
                    .values()
                    .filter(|row| eval::matches(&rest, row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(store);

        if let Some((field, target)) = near {
            rows.sort_by(|a, b| {
                eval::distance(eval::get_path(a, &field), target)
                    .partial_cmp(&eval::distance(eval::get_path(b, &field), target))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        } else if !orders.is_empty() {
            eval::apply_order(&mut rows, &orders);
        }

        let skip = options.skip.unwrap_or(0) as usize;
        if skip > 0 {
            rows = rows.into_iter().skip(skip).collect();
        }
        if let Some(limit) = options.limit {
            rows.truncate(limit as usize);
        }
        if let Some(select) = select {
            rows = rows.into_iter().map(|row| project(row, &select)).collect();
        }
        Ok(rows)
    }

    fn check_unique(
        collection: &Collection,
        schema: &ModelSchema,
        record: &JsonValue,
        exclude_id: Option<i64>,
    ) -> OrmResult<()> {
        for column in schema.columns.iter().filter(|c| c.unique) {
            let value = eval::get_path(record, &column.storage_name);
            if value.is_null() {
                continue;
            }
            let clash = collection.rows.iter().any(|(id, row)| {
                Some(*id) != exclude_id && eval::get_path(row, &column.storage_name) == value
            });
            if clash {
                return Err(OrmError::DuplicateKey(schema.table_name.clone()));
            }
        }
        Ok(())
    }

    async fn insert(&self, schema: &ModelSchema, data: &JsonValue) -> OrmResult<JsonValue> {
        let mut store = self.store.write().await;
        let collection = store.entry(schema.table_name.clone()).or_default();
        let mut record = data.clone();
        collection.next_id += 1;
        let id = collection.next_id;
        if let JsonValue::Object(map) = &mut record {
            map.insert("id".to_string(), JsonValue::from(id));
        }
        Self::check_unique(collection, schema, &record, None)?;
        collection.rows.insert(id, record.clone());
        Ok(record)
    }
}

impl Default for DocumentAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn project(row: JsonValue, select: &[String]) -> JsonValue {
    let JsonValue::Object(map) = row else {
        return row;
    };
    let mut out = Map::new();
    if let Some(id) = map.get("id") {
        out.insert("id".to_string(), id.clone());
    }
    for column in select {
        if let Some(value) = map.get(column) {
            out.insert(column.clone(), value.clone());
        }
    }
    JsonValue::Object(out)
}

fn record_id(record: &JsonValue) -> Option<i64> {
    record.get("id").and_then(JsonValue::as_i64)
}

#[async_trait]
impl Adapter for DocumentAdapter {
    fn backend_type(&self) -> BackendType {
        BackendType::Document
    }

    fn capabilities(&self) -> &AdapterCapabilities {
        &self.capabilities
    }

    async fn connect(&self, _settings: &ConnectionSettings) -> OrmResult<()> {
        Ok(())
    }

    async fn create(&self, schema: &ModelSchema, data: &JsonValue) -> OrmResult<JsonValue> {
        self.insert(schema, data).await
    }

    async fn create_bulk(
        &self,
        schema: &ModelSchema,
        rows: &[JsonValue],
    ) -> OrmResult<Vec<JsonValue>> {
        let mut created = Vec::with_capacity(rows.len());
        for row in rows {
            created.push(self.insert(schema, row).await?);
        }
        Ok(created)
    }

    async fn update(&self, schema: &ModelSchema, record: &JsonValue) -> OrmResult<()> {
        let id =
            record_id(record).ok_or_else(|| OrmError::NotFound(schema.table_name.clone()))?;
        let mut store = self.store.write().await;
        let collection = store
            .get_mut(&schema.table_name)
            .ok_or_else(|| OrmError::NotFound(schema.table_name.clone()))?;
        if !collection.rows.contains_key(&id) {
            return Err(OrmError::NotFound(schema.table_name.clone()));
        }
        Self::check_unique(collection, schema, record, Some(id))?;
        collection.rows.insert(id, record.clone());
        Ok(())
    }

    async fn update_partial(
        &self,
        schema: &ModelSchema,
        conditions: Option<&JsonValue>,
        updates: &JsonValue,
    ) -> OrmResult<u64> {
        let filter = self.compile_conditions(schema, conditions)?;
        let updates = updates
            .as_object()
            .ok_or_else(|| OrmError::backend_message("partial update requires an object"))?;
        let mut store = self.store.write().await;
        let Some(collection) = store.get_mut(&schema.table_name) else {
            return Ok(0);
        };
        let mut affected = 0;
        for row in collection.rows.values_mut() {
            if !eval::matches(&filter, row) {
                continue;
            }
            if let JsonValue::Object(map) = row {
                for (key, value) in updates {
                    map.insert(key.clone(), value.clone());
                }
            }
            affected += 1;
        }
        Ok(affected)
    }

    async fn upsert(
        &self,
        schema: &ModelSchema,
        conditions: &JsonValue,
        updates: &JsonValue,
    ) -> OrmResult<()> {
        let affected = self
            .update_partial(schema, Some(conditions), updates)
            .await?;
        if affected > 0 {
            return Ok(());
        }
        // Seed the new record from the equality conditions plus the updates
        let mut seed = Map::new();
        if let JsonValue::Object(map) = conditions {
            for (key, value) in map {
                if !value.is_object() && !key.starts_with('$') {
                    let storage = schema.storage_name(key)?;
                    seed.insert(storage.to_string(), value.clone());
                }
            }
        }
        if let JsonValue::Object(map) = updates {
            for (key, value) in map {
                seed.insert(key.clone(), value.clone());
            }
        }
        self.insert(schema, &JsonValue::Object(seed)).await?;
        Ok(())
    }

    async fn find_by_id(&self, schema: &ModelSchema, id: &JsonValue) -> OrmResult<JsonValue> {
        let id = id
            .as_i64()
            .ok_or_else(|| OrmError::NotFound(schema.table_name.clone()))?;
        let store = self.store.read().await;
        store
            .get(&schema.table_name)
            .and_then(|collection| collection.rows.get(&id))
            .cloned()
            .ok_or_else(|| OrmError::NotFound(schema.table_name.clone()))
    }

    async fn find(
        &self,
        schema: &ModelSchema,
        options: &QueryOptions,
    ) -> OrmResult<Vec<JsonValue>> {
        self.matching_rows(schema, options).await
    }

    async fn stream(
        &self,
        schema: &ModelSchema,
        options: &QueryOptions,
    ) -> OrmResult<mpsc::Receiver<OrmResult<JsonValue>>> {
        let rows = self.matching_rows(schema, options).await?;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for row in rows {
                if tx.send(Ok(row)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn count(&self, schema: &ModelSchema, conditions: Option<&JsonValue>) -> OrmResult<u64> {
        let options = QueryOptions {
            conditions: conditions.cloned(),
            ..Default::default()
        };
        Ok(self.matching_rows(schema, &options).await?.len() as u64)
    }

    async fn group(
        &self,
        schema: &ModelSchema,
        conditions: Option<&JsonValue>,
        spec: &GroupSpec,
    ) -> OrmResult<Vec<JsonValue>> {
        let options = QueryOptions {
            conditions: conditions.cloned(),
            ..Default::default()
        };
        let rows = self.matching_rows(schema, &options).await?;
        Ok(eval::execute_group(&rows, spec))
    }

    async fn delete(&self, schema: &ModelSchema, conditions: Option<&JsonValue>) -> OrmResult<u64> {
        let filter = self.compile_conditions(schema, conditions)?;
        let mut store = self.store.write().await;
        let Some(collection) = store.get_mut(&schema.table_name) else {
            return Ok(0);
        };
        let before = collection.rows.len();
        collection.rows.retain(|_, row| !eval::matches(&filter, row));
        Ok((before - collection.rows.len()) as u64)
    }

    async fn get_schemas(&self) -> OrmResult<LiveSchema> {
        let store = self.store.read().await;
        let mut live = LiveSchema::schemaless();
        for (name, collection) in store.iter() {
            live.tables.insert(
                name.clone(),
                LiveTable {
                    columns: HashMap::new(),
                    indexes: collection.indexes.clone(),
                    foreign_keys: HashSet::new(),
                },
            );
        }
        Ok(live)
    }

    async fn create_table(&self, schema: &ModelSchema) -> OrmResult<()> {
        let mut store = self.store.write().await;
        store.entry(schema.table_name.clone()).or_default();
        Ok(())
    }

    async fn add_column(&self, _schema: &ModelSchema, _column: &ColumnSchema) -> OrmResult<()> {
        // Documents are schema-less; nothing to do
        Ok(())
    }

    async fn create_index(&self, schema: &ModelSchema, index: &IndexSchema) -> OrmResult<()> {
        let mut store = self.store.write().await;
        let collection = store.entry(schema.table_name.clone()).or_default();
        collection.indexes.insert(index.name.clone());
        Ok(())
    }

    async fn create_foreign_key(
        &self,
        _schema: &ModelSchema,
        _column: &str,
        _referenced_table: &str,
    ) -> OrmResult<()> {
        // No native referential integrity; cascades run in the layer above
        Ok(())
    }

    async fn drop_table(&self, schema: &ModelSchema) -> OrmResult<()> {
        let mut store = self.store.write().await;
        store.remove(&schema.table_name);
        Ok(())
    }

    async fn begin(
        &self,
        _isolation: Option<IsolationLevel>,
    ) -> OrmResult<Box<dyn AdapterTransaction>> {
        let guard = self.tx_lock.clone().lock_owned().await;
        let snapshot = self.store.read().await.clone();
        Ok(Box::new(DocumentTransaction {
            store: self.store.clone(),
            snapshot: Some(snapshot),
            _guard: guard,
        }))
    }
}

/// Snapshot transaction: rollback restores the whole-store snapshot taken
/// at begin, commit discards it.
struct DocumentTransaction {
    store: Arc<RwLock<Store>>,
    snapshot: Option<Store>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl AdapterTransaction for DocumentTransaction {
    async fn commit(&mut self) -> OrmResult<()> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(&mut self) -> OrmResult<()> {
        if let Some(snapshot) = self.snapshot.take() {
            *self.store.write().await = snapshot;
        }
        Ok(())
    }
}
