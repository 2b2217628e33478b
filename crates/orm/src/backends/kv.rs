//! In-process key-value store backend
//!
//! A flat keyspace of `table:id` keys holding JSON blobs. The store has no
//! query engine at all, so every condition is evaluated client-side after a
//! prefix scan, and ids come from per-table sequences. Schema-less; DDL
//! operations are accepted as no-ops.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value as JsonValue};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use crate::compiler::{eval, DocumentCompiler, GroupSpec};
use crate::conditions::parse_orders;
use crate::error::{OrmError, OrmResult};
use crate::schema::{ColumnSchema, IndexSchema, ModelSchema};
use crate::transaction::IsolationLevel;

use super::core::{
    Adapter, AdapterCapabilities, AdapterTransaction, ConnectionSettings, LiveSchema, QueryOptions,
};
use super::BackendType;

/// The key-value store adapter
pub struct KvAdapter {
    entries: Arc<DashMap<String, JsonValue>>,
    sequences: DashMap<String, i64>,
    tx_lock: Arc<Mutex<()>>,
    compiler: DocumentCompiler,
    capabilities: AdapterCapabilities,
}

fn key_for(table: &str, id: i64) -> String {
    format!("{table}:{id}")
}

fn key_prefix(table: &str) -> String {
    format!("{table}:")
}

impl KvAdapter {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            sequences: DashMap::new(),
            tx_lock: Arc::new(Mutex::new(())),
            compiler: DocumentCompiler::new(),
            capabilities: AdapterCapabilities {
                nested_documents: false,
                geopoint: false,
                native_upsert: false,
                string_length: false,
                native_foreign_keys: false,
                isolation_levels: Vec::new(),
            },
        }
    }

    fn next_id(&self, table: &str) -> i64 {
        let mut seq = self.sequences.entry(table.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    fn scan(&self, table: &str) -> Vec<JsonValue> {
        let prefix = key_prefix(table);
        let mut rows: Vec<JsonValue> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by_key(|row| row.get("id").and_then(JsonValue::as_i64).unwrap_or(0));
        rows
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

    fn matching_rows(
        &self,
        schema: &ModelSchema,
        options: &QueryOptions,
    ) -> OrmResult<Vec<JsonValue>> {
        let filter = self.compile_conditions(schema, options.conditions.as_ref())?;
        let orders = parse_orders(schema, &options.orders)?;
        let select = match &options.select {
            Some(columns) => Some(crate::conditions::resolve_select(schema, columns)?),
            None => None,
        };

        let mut rows: Vec<JsonValue> = self
            .scan(&schema.table_name)
            .into_iter()
            .filter(|row| eval::matches(&filter, row))
            .collect();
        if !orders.is_empty() {
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
            rows = rows
                .into_iter()
                .map(|row| {
                    let JsonValue::Object(map) = row else { return row };
                    let mut out = Map::new();
                    if let Some(id) = map.get("id") {
                        out.insert("id".to_string(), id.clone());
                    }
                    for column in &select {
                        if let Some(value) = map.get(column) {
                            out.insert(column.clone(), value.clone());
                        }
                    }
                    JsonValue::Object(out)
                })
                .collect();
        }
        Ok(rows)
    }

    fn check_unique(
        &self,
        schema: &ModelSchema,
        record: &JsonValue,
        exclude_id: Option<i64>,
    ) -> OrmResult<()> {
        for column in schema.columns.iter().filter(|c| c.unique) {
            let value = eval::get_path(record, &column.storage_name);
            if value.is_null() {
                continue;
            }
            let clash = self.scan(&schema.table_name).into_iter().any(|row| {
                row.get("id").and_then(JsonValue::as_i64) != exclude_id
                    && eval::get_path(&row, &column.storage_name) == value
            });
            if clash {
                return Err(OrmError::DuplicateKey(schema.table_name.clone()));
            }
        }
        Ok(())
    }
}

impl Default for KvAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for KvAdapter {
    fn backend_type(&self) -> BackendType {
        BackendType::KeyValue
    }

    fn capabilities(&self) -> &AdapterCapabilities {
        &self.capabilities
    }

    async fn connect(&self, _settings: &ConnectionSettings) -> OrmResult<()> {
        Ok(())
    }

    async fn create(&self, schema: &ModelSchema, data: &JsonValue) -> OrmResult<JsonValue> {
        let mut record = data.clone();
        let id = self.next_id(&schema.table_name);
        if let JsonValue::Object(map) = &mut record {
            map.insert("id".to_string(), JsonValue::from(id));
        }
        self.check_unique(schema, &record, Some(id))?;
        self.entries
            .insert(key_for(&schema.table_name, id), record.clone());
        Ok(record)
    }

    async fn create_bulk(
        &self,
        schema: &ModelSchema,
        rows: &[JsonValue],
    ) -> OrmResult<Vec<JsonValue>> {
        let mut created = Vec::with_capacity(rows.len());
        for row in rows {
            created.push(self.create(schema, row).await?);
        }
        Ok(created)
    }

    async fn update(&self, schema: &ModelSchema, record: &JsonValue) -> OrmResult<()> {
        let id = record
            .get("id")
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| OrmError::NotFound(schema.table_name.clone()))?;
        let key = key_for(&schema.table_name, id);
        if !self.entries.contains_key(&key) {
            return Err(OrmError::NotFound(schema.table_name.clone()));
        }
        self.check_unique(schema, record, Some(id))?;
        self.entries.insert(key, record.clone());
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
        let prefix = key_prefix(&schema.table_name);
        let mut affected = 0;
        for mut entry in self.entries.iter_mut() {
            if !entry.key().starts_with(&prefix) || !eval::matches(&filter, entry.value()) {
                continue;
            }
            if let JsonValue::Object(map) = entry.value_mut() {
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
        // No native upsert: find-then-update-or-create
        let affected = self
            .update_partial(schema, Some(conditions), updates)
            .await?;
        if affected > 0 {
            return Ok(());
        }
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
        self.create(schema, &JsonValue::Object(seed)).await?;
        Ok(())
    }

    async fn find_by_id(&self, schema: &ModelSchema, id: &JsonValue) -> OrmResult<JsonValue> {
        let id = id
            .as_i64()
            .ok_or_else(|| OrmError::NotFound(schema.table_name.clone()))?;
        self.entries
            .get(&key_for(&schema.table_name, id))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OrmError::NotFound(schema.table_name.clone()))
    }

    async fn find(
        &self,
        schema: &ModelSchema,
        options: &QueryOptions,
    ) -> OrmResult<Vec<JsonValue>> {
        self.matching_rows(schema, options)
    }

    async fn stream(
        &self,
        schema: &ModelSchema,
        options: &QueryOptions,
    ) -> OrmResult<mpsc::Receiver<OrmResult<JsonValue>>> {
        let rows = self.matching_rows(schema, options)?;
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
        Ok(self.matching_rows(schema, &options)?.len() as u64)
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
        let rows = self.matching_rows(schema, &options)?;
        Ok(eval::execute_group(&rows, spec))
    }

    async fn delete(&self, schema: &ModelSchema, conditions: Option<&JsonValue>) -> OrmResult<u64> {
        let filter = self.compile_conditions(schema, conditions)?;
        let prefix = key_prefix(&schema.table_name);
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix) && eval::matches(&filter, entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        let count = doomed.len() as u64;
        for key in doomed {
            self.entries.remove(&key);
        }
        Ok(count)
    }

    async fn get_schemas(&self) -> OrmResult<LiveSchema> {
        Ok(LiveSchema::schemaless())
    }

    async fn create_table(&self, _schema: &ModelSchema) -> OrmResult<()> {
        Ok(())
    }

    async fn add_column(&self, _schema: &ModelSchema, _column: &ColumnSchema) -> OrmResult<()> {
        Ok(())
    }

    async fn create_index(&self, _schema: &ModelSchema, _index: &IndexSchema) -> OrmResult<()> {
        // The flat keyspace has nothing to index
        Ok(())
    }

    async fn create_foreign_key(
        &self,
        _schema: &ModelSchema,
        _column: &str,
        _referenced_table: &str,
    ) -> OrmResult<()> {
        Ok(())
    }

    async fn drop_table(&self, schema: &ModelSchema) -> OrmResult<()> {
        let prefix = key_prefix(&schema.table_name);
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.key().clone())
            .collect();
        for key in doomed {
            self.entries.remove(&key);
        }
        self.sequences.remove(&schema.table_name);
        Ok(())
    }

    async fn begin(
        &self,
        _isolation: Option<IsolationLevel>,
    ) -> OrmResult<Box<dyn AdapterTransaction>> {
        let guard = self.tx_lock.clone().lock_owned().await;
        let snapshot: Vec<(String, JsonValue)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        Ok(Box::new(KvTransaction {
            entries: self.entries.clone(),
            snapshot: Some(snapshot),
            _guard: guard,
        }))
    }
}

struct KvTransaction {
    entries: Arc<DashMap<String, JsonValue>>,
    snapshot: Option<Vec<(String, JsonValue)>>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl AdapterTransaction for KvTransaction {
    async fn commit(&mut self) -> OrmResult<()> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(&mut self) -> OrmResult<()> {
        if let Some(snapshot) = self.snapshot.take() {
            self.entries.clear();
            for (key, value) in snapshot {
                self.entries.insert(key, value);
            }
        }
        Ok(())
    }
}
