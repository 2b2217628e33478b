//! Query executor
//!
//! A `Query` accumulates conditions, ordering, projection and pagination,
//! then executes against the backend. Reads route through the connection's
//! replica rotation; writes and deletes go to the primary, with integrity
//! cascades running before the owning delete.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, Mutex};

use crate::backends::QueryOptions;
use crate::compiler::parse_group;
use crate::conditions::merge_and;
use crate::connection::{to_logical, to_storage, Connection};
use crate::error::{OrmError, OrmResult};
use crate::relationships::{cascade_delete, RelationHandle};
use crate::schema::ModelSchema;

/// A composable query over one model
#[derive(Clone)]
pub struct Query {
    conn: Connection,
    schema: Arc<ModelSchema>,
    conditions: Option<JsonValue>,
    orders: Vec<String>,
    select: Option<Vec<String>>,
    limit: Option<u64>,
    skip: Option<u64>,
}

impl Query {
    pub(crate) fn new(conn: Connection, schema: Arc<ModelSchema>) -> Self {
        Self {
            conn,
            schema,
            conditions: None,
            orders: Vec::new(),
            select: None,
            limit: None,
            skip: None,
        }
    }

    /// AND a condition subtree onto the query
    pub fn filter(mut self, conditions: JsonValue) -> Self {
        self.conditions = Some(merge_and(self.conditions.take(), conditions));
        self
    }

    /// Add an order entry; prefix with `-` for descending
    pub fn order(mut self, spec: &str) -> Self {
        self.orders.push(spec.to_string());
        self
    }

    /// Project onto the named columns; `id` always rides along
    pub fn select(mut self, columns: &[&str]) -> Self {
        self.select = Some(columns.iter().map(|c| (*c).to_string()).collect());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    fn options(&self) -> QueryOptions {
        QueryOptions {
            conditions: self.conditions.clone(),
            orders: self.orders.clone(),
            select: self.select.clone(),
            limit: self.limit,
            skip: self.skip,
        }
    }

    /// Execute and return plain (lean) logical-keyed records
    pub async fn exec(&self) -> OrmResult<Vec<JsonValue>> {
        let rows = self
            .conn
            .read_adapter()
            .find(&self.schema, &self.options())
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| to_logical(&self.schema, row))
            .collect())
    }

    /// Execute and wrap each record in a [`ModelInstance`]
    pub async fn instances(&self) -> OrmResult<Vec<ModelInstance>> {
        Ok(self
            .exec()
            .await?
            .into_iter()
            .map(|data| ModelInstance::new(self.conn.clone(), self.schema.clone(), data))
            .collect())
    }

    /// First matching record, or `None`
    pub async fn first(&self) -> OrmResult<Option<JsonValue>> {
        Ok(self.clone().limit(1).exec().await?.into_iter().next())
    }

    /// Exactly one record, or [`OrmError::NotFound`]
    pub async fn one(&self) -> OrmResult<JsonValue> {
        self.first()
            .await?
            .ok_or_else(|| OrmError::NotFound(self.schema.name.clone()))
    }

    /// Count matching records; ordering and pagination do not apply
    pub async fn count(&self) -> OrmResult<u64> {
        self.conn
            .read_adapter()
            .count(&self.schema, self.conditions.as_ref())
            .await
    }

    /// Grouped aggregation. `group_by` is `None`, a column name, or an
    /// array of column names; `fields` maps output names to aggregates.
    pub async fn group(
        &self,
        group_by: Option<&JsonValue>,
        fields: &JsonValue,
    ) -> OrmResult<Vec<JsonValue>> {
        let spec = parse_group(&self.schema, group_by, fields)?;
        self.conn
            .read_adapter()
            .group(&self.schema, self.conditions.as_ref(), &spec)
            .await
    }

    /// Apply a partial update to every matching record
    pub async fn update(&self, updates: &JsonValue) -> OrmResult<u64> {
        let storage = to_storage(&self.schema, updates)?;
        self.conn
            .adapter()
            .update_partial(&self.schema, self.conditions.as_ref(), &storage)
            .await
    }

    /// Update matching records, or insert one from the equality conditions
    /// when nothing matched
    pub async fn upsert(&self, updates: &JsonValue) -> OrmResult<()> {
        let conditions = self
            .conditions
            .clone()
            .unwrap_or_else(|| JsonValue::Object(Default::default()));
        let storage = to_storage(&self.schema, updates)?;
        self.conn
            .adapter()
            .upsert(&self.schema, &conditions, &storage)
            .await
    }

    /// Delete matching records after running integrity policies
    pub async fn delete(&self) -> OrmResult<u64> {
        let adapter = self.conn.adapter();
        let rows = adapter
            .find(
                &self.schema,
                &QueryOptions {
                    conditions: self.conditions.clone(),
                    ..Default::default()
                },
            )
            .await?;
        let ids: Vec<JsonValue> = rows.iter().filter_map(|r| r.get("id").cloned()).collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let models = self.conn.models()?;
        cascade_delete(adapter.as_ref(), &models, &self.schema.name, ids).await?;
        adapter.delete(&self.schema, self.conditions.as_ref()).await
    }

    /// Stream matching records without materializing the full result
    pub async fn stream(&self) -> OrmResult<mpsc::Receiver<OrmResult<JsonValue>>> {
        let mut inner = self
            .conn
            .read_adapter()
            .stream(&self.schema, &self.options())
            .await?;
        let schema = self.schema.clone();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(item) = inner.recv().await {
                let mapped = item.map(|row| to_logical(&schema, row));
                if tx.send(mapped).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// One fetched record bound to its connection, with relation access
pub struct ModelInstance {
    conn: Connection,
    schema: Arc<ModelSchema>,
    data: JsonValue,
    relation_cache: Arc<Mutex<HashMap<String, Vec<JsonValue>>>>,
}

impl ModelInstance {
    pub(crate) fn new(conn: Connection, schema: Arc<ModelSchema>, data: JsonValue) -> Self {
        Self {
            conn,
            schema,
            data,
            relation_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn id(&self) -> Option<&JsonValue> {
        self.data.get("id")
    }

    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.data.get(column)
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    pub fn model(&self) -> &str {
        &self.schema.name
    }

    /// A handle over one declared association of this record
    pub fn relation(&self, alias: &str) -> OrmResult<RelationHandle> {
        let association = self.schema.association(alias).cloned().ok_or_else(|| {
            OrmError::backend_message(format!(
                "model '{}' has no association '{alias}'",
                self.schema.name
            ))
        })?;
        Ok(RelationHandle::new(
            self.conn.clone(),
            association,
            self.data.clone(),
            self.relation_cache.clone(),
        ))
    }
}
