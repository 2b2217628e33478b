//! SQL backend over sqlx
//!
//! One adapter serves PostgreSQL, MySQL and SQLite through the `Any` driver;
//! everything dialect-specific is routed through [`SqlDialect`] and the
//! condition compiler. Statements are rendered by pure helpers so the SQL
//! text is testable without a live server.

use serde_json::{Map, Value as JsonValue};
use sqlx::any::{install_default_drivers, AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Row};
use tokio::sync::{mpsc, Mutex, OnceCell};
use tracing::debug;

use crate::compiler::{GroupSpec, SqlCompiler, SqlFragment};
use crate::error::{OrmError, OrmResult};
use crate::schema::{ColumnSchema, ColumnType, IndexSchema, ModelSchema};
use crate::transaction::IsolationLevel;

use super::core::{
    wrap_error, Adapter, AdapterCapabilities, AdapterTransaction, ConnectionSettings, LiveColumn,
    LiveSchema, LiveTable, QueryOptions, SqlDialect,
};
use super::BackendType;

/// Pool gauge snapshot
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
}

/// The SQL adapter, parameterized by dialect
pub struct SqlAdapter {
    dialect: SqlDialect,
    compiler: SqlCompiler,
    pool: OnceCell<AnyPool>,
    capabilities: AdapterCapabilities,
}

impl SqlAdapter {
    fn new(dialect: SqlDialect, capabilities: AdapterCapabilities) -> Self {
        Self {
            dialect,
            compiler: SqlCompiler::new(dialect),
            pool: OnceCell::new(),
            capabilities,
        }
    }

    pub fn postgres() -> Self {
        Self::new(
            SqlDialect::PostgreSql,
            AdapterCapabilities {
                nested_documents: false,
                geopoint: false,
                native_upsert: false,
                string_length: true,
                native_foreign_keys: true,
                isolation_levels: vec![
                    IsolationLevel::ReadUncommitted,
                    IsolationLevel::ReadCommitted,
                    IsolationLevel::RepeatableRead,
                    IsolationLevel::Serializable,
                ],
            },
        )
    }

    pub fn mysql() -> Self {
        Self::new(
            SqlDialect::MySql,
            AdapterCapabilities {
                nested_documents: false,
                geopoint: false,
                native_upsert: false,
                string_length: true,
                native_foreign_keys: true,
                isolation_levels: vec![
                    IsolationLevel::ReadUncommitted,
                    IsolationLevel::ReadCommitted,
                    IsolationLevel::RepeatableRead,
                    IsolationLevel::Serializable,
                ],
            },
        )
    }

    pub fn sqlite() -> Self {
        Self::new(
            SqlDialect::Sqlite,
            AdapterCapabilities {
                nested_documents: false,
                geopoint: false,
                native_upsert: false,
                string_length: false,
                native_foreign_keys: false,
                isolation_levels: Vec::new(),
            },
        )
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    /// Current pool gauges, when connected
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.get().map(|pool| PoolStats {
            size: pool.size(),
            idle: pool.num_idle(),
        })
    }

    fn pool(&self) -> OrmResult<&AnyPool> {
        self.pool.get().ok_or_else(|| OrmError::Connection {
            message: "backend is not connected".to_string(),
            retryable: false,
        })
    }

    fn quote(&self, identifier: &str) -> String {
        let q = self.dialect.identifier_quote();
        format!("{q}{identifier}{q}")
    }

    fn column_type_sql(&self, column: &ColumnSchema) -> &'static str {
        if column.array {
            // Arrays travel as JSON text on every SQL dialect
            return match self.dialect {
                SqlDialect::PostgreSql => "JSONB",
                SqlDialect::MySql => "JSON",
                SqlDialect::Sqlite => "TEXT",
            };
        }
        match (&column.column_type, self.dialect) {
            (ColumnType::String(_), SqlDialect::Sqlite) => "TEXT",
            (ColumnType::String(_), _) => "VARCHAR(255)",
            (ColumnType::Number, SqlDialect::PostgreSql) => "DOUBLE PRECISION",
            (ColumnType::Number, SqlDialect::MySql) => "DOUBLE",
            (ColumnType::Number, SqlDialect::Sqlite) => "REAL",
            (ColumnType::Boolean, _) => "BOOLEAN",
            (ColumnType::Integer, _) => "INT",
            (ColumnType::BigInteger | ColumnType::RecordId, _) => "BIGINT",
            (ColumnType::Date, SqlDialect::PostgreSql) => "TIMESTAMPTZ",
            (ColumnType::Date, SqlDialect::MySql) => "DATETIME(3)",
            (ColumnType::Date, SqlDialect::Sqlite) => "TEXT",
            (ColumnType::Object, SqlDialect::PostgreSql) => "JSONB",
            (ColumnType::Object, SqlDialect::MySql) => "JSON",
            (ColumnType::Object, SqlDialect::Sqlite) => "TEXT",
            (ColumnType::Text, _) => "TEXT",
            // No geo type without an extension; stored as text
            (ColumnType::GeoPoint, _) => "TEXT",
            (ColumnType::Blob, SqlDialect::PostgreSql) => "BYTEA",
            (ColumnType::Blob, _) => "BLOB",
        }
    }

    fn string_type_sql(&self, column: &ColumnSchema) -> String {
        if let ColumnType::String(Some(length)) = column.column_type {
            if self.capabilities.string_length && !column.array {
                return format!("VARCHAR({length})");
            }
        }
        self.column_type_sql(column).to_string()
    }

    fn create_table_sql(&self, schema: &ModelSchema) -> String {
        let mut defs = Vec::with_capacity(schema.columns.len());
        for column in &schema.columns {
            if column.storage_name == "id" {
                defs.push(format!(
                    "{} {}",
                    self.quote("id"),
                    self.dialect.auto_increment_primary_key()
                ));
                continue;
            }
            let mut def = format!(
                "{} {}",
                self.quote(&column.storage_name),
                self.string_type_sql(column)
            );
            if column.required {
                def.push_str(" NOT NULL");
            }
            if column.unique {
                def.push_str(" UNIQUE");
            }
            defs.push(def);
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.quote(&schema.table_name),
            defs.join(", ")
        )
    }

    fn add_column_sql(&self, schema: &ModelSchema, column: &ColumnSchema) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.quote(&schema.table_name),
            self.quote(&column.storage_name),
            self.string_type_sql(column)
        )
    }

    fn create_index_sql(&self, schema: &ModelSchema, index: &IndexSchema) -> String {
        let unique = if index.unique { "UNIQUE " } else { "" };
        let if_not_exists = match self.dialect {
            // MySQL has no IF NOT EXISTS for indexes
            SqlDialect::MySql => "",
            _ => "IF NOT EXISTS ",
        };
        let columns = index
            .columns
            .iter()
            .map(|c| self.quote(c))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE {unique}INDEX {if_not_exists}{} ON {} ({columns})",
            self.quote(&index.name),
            self.quote(&schema.table_name)
        )
    }

    fn insert_sql(&self, schema: &ModelSchema, data: &JsonValue) -> (String, Vec<JsonValue>) {
        let mut columns = Vec::new();
        let mut placeholders = Vec::new();
        let mut params = Vec::new();
        if let JsonValue::Object(map) = data {
            for column in &schema.columns {
                if column.storage_name == "id" {
                    continue;
                }
                if let Some(value) = map.get(&column.storage_name) {
                    columns.push(self.quote(&column.storage_name));
                    placeholders.push(self.dialect.parameter_placeholder(params.len()));
                    params.push(value.clone());
                }
            }
        }
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quote(&schema.table_name),
            columns.join(", "),
            placeholders.join(", ")
        );
        if self.dialect == SqlDialect::PostgreSql {
            sql.push_str(" RETURNING ");
            sql.push_str(&self.quote("id"));
        }
        (sql, params)
    }

    fn select_sql(
        &self,
        schema: &ModelSchema,
        options: &QueryOptions,
    ) -> OrmResult<(String, Vec<JsonValue>)> {
        let select = match &options.select {
            Some(columns) => {
                let list = self.compiler.compile_select(schema, columns)?;
                format!("{}, {list}", self.quote("id"))
            }
            None => "*".to_string(),
        };
        let mut sql = format!("SELECT {select} FROM {}", self.quote(&schema.table_name));
        let mut params = Vec::new();
        if let Some(conditions) = &options.conditions {
            let fragment = self.compiler.compile(schema, conditions)?;
            sql.push_str(" WHERE ");
            sql.push_str(&fragment.sql);
            params = fragment.params;
        }
        if !options.orders.is_empty() {
            let order = self.compiler.compile_order(schema, &options.orders)?;
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }
        self.push_limit_skip(&mut sql, options.limit, options.skip);
        Ok((sql, params))
    }

    fn push_limit_skip(&self, sql: &mut String, limit: Option<u64>, skip: Option<u64>) {
        match (limit, skip) {
            (None, None) => {}
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (limit, Some(skip)) => {
                // OFFSET without LIMIT needs a sentinel limit on two dialects
                let limit = match (limit, self.dialect) {
                    (Some(limit), _) => limit as i64,
                    (None, SqlDialect::PostgreSql) => i64::MAX,
                    (None, SqlDialect::MySql) => i64::MAX,
                    (None, SqlDialect::Sqlite) => -1,
                };
                sql.push_str(&format!(" LIMIT {limit} OFFSET {skip}"));
            }
        }
    }

    fn where_clause(
        &self,
        schema: &ModelSchema,
        conditions: Option<&JsonValue>,
    ) -> OrmResult<SqlFragment> {
        match conditions {
            Some(tree) => self.compiler.compile(schema, tree),
            None => Ok(SqlFragment::default()),
        }
    }

    async fn execute_sql(&self, table: &str, sql: &str, params: &[JsonValue]) -> OrmResult<u64> {
        debug!(%sql, "executing statement");
        let result = bind_params(sqlx::query(sql), params)
            .execute(self.pool()?)
            .await
            .map_err(|e| wrap_error(table, e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn fetch_sql(
        &self,
        table: &str,
        sql: &str,
        params: &[JsonValue],
    ) -> OrmResult<Vec<JsonValue>> {
        debug!(%sql, "fetching rows");
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(self.pool()?)
            .await
            .map_err(|e| wrap_error(table, e.to_string()))?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn live_schema_postgres(&self) -> OrmResult<LiveSchema> {
        let mut schema = LiveSchema {
            schema_aware: true,
            tables: Default::default(),
        };
        let columns = self
            .fetch_sql(
                "information_schema",
                "SELECT table_name, column_name, is_nullable FROM information_schema.columns \
                 WHERE table_schema = 'public'",
                &[],
            )
            .await?;
        for row in columns {
            let table = json_str(&row, "table_name");
            let column = json_str(&row, "column_name");
            let required = json_str(&row, "is_nullable") == "NO";
            schema
                .tables
                .entry(table)
                .or_insert_with(LiveTable::default)
                .columns
                .insert(column, LiveColumn { required });
        }
        let indexes = self
            .fetch_sql(
                "pg_indexes",
                "SELECT tablename, indexname FROM pg_indexes WHERE schemaname = 'public'",
                &[],
            )
            .await?;
        for row in indexes {
            if let Some(table) = schema.tables.get_mut(&json_str(&row, "tablename")) {
                table.indexes.insert(json_str(&row, "indexname"));
            }
        }
        let fks = self
            .fetch_sql(
                "information_schema",
                "SELECT table_name, constraint_name FROM information_schema.table_constraints \
                 WHERE constraint_type = 'FOREIGN KEY' AND table_schema = 'public'",
                &[],
            )
            .await?;
        for row in fks {
            if let Some(table) = schema.tables.get_mut(&json_str(&row, "table_name")) {
                table.foreign_keys.insert(json_str(&row, "constraint_name"));
            }
        }
        Ok(schema)
    }

    async fn live_schema_mysql(&self) -> OrmResult<LiveSchema> {
        let mut schema = LiveSchema {
            schema_aware: true,
            tables: Default::default(),
        };
        let columns = self
            .fetch_sql(
                "information_schema",
                "SELECT table_name, column_name, is_nullable FROM information_schema.columns \
                 WHERE table_schema = DATABASE()",
                &[],
            )
            .await?;
        for row in columns {
            let table = json_str(&row, "table_name");
            let column = json_str(&row, "column_name");
            let required = json_str(&row, "is_nullable") == "NO";
            schema
                .tables
                .entry(table)
                .or_insert_with(LiveTable::default)
                .columns
                .insert(column, LiveColumn { required });
        }
        let indexes = self
            .fetch_sql(
                "information_schema",
                "SELECT DISTINCT table_name, index_name FROM information_schema.statistics \
                 WHERE table_schema = DATABASE()",
                &[],
            )
            .await?;
        for row in indexes {
            if let Some(table) = schema.tables.get_mut(&json_str(&row, "table_name")) {
                table.indexes.insert(json_str(&row, "index_name"));
            }
        }
        let fks = self
            .fetch_sql(
                "information_schema",
                "SELECT table_name, constraint_name FROM information_schema.table_constraints \
                 WHERE constraint_type = 'FOREIGN KEY' AND table_schema = DATABASE()",
                &[],
            )
            .await?;
        for row in fks {
            if let Some(table) = schema.tables.get_mut(&json_str(&row, "table_name")) {
                table.foreign_keys.insert(json_str(&row, "constraint_name"));
            }
        }
        Ok(schema)
    }

    async fn live_schema_sqlite(&self) -> OrmResult<LiveSchema> {
        let mut schema = LiveSchema {
            schema_aware: true,
            tables: Default::default(),
        };
        let tables = self
            .fetch_sql(
                "sqlite_master",
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%'",
                &[],
            )
            .await?;
        for row in tables {
            let name = json_str(&row, "name");
            let mut table = LiveTable::default();
            let columns = self
                .fetch_sql(&name, &format!("PRAGMA table_info({})", self.quote(&name)), &[])
                .await?;
            for column in columns {
                let required = column
                    .get("notnull")
                    .and_then(JsonValue::as_i64)
                    .unwrap_or(0)
                    != 0;
                table
                    .columns
                    .insert(json_str(&column, "name"), LiveColumn { required });
            }
            schema.tables.insert(name, table);
        }
        let indexes = self
            .fetch_sql(
                "sqlite_master",
                "SELECT name, tbl_name FROM sqlite_master WHERE type = 'index' \
                 AND name NOT LIKE 'sqlite_%'",
                &[],
            )
            .await?;
        for row in indexes {
            if let Some(table) = schema.tables.get_mut(&json_str(&row, "tbl_name")) {
                table.indexes.insert(json_str(&row, "name"));
            }
        }
        Ok(schema)
    }
}

/// Bind positional JSON parameters onto a statement
fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    params: &[JsonValue],
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    for value in params {
        query = match value {
            JsonValue::Null => query.bind(None::<String>),
            JsonValue::Bool(b) => query.bind(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or_default()),
            },
            JsonValue::String(s) => query.bind(s.clone()),
            // Objects and arrays travel as JSON text
            other => query.bind(other.to_string()),
        };
    }
    query
}

/// Decode a driver row into a JSON object, probing the common scalar types
fn row_to_json(row: &AnyRow) -> JsonValue {
    let mut map = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(index) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else {
            JsonValue::Null
        };
        map.insert(column.name().to_string(), value);
    }
    JsonValue::Object(map)
}

fn json_str(row: &JsonValue, key: &str) -> String {
    row.get(key)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

#[async_trait::async_trait]
impl Adapter for SqlAdapter {
    fn backend_type(&self) -> BackendType {
        match self.dialect {
            SqlDialect::PostgreSql => BackendType::PostgreSql,
            SqlDialect::MySql => BackendType::MySql,
            SqlDialect::Sqlite => BackendType::Sqlite,
        }
    }

    fn capabilities(&self) -> &AdapterCapabilities {
        &self.capabilities
    }

    async fn connect(&self, settings: &ConnectionSettings) -> OrmResult<()> {
        if self.pool.get().is_some() {
            return Ok(());
        }
        let url = settings.url.as_deref().ok_or_else(|| OrmError::Connection {
            message: "a connection url is required for SQL backends".to_string(),
            retryable: false,
        })?;
        install_default_drivers();
        // A shared in-memory SQLite database exists per connection, so the
        // pool must not fan out
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| wrap_error("", e.to_string()))?;
        let _ = self.pool.set(pool);
        Ok(())
    }

    async fn create(&self, schema: &ModelSchema, data: &JsonValue) -> OrmResult<JsonValue> {
        let (sql, params) = self.insert_sql(schema, data);
        let id = if self.dialect == SqlDialect::PostgreSql {
            let row = bind_params(sqlx::query(&sql), &params)
                .fetch_one(self.pool()?)
                .await
                .map_err(|e| wrap_error(&schema.table_name, e.to_string()))?;
            row.try_get::<i64, _>(0)
                .map_err(|e| wrap_error(&schema.table_name, e.to_string()))?
        } else {
            let result = bind_params(sqlx::query(&sql), &params)
                .execute(self.pool()?)
                .await
                .map_err(|e| wrap_error(&schema.table_name, e.to_string()))?;
            result.last_insert_id().unwrap_or_default()
        };
        let mut record = data.clone();
        if let JsonValue::Object(map) = &mut record {
            map.insert("id".to_string(), JsonValue::from(id));
        }
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
        let map = record
            .as_object()
            .ok_or_else(|| OrmError::NotFound(schema.table_name.clone()))?;
        let id = map
            .get("id")
            .cloned()
            .ok_or_else(|| OrmError::NotFound(schema.table_name.clone()))?;
        let mut sets = Vec::new();
        let mut params = Vec::new();
        for column in &schema.columns {
            if column.storage_name == "id" {
                continue;
            }
            let value = map.get(&column.storage_name).cloned().unwrap_or(JsonValue::Null);
            sets.push(format!(
                "{} = {}",
                self.quote(&column.storage_name),
                self.dialect.parameter_placeholder(params.len())
            ));
            params.push(value);
        }
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = {}",
            self.quote(&schema.table_name),
            sets.join(", "),
            self.quote("id"),
            self.dialect.parameter_placeholder(params.len())
        );
        params.push(id);
        let affected = self.execute_sql(&schema.table_name, &sql, &params).await?;
        if affected == 0 {
            return Err(OrmError::NotFound(schema.table_name.clone()));
        }
        Ok(())
    }

    async fn update_partial(
        &self,
        schema: &ModelSchema,
        conditions: Option<&JsonValue>,
        updates: &JsonValue,
    ) -> OrmResult<u64> {
        let updates = updates
            .as_object()
            .ok_or_else(|| OrmError::backend_message("partial update requires an object"))?;
        // Condition placeholders come first so PostgreSQL numbering stays
        // sequential; bind order follows placeholder numbering, not
        // statement position
        let fragment = self.where_clause(schema, conditions)?;
        let mut condition_params = fragment.params;
        let mut sets = Vec::new();
        let mut set_params = Vec::new();
        for column in &schema.columns {
            if let Some(value) = updates.get(&column.storage_name) {
                sets.push(format!(
                    "{} = {}",
                    self.quote(&column.storage_name),
                    self.dialect
                        .parameter_placeholder(condition_params.len() + set_params.len())
                ));
                set_params.push(value.clone());
            }
        }
        if sets.is_empty() {
            return Ok(0);
        }
        let mut sql = format!(
            "UPDATE {} SET {}",
            self.quote(&schema.table_name),
            sets.join(", ")
        );
        if !fragment.sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&fragment.sql);
        }
        let params = match self.dialect {
            SqlDialect::PostgreSql => {
                condition_params.extend(set_params);
                condition_params
            }
            _ => {
                set_params.extend(condition_params);
                set_params
            }
        };
        self.execute_sql(&schema.table_name, &sql, &params).await
    }

    async fn upsert(
        &self,
        schema: &ModelSchema,
        conditions: &JsonValue,
        updates: &JsonValue,
    ) -> OrmResult<()> {
        // Update-then-insert; conflict-target inference is not portable
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
        let sql = format!(
            "SELECT * FROM {} WHERE {} = {} LIMIT 1",
            self.quote(&schema.table_name),
            self.quote("id"),
            self.dialect.parameter_placeholder(0)
        );
        let rows = self
            .fetch_sql(&schema.table_name, &sql, &[id.clone()])
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| OrmError::NotFound(schema.table_name.clone()))
    }

    async fn find(
        &self,
        schema: &ModelSchema,
        options: &QueryOptions,
    ) -> OrmResult<Vec<JsonValue>> {
        let (sql, params) = self.select_sql(schema, options)?;
        self.fetch_sql(&schema.table_name, &sql, &params).await
    }

    async fn stream(
        &self,
        schema: &ModelSchema,
        options: &QueryOptions,
    ) -> OrmResult<mpsc::Receiver<OrmResult<JsonValue>>> {
        let rows = self.find(schema, options).await?;
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
        let fragment = self.where_clause(schema, conditions)?;
        let mut sql = format!(
            "SELECT COUNT(*) AS {} FROM {}",
            self.quote("count"),
            self.quote(&schema.table_name)
        );
        if !fragment.sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&fragment.sql);
        }
        let rows = self
            .fetch_sql(&schema.table_name, &sql, &fragment.params)
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(JsonValue::as_i64)
            .unwrap_or(0) as u64)
    }

    async fn group(
        &self,
        schema: &ModelSchema,
        conditions: Option<&JsonValue>,
        spec: &GroupSpec,
    ) -> OrmResult<Vec<JsonValue>> {
        let (select, group_by) = self.compiler.compile_group(schema, spec)?;
        let fragment = self.where_clause(schema, conditions)?;
        let mut sql = format!("SELECT {select} FROM {}", self.quote(&schema.table_name));
        if !fragment.sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&fragment.sql);
        }
        if !group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&group_by);
        }
        self.fetch_sql(&schema.table_name, &sql, &fragment.params)
            .await
    }

    async fn delete(&self, schema: &ModelSchema, conditions: Option<&JsonValue>) -> OrmResult<u64> {
        let fragment = self.where_clause(schema, conditions)?;
        let mut sql = format!("DELETE FROM {}", self.quote(&schema.table_name));
        if !fragment.sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&fragment.sql);
        }
        self.execute_sql(&schema.table_name, &sql, &fragment.params)
            .await
    }

    async fn get_schemas(&self) -> OrmResult<LiveSchema> {
        match self.dialect {
            SqlDialect::PostgreSql => self.live_schema_postgres().await,
            SqlDialect::MySql => self.live_schema_mysql().await,
            SqlDialect::Sqlite => self.live_schema_sqlite().await,
        }
    }

    async fn create_table(&self, schema: &ModelSchema) -> OrmResult<()> {
        let sql = self.create_table_sql(schema);
        self.execute_sql(&schema.table_name, &sql, &[]).await?;
        Ok(())
    }

    async fn add_column(&self, schema: &ModelSchema, column: &ColumnSchema) -> OrmResult<()> {
        let sql = self.add_column_sql(schema, column);
        self.execute_sql(&schema.table_name, &sql, &[]).await?;
        Ok(())
    }

    async fn create_index(&self, schema: &ModelSchema, index: &IndexSchema) -> OrmResult<()> {
        let sql = self.create_index_sql(schema, index);
        self.execute_sql(&schema.table_name, &sql, &[]).await?;
        Ok(())
    }

    async fn create_foreign_key(
        &self,
        schema: &ModelSchema,
        column: &str,
        referenced_table: &str,
    ) -> OrmResult<()> {
        if !self.capabilities.native_foreign_keys {
            return Err(OrmError::backend_message(
                "this backend does not support adding foreign keys",
            ));
        }
        let constraint = format!("fk_{}_{column}", schema.table_name);
        let sql = format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            self.quote(&schema.table_name),
            self.quote(&constraint),
            self.quote(column),
            self.quote(referenced_table),
            self.quote("id")
        );
        self.execute_sql(&schema.table_name, &sql, &[]).await?;
        Ok(())
    }

    async fn drop_table(&self, schema: &ModelSchema) -> OrmResult<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", self.quote(&schema.table_name));
        self.execute_sql(&schema.table_name, &sql, &[]).await?;
        Ok(())
    }

    async fn begin(
        &self,
        isolation: Option<IsolationLevel>,
    ) -> OrmResult<Box<dyn AdapterTransaction>> {
        let mut tx = self
            .pool()?
            .begin()
            .await
            .map_err(|e| wrap_error("", e.to_string()))?;
        if let Some(level) = isolation {
            if self.capabilities.isolation_levels.contains(&level) {
                let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
                sqlx::query(&sql)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| wrap_error("", e.to_string()))?;
            }
        }
        Ok(Box::new(SqlTransaction {
            tx: Mutex::new(Some(tx)),
        }))
    }
}

struct SqlTransaction {
    tx: Mutex<Option<sqlx::Transaction<'static, sqlx::Any>>>,
}

impl SqlTransaction {
    fn take(&mut self) -> OrmResult<sqlx::Transaction<'static, sqlx::Any>> {
        self.tx
            .get_mut()
            .take()
            .ok_or(OrmError::TransactionFinished)
    }
}

#[async_trait::async_trait]
impl AdapterTransaction for SqlTransaction {
    async fn commit(&mut self) -> OrmResult<()> {
        self.take()?
            .commit()
            .await
            .map_err(|e| wrap_error("", e.to_string()))
    }

    async fn rollback(&mut self) -> OrmResult<()> {
        self.take()?
            .rollback()
            .await
            .map_err(|e| wrap_error("", e.to_string()))
    }

    async fn execute(&mut self, sql: &str, params: &[JsonValue]) -> OrmResult<u64> {
        let tx = self
            .tx
            .get_mut()
            .as_mut()
            .ok_or(OrmError::TransactionFinished)?;
        let result = bind_params(sqlx::query(sql), params)
            .execute(&mut **tx)
            .await
            .map_err(|e| wrap_error("", e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn fetch(&mut self, sql: &str, params: &[JsonValue]) -> OrmResult<Vec<JsonValue>> {
        let tx = self
            .tx
            .get_mut()
            .as_mut()
            .ok_or(OrmError::TransactionFinished)?;
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| wrap_error("", e.to_string()))?;
        Ok(rows.iter().map(row_to_json).collect())
    }
}
