//! Batch data manipulation
//!
//! Runs an ordered list of directives against a connection. Creates may
//! carry a logical id under `id`; later directives can reference it and the
//! placeholder resolves to the real record id.
//!
//! Supported directives:
//! - `"deleteAll"` or `{"deleteAll": ...}` clears every model
//! - `"dropAll"` drops every table
//! - `{"create_<model>": {..data..}}` inserts one record
//! - `{"delete_<model>": {..conditions..}}` deletes matching records
//! - `{"find_<model>": {..conditions..}}` fetches records into the result
//!   map under the directive key
//! - `{"drop_<model>": ..}` drops one model's table

use std::collections::HashMap;

use serde_json::{Map, Value as JsonValue};

use crate::connection::Connection;
use crate::error::{OrmError, OrmResult};
use crate::relationships::resolve::camelize;

/// Execute directives in order; returns created records keyed by their
/// logical id
pub async fn run(
    conn: &Connection,
    directives: &[JsonValue],
) -> OrmResult<HashMap<String, JsonValue>> {
    let mut created: HashMap<String, JsonValue> = HashMap::new();
    for directive in directives {
        match directive {
            JsonValue::String(command) => run_command(conn, command).await?,
            JsonValue::Object(map) if map.len() == 1 => {
                // Single-key object; the key is the command
                let (key, value) = map
                    .iter()
                    .next()
                    .ok_or_else(|| OrmError::UnknownCommand(directive.to_string()))?;
                run_keyed(conn, key, value, &mut created).await?;
            }
            other => return Err(OrmError::UnknownCommand(other.to_string())),
        }
    }
    Ok(created)
}

async fn run_command(conn: &Connection, command: &str) -> OrmResult<()> {
    match command {
        "deleteAll" => {
            conn.delete_all().await?;
            Ok(())
        }
        "dropAll" => conn.drop_all().await,
        other => Err(OrmError::UnknownCommand(other.to_string())),
    }
}

async fn run_keyed(
    conn: &Connection,
    key: &str,
    value: &JsonValue,
    created: &mut HashMap<String, JsonValue>,
) -> OrmResult<()> {
    if key == "deleteAll" || key == "dropAll" {
        return run_command(conn, key).await;
    }
    if let Some(model) = key.strip_prefix("create_") {
        let model = camelize(model);
        let (logical_id, data) = split_logical_id(value);
        let data = substitute(&data, created);
        let record = conn.create(&model, &data).await?;
        if let Some(logical_id) = logical_id {
            created.insert(logical_id, record);
        }
        return Ok(());
    }
    if let Some(model) = key.strip_prefix("delete_") {
        let model = camelize(model);
        let conditions = substitute(value, created);
        conn.query(&model)?.filter(conditions).delete().await?;
        return Ok(());
    }
    if let Some(model) = key.strip_prefix("find_") {
        let model = camelize(model);
        let conditions = substitute(value, created);
        let rows = conn.query(&model)?.filter(conditions).exec().await?;
        created.insert(key.to_string(), JsonValue::Array(rows));
        return Ok(());
    }
    if let Some(model) = key.strip_prefix("drop_") {
        let model = camelize(model);
        let schema = conn.model(&model)?;
        conn.adapter().drop_table(&schema).await?;
        return Ok(());
    }
    Err(OrmError::UnknownCommand(key.to_string()))
}

/// Pull a string `id` out of create data; it is a logical placeholder, not
/// a column value
fn split_logical_id(data: &JsonValue) -> (Option<String>, JsonValue) {
    let JsonValue::Object(map) = data else {
        return (None, data.clone());
    };
    let mut out = Map::new();
    let mut logical_id = None;
    for (key, value) in map {
        if key == "id" {
            if let JsonValue::String(name) = value {
                logical_id = Some(name.clone());
                continue;
            }
        }
        out.insert(key.clone(), value.clone());
    }
    (logical_id, JsonValue::Object(out))
}

/// Replace string values that name an earlier create's logical id with the
/// real record id
fn substitute(value: &JsonValue, created: &HashMap<String, JsonValue>) -> JsonValue {
    match value {
        JsonValue::String(s) => match created.get(s).and_then(|record| record.get("id")) {
            Some(id) => id.clone(),
            None => value.clone(),
        },
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|v| substitute(v, created)).collect())
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, created)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::DocumentAdapter;
    use crate::schema::{AssociationOptions, ColumnType};
    use serde_json::json;
    use std::sync::Arc;

    async fn blog() -> Connection {
        let conn = Connection::from_adapter(Arc::new(DocumentAdapter::new()));
        conn.define("User", "users", |m| {
            m.column("name", ColumnType::String(None));
            m.has_many("posts", AssociationOptions::default());
        })
        .unwrap();
        conn.define("Post", "posts", |m| {
            m.column("body", ColumnType::Text);
            m.belongs_to("user", AssociationOptions::default());
        })
        .unwrap();
        conn
    }

    #[tokio::test]
    async fn creates_resolve_logical_ids() {
        let conn = blog().await;
        let created = conn
            .manipulate(&[
                json!({"create_user": {"id": "ada", "name": "Ada"}}),
                json!({"create_post": {"body": "hello", "user_id": "ada"}}),
            ])
            .await
            .unwrap();
        let ada_id = created["ada"]["id"].clone();
        let posts = conn.query("Post").unwrap().exec().await.unwrap();
        assert_eq!(posts[0]["user_id"], ada_id);
    }

    #[tokio::test]
    async fn delete_all_and_unknown_command() {
        let conn = blog().await;
        conn.create("User", &json!({"name": "Ada"})).await.unwrap();
        conn.manipulate(&[json!("deleteAll")]).await.unwrap();
        assert_eq!(conn.query("User").unwrap().count().await.unwrap(), 0);
        let err = conn
            .manipulate(&[json!({"explode_user": {}})])
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::UnknownCommand(c) if c == "explode_user"));
    }

    #[tokio::test]
    async fn delete_directive_filters() {
        let conn = blog().await;
        conn.create("User", &json!({"name": "Ada"})).await.unwrap();
        conn.create("User", &json!({"name": "Bob"})).await.unwrap();
        conn.manipulate(&[json!({"delete_user": {"name": "Bob"}})])
            .await
            .unwrap();
        let rows = conn.query("User").unwrap().exec().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("Ada"));
    }
}
