//! Relation access from a fetched record
//!
//! A handle is created per association alias. Fetches are memoized in a
//! cache shared by every handle of the same record, so repeated access does
//! not re-query; `fetch_reload` bypasses and refreshes the cache.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;

use crate::backends::QueryOptions;
use crate::connection::Connection;
use crate::error::{OrmError, OrmResult};

use super::{Association, AssociationType};

/// A record's view onto one of its associations
pub struct RelationHandle {
    conn: Connection,
    association: Association,
    owner: JsonValue,
    cache: Arc<Mutex<HashMap<String, Vec<JsonValue>>>>,
}

impl RelationHandle {
    pub(crate) fn new(
        conn: Connection,
        association: Association,
        owner: JsonValue,
        cache: Arc<Mutex<HashMap<String, Vec<JsonValue>>>>,
    ) -> Self {
        Self {
            conn,
            association,
            owner,
            cache,
        }
    }

    pub fn association(&self) -> &Association {
        &self.association
    }

    /// Fetch the related records, serving from the cache when warm
    pub async fn fetch(&self) -> OrmResult<Vec<JsonValue>> {
        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&self.association.alias) {
                return Ok(cached.clone());
            }
        }
        self.fetch_reload().await
    }

    /// Fetch fresh from the backend and refresh the cache
    pub async fn fetch_reload(&self) -> OrmResult<Vec<JsonValue>> {
        let rows = self.load().await?;
        let mut cache = self.cache.lock().await;
        cache.insert(self.association.alias.clone(), rows.clone());
        Ok(rows)
    }

    /// The single related record, for has-one and belongs-to edges
    pub async fn one(&self) -> OrmResult<Option<JsonValue>> {
        Ok(self.fetch().await?.into_iter().next())
    }

    /// Create a related record with its foreign key pointing at the owner.
    /// Only the owning side of has-many/has-one can build.
    pub async fn build(&self, data: &JsonValue) -> OrmResult<JsonValue> {
        if self.association.association_type == AssociationType::BelongsTo {
            return Err(OrmError::backend_message(
                "belongs-to relations cannot build records",
            ));
        }
        let owner_id = self
            .owner
            .get("id")
            .cloned()
            .ok_or_else(|| OrmError::NotFound(self.association.source_model.clone()))?;
        let mut seeded = data.clone();
        if let JsonValue::Object(map) = &mut seeded {
            map.insert(self.association.foreign_key.clone(), owner_id);
        }
        let created = self
            .conn
            .create(&self.association.target_model, &seeded)
            .await?;
        // The cache no longer reflects the backend
        self.cache.lock().await.remove(&self.association.alias);
        Ok(created)
    }

    async fn load(&self) -> OrmResult<Vec<JsonValue>> {
        match self.association.association_type {
            AssociationType::HasMany | AssociationType::HasOne => {
                let owner_id = match self.owner.get("id") {
                    Some(id) if !id.is_null() => id.clone(),
                    _ => return Ok(Vec::new()),
                };
                let fk = self.association.foreign_key.as_str();
                let limit = match self.association.association_type {
                    AssociationType::HasOne => Some(1),
                    _ => None,
                };
                let schema = self.conn.model(&self.association.target_model)?;
                let rows = self
                    .conn
                    .read_adapter()
                    .find(
                        &schema,
                        &QueryOptions {
                            conditions: Some(json!({ fk: owner_id })),
                            limit,
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(rows
                    .into_iter()
                    .map(|row| crate::connection::to_logical(&schema, row))
                    .collect())
            }
            AssociationType::BelongsTo => {
                let fk_value = match self.owner.get(&self.association.foreign_key) {
                    Some(value) if !value.is_null() => value.clone(),
                    _ => return Ok(Vec::new()),
                };
                match self.conn.get(&self.association.target_model, &fk_value).await {
                    Ok(record) => Ok(vec![record]),
                    Err(OrmError::NotFound(_)) => Ok(Vec::new()),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::DocumentAdapter;
    use crate::relationships::IntegrityPolicy;
    use crate::schema::{AssociationOptions, ColumnType};
    use serde_json::json;

    async fn blog() -> Connection {
        let conn = Connection::from_adapter(Arc::new(DocumentAdapter::new()));
        conn.define("User", "users", |m| {
            m.column("name", ColumnType::String(None));
            m.has_many("posts", AssociationOptions::integrity(IntegrityPolicy::Ignore));
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
    async fn has_many_fetches_and_builds() {
        let conn = blog().await;
        let user = conn.create("User", &json!({"name": "ada"})).await.unwrap();
        conn.create("Post", &json!({"body": "one", "user_id": user["id"]}))
            .await
            .unwrap();
        let instances = conn.query("User").unwrap().instances().await.unwrap();
        let handle = instances[0].relation("posts").unwrap();
        assert_eq!(handle.fetch().await.unwrap().len(), 1);
        handle.build(&json!({"body": "two"})).await.unwrap();
        assert_eq!(handle.fetch().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn belongs_to_resolves_owner() {
        let conn = blog().await;
        let user = conn.create("User", &json!({"name": "ada"})).await.unwrap();
        conn.create("Post", &json!({"body": "one", "user_id": user["id"]}))
            .await
            .unwrap();
        let posts = conn.query("Post").unwrap().instances().await.unwrap();
        let owner = posts[0].relation("user").unwrap().one().await.unwrap();
        assert_eq!(owner.unwrap()["name"], json!("ada"));
    }

    #[tokio::test]
    async fn fetch_is_memoized_until_reload() {
        let conn = blog().await;
        let user = conn.create("User", &json!({"name": "ada"})).await.unwrap();
        let instances = conn.query("User").unwrap().instances().await.unwrap();
        let handle = instances[0].relation("posts").unwrap();
        assert!(handle.fetch().await.unwrap().is_empty());
        conn.create("Post", &json!({"body": "late", "user_id": user["id"]}))
            .await
            .unwrap();
        // Cached answer survives the write
        assert!(handle.fetch().await.unwrap().is_empty());
        assert_eq!(handle.fetch_reload().await.unwrap().len(), 1);
    }
}
