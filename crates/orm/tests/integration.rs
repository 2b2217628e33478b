//! End-to-end behavior over the in-process backends

use std::sync::Arc;

use serde_json::json;
use strata_orm::backends::{DocumentAdapter, KvAdapter};
use strata_orm::{
    AssociationOptions, ColumnSchema, ColumnType, Connection, IntegrityPolicy, OrmError,
};

fn document_connection() -> Connection {
    Connection::from_adapter(Arc::new(DocumentAdapter::new()))
}

fn kv_connection() -> Connection {
    Connection::from_adapter(Arc::new(KvAdapter::new()))
}

fn define_people(conn: &Connection) {
    conn.define("Person", "people", |m| {
        m.column("name", ColumnType::String(None));
        m.column("age", ColumnType::Integer);
        m.column("price", ColumnType::Number);
        m.index(&["age"]);
    })
    .unwrap();
}

async fn seed_people(conn: &Connection) {
    for (name, age, price) in [("a", 10, 10.0), ("b", 20, 20.0), ("c", 30, 5.0)] {
        conn.create("Person", &json!({"name": name, "age": age, "price": price}))
            .await
            .unwrap();
    }
}

fn define_blog(conn: &Connection, policy: IntegrityPolicy) {
    conn.define("User", "users", |m| {
        m.column("name", ColumnType::String(None));
        m.has_many("posts", AssociationOptions::integrity(policy));
    })
    .unwrap();
    conn.define("Post", "posts", |m| {
        m.column("body", ColumnType::Text);
        m.has_many("comments", AssociationOptions::integrity(policy));
    })
    .unwrap();
    conn.define("Comment", "comments", |m| {
        m.column("body", ColumnType::Text);
    })
    .unwrap();
}

#[tokio::test]
async fn integer_comparisons_clamp_out_of_range_literals() {
    let conn = document_connection();
    define_people(&conn);
    seed_people(&conn).await;
    // The literal exceeds the integer column range and clamps to the
    // maximum, so nothing can exceed it
    let rows = conn
        .query("Person")
        .unwrap()
        .filter(json!({"age": {"$gt": 9_999_999_999i64}}))
        .exec()
        .await
        .unwrap();
    assert!(rows.is_empty());
    let rows = conn
        .query("Person")
        .unwrap()
        .filter(json!({"age": {"$lt": 9_999_999_999i64}}))
        .exec()
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn empty_in_matches_nothing_without_error() {
    for conn in [document_connection(), kv_connection()] {
        define_people(&conn);
        seed_people(&conn).await;
        let rows = conn
            .query("Person")
            .unwrap()
            .filter(json!({"age": {"$in": []}}))
            .exec()
            .await
            .unwrap();
        assert!(rows.is_empty());
        let rows = conn
            .query("Person")
            .unwrap()
            .filter(json!({"age": []}))
            .exec()
            .await
            .unwrap();
        assert!(rows.is_empty());
    }
}

#[tokio::test]
async fn unknown_columns_and_operators_fail_fast() {
    let conn = document_connection();
    define_people(&conn);
    let err = conn
        .query("Person")
        .unwrap()
        .filter(json!({"height": 1}))
        .exec()
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::UnknownColumn(c) if c == "height"));
    let err = conn
        .query("Person")
        .unwrap()
        .filter(json!({"age": {"$within": 5}}))
        .exec()
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::UnknownOperator(o) if o == "$within"));
}

#[tokio::test]
async fn reconcile_round_trip_settles() {
    let conn = document_connection();
    define_people(&conn);
    let before = conn.diff_schemas().await.unwrap();
    assert!(before.iter().any(|c| !c.ignorable));
    let applied = conn.apply_schemas().await.unwrap();
    assert!(applied > 0);
    let after = conn.diff_schemas().await.unwrap();
    assert!(after.iter().all(|c| c.ignorable), "plan not settled: {after:?}");
}

#[tokio::test]
async fn concurrent_apply_is_single_flight() {
    let conn = document_connection();
    define_people(&conn);
    let plan_size = conn
        .diff_schemas()
        .await
        .unwrap()
        .iter()
        .filter(|c| !c.ignorable)
        .count() as u64;
    assert!(plan_size > 0);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let conn = conn.clone();
        handles.push(tokio::spawn(async move { conn.apply_schemas().await }));
    }
    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap().unwrap();
    }
    // Exactly one caller executed the plan; the rest coalesced
    assert_eq!(total, plan_size);
}

#[tokio::test]
async fn restrict_policy_blocks_delete_while_dependents_exist() {
    let conn = document_connection();
    define_blog(&conn, IntegrityPolicy::Restrict);
    let user = conn.create("User", &json!({"name": "ada"})).await.unwrap();
    conn.create("Post", &json!({"body": "p", "user_id": user["id"]}))
        .await
        .unwrap();
    let err = conn
        .query("User")
        .unwrap()
        .filter(json!({"id": user["id"]}))
        .delete()
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::IntegrityViolation(m) if m == "Post"));
    assert_eq!(conn.query("User").unwrap().count().await.unwrap(), 1);
    // With the dependent gone the delete proceeds
    conn.query("Post").unwrap().delete().await.unwrap();
    conn.query("User").unwrap().delete().await.unwrap();
    assert_eq!(conn.query("User").unwrap().count().await.unwrap(), 0);
}

#[tokio::test]
async fn nullify_policy_clears_foreign_keys() {
    let conn = document_connection();
    define_blog(&conn, IntegrityPolicy::Nullify);
    let user = conn.create("User", &json!({"name": "ada"})).await.unwrap();
    conn.create("Post", &json!({"body": "p", "user_id": user["id"]}))
        .await
        .unwrap();
    conn.query("User").unwrap().delete().await.unwrap();
    let posts = conn.query("Post").unwrap().exec().await.unwrap();
    assert_eq!(posts.len(), 1);
    assert!(posts[0]["user_id"].is_null());
}

#[tokio::test]
async fn delete_policy_cascades_to_grandchildren() {
    let conn = document_connection();
    define_blog(&conn, IntegrityPolicy::Delete);
    let user = conn.create("User", &json!({"name": "ada"})).await.unwrap();
    let post = conn
        .create("Post", &json!({"body": "p", "user_id": user["id"]}))
        .await
        .unwrap();
    conn.create("Comment", &json!({"body": "c", "post_id": post["id"]}))
        .await
        .unwrap();
    // An unrelated comment survives the cascade
    conn.create("Comment", &json!({"body": "stray"})).await.unwrap();
    conn.query("User")
        .unwrap()
        .filter(json!({"id": user["id"]}))
        .delete()
        .await
        .unwrap();
    assert_eq!(conn.query("Post").unwrap().count().await.unwrap(), 0);
    let comments = conn.query("Comment").unwrap().exec().await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0]["body"], json!("stray"));
}

#[tokio::test]
async fn finished_transactions_reject_every_operation() {
    let conn = document_connection();
    define_people(&conn);
    let mut tx = conn.transaction(None).await.unwrap();
    tx.commit().await.unwrap();
    assert!(matches!(
        tx.commit().await.unwrap_err(),
        OrmError::TransactionFinished
    ));
    assert!(matches!(
        tx.rollback().await.unwrap_err(),
        OrmError::TransactionFinished
    ));
    let mut tx = conn.transaction(None).await.unwrap();
    tx.rollback().await.unwrap();
    assert!(matches!(
        tx.execute("SELECT 1", &[]).await.unwrap_err(),
        OrmError::TransactionFinished
    ));
}

#[tokio::test]
async fn rollback_discards_writes() {
    let conn = document_connection();
    define_people(&conn);
    seed_people(&conn).await;
    let mut tx = conn.transaction(None).await.unwrap();
    conn.query("Person").unwrap().delete().await.unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(conn.query("Person").unwrap().count().await.unwrap(), 3);
}

#[tokio::test]
async fn implicit_group_counts_and_sums() {
    for conn in [document_connection(), kv_connection()] {
        define_people(&conn);
        seed_people(&conn).await;
        let rows = conn
            .query("Person")
            .unwrap()
            .group(None, &json!({"count": {"$sum": 1}, "total": {"$sum": "$price"}}))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["count"], json!(3));
        assert_eq!(rows[0]["total"], json!(35.0));
    }
}

#[tokio::test]
async fn inconsistency_scan_lists_orphans_once() {
    let conn = document_connection();
    define_blog(&conn, IntegrityPolicy::Ignore);
    let user = conn.create("User", &json!({"name": "ada"})).await.unwrap();
    let kept = conn
        .create("Post", &json!({"body": "ok", "user_id": user["id"]}))
        .await
        .unwrap();
    let orphan = conn
        .create("Post", &json!({"body": "orphan", "user_id": 999}))
        .await
        .unwrap();
    let report = conn.get_inconsistencies().await.unwrap();
    let posts = report.get("Post").unwrap();
    assert_eq!(posts, &vec![orphan["id"].clone()]);
    assert!(!posts.contains(&kept["id"]));
    assert!(!report.contains_key("User"));
}

#[tokio::test]
async fn inconsistency_scan_covers_belongs_to_only_edges() {
    let conn = document_connection();
    conn.define("User", "users", |m| {
        m.column("name", ColumnType::String(None));
    })
    .unwrap();
    // Only the child side declares the edge; the scan must still walk it
    conn.define("Post", "posts", |m| {
        m.column("body", ColumnType::Text);
        m.belongs_to("user", AssociationOptions::default());
    })
    .unwrap();
    let orphan = conn
        .create("Post", &json!({"body": "dangling", "user_id": 42}))
        .await
        .unwrap();
    let report = conn.get_inconsistencies().await.unwrap();
    assert_eq!(report.get("Post").unwrap(), &vec![orphan["id"].clone()]);
    assert!(!report.contains_key("User"));
}

#[tokio::test]
async fn duplicate_unique_values_are_rejected() {
    let conn = document_connection();
    conn.define("Account", "accounts", |m| {
        m.column_schema(ColumnSchema::new("email", ColumnType::String(None)).unique());
    })
    .unwrap();
    conn.create("Account", &json!({"email": "a@example.com"}))
        .await
        .unwrap();
    let err = conn
        .create("Account", &json!({"email": "a@example.com"}))
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::DuplicateKey(_)));
}

#[tokio::test]
async fn kv_backend_matches_document_semantics_for_crud() {
    let conn = kv_connection();
    define_people(&conn);
    seed_people(&conn).await;
    let rows = conn
        .query("Person")
        .unwrap()
        .filter(json!({"age": {"$gte": 20}}))
        .order("-age")
        .exec()
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["age"], json!(30));
    let affected = conn
        .query("Person")
        .unwrap()
        .filter(json!({"name": "a"}))
        .update(&json!({"age": 11}))
        .await
        .unwrap();
    assert_eq!(affected, 1);
    let one = conn
        .query("Person")
        .unwrap()
        .filter(json!({"name": "a"}))
        .one()
        .await
        .unwrap();
    assert_eq!(one["age"], json!(11));
}

#[tokio::test]
async fn sqlite_memory_url_connects_end_to_end() {
    let conn = Connection::connect("sqlite::memory:").await.unwrap();
    conn.define("Person", "people", |m| {
        m.column("name", ColumnType::String(None));
    })
    .unwrap();
    conn.apply_schemas().await.unwrap();
    let created = conn
        .create("Person", &json!({"name": "ada"}))
        .await
        .unwrap();
    assert_eq!(created["name"], json!("ada"));
    assert!(created["id"].is_number());
}
