use claystore_core::db::migrations::{current_user_version, latest_version};
use claystore_core::db::{
    open_store, open_store_in_memory, ConnectOptions, Connection, Driver, DriverError,
    SqliteDriver, TableOptions,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn connect_options() -> ConnectOptions {
    ConnectOptions {
        host: "localhost".to_string(),
        port: 28015,
        auth_key: None,
        database: "test".to_string(),
    }
}

fn doc(value: Value) -> claystore_core::Document {
    value.as_object().cloned().unwrap()
}

async fn store_with_table() -> Arc<dyn Connection> {
    let conn = SqliteDriver::in_memory()
        .connect(&connect_options())
        .await
        .unwrap();
    conn.db_create("test").await.unwrap();
    conn.table_create("test", "things", &TableOptions {
        primary_key: "id".to_string(),
        ..TableOptions::default()
    })
    .await
    .unwrap();
    conn
}

#[test]
fn in_memory_store_is_fully_migrated() {
    let conn = open_store_in_memory().unwrap();
    assert_eq!(current_user_version(&conn).unwrap(), latest_version());

    let tables: Vec<String> = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'cs_%' ORDER BY name;")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        tables,
        vec!["cs_databases", "cs_documents", "cs_indexes", "cs_tables"]
    );

    let columns: Vec<String> = conn
        .prepare("SELECT name FROM pragma_table_info('cs_documents') ORDER BY cid;")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(columns, vec!["db", "tbl", "doc_key", "body"]);
}

#[test]
fn reopening_a_store_file_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    drop(open_store(&path).unwrap());
    let conn = open_store(&path).unwrap();
    assert_eq!(current_user_version(&conn).unwrap(), latest_version());
}

#[test]
fn newer_catalog_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(&format!("PRAGMA user_version = {};", latest_version() + 1))
            .unwrap();
    }

    let err = open_store(&path).unwrap_err();
    assert!(matches!(
        err,
        DriverError::UnsupportedCatalogVersion { store_version, latest_supported }
            if store_version == latest_version() + 1 && latest_supported == latest_version()
    ));
}

#[tokio::test]
async fn missing_catalog_objects_are_typed_errors() {
    let conn = SqliteDriver::in_memory()
        .connect(&connect_options())
        .await
        .unwrap();

    assert!(matches!(
        conn.table_list("nope").await,
        Err(DriverError::DatabaseNotFound(ref name)) if name == "nope"
    ));

    conn.db_create("test").await.unwrap();
    assert!(matches!(
        conn.get("test", "things", "1").await,
        Err(DriverError::TableNotFound { ref table, .. }) if table == "things"
    ));

    let conn = store_with_table().await;
    assert!(matches!(
        conn.get_all_by_index("test", "things", "color", &json!("red")).await,
        Err(DriverError::IndexNotFound { ref index, .. }) if index == "color"
    ));
}

#[tokio::test]
async fn duplicate_catalog_creates_report_already_exists() {
    let conn = store_with_table().await;

    assert!(matches!(
        conn.db_create("test").await,
        Err(DriverError::AlreadyExists(_))
    ));
    assert!(matches!(
        conn.table_create("test", "things", &TableOptions::default()).await,
        Err(DriverError::InvalidDocument(_))
    ));
    assert!(matches!(
        conn.table_create("test", "things", &TableOptions {
            primary_key: "id".to_string(),
            ..TableOptions::default()
        })
        .await,
        Err(DriverError::AlreadyExists(_))
    ));

    conn.index_create("test", "things", "color").await.unwrap();
    assert!(matches!(
        conn.index_create("test", "things", "color").await,
        Err(DriverError::AlreadyExists(_))
    ));
    assert_eq!(
        conn.index_list("test", "things").await.unwrap(),
        vec!["color".to_string()]
    );
}

#[tokio::test]
async fn invalid_identifiers_are_rejected() {
    let conn = SqliteDriver::in_memory()
        .connect(&connect_options())
        .await
        .unwrap();

    assert!(matches!(
        conn.db_create("bad name").await,
        Err(DriverError::InvalidIdentifier(_))
    ));
    conn.db_create("test").await.unwrap();
    assert!(matches!(
        conn.order_by("test", "things", "x'); DROP TABLE cs_documents; --").await,
        Err(DriverError::InvalidIdentifier(_))
    ));
}

#[tokio::test]
async fn insert_without_key_generates_one() {
    let conn = store_with_table().await;

    let result = conn
        .insert("test", "things", doc(json!({"color": "red"})))
        .await
        .unwrap();
    assert_eq!(result.inserted, 1);
    assert_eq!(result.generated_keys.len(), 1);

    let stored = conn
        .get("test", "things", &result.generated_keys[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored["id"], json!(result.generated_keys[0]));
}

#[tokio::test]
async fn duplicate_insert_is_reported_in_write_result() {
    let conn = store_with_table().await;
    conn.insert("test", "things", doc(json!({"id": "1"})))
        .await
        .unwrap();

    let result = conn
        .insert("test", "things", doc(json!({"id": "1", "color": "blue"})))
        .await
        .unwrap();
    assert!(result.has_errors());
    assert_eq!(result.inserted, 0);
    assert!(result.first_error.unwrap().contains("Duplicate primary key"));

    let stored = conn.get("test", "things", "1").await.unwrap().unwrap();
    assert!(!stored.contains_key("color"));
}

#[tokio::test]
async fn index_lookup_distinguishes_json_types() {
    let conn = store_with_table().await;
    conn.index_create("test", "things", "flag").await.unwrap();
    for (id, flag) in [("a", json!(true)), ("b", json!(1)), ("c", json!("1")), ("d", json!(1.0))] {
        conn.insert("test", "things", doc(json!({"id": id, "flag": flag})))
            .await
            .unwrap();
    }

    let ids = |docs: Vec<claystore_core::Document>| {
        let mut ids: Vec<String> = docs
            .into_iter()
            .map(|doc| doc["id"].as_str().unwrap().to_string())
            .collect();
        ids.sort();
        ids
    };

    let truthy = conn
        .get_all_by_index("test", "things", "flag", &json!(true))
        .await
        .unwrap();
    assert_eq!(ids(truthy), vec!["a"]);

    let numeric = conn
        .get_all_by_index("test", "things", "flag", &json!(1))
        .await
        .unwrap();
    assert_eq!(ids(numeric), vec!["b", "d"]);

    let text = conn
        .get_all_by_index("test", "things", "flag", &json!("1"))
        .await
        .unwrap();
    assert_eq!(ids(text), vec!["c"]);
}

#[tokio::test]
async fn tables_are_isolated_from_each_other() {
    let conn = store_with_table().await;
    conn.table_create("test", "others", &TableOptions {
        primary_key: "id".to_string(),
        ..TableOptions::default()
    })
    .await
    .unwrap();

    conn.insert("test", "things", doc(json!({"id": "1"})))
        .await
        .unwrap();
    assert!(conn.get("test", "others", "1").await.unwrap().is_none());
    assert_eq!(conn.order_by("test", "others", "id").await.unwrap().len(), 0);
}

#[tokio::test]
async fn delete_all_counts_deleted_and_skipped() {
    let conn = store_with_table().await;
    for id in ["1", "2", "3"] {
        conn.insert("test", "things", doc(json!({ "id": id })))
            .await
            .unwrap();
    }

    let keys = vec!["1".to_string(), "3".to_string(), "3".to_string(), "9".to_string()];
    let result = conn.delete_all("test", "things", &keys).await.unwrap();
    assert_eq!(result.deleted, 2);
    assert_eq!(result.skipped, 1);

    let remaining = conn.order_by("test", "things", "id").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0]["id"], json!("2"));
}

#[tokio::test]
async fn closed_connection_rejects_operations() {
    let conn = store_with_table().await;
    conn.close().await.unwrap();
    conn.close().await.unwrap();

    assert!(matches!(conn.db_list().await, Err(DriverError::Closed)));
    assert!(matches!(
        conn.get("test", "things", "1").await,
        Err(DriverError::Closed)
    ));
}

#[tokio::test]
async fn in_memory_stores_are_private_per_connection() {
    let driver = SqliteDriver::in_memory();
    let first = driver.connect(&connect_options()).await.unwrap();
    let second = driver.connect(&connect_options()).await.unwrap();

    first.db_create("test").await.unwrap();
    assert_eq!(first.db_list().await.unwrap(), vec!["test".to_string()]);
    assert!(second.db_list().await.unwrap().is_empty());
}
