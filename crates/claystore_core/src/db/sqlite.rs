//! Embedded document store on SQLite.
//!
//! # Responsibility
//! - Implement `Driver`/`Connection` over one SQLite file (or memory).
//! - Keep the catalog of databases, tables and indexes alongside documents.
//!
//! # Invariants
//! - Every call runs on the blocking pool; the SQLite handle is never used
//!   from two threads at once.
//! - Missing databases, tables and indexes are reported as typed errors, not
//!   as empty results.
//! - Duplicate-key inserts and primary-key changes surface in `WriteResult`,
//!   never as transport errors.

use super::open::{open_store, open_store_in_memory};
use super::{
    is_valid_identifier, ConnectOptions, Connection, Driver, DriverError, DriverResult,
    TableOptions, WriteResult,
};
use crate::model::Document;
use async_trait::async_trait;
use log::{debug, info, warn};
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use uuid::Uuid;

/// Keeps `IN (...)` lists well below SQLite's bound-parameter limit.
const KEY_CHUNK_SIZE: usize = 500;

/// Where the embedded store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// Private to one connection; gone once that connection closes.
    Memory,
    File(PathBuf),
}

impl Display for StoreLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Driver that opens embedded SQLite stores.
#[derive(Debug, Clone)]
pub struct SqliteDriver {
    location: StoreLocation,
    auth_key: Option<String>,
}

impl SqliteDriver {
    pub fn in_memory() -> Self {
        Self {
            location: StoreLocation::Memory,
            auth_key: None,
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            location: StoreLocation::File(path.into()),
            auth_key: None,
        }
    }

    /// Requires connects to present exactly this auth key.
    pub fn with_auth_key(mut self, auth_key: impl Into<String>) -> Self {
        self.auth_key = Some(auth_key.into());
        self
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    async fn connect(&self, options: &ConnectOptions) -> DriverResult<Arc<dyn Connection>> {
        if let Some(expected) = &self.auth_key {
            if options.auth_key.as_deref() != Some(expected.as_str()) {
                warn!(
                    "event=connect module=db status=error host={} port={} error_code=auth_failed",
                    options.host, options.port
                );
                return Err(DriverError::AuthenticationFailed);
            }
        }

        let location = self.location.clone();
        let conn = tokio::task::spawn_blocking(move || match location {
            StoreLocation::Memory => open_store_in_memory(),
            StoreLocation::File(path) => open_store(path),
        })
        .await
        .map_err(|err| DriverError::Task(err.to_string()))??;

        let connection = SqliteConnection::new(conn);
        info!(
            "event=connect module=db status=ok connection_id={} host={} port={} location={}",
            connection.id(),
            options.host,
            options.port,
            self.location
        );
        Ok(Arc::new(connection))
    }
}

/// One open embedded store.
pub struct SqliteConnection {
    id: Uuid,
    inner: Arc<Mutex<Option<rusqlite::Connection>>>,
}

impl SqliteConnection {
    fn new(conn: rusqlite::Connection) -> Self {
        Self {
            id: Uuid::new_v4(),
            inner: Arc::new(Mutex::new(Some(conn))),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    async fn run<T, F>(&self, op: &'static str, work: F) -> DriverResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> DriverResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let started_at = Instant::now();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = lock(&inner)?;
            let conn = guard.as_mut().ok_or(DriverError::Closed)?;
            work(conn)
        })
        .await
        .map_err(|err| DriverError::Task(err.to_string()))
        .and_then(|result| result);

        match &result {
            Ok(_) => debug!(
                "event=query module=db status=ok op={op} connection_id={} duration_ms={}",
                self.id,
                started_at.elapsed().as_millis()
            ),
            Err(err) => debug!(
                "event=query module=db status=error op={op} connection_id={} duration_ms={} error={}",
                self.id,
                started_at.elapsed().as_millis(),
                err
            ),
        }
        result
    }
}

fn lock(
    inner: &Mutex<Option<rusqlite::Connection>>,
) -> DriverResult<MutexGuard<'_, Option<rusqlite::Connection>>> {
    inner
        .lock()
        .map_err(|_| DriverError::Task("connection lock poisoned".to_string()))
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn db_list(&self) -> DriverResult<Vec<String>> {
        self.run("db_list", |conn| {
            let mut stmt = conn.prepare("SELECT name FROM cs_databases ORDER BY name ASC;")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn db_create(&self, database: &str) -> DriverResult<()> {
        check_identifier(database)?;
        let db = database.to_string();
        self.run("db_create", move |conn| {
            let changed = conn.execute(
                "INSERT INTO cs_databases (name) VALUES (?1) ON CONFLICT (name) DO NOTHING;",
                [db.as_str()],
            )?;
            if changed == 0 {
                return Err(DriverError::AlreadyExists(format!("database `{db}`")));
            }
            Ok(())
        })
        .await
    }

    async fn table_list(&self, database: &str) -> DriverResult<Vec<String>> {
        let db = database.to_string();
        self.run("table_list", move |conn| {
            require_database(conn, &db)?;
            let mut stmt =
                conn.prepare("SELECT name FROM cs_tables WHERE db = ?1 ORDER BY name ASC;")?;
            let names = stmt
                .query_map([db.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn table_create(
        &self,
        database: &str,
        table: &str,
        options: &TableOptions,
    ) -> DriverResult<()> {
        check_identifier(table)?;
        if options.primary_key.is_empty() {
            return Err(DriverError::InvalidDocument(
                "table primary key field cannot be empty".to_string(),
            ));
        }
        let db = database.to_string();
        let tbl = table.to_string();
        let primary_key = options.primary_key.clone();
        let extra = serde_json::to_string(&options.extra)?;
        self.run("table_create", move |conn| {
            require_database(conn, &db)?;
            let changed = conn.execute(
                "INSERT INTO cs_tables (db, name, primary_key, options)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (db, name) DO NOTHING;",
                params![db, tbl, primary_key, extra],
            )?;
            if changed == 0 {
                return Err(DriverError::AlreadyExists(format!("table `{db}.{tbl}`")));
            }
            Ok(())
        })
        .await
    }

    async fn index_list(&self, database: &str, table: &str) -> DriverResult<Vec<String>> {
        let db = database.to_string();
        let tbl = table.to_string();
        self.run("index_list", move |conn| {
            require_table(conn, &db, &tbl)?;
            let mut stmt = conn.prepare(
                "SELECT name FROM cs_indexes WHERE db = ?1 AND tbl = ?2 ORDER BY name ASC;",
            )?;
            let names = stmt
                .query_map(params![db, tbl], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn index_create(&self, database: &str, table: &str, index: &str) -> DriverResult<()> {
        check_identifier(index)?;
        let db = database.to_string();
        let tbl = table.to_string();
        let idx = index.to_string();
        self.run("index_create", move |conn| {
            let tx = conn.transaction()?;
            require_table(&tx, &db, &tbl)?;
            let changed = tx.execute(
                "INSERT INTO cs_indexes (db, tbl, name)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (db, tbl, name) DO NOTHING;",
                params![db, tbl, idx],
            )?;
            if changed == 0 {
                return Err(DriverError::AlreadyExists(format!(
                    "index `{idx}` on table `{tbl}`"
                )));
            }
            // One expression index per field name serves every table.
            tx.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS cs_field_{idx}
                 ON cs_documents (db, tbl, {});",
                field_expr(&idx)
            ))?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get(&self, database: &str, table: &str, key: &str) -> DriverResult<Option<Document>> {
        let db = database.to_string();
        let tbl = table.to_string();
        let key = key.to_string();
        self.run("get", move |conn| {
            require_table(conn, &db, &tbl)?;
            fetch_one(conn, &db, &tbl, &key)
        })
        .await
    }

    async fn get_all(
        &self,
        database: &str,
        table: &str,
        keys: &[String],
    ) -> DriverResult<Vec<Document>> {
        let db = database.to_string();
        let tbl = table.to_string();
        let keys = distinct_keys(keys);
        self.run("get_all", move |conn| {
            require_table(conn, &db, &tbl)?;
            let mut documents = Vec::with_capacity(keys.len());
            for chunk in keys.chunks(KEY_CHUNK_SIZE) {
                let sql = format!(
                    "SELECT body FROM cs_documents
                     WHERE db = ? AND tbl = ? AND doc_key IN ({});",
                    placeholders(chunk.len())
                );
                let bind = [db.as_str(), tbl.as_str()]
                    .into_iter()
                    .chain(chunk.iter().map(String::as_str));
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params_from_iter(bind))?;
                while let Some(row) = rows.next()? {
                    documents.push(parse_body(&row.get::<_, String>(0)?)?);
                }
            }
            Ok(documents)
        })
        .await
    }

    async fn get_all_by_index(
        &self,
        database: &str,
        table: &str,
        index: &str,
        value: &Value,
    ) -> DriverResult<Vec<Document>> {
        let db = database.to_string();
        let tbl = table.to_string();
        let idx = index.to_string();
        let needle = serde_json::to_string(value)?;
        self.run("get_all_by_index", move |conn| {
            require_index(conn, &db, &tbl, &idx)?;
            let expr = field_expr(&idx);
            let kind = field_type_expr(&idx);
            let sql = format!(
                "SELECT body FROM cs_documents
                 WHERE db = ?1 AND tbl = ?2
                   AND {expr} = json_extract(?3, '$')
                   AND (
                        {kind} = json_type(?3, '$')
                        OR ({kind} IN ('integer', 'real') AND json_type(?3, '$') IN ('integer', 'real'))
                   );"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![db, tbl, needle])?;
            let mut documents = Vec::new();
            while let Some(row) = rows.next()? {
                documents.push(parse_body(&row.get::<_, String>(0)?)?);
            }
            Ok(documents)
        })
        .await
    }

    async fn order_by(
        &self,
        database: &str,
        table: &str,
        field: &str,
    ) -> DriverResult<Vec<Document>> {
        check_identifier(field)?;
        let db = database.to_string();
        let tbl = table.to_string();
        let field = field.to_string();
        self.run("order_by", move |conn| {
            require_table(conn, &db, &tbl)?;
            let sql = format!(
                "SELECT body FROM cs_documents
                 WHERE db = ?1 AND tbl = ?2
                 ORDER BY {} ASC, doc_key ASC;",
                field_expr(&field)
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![db, tbl])?;
            let mut documents = Vec::new();
            while let Some(row) = rows.next()? {
                documents.push(parse_body(&row.get::<_, String>(0)?)?);
            }
            Ok(documents)
        })
        .await
    }

    async fn insert(
        &self,
        database: &str,
        table: &str,
        document: Document,
    ) -> DriverResult<WriteResult> {
        let db = database.to_string();
        let tbl = table.to_string();
        self.run("insert", move |conn| {
            let primary_key = require_table(conn, &db, &tbl)?;
            insert_document(conn, &db, &tbl, &primary_key, document)
        })
        .await
    }

    async fn update(
        &self,
        database: &str,
        table: &str,
        key: &str,
        patch: Document,
    ) -> DriverResult<WriteResult> {
        let db = database.to_string();
        let tbl = table.to_string();
        let key = key.to_string();
        self.run("update", move |conn| {
            let tx = conn.transaction()?;
            let primary_key = require_table(&tx, &db, &tbl)?;
            let result = merge_document(&tx, &db, &tbl, &primary_key, &key, patch)?;
            tx.commit()?;
            Ok(result)
        })
        .await
    }

    async fn delete(&self, database: &str, table: &str, key: &str) -> DriverResult<WriteResult> {
        let db = database.to_string();
        let tbl = table.to_string();
        let key = key.to_string();
        self.run("delete", move |conn| {
            require_table(conn, &db, &tbl)?;
            let deleted = conn.execute(
                "DELETE FROM cs_documents WHERE db = ?1 AND tbl = ?2 AND doc_key = ?3;",
                params![db, tbl, key],
            )?;
            Ok(delete_result(1, deleted))
        })
        .await
    }

    async fn delete_all(
        &self,
        database: &str,
        table: &str,
        keys: &[String],
    ) -> DriverResult<WriteResult> {
        let db = database.to_string();
        let tbl = table.to_string();
        let keys = distinct_keys(keys);
        self.run("delete_all", move |conn| {
            let tx = conn.transaction()?;
            require_table(&tx, &db, &tbl)?;
            let mut deleted = 0;
            for chunk in keys.chunks(KEY_CHUNK_SIZE) {
                let sql = format!(
                    "DELETE FROM cs_documents WHERE db = ? AND tbl = ? AND doc_key IN ({});",
                    placeholders(chunk.len())
                );
                let bind = [db.as_str(), tbl.as_str()]
                    .into_iter()
                    .chain(chunk.iter().map(String::as_str));
                deleted += tx.execute(&sql, params_from_iter(bind))?;
            }
            tx.commit()?;
            Ok(delete_result(keys.len(), deleted))
        })
        .await
    }

    async fn close(&self) -> DriverResult<()> {
        let inner = Arc::clone(&self.inner);
        let closed = tokio::task::spawn_blocking(move || -> DriverResult<bool> {
            let mut guard = lock(&inner)?;
            match guard.take() {
                Some(conn) => {
                    conn.close().map_err(|(_, err)| DriverError::Sqlite(err))?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
        .await
        .map_err(|err| DriverError::Task(err.to_string()))??;

        if closed {
            info!(
                "event=disconnect module=db status=ok connection_id={}",
                self.id
            );
        }
        Ok(())
    }
}

fn check_identifier(name: &str) -> DriverResult<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(DriverError::InvalidIdentifier(name.to_string()))
    }
}

fn require_database(conn: &rusqlite::Connection, db: &str) -> DriverResult<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM cs_databases WHERE name = ?1);",
        [db],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(DriverError::DatabaseNotFound(db.to_string()))
    }
}

/// Returns the table's primary key field.
fn require_table(conn: &rusqlite::Connection, db: &str, tbl: &str) -> DriverResult<String> {
    require_database(conn, db)?;
    conn.query_row(
        "SELECT primary_key FROM cs_tables WHERE db = ?1 AND name = ?2;",
        [db, tbl],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .ok_or_else(|| DriverError::TableNotFound {
        database: db.to_string(),
        table: tbl.to_string(),
    })
}

fn require_index(conn: &rusqlite::Connection, db: &str, tbl: &str, idx: &str) -> DriverResult<()> {
    require_table(conn, db, tbl)?;
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM cs_indexes WHERE db = ?1 AND tbl = ?2 AND name = ?3);",
        [db, tbl, idx],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(DriverError::IndexNotFound {
            table: tbl.to_string(),
            index: idx.to_string(),
        })
    }
}

fn fetch_one(
    conn: &rusqlite::Connection,
    db: &str,
    tbl: &str,
    key: &str,
) -> DriverResult<Option<Document>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM cs_documents WHERE db = ?1 AND tbl = ?2 AND doc_key = ?3;",
            [db, tbl, key],
            |row| row.get(0),
        )
        .optional()?;
    body.as_deref().map(parse_body).transpose()
}

fn insert_document(
    conn: &rusqlite::Connection,
    db: &str,
    tbl: &str,
    primary_key: &str,
    mut document: Document,
) -> DriverResult<WriteResult> {
    let mut result = WriteResult::default();
    let key = match document_key(&document, primary_key)? {
        Some(key) => key,
        None => {
            let generated = Uuid::new_v4().to_string();
            document.insert(primary_key.to_string(), Value::String(generated.clone()));
            result.generated_keys.push(generated.clone());
            generated
        }
    };

    let body = serde_json::to_string(&document)?;
    let changed = conn.execute(
        "INSERT INTO cs_documents (db, tbl, doc_key, body)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (db, tbl, doc_key) DO NOTHING;",
        params![db, tbl, key, body],
    )?;
    if changed == 0 {
        return Ok(WriteResult::error(format!(
            "Duplicate primary key `{primary_key}`: {key}"
        )));
    }

    result.inserted = 1;
    Ok(result)
}

fn merge_document(
    conn: &rusqlite::Connection,
    db: &str,
    tbl: &str,
    primary_key: &str,
    key: &str,
    patch: Document,
) -> DriverResult<WriteResult> {
    let Some(mut document) = fetch_one(conn, db, tbl, key)? else {
        return Ok(WriteResult {
            skipped: 1,
            ..WriteResult::default()
        });
    };

    if let Some(new_key) = patch.get(primary_key) {
        if new_key.as_str() != Some(key) {
            return Ok(WriteResult::error(format!(
                "Primary key `{primary_key}` cannot be changed"
            )));
        }
    }

    let before = document.clone();
    for (field, value) in patch {
        document.insert(field, value);
    }
    if document == before {
        return Ok(WriteResult {
            unchanged: 1,
            ..WriteResult::default()
        });
    }

    conn.execute(
        "UPDATE cs_documents SET body = ?4 WHERE db = ?1 AND tbl = ?2 AND doc_key = ?3;",
        params![db, tbl, key, serde_json::to_string(&document)?],
    )?;
    Ok(WriteResult {
        replaced: 1,
        ..WriteResult::default()
    })
}

/// Reads the primary key of a document about to be written.
fn document_key(document: &Document, primary_key: &str) -> DriverResult<Option<String>> {
    match document.get(primary_key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(key)) if !key.is_empty() => Ok(Some(key.clone())),
        Some(Value::String(_)) => Err(DriverError::InvalidDocument(format!(
            "primary key `{primary_key}` cannot be empty"
        ))),
        Some(other) => Err(DriverError::InvalidDocument(format!(
            "primary key `{primary_key}` must be a string, got {other}"
        ))),
    }
}

fn delete_result(requested: usize, deleted: usize) -> WriteResult {
    WriteResult {
        deleted: deleted as u64,
        skipped: requested.saturating_sub(deleted) as u64,
        ..WriteResult::default()
    }
}

fn parse_body(body: &str) -> DriverResult<Document> {
    Ok(serde_json::from_str(body)?)
}

fn distinct_keys(keys: &[String]) -> Vec<String> {
    keys.iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// JSON path expression for a validated identifier. Must stay textually
/// identical between index creation and lookups for SQLite to use the index.
fn field_expr(field: &str) -> String {
    format!("json_extract(body, '$.\"{field}\"')")
}

fn field_type_expr(field: &str) -> String {
    format!("json_type(body, '$.\"{field}\"')")
}
