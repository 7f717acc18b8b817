//! Schema provisioning.
//!
//! # Responsibility
//! - Ensure database, primary table, attachment table and declared indexes
//!   exist, in that order.
//!
//! # Invariants
//! - Every step lists before it creates; a second run creates nothing.
//! - Index creation fans out concurrently; the first error wins.
//! - A create that loses a race to a concurrent provision counts as present.
//! - The first failing step aborts the run; nothing is rolled back.

use crate::db::{Connection, DriverError, DriverResult, TableOptions};
use futures::future::try_join_all;
use log::info;
use serde_json::{Map, Value};

/// What a provisioning run had to create.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub database_created: bool,
    pub tables_created: Vec<String>,
    pub indexes_created: Vec<String>,
}

impl ProvisionReport {
    /// True when the schema was already complete.
    pub fn is_noop(&self) -> bool {
        !self.database_created && self.tables_created.is_empty() && self.indexes_created.is_empty()
    }
}

/// Target schema of one model adapter.
#[derive(Debug, Clone)]
pub struct SchemaPlan<'a> {
    pub database: &'a str,
    pub table: &'a str,
    pub attachment_table: &'a str,
    pub key_field: &'a str,
    pub dbopts: &'a Map<String, Value>,
    pub indexes: &'a [String],
}

impl SchemaPlan<'_> {
    /// Caller hints plus the model key field as primary key. Hints are
    /// copied, never edited in place.
    pub fn table_options(&self) -> TableOptions {
        let mut extra = self.dbopts.clone();
        extra.remove("primary_key");
        extra.remove("primaryKey");
        TableOptions {
            primary_key: self.key_field.to_string(),
            extra,
        }
    }
}

pub async fn provision(conn: &dyn Connection, plan: &SchemaPlan<'_>) -> DriverResult<ProvisionReport> {
    let mut report = ProvisionReport {
        database_created: ensure_database(conn, plan.database).await?,
        ..ProvisionReport::default()
    };

    let table_options = plan.table_options();
    for table in [plan.table, plan.attachment_table] {
        if ensure_table(conn, plan.database, table, &table_options).await? {
            report.tables_created.push(table.to_string());
        }
    }

    let created = try_join_all(
        plan.indexes
            .iter()
            .map(|index| ensure_index(conn, plan.database, plan.table, index)),
    )
    .await?;
    report.indexes_created = plan
        .indexes
        .iter()
        .zip(created)
        .filter_map(|(index, created)| created.then(|| index.clone()))
        .collect();

    Ok(report)
}

async fn ensure_database(conn: &dyn Connection, database: &str) -> DriverResult<bool> {
    let databases = conn.db_list().await?;
    if databases.iter().any(|name| name == database) {
        return Ok(false);
    }

    let created = tolerate_existing(conn.db_create(database).await)?;
    if created {
        info!("event=db_create module=provision status=ok database={database}");
    }
    Ok(created)
}

async fn ensure_table(
    conn: &dyn Connection,
    database: &str,
    table: &str,
    options: &TableOptions,
) -> DriverResult<bool> {
    let tables = conn.table_list(database).await?;
    if tables.iter().any(|name| name == table) {
        return Ok(false);
    }

    let created = tolerate_existing(conn.table_create(database, table, options).await)?;
    if created {
        info!(
            "event=table_create module=provision status=ok database={database} table={table} primary_key={}",
            options.primary_key
        );
    }
    Ok(created)
}

async fn ensure_index(
    conn: &dyn Connection,
    database: &str,
    table: &str,
    index: &str,
) -> DriverResult<bool> {
    let indexes = conn.index_list(database, table).await?;
    if indexes.iter().any(|name| name == index) {
        return Ok(false);
    }

    let created = tolerate_existing(conn.index_create(database, table, index).await)?;
    if created {
        info!("event=index_create module=provision status=ok table={table} index={index}");
    }
    Ok(created)
}

/// `Ok(true)` when created, `Ok(false)` when someone else created it first.
fn tolerate_existing(result: DriverResult<()>) -> DriverResult<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(DriverError::AlreadyExists(_)) => Ok(false),
        Err(err) => Err(err),
    }
}
