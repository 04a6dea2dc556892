//! Change store: the boundary between the sync engine and the node's
//! primary database.
//!
//! The engine only needs three things from storage: the rows written since
//! a watermark, a way to apply an incoming row under the conflict policy, and
//! a way for the local application to write rows. [`ChangeStore`] captures
//! exactly that; [`SqliteChangeStore`] is the SQLite-backed implementation.

pub mod row;
pub mod schema;
pub mod sqlite;
pub mod timestamp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::sync::conflict::Resolution;

pub use row::{Row, SchemaError, Value};
pub use schema::TableSchema;
pub use sqlite::{init_db, SqliteChangeStore};

/// How a row changed relative to the requested window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "INSERT"),
            ChangeKind::Update => write!(f, "UPDATE"),
        }
    }
}

/// Whether a change set covers the whole table or a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Full,
    Incremental,
}

/// A single row snapshot tagged with its change kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub kind: ChangeKind,
    pub row: Row,
}

/// Rows of one table recorded by a store since a point in time.
///
/// `since` and `watermark` are in the recording store's clock, not in the
/// `updated_at` domain. They are only meaningful when handed back to the
/// same store.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub table: &'static TableSchema,
    /// Rows in stable order (by key for full sets, by recording order otherwise).
    pub changes: Vec<Change>,
    pub since: Option<DateTime<Utc>>,
    /// Taken before the rows were read.
    pub generated_at: DateTime<Utc>,
    /// Highest recording time covered by this set. Passing it as the next
    /// `since` returns exactly the rows written after this set was read.
    /// `None` only for a full set of an empty table.
    pub watermark: Option<DateTime<Utc>>,
    pub sync_type: SyncType,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Identities involved in applying an incoming row.
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext<'a> {
    pub local_node: &'a str,
    pub source_node: &'a str,
}

/// Errors from the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("row in {table} has no {column}")]
    MissingField {
        table: &'static str,
        column: &'static str,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage operations the sync engine relies on.
#[async_trait]
pub trait ChangeStore: Send + Sync {
    /// Rows this store recorded strictly after `since`, or every row when
    /// `since` is `None`. Every write (local or applied) records the row
    /// again, regardless of its `updated_at`.
    async fn changes_since(
        &self,
        table: &'static TableSchema,
        since: Option<DateTime<Utc>>,
    ) -> Result<ChangeSet, StoreError>;

    /// Applies one incoming row under the conflict policy and reports what
    /// happened. Applying the same row twice leaves the store unchanged.
    async fn apply_row(
        &self,
        table: &'static TableSchema,
        row: &Row,
        ctx: ApplyContext<'_>,
    ) -> Result<Resolution, StoreError>;

    /// Inserts or replaces a locally produced row.
    async fn write_local(&self, table: &'static TableSchema, row: &Row) -> Result<(), StoreError>;

    /// Reads a single row by key.
    async fn get_row(&self, table: &'static TableSchema, id: i64) -> Result<Option<Row>, StoreError>;
}
