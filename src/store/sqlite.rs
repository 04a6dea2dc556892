//! SQLite-backed change store.
//!
//! Besides the replicated columns every table carries a local `recorded_at`
//! column. Each write stamps it inside an immediate transaction with a value
//! strictly greater than any stamp already in the table, so recording order
//! is commit order. Change feeds are resumed from these stamps; `updated_at`
//! only decides conflicts.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode,
    SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row as _;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::row::{Row, SchemaError, Value};
use super::schema::{ColumnType, TableSchema};
use super::timestamp;
use super::{ApplyContext, Change, ChangeKind, ChangeSet, ChangeStore, StoreError, SyncType};
use crate::sync::conflict::{resolve, Resolution};

/// Local recording stamp; never part of a replicated row.
const RECORDED_AT: &str = "recorded_at";

/// Writers take the database lock up front so that concurrent
/// read-then-write transactions queue instead of failing to upgrade.
const BEGIN_IMMEDIATE: &str = "BEGIN IMMEDIATE";

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens (creating if needed) the node database and runs migrations.
pub async fn init_db(path: &Path) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite:{}?mode=rwc", path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Change store over the node's SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteChangeStore {
    pool: SqlitePool,
}

impl SqliteChangeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens the database at `path` and wraps it in a store.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(init_db(path).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn decode(table: &'static TableSchema, sql_row: &SqliteRow) -> Result<Row, StoreError> {
        let mut row = Row::new();
        for column in table.columns {
            let value = match column.ty {
                ColumnType::Integer => sql_row
                    .try_get::<Option<i64>, _>(column.name)?
                    .map(Value::Integer),
                ColumnType::Real => sql_row
                    .try_get::<Option<f64>, _>(column.name)?
                    .map(Value::Real),
                ColumnType::Text => sql_row
                    .try_get::<Option<String>, _>(column.name)?
                    .map(Value::Text),
                ColumnType::Bool => sql_row
                    .try_get::<Option<bool>, _>(column.name)?
                    .map(Value::Bool),
                ColumnType::Timestamp => match sql_row.try_get::<Option<String>, _>(column.name)? {
                    Some(text) => Some(Value::Timestamp(timestamp::parse(&text).map_err(
                        |_| SchemaError::InvalidValue {
                            table: table.name,
                            column: column.name,
                            expected: ColumnType::Timestamp,
                        },
                    )?)),
                    None => None,
                },
            };
            row.set(column.name, value.unwrap_or(Value::Null));
        }
        Ok(row)
    }

    fn recorded_at_of(
        table: &'static TableSchema,
        sql_row: &SqliteRow,
    ) -> Result<DateTime<Utc>, StoreError> {
        let text: String = sql_row.try_get(RECORDED_AT)?;
        timestamp::parse(&text).map_err(|_| {
            StoreError::from(SchemaError::InvalidValue {
                table: table.name,
                column: RECORDED_AT,
                expected: ColumnType::Timestamp,
            })
        })
    }

    /// Stamp for the next write to `table`: the current time, or just past
    /// the latest stamp if the clock has not moved beyond it. Must run inside
    /// an immediate transaction.
    async fn next_recorded_at(
        conn: &mut SqliteConnection,
        table: &'static TableSchema,
    ) -> Result<DateTime<Utc>, StoreError> {
        let sql = format!("SELECT MAX({}) FROM {}", RECORDED_AT, table.name);
        let (latest,): (Option<String>,) = sqlx::query_as(&sql).fetch_one(&mut *conn).await?;

        // Stamps are stored with microsecond precision.
        let now = Utc::now().trunc_subsecs(6);
        let latest = latest.as_deref().and_then(|s| timestamp::parse(s).ok());
        Ok(match latest {
            Some(latest) if latest >= now => latest + chrono::Duration::microseconds(1),
            _ => now,
        })
    }

    fn key_of(table: &'static TableSchema, row: &Row) -> Result<i64, StoreError> {
        row.key().ok_or(StoreError::MissingField {
            table: table.name,
            column: TableSchema::KEY,
        })
    }

    /// Binds every schema column in order, then the recording stamp.
    fn bind_row<'q>(
        mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
        table: &'static TableSchema,
        row: &Row,
        recorded_at: &DateTime<Utc>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        for column in table.columns {
            query = bind_value(query, row.get(column.name).unwrap_or(&Value::Null));
        }
        query.bind(timestamp::format(recorded_at))
    }

    fn insert_sql(table: &'static TableSchema) -> String {
        let placeholders = vec!["?"; table.columns.len() + 1].join(", ");
        format!(
            "INSERT INTO {} ({}, {}) VALUES ({}) ON CONFLICT(id) DO NOTHING",
            table.name,
            table.column_list(),
            RECORDED_AT,
            placeholders
        )
    }

    fn update_sql(table: &'static TableSchema) -> String {
        let assignments = table
            .columns
            .iter()
            .filter(|c| c.name != TableSchema::KEY)
            .map(|c| format!("{} = ?", c.name))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "UPDATE {} SET {}, {} = ? WHERE id = ?",
            table.name, assignments, RECORDED_AT
        )
    }

    fn upsert_sql(table: &'static TableSchema) -> String {
        let placeholders = vec!["?"; table.columns.len() + 1].join(", ");
        let assignments = table
            .columns
            .iter()
            .map(|c| c.name)
            .filter(|name| *name != TableSchema::KEY)
            .chain(std::iter::once(RECORDED_AT))
            .map(|name| format!("{0} = excluded.{0}", name))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}, {}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
            table.name,
            table.column_list(),
            RECORDED_AT,
            placeholders,
            assignments
        )
    }
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Integer(i) => query.bind(*i),
        Value::Real(r) => query.bind(*r),
        Value::Text(s) => query.bind(s.clone()),
        Value::Bool(b) => query.bind(*b),
        Value::Timestamp(ts) => query.bind(timestamp::format(ts)),
    }
}

/// A row never modified since creation is reported as an insert.
fn change_kind(row: &Row) -> ChangeKind {
    match (row.created_at(), row.changed_at()) {
        (Some(created), Some(changed)) if created < changed => ChangeKind::Update,
        _ => ChangeKind::Insert,
    }
}

#[async_trait]
impl ChangeStore for SqliteChangeStore {
    async fn changes_since(
        &self,
        table: &'static TableSchema,
        since: Option<DateTime<Utc>>,
    ) -> Result<ChangeSet, StoreError> {
        let generated_at = Utc::now();

        let rows = match since {
            None => {
                let sql = format!(
                    "SELECT {}, {} FROM {} ORDER BY id",
                    table.column_list(),
                    RECORDED_AT,
                    table.name
                );
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
            Some(since) => {
                let sql = format!(
                    "SELECT {0}, {1} FROM {2} WHERE {1} > ? ORDER BY {1}, id",
                    table.column_list(),
                    RECORDED_AT,
                    table.name
                );
                sqlx::query(&sql)
                    .bind(timestamp::format(&since))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut watermark = since;
        let mut changes = Vec::with_capacity(rows.len());
        for sql_row in &rows {
            let row = Self::decode(table, sql_row)?;
            watermark = watermark.max(Some(Self::recorded_at_of(table, sql_row)?));
            let kind = match since {
                None => ChangeKind::Insert,
                Some(_) => change_kind(&row),
            };
            changes.push(Change { kind, row });
        }

        Ok(ChangeSet {
            table,
            changes,
            since,
            generated_at,
            watermark,
            sync_type: if since.is_some() {
                SyncType::Incremental
            } else {
                SyncType::Full
            },
        })
    }

    async fn apply_row(
        &self,
        table: &'static TableSchema,
        row: &Row,
        ctx: ApplyContext<'_>,
    ) -> Result<Resolution, StoreError> {
        row.validate(table)?;
        let id = Self::key_of(table, row)?;
        let incoming = row.changed_at().ok_or(StoreError::MissingField {
            table: table.name,
            column: TableSchema::CHANGED_AT,
        })?;

        let mut tx = self.pool.begin_with(BEGIN_IMMEDIATE).await?;

        let select = format!("SELECT {} FROM {} WHERE id = ?", table.column_list(), table.name);
        let local = sqlx::query(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| Self::decode(table, &r))
            .transpose()?;

        let resolution = match &local {
            Some(local) if local == row => Resolution::Unchanged,
            Some(local) => resolve(local.changed_at(), incoming, ctx.local_node, ctx.source_node),
            None => Resolution::Insert,
        };

        if resolution.writes_incoming() {
            let recorded_at = Self::next_recorded_at(&mut *tx, table).await?;
            if resolution == Resolution::Insert {
                let sql = Self::insert_sql(table);
                Self::bind_row(sqlx::query(&sql), table, row, &recorded_at)
                    .execute(&mut *tx)
                    .await?;
            } else {
                let sql = Self::update_sql(table);
                let mut query = sqlx::query(&sql);
                for column in table.columns.iter().filter(|c| c.name != TableSchema::KEY) {
                    query = bind_value(query, row.get(column.name).unwrap_or(&Value::Null));
                }
                query
                    .bind(timestamp::format(&recorded_at))
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;

        Ok(resolution)
    }

    async fn write_local(&self, table: &'static TableSchema, row: &Row) -> Result<(), StoreError> {
        row.validate(table)?;
        Self::key_of(table, row)?;

        let mut tx = self.pool.begin_with(BEGIN_IMMEDIATE).await?;
        let recorded_at = Self::next_recorded_at(&mut *tx, table).await?;

        let sql = Self::upsert_sql(table);
        Self::bind_row(sqlx::query(&sql), table, row, &recorded_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_row(&self, table: &'static TableSchema, id: i64) -> Result<Option<Row>, StoreError> {
        let sql = format!("SELECT {} FROM {} WHERE id = ?", table.column_list(), table.name);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;

        row.map(|r| Self::decode(table, &r)).transpose()
    }
}
