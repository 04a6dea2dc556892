//! Schema registry for the replicated tables.
//!
//! The set of tables that can be replicated is closed: every table a node
//! is configured to sync must be listed here. Each table has an integer
//! primary key `id` and an `updated_at` change timestamp used for
//! incremental fetches and conflict resolution.

use std::fmt;

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Bool,
    Timestamp,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Integer => write!(f, "integer"),
            ColumnType::Real => write!(f, "real"),
            ColumnType::Text => write!(f, "text"),
            ColumnType::Bool => write!(f, "bool"),
            ColumnType::Timestamp => write!(f, "timestamp"),
        }
    }
}

/// A single column definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
}

const fn col(name: &'static str, ty: ColumnType) -> Column {
    Column {
        name,
        ty,
        nullable: false,
    }
}

const fn opt(name: &'static str, ty: ColumnType) -> Column {
    Column {
        name,
        ty,
        nullable: true,
    }
}

/// Definition of a replicated table.
#[derive(Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: &'static [Column],
}

impl TableSchema {
    /// Primary key column.
    pub const KEY: &'static str = "id";
    /// Column holding the last-change timestamp.
    pub const CHANGED_AT: &'static str = "updated_at";
    /// Column holding the creation timestamp.
    pub const CREATED_AT: &'static str = "created_at";

    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Comma-separated column list for SQL statements.
    pub fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

use ColumnType::{Bool, Integer, Real, Text, Timestamp};

pub static USERS: TableSchema = TableSchema {
    name: "users",
    columns: &[
        col("id", Integer),
        col("username", Text),
        col("email", Text),
        opt("full_name", Text),
        opt("avatar_url", Text),
        opt("bio", Text),
        col("created_at", Timestamp),
        col("updated_at", Timestamp),
        col("is_active", Bool),
        col("is_verified", Bool),
        col("role", Text),
    ],
};

pub static PRODUCTS: TableSchema = TableSchema {
    name: "products",
    columns: &[
        col("id", Integer),
        col("name", Text),
        opt("description", Text),
        opt("category_id", Integer),
        opt("manufacturer", Text),
        opt("price", Real),
        col("created_at", Timestamp),
        col("updated_at", Timestamp),
        col("is_active", Bool),
    ],
};

pub static REVIEWS: TableSchema = TableSchema {
    name: "reviews",
    columns: &[
        col("id", Integer),
        col("user_id", Integer),
        col("product_id", Integer),
        col("rating", Integer),
        opt("title", Text),
        opt("content", Text),
        opt("pros", Text),
        opt("cons", Text),
        col("verified_purchase", Bool),
        col("created_at", Timestamp),
        col("updated_at", Timestamp),
    ],
};

pub static CATEGORIES: TableSchema = TableSchema {
    name: "categories",
    columns: &[
        col("id", Integer),
        col("name", Text),
        opt("description", Text),
        opt("parent_id", Integer),
        col("created_at", Timestamp),
        col("updated_at", Timestamp),
    ],
};

/// Every table known to the registry.
pub static TABLES: [&TableSchema; 4] = [&USERS, &PRODUCTS, &REVIEWS, &CATEGORIES];

/// Looks up a table schema by name.
pub fn lookup(name: &str) -> Option<&'static TableSchema> {
    TABLES.iter().copied().find(|t| t.name == name)
}

/// Names of every replicable table, in registry order.
pub fn table_names() -> Vec<String> {
    TABLES.iter().map(|t| t.name.to_string()).collect()
}
