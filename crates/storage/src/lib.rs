//! Durable storage for Perch: SQLite behind an async [`Database`] trait.
//!
//! The backend serializes writes through a single writer thread and serves
//! reads from a small connection pool. Schema changes owned by this crate are
//! versioned migrations; table layouts owned by callers (the flag tables in
//! `perch-settings`) are created by those callers.

mod migrate;
mod native;
mod value;

use std::path::{Path, PathBuf};

pub use native::NativeDatabase;
pub use value::{FromRow, Row, SqlValue, ToSql};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to open database at {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("migration {version} failed: {reason}")]
    Migration { version: u32, reason: String },

    #[error("query failed: {0}")]
    Query(String),

    #[error("expected one row but found none")]
    NotFound,

    #[error("storage writer is no longer running")]
    WriterClosed,
}

/// A statement with its parameters already bound, for [`Database::transaction`].
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: &[&dyn ToSql]) -> Self {
        Self {
            sql: sql.into(),
            params: value::bind(params),
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait Database: Send + Sync + 'static {
    /// Run one write. Returns the number of changed rows.
    async fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<u64, StorageError>;

    /// Run several writes atomically: all commit or none do. Returns the
    /// total number of changed rows.
    async fn transaction(&self, statements: Vec<Statement>) -> Result<u64, StorageError>;

    async fn query<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<T>, StorageError>;

    /// The first row, or [`StorageError::NotFound`].
    async fn query_one<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<T, StorageError>;
}

/// Open (or create) the database at `path` and apply pending migrations.
pub async fn open_database(path: &Path) -> Result<NativeDatabase, StorageError> {
    NativeDatabase::open(path).await
}
