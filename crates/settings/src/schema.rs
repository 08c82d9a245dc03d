//! Fixed schemas for the durable flag tables.
//!
//! Each table is keyed by canonical identifier. The only supported evolution is
//! additive: a declared column missing from an existing table is added with its
//! default at startup.

use std::fmt;

use perch_storage::{Database, Row, SqlValue, StorageError};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Per-chat flags
    Chats,
    /// Per-identifier bot modes
    Settings,
}

impl Table {
    pub const ALL: [Table; 2] = [Table::Chats, Table::Settings];

    pub fn name(self) -> &'static str {
        match self {
            Table::Chats => "chats",
            Table::Settings => "settings",
        }
    }

    pub fn columns(self) -> &'static [ColumnDef] {
        match self {
            Table::Chats => CHATS_COLUMNS,
            Table::Settings => SETTINGS_COLUMNS,
        }
    }

    /// Row cache capacity. `chats` sees the most traffic.
    pub fn cache_capacity(self) -> usize {
        match self {
            Table::Chats => 100,
            Table::Settings => 50,
        }
    }

    pub fn column(self, name: &str) -> Option<&'static ColumnDef> {
        self.columns().iter().find(|column| column.name == name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Bool,
    Int,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnKind::Bool => f.write_str("bool"),
            ColumnKind::Int => f.write_str("int"),
        }
    }
}

/// A typed column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
}

impl FieldValue {
    pub fn kind(self) -> ColumnKind {
        match self {
            FieldValue::Bool(_) => ColumnKind::Bool,
            FieldValue::Int(_) => ColumnKind::Int,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            FieldValue::Bool(value) => Some(value),
            FieldValue::Int(_) => None,
        }
    }

    pub fn as_int(self) -> Option<i64> {
        match self {
            FieldValue::Int(value) => Some(value),
            FieldValue::Bool(_) => None,
        }
    }

    /// Booleans are stored as 0/1 integers.
    pub(crate) fn to_stored(self) -> i64 {
        match self {
            FieldValue::Bool(value) => i64::from(value),
            FieldValue::Int(value) => value,
        }
    }

    /// Rehydrate a stored value using the column's declared type.
    pub(crate) fn from_stored(column: &ColumnDef, value: Option<&SqlValue>) -> FieldValue {
        let Some(stored) = value.and_then(SqlValue::as_integer) else {
            return column.default;
        };
        match column.kind {
            ColumnKind::Bool => FieldValue::Bool(stored != 0),
            ColumnKind::Int => FieldValue::Int(stored),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub default: FieldValue,
}

impl ColumnDef {
    const fn bool(name: &'static str, default: bool) -> Self {
        Self {
            name,
            kind: ColumnKind::Bool,
            default: FieldValue::Bool(default),
        }
    }

    fn ddl(&self) -> String {
        format!(
            "{} INTEGER NOT NULL DEFAULT {}",
            self.name,
            self.default.to_stored()
        )
    }
}

const CHATS_COLUMNS: &[ColumnDef] = &[ColumnDef::bool("mute", false)];

const SETTINGS_COLUMNS: &[ColumnDef] = &[
    ColumnDef::bool("self_only", false),
    ColumnDef::bool("group_only", false),
];

/// Create every table that is missing and add any declared column an existing
/// table lacks.
pub async fn ensure_schema<D: Database>(db: &D) -> Result<(), StorageError> {
    for table in Table::ALL {
        ensure_table(db, table).await?;
    }
    Ok(())
}

async fn ensure_table<D: Database>(db: &D, table: Table) -> Result<(), StorageError> {
    let columns = table
        .columns()
        .iter()
        .map(ColumnDef::ddl)
        .collect::<Vec<_>>()
        .join(", ");
    db.execute(
        &format!("CREATE TABLE IF NOT EXISTS {table} (id TEXT PRIMARY KEY NOT NULL, {columns})"),
        &[],
    )
    .await?;

    let existing: Vec<Row> = db
        .query(&format!("PRAGMA table_info({table})"), &[])
        .await?;
    let existing: Vec<&str> = existing
        .iter()
        .filter_map(|row| row.get(1).and_then(SqlValue::as_text))
        .collect();

    for column in table.columns() {
        if existing.contains(&column.name) {
            continue;
        }
        db.execute(
            &format!("ALTER TABLE {table} ADD COLUMN {}", column.ddl()),
            &[],
        )
        .await?;
        info!(table = %table, column = column.name, "added missing column");
    }

    debug!(table = %table, "schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use perch_storage::open_database;

    #[tokio::test]
    async fn ensure_schema_creates_tables() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = open_database(&dir.path().join("settings.db")).await.unwrap();
        ensure_schema(&db).await.unwrap();
        ensure_schema(&db).await.unwrap();

        let rows: Vec<Row> = db
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('chats', 'settings')",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn missing_column_is_added_with_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = open_database(&dir.path().join("settings.db")).await.unwrap();
        db.execute(
            "CREATE TABLE settings (id TEXT PRIMARY KEY NOT NULL, self_only INTEGER NOT NULL DEFAULT 0)",
            &[],
        )
        .await
        .unwrap();
        let id = "1@s.whatsapp.net".to_string();
        db.execute("INSERT INTO settings (id, self_only) VALUES (?1, 1)", &[&id])
            .await
            .unwrap();

        ensure_schema(&db).await.unwrap();

        let row: Row = db
            .query_one(
                "SELECT self_only, group_only FROM settings WHERE id = ?1",
                &[&id],
            )
            .await
            .unwrap();
        assert_eq!(row.get(0), Some(&SqlValue::Integer(1)));
        assert_eq!(row.get(1), Some(&SqlValue::Integer(0)));
    }

    #[test]
    fn stored_values_rehydrate_by_column_kind() {
        let mute = Table::Chats.column("mute").unwrap();
        assert_eq!(
            FieldValue::from_stored(mute, Some(&SqlValue::Integer(1))),
            FieldValue::Bool(true)
        );
        assert_eq!(FieldValue::from_stored(mute, None), FieldValue::Bool(false));
        assert!(Table::Settings.column("mute").is_none());
    }
}
