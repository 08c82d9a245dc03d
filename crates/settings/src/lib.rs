//! Durable configuration: fixed-schema flag rows behind a write-through LRU
//! cache, plus free-form metadata entries.
//!
//! Rows are keyed by canonical identifier and created with their declared
//! defaults the first time they are read. Writes are validated against the
//! table schema, committed to SQLite, and only then applied to the cached row
//! in place, so a cached row never runs ahead of the backing store. A row read
//! from SQLite is cached only if no entry appeared while the read was pending.

pub mod meta;
pub mod schema;

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use perch_core::{jid, PerchError};
use perch_storage::{Database, Row, Statement, StorageError};
use tracing::{debug, warn};

pub use meta::{MetaStore, MetaValue};
pub use schema::{ensure_schema, ColumnDef, ColumnKind, FieldValue, Table};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("unknown field {field} on table {table}")]
    UnknownField { table: Table, field: String },

    #[error("field {field} on table {table} expects {expected}, got {found}")]
    TypeMismatch {
        table: Table,
        field: String,
        expected: ColumnKind,
        found: ColumnKind,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<SettingsError> for PerchError {
    fn from(error: SettingsError) -> Self {
        PerchError::Settings(error.to_string())
    }
}

/// One row of a flag table, with every declared column present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRow {
    pub table: Table,
    pub id: String,
    values: BTreeMap<&'static str, FieldValue>,
}

impl ConfigRow {
    fn defaults(table: Table, id: String) -> Self {
        let values = table
            .columns()
            .iter()
            .map(|column| (column.name, column.default))
            .collect();
        Self { table, id, values }
    }

    fn from_storage(table: Table, id: String, row: &Row) -> Self {
        let values = table
            .columns()
            .iter()
            .enumerate()
            .map(|(index, column)| (column.name, FieldValue::from_stored(column, row.get(index))))
            .collect();
        Self { table, id, values }
    }

    pub fn get(&self, field: &str) -> Option<FieldValue> {
        self.values.get(field).copied()
    }

    /// Boolean column value; `false` for unknown or non-boolean fields.
    pub fn flag(&self, field: &str) -> bool {
        self.get(field).and_then(FieldValue::as_bool).unwrap_or(false)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'static str, FieldValue)> + '_ {
        self.values.iter().map(|(name, value)| (*name, *value))
    }
}

type RowCache = Mutex<LruCache<String, ConfigRow>>;

pub struct SettingsStore<D: Database> {
    db: Arc<D>,
    chats_cache: RowCache,
    settings_cache: RowCache,
}

fn new_cache(table: Table) -> RowCache {
    let capacity = NonZeroUsize::new(table.cache_capacity()).unwrap_or(NonZeroUsize::MIN);
    Mutex::new(LruCache::new(capacity))
}

fn cache_key(table: Table, id: &str) -> String {
    format!("{table}:{id}")
}

impl<D: Database> SettingsStore<D> {
    /// Open the store, creating tables and adding missing columns first.
    pub async fn open(db: Arc<D>) -> Result<Self, SettingsError> {
        ensure_schema(db.as_ref()).await?;
        Ok(Self {
            db,
            chats_cache: new_cache(Table::Chats),
            settings_cache: new_cache(Table::Settings),
        })
    }

    pub fn database(&self) -> &Arc<D> {
        &self.db
    }

    fn cache(&self, table: Table) -> MutexGuard<'_, LruCache<String, ConfigRow>> {
        let cache = match table {
            Table::Chats => &self.chats_cache,
            Table::Settings => &self.settings_cache,
        };
        cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the row is currently cached. Does not touch recency.
    pub fn is_cached(&self, table: Table, id: &str) -> bool {
        let id = jid::normalize(id);
        self.cache(table).contains(&cache_key(table, &id))
    }

    /// Fetch a row, creating it with defaults if it does not exist yet.
    pub async fn get_row(&self, table: Table, id: &str) -> Result<ConfigRow, SettingsError> {
        let id = jid::normalize(id);
        let key = cache_key(table, &id);

        let cached = self.cache(table).get(&key).cloned();
        if let Some(row) = cached {
            return Ok(row);
        }

        let row = match self.load_row(table, &id).await? {
            Some(row) => row,
            None => {
                self.db
                    .execute(
                        &format!("INSERT OR IGNORE INTO {table} (id) VALUES (?1)"),
                        &[&id],
                    )
                    .await?;
                debug!(table = %table, id = %id, "created default row");
                ConfigRow::defaults(table, id)
            }
        };

        Ok(self.cache_loaded(key, row))
    }

    /// Validate and persist one field. The row is created first if needed.
    pub async fn set_field(
        &self,
        table: Table,
        id: &str,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> Result<(), SettingsError> {
        let value = value.into();
        let Some(column) = table.column(field) else {
            warn!(table = %table, field, "rejected write to unknown field");
            return Err(SettingsError::UnknownField {
                table,
                field: field.to_string(),
            });
        };
        if column.kind != value.kind() {
            warn!(
                table = %table,
                field,
                expected = %column.kind,
                found = %value.kind(),
                "rejected write with mismatched type"
            );
            return Err(SettingsError::TypeMismatch {
                table,
                field: field.to_string(),
                expected: column.kind,
                found: value.kind(),
            });
        }

        let id = jid::normalize(id);
        let stored = value.to_stored();
        self.db
            .transaction(vec![
                Statement::new(format!("INSERT OR IGNORE INTO {table} (id) VALUES (?1)"), &[&id]),
                Statement::new(
                    format!("UPDATE {table} SET {} = ?1 WHERE id = ?2", column.name),
                    &[&stored, &id],
                ),
            ])
            .await?;

        let key = cache_key(table, &id);
        if self.apply_cached(table, &key, column.name, value) {
            return Ok(());
        }
        // Loaded after the commit, so it already carries this write.
        let row = self
            .load_row(table, &id)
            .await?
            .unwrap_or_else(|| ConfigRow::defaults(table, id));
        let mut cache = self.cache(table);
        match cache.get_mut(&key) {
            Some(cached) => {
                cached.values.insert(column.name, value);
            }
            None => {
                cache.put(key, row);
            }
        }
        Ok(())
    }

    /// Apply a committed field write to the cached row in place. Returns
    /// false when the row is not cached.
    fn apply_cached(
        &self,
        table: Table,
        key: &str,
        field: &'static str,
        value: FieldValue,
    ) -> bool {
        match self.cache(table).get_mut(key) {
            Some(row) => {
                row.values.insert(field, value);
                true
            }
            None => false,
        }
    }

    /// Cache a row read from storage unless a newer copy got there first.
    /// Writers update cached rows in place, so an existing entry always
    /// reflects every commit and wins over the loaded snapshot.
    fn cache_loaded(&self, key: String, row: ConfigRow) -> ConfigRow {
        let mut cache = self.cache(row.table);
        if let Some(existing) = cache.get(&key) {
            return existing.clone();
        }
        cache.put(key, row.clone());
        row
    }

    /// Delete a row and drop it from the cache. Returns whether it existed.
    pub async fn remove_row(&self, table: Table, id: &str) -> Result<bool, SettingsError> {
        let id = jid::normalize(id);
        let removed = self
            .db
            .execute(&format!("DELETE FROM {table} WHERE id = ?1"), &[&id])
            .await?;
        self.cache(table).pop(&cache_key(table, &id));
        Ok(removed > 0)
    }

    async fn load_row(&self, table: Table, id: &str) -> Result<Option<ConfigRow>, SettingsError> {
        let columns = table
            .columns()
            .iter()
            .map(|column| column.name)
            .collect::<Vec<_>>()
            .join(", ");
        let id = id.to_string();
        let rows: Vec<Row> = self
            .db
            .query(
                &format!("SELECT {columns} FROM {table} WHERE id = ?1"),
                &[&id],
            )
            .await?;

        Ok(rows
            .first()
            .map(|row| ConfigRow::from_storage(table, id, row)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use perch_storage::{open_database, NativeDatabase, SqlValue};
    use tracing_test::traced_test;

    async fn open_temp_store() -> (SettingsStore<NativeDatabase>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().expect("failed to create temp dir");
        let db = open_database(&dir.path().join("settings.db"))
            .await
            .expect("failed to open database");
        let store = SettingsStore::open(Arc::new(db))
            .await
            .expect("failed to open settings store");
        (store, dir)
    }

    async fn count_rows(store: &SettingsStore<NativeDatabase>, table: Table, id: &str) -> i64 {
        let id = id.to_string();
        let row: Row = store
            .database()
            .query_one(
                &format!("SELECT COUNT(*) FROM {table} WHERE id = ?1"),
                &[&id],
            )
            .await
            .unwrap();
        row.get(0).and_then(SqlValue::as_integer).unwrap()
    }

    #[tokio::test]
    async fn first_read_creates_defaults_once() {
        let (store, _dir) = open_temp_store().await;

        let first = store.get_row(Table::Settings, "15551234567").await.unwrap();
        assert_eq!(first.id, "15551234567@s.whatsapp.net");
        assert_eq!(first.get("self_only"), Some(FieldValue::Bool(false)));
        assert_eq!(first.get("group_only"), Some(FieldValue::Bool(false)));

        let second = store
            .get_row(Table::Settings, "15551234567@s.whatsapp.net")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(
            count_rows(&store, Table::Settings, "15551234567@s.whatsapp.net").await,
            1
        );
    }

    #[tokio::test]
    async fn set_field_persists_across_stores() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.db");
        {
            let db = open_database(&path).await.unwrap();
            let store = SettingsStore::open(Arc::new(db)).await.unwrap();
            store
                .set_field(Table::Chats, "1203@g.us", "mute", true)
                .await
                .unwrap();
            assert!(store.get_row(Table::Chats, "1203@g.us").await.unwrap().flag("mute"));
        }

        let db = open_database(&path).await.unwrap();
        let store = SettingsStore::open(Arc::new(db)).await.unwrap();
        let row = store.get_row(Table::Chats, "1203@g.us").await.unwrap();
        assert_eq!(row.get("mute"), Some(FieldValue::Bool(true)));
    }

    #[traced_test]
    #[tokio::test]
    async fn unknown_field_is_rejected_and_row_unchanged() {
        let (store, _dir) = open_temp_store().await;
        let before = store.get_row(Table::Chats, "1@s.whatsapp.net").await.unwrap();

        let result = store
            .set_field(Table::Chats, "1@s.whatsapp.net", "volume", 3i64)
            .await;
        assert_matches!(result, Err(SettingsError::UnknownField { ref field, .. }) if field == "volume");

        let after = store.get_row(Table::Chats, "1@s.whatsapp.net").await.unwrap();
        assert_eq!(before, after);
        assert!(logs_contain("rejected write to unknown field"));
    }

    #[tokio::test]
    async fn mismatched_type_is_rejected() {
        let (store, _dir) = open_temp_store().await;
        let result = store
            .set_field(Table::Settings, "1@s.whatsapp.net", "self_only", 1i64)
            .await;
        assert_matches!(
            result,
            Err(SettingsError::TypeMismatch {
                expected: ColumnKind::Bool,
                found: ColumnKind::Int,
                ..
            })
        );
        let row = store.get_row(Table::Settings, "1@s.whatsapp.net").await.unwrap();
        assert!(!row.flag("self_only"));
    }

    #[tokio::test]
    async fn lru_evicts_first_inserted_and_falls_back_to_storage() {
        let (store, _dir) = open_temp_store().await;
        let ids: Vec<String> = (0..101).map(|n| format!("{}@s.whatsapp.net", 1000 + n)).collect();

        store.set_field(Table::Chats, &ids[0], "mute", true).await.unwrap();
        for id in &ids[1..] {
            store.get_row(Table::Chats, id).await.unwrap();
        }

        assert!(!store.is_cached(Table::Chats, &ids[0]));
        assert!(ids[1..].iter().all(|id| store.is_cached(Table::Chats, id)));

        let row = store.get_row(Table::Chats, &ids[0]).await.unwrap();
        assert!(row.flag("mute"));
        assert_eq!(count_rows(&store, Table::Chats, &ids[0]).await, 1);
    }

    #[tokio::test]
    async fn concurrent_writes_to_one_row_keep_cache_coherent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.db");
        let store = SettingsStore::open(Arc::new(open_database(&path).await.unwrap()))
            .await
            .unwrap();

        let (self_only, group_only) = tokio::join!(
            store.set_field(Table::Settings, "1", "self_only", true),
            store.set_field(Table::Settings, "1", "group_only", true),
        );
        self_only.unwrap();
        group_only.unwrap();

        let cached = store.get_row(Table::Settings, "1").await.unwrap();
        let fresh = SettingsStore::open(Arc::new(open_database(&path).await.unwrap()))
            .await
            .unwrap();
        let stored = fresh.get_row(Table::Settings, "1").await.unwrap();
        assert_eq!(cached, stored);
        assert!(cached.flag("self_only") && cached.flag("group_only"));
    }

    #[tokio::test]
    async fn read_racing_a_write_does_not_cache_the_old_row() {
        let (store, _dir) = open_temp_store().await;
        store.get_row(Table::Chats, "2@s.whatsapp.net").await.unwrap();
        store.remove_row(Table::Chats, "2@s.whatsapp.net").await.unwrap();

        let (read, write) = tokio::join!(
            store.get_row(Table::Chats, "2@s.whatsapp.net"),
            store.set_field(Table::Chats, "2@s.whatsapp.net", "mute", true),
        );
        read.unwrap();
        write.unwrap();

        let row = store.get_row(Table::Chats, "2@s.whatsapp.net").await.unwrap();
        assert!(row.flag("mute"));
    }

    #[tokio::test]
    async fn tables_have_separate_caches() {
        let (store, _dir) = open_temp_store().await;
        store.get_row(Table::Chats, "1@s.whatsapp.net").await.unwrap();
        assert!(store.is_cached(Table::Chats, "1@s.whatsapp.net"));
        assert!(!store.is_cached(Table::Settings, "1@s.whatsapp.net"));
    }

    #[tokio::test]
    async fn remove_row_drops_cache_and_recreates_defaults() {
        let (store, _dir) = open_temp_store().await;
        store
            .set_field(Table::Settings, "1@s.whatsapp.net", "group_only", true)
            .await
            .unwrap();

        assert!(store.remove_row(Table::Settings, "1@s.whatsapp.net").await.unwrap());
        assert!(!store.is_cached(Table::Settings, "1@s.whatsapp.net"));
        assert!(!store.remove_row(Table::Settings, "1@s.whatsapp.net").await.unwrap());

        let row = store.get_row(Table::Settings, "1@s.whatsapp.net").await.unwrap();
        assert!(!row.flag("group_only"));
    }

    #[test]
    fn settings_error_converts_to_perch_error() {
        let error: PerchError = SettingsError::UnknownField {
            table: Table::Chats,
            field: "x".into(),
        }
        .into();
        assert_matches!(error, PerchError::Settings(ref message) if message.contains("unknown field x"));
    }
}
