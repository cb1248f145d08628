//! SQLite-backed record store

use eyre::{Context, Result, eyre};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Transaction, params, params_from_iter};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::record::{Filter, IndexValue, Record};

/// Database file name inside the store directory
pub const DB_FILE: &str = "hive.db";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE TABLE IF NOT EXISTS record_indexes (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    field TEXT NOT NULL,
    value_str TEXT,
    value_int INTEGER,
    PRIMARY KEY (collection, id, field)
);
CREATE INDEX IF NOT EXISTS idx_record_indexes_str ON record_indexes (collection, field, value_str);
CREATE INDEX IF NOT EXISTS idx_record_indexes_int ON record_indexes (collection, field, value_int);
"#;

/// Persistent store for [`Record`] types
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Store {
    /// Open or create a store in the given directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        debug!(dir = %dir.display(), "Store::open: called");
        fs::create_dir_all(dir).context("Failed to create store directory")?;

        let db_path = dir.join(DB_FILE);
        let conn = Connection::open(&db_path).context(format!("Failed to open {}", db_path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA).context("Failed to create schema")?;

        info!(path = %db_path.display(), journal_mode = %mode, "Opened store");
        Ok(Self {
            conn,
            path: Some(db_path),
        })
    }

    /// Open a throwaway in-memory store
    pub fn open_in_memory() -> Result<Self> {
        debug!("Store::open_in_memory: called");
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA).context("Failed to create schema")?;
        Ok(Self { conn, path: None })
    }

    /// Path of the database file (None for in-memory stores)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert a new record, failing if the id already exists
    pub fn create<T: Record>(&mut self, record: T) -> Result<String> {
        create(&self.conn, &record)
    }

    /// Fetch a record by id
    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        get(&self.conn, id)
    }

    /// Replace an existing record, failing if it does not exist
    pub fn update<T: Record>(&mut self, record: T) -> Result<()> {
        update(&self.conn, &record)
    }

    /// Insert or replace a record
    pub fn upsert<T: Record>(&mut self, record: T) -> Result<()> {
        upsert(&self.conn, &record)
    }

    /// Delete a record, returning whether it existed
    pub fn delete<T: Record>(&mut self, id: &str) -> Result<bool> {
        delete::<T>(&self.conn, id)
    }

    /// List records matching every filter, in insertion order
    pub fn list<T: Record>(&self, filters: &[Filter]) -> Result<Vec<T>> {
        list(&self.conn, filters)
    }

    /// Recompute the index rows of every record in a collection
    pub fn rebuild_indexes<T: Record>(&mut self) -> Result<usize> {
        debug!(collection = T::collection_name(), "Store::rebuild_indexes: called");
        let tx = self.conn.transaction()?;
        let records: Vec<T> = list(&tx, &[])?;
        tx.execute(
            "DELETE FROM record_indexes WHERE collection = ?1",
            params![T::collection_name()],
        )?;
        for record in &records {
            write_indexes(&tx, record)?;
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Run `f` inside one SQLite transaction
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise.
    pub fn transaction<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<R>,
    {
        debug!("Store::transaction: called");
        let mut tx = Tx {
            inner: self.conn.transaction()?,
        };
        let result = f(&mut tx)?;
        tx.inner.commit().context("Failed to commit transaction")?;
        Ok(result)
    }

    /// Checkpoint the write-ahead log into the main database file
    pub fn flush(&mut self) -> Result<()> {
        debug!("Store::flush: called");
        if self.path.is_some() {
            self.conn
                .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
                .context("Failed to checkpoint WAL")?;
        }
        Ok(())
    }
}

/// Handle to an open transaction, see [`Store::transaction`]
pub struct Tx<'a> {
    inner: Transaction<'a>,
}

impl Tx<'_> {
    pub fn create<T: Record>(&mut self, record: T) -> Result<String> {
        create(&self.inner, &record)
    }

    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        get(&self.inner, id)
    }

    pub fn update<T: Record>(&mut self, record: T) -> Result<()> {
        update(&self.inner, &record)
    }

    pub fn upsert<T: Record>(&mut self, record: T) -> Result<()> {
        upsert(&self.inner, &record)
    }

    pub fn delete<T: Record>(&mut self, id: &str) -> Result<bool> {
        delete::<T>(&self.inner, id)
    }

    pub fn list<T: Record>(&self, filters: &[Filter]) -> Result<Vec<T>> {
        list(&self.inner, filters)
    }
}

fn create<T: Record>(conn: &Connection, record: &T) -> Result<String> {
    let collection = T::collection_name();
    let id = record.id().to_string();
    debug!(collection, %id, "create: called");

    let data = serde_json::to_string(record).context("Failed to serialize record")?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO records (collection, id, data, updated_at) VALUES (?1, ?2, ?3, ?4)",
        params![collection, id, data, record.updated_at()],
    )?;
    if inserted == 0 {
        return Err(eyre!("Record already exists: {}/{}", collection, id));
    }
    write_indexes(conn, record)?;
    Ok(id)
}

fn get<T: Record>(conn: &Connection, id: &str) -> Result<Option<T>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
            params![T::collection_name(), id],
            |row| row.get(0),
        )
        .optional()?;

    match data {
        Some(data) => {
            let record = serde_json::from_str(&data)
                .context(format!("Failed to deserialize {}/{}", T::collection_name(), id))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

fn update<T: Record>(conn: &Connection, record: &T) -> Result<()> {
    let collection = T::collection_name();
    debug!(collection, id = record.id(), "update: called");

    let data = serde_json::to_string(record).context("Failed to serialize record")?;
    let changed = conn.execute(
        "UPDATE records SET data = ?3, updated_at = ?4 WHERE collection = ?1 AND id = ?2",
        params![collection, record.id(), data, record.updated_at()],
    )?;
    if changed == 0 {
        return Err(eyre!("Record not found: {}/{}", collection, record.id()));
    }
    write_indexes(conn, record)
}

fn upsert<T: Record>(conn: &Connection, record: &T) -> Result<()> {
    let data = serde_json::to_string(record).context("Failed to serialize record")?;
    conn.execute(
        "INSERT INTO records (collection, id, data, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (collection, id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        params![T::collection_name(), record.id(), data, record.updated_at()],
    )?;
    write_indexes(conn, record)
}

fn delete<T: Record>(conn: &Connection, id: &str) -> Result<bool> {
    let collection = T::collection_name();
    debug!(collection, %id, "delete: called");
    conn.execute(
        "DELETE FROM record_indexes WHERE collection = ?1 AND id = ?2",
        params![collection, id],
    )?;
    let removed = conn.execute(
        "DELETE FROM records WHERE collection = ?1 AND id = ?2",
        params![collection, id],
    )?;
    Ok(removed > 0)
}

fn list<T: Record>(conn: &Connection, filters: &[Filter]) -> Result<Vec<T>> {
    let mut sql = String::from("SELECT r.data FROM records r WHERE r.collection = ?");
    let mut values = vec![Value::Text(T::collection_name().to_string())];

    for filter in filters {
        let (column, value) = match &filter.value {
            IndexValue::String(s) => ("value_str", Value::Text(s.clone())),
            IndexValue::Int(i) => ("value_int", Value::Integer(*i)),
            IndexValue::Bool(b) => ("value_int", Value::Integer(i64::from(*b))),
        };
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM record_indexes i WHERE i.collection = r.collection AND i.id = r.id \
             AND i.field = ? AND i.{} {} ?)",
            column,
            filter.op.as_sql()
        ));
        values.push(Value::Text(filter.field.clone()));
        values.push(value);
    }
    sql.push_str(" ORDER BY r.rowid");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?;

    let mut records = Vec::new();
    for data in rows {
        let data = data?;
        let record = serde_json::from_str(&data).context(format!("Failed to deserialize {}", T::collection_name()))?;
        records.push(record);
    }
    Ok(records)
}

fn write_indexes<T: Record>(conn: &Connection, record: &T) -> Result<()> {
    let collection = T::collection_name();
    conn.execute(
        "DELETE FROM record_indexes WHERE collection = ?1 AND id = ?2",
        params![collection, record.id()],
    )?;

    let mut stmt = conn.prepare(
        "INSERT INTO record_indexes (collection, id, field, value_str, value_int) VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (field, value) in record.indexed_fields() {
        let (value_str, value_int) = match value {
            IndexValue::String(s) => (Some(s), None),
            IndexValue::Int(i) => (None, Some(i)),
            IndexValue::Bool(b) => (None, Some(i64::from(b))),
        };
        stmt.execute(params![collection, record.id(), field, value_str, value_int])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FilterOp;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        id: String,
        status: String,
        size: i64,
        archived: bool,
        owner: Option<String>,
        updated_at: i64,
    }

    impl Widget {
        fn new(id: &str, status: &str, size: i64) -> Self {
            Self {
                id: id.to_string(),
                status: status.to_string(),
                size,
                archived: false,
                owner: None,
                updated_at: crate::now_ms(),
            }
        }
    }

    impl Record for Widget {
        fn id(&self) -> &str {
            &self.id
        }

        fn updated_at(&self) -> i64 {
            self.updated_at
        }

        fn collection_name() -> &'static str {
            "widgets"
        }

        fn indexed_fields(&self) -> HashMap<String, IndexValue> {
            let mut fields = HashMap::new();
            fields.insert("status".to_string(), IndexValue::String(self.status.clone()));
            fields.insert("size".to_string(), IndexValue::Int(self.size));
            fields.insert("archived".to_string(), IndexValue::Bool(self.archived));
            if let Some(ref owner) = self.owner {
                fields.insert("owner".to_string(), IndexValue::String(owner.clone()));
            }
            fields
        }
    }

    #[test]
    fn test_crud() {
        let temp = tempdir().unwrap();
        let mut store = Store::open(temp.path()).unwrap();
        assert!(store.path().unwrap().ends_with(DB_FILE));

        let id = store.create(Widget::new("w1", "open", 3)).unwrap();
        assert_eq!(id, "w1");

        let mut widget: Widget = store.get("w1").unwrap().unwrap();
        assert_eq!(widget.size, 3);

        widget.status = "closed".to_string();
        store.update(widget.clone()).unwrap();
        let fetched: Widget = store.get("w1").unwrap().unwrap();
        assert_eq!(fetched.status, "closed");

        assert!(store.delete::<Widget>("w1").unwrap());
        assert!(!store.delete::<Widget>("w1").unwrap());
        assert!(store.get::<Widget>("w1").unwrap().is_none());
    }

    #[test]
    fn test_create_duplicate_fails() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(Widget::new("w1", "open", 1)).unwrap();
        assert!(store.create(Widget::new("w1", "open", 1)).is_err());
    }

    #[test]
    fn test_update_missing_fails() {
        let mut store = Store::open_in_memory().unwrap();
        assert!(store.update(Widget::new("ghost", "open", 1)).is_err());
        store.upsert(Widget::new("ghost", "open", 1)).unwrap();
        assert!(store.get::<Widget>("ghost").unwrap().is_some());
    }

    #[test]
    fn test_list_filters_and_order() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(Widget::new("c", "open", 5)).unwrap();
        store.create(Widget::new("a", "closed", 2)).unwrap();
        store.create(Widget::new("b", "open", 9)).unwrap();

        let all: Vec<Widget> = store.list(&[]).unwrap();
        let ids: Vec<_> = all.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);

        let open: Vec<Widget> = store.list(&[Filter::eq("status", "open")]).unwrap();
        assert_eq!(open.len(), 2);

        let big_open: Vec<Widget> = store
            .list(&[
                Filter::eq("status", "open"),
                Filter {
                    field: "size".to_string(),
                    op: FilterOp::Gt,
                    value: IndexValue::Int(6),
                },
            ])
            .unwrap();
        assert_eq!(big_open.len(), 1);
        assert_eq!(big_open[0].id, "b");

        let not_closed: Vec<Widget> = store.list(&[Filter::ne("status", "closed")]).unwrap();
        assert_eq!(not_closed.len(), 2);

        let unarchived: Vec<Widget> = store.list(&[Filter::eq("archived", false)]).unwrap();
        assert_eq!(unarchived.len(), 3);
    }

    #[test]
    fn test_optional_index_only_matches_when_present() {
        let mut store = Store::open_in_memory().unwrap();
        let mut owned = Widget::new("owned", "open", 1);
        owned.owner = Some("alice".to_string());
        store.create(owned).unwrap();
        store.create(Widget::new("free", "open", 1)).unwrap();

        let others: Vec<Widget> = store.list(&[Filter::ne("owner", "bob")]).unwrap();
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].id, "owned");
    }

    #[test]
    fn test_update_refreshes_indexes() {
        let mut store = Store::open_in_memory().unwrap();
        let mut widget = Widget::new("w", "open", 1);
        store.create(widget.clone()).unwrap();

        widget.status = "closed".to_string();
        store.update(widget).unwrap();

        let open: Vec<Widget> = store.list(&[Filter::eq("status", "open")]).unwrap();
        assert!(open.is_empty());
        let closed: Vec<Widget> = store.list(&[Filter::eq("status", "closed")]).unwrap();
        assert_eq!(closed.len(), 1);
    }

    #[test]
    fn test_transaction_commits() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .transaction(|tx| {
                tx.create(Widget::new("a", "open", 1))?;
                tx.create(Widget::new("b", "open", 1))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.list::<Widget>(&[]).unwrap().len(), 2);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(Widget::new("a", "open", 1)).unwrap();

        let result: Result<()> = store.transaction(|tx| {
            let mut a: Widget = tx.get("a")?.unwrap();
            a.status = "closed".to_string();
            tx.update(a)?;
            tx.create(Widget::new("a", "open", 1))?;
            Ok(())
        });
        assert!(result.is_err());

        let a: Widget = store.get("a").unwrap().unwrap();
        assert_eq!(a.status, "open");
    }

    #[test]
    fn test_rebuild_indexes() {
        let temp = tempdir().unwrap();
        let mut store = Store::open(temp.path()).unwrap();
        store.create(Widget::new("a", "open", 1)).unwrap();
        store.create(Widget::new("b", "closed", 1)).unwrap();

        store.conn.execute("DELETE FROM record_indexes", []).unwrap();
        assert!(store.list::<Widget>(&[Filter::eq("status", "open")]).unwrap().is_empty());

        assert_eq!(store.rebuild_indexes::<Widget>().unwrap(), 2);
        assert_eq!(store.list::<Widget>(&[Filter::eq("status", "open")]).unwrap().len(), 1);
    }

    #[test]
    fn test_flush_and_reopen() {
        let temp = tempdir().unwrap();
        {
            let mut store = Store::open(temp.path()).unwrap();
            store.create(Widget::new("persisted", "open", 1)).unwrap();
            store.flush().unwrap();
        }
        let store = Store::open(temp.path()).unwrap();
        assert!(store.get::<Widget>("persisted").unwrap().is_some());
    }
}
