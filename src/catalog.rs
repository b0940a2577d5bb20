//! The table registry. An explicit, shareable object rather than process
//! state: every engine instance owns its own catalog, so several engines
//! can coexist in one process (tests lean on this to simulate restarts).

use crate::error::{DbError, DbResult};
use crate::heap_file::HeapFile;
use crate::tuple::TupleDesc;
use crate::TableId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct TableEntry {
    file: Arc<HeapFile>,
    name: String,
}

#[derive(Default)]
pub struct Catalog {
    tables: RwLock<HashMap<TableId, TableEntry>>,
    names: RwLock<HashMap<String, TableId>>,
    next_table_id: AtomicU32,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    /// Hands out table ids for newly created tables.
    pub fn next_table_id(&self) -> TableId {
        self.next_table_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Registers a table under a name. A table re-registered under an
    /// existing name replaces the old binding, mirroring file overwrite
    /// semantics on disk.
    pub fn add_table(&self, file: Arc<HeapFile>, name: &str) {
        let id = file.table_id();
        let mut names = self.names.write();
        let mut tables = self.tables.write();
        if let Some(old) = names.insert(name.to_string(), id) {
            tables.remove(&old);
        }
        tables.insert(
            id,
            TableEntry {
                file,
                name: name.to_string(),
            },
        );
    }

    pub fn table_file(&self, id: TableId) -> DbResult<Arc<HeapFile>> {
        self.tables
            .read()
            .get(&id)
            .map(|entry| entry.file.clone())
            .ok_or(DbError::UnknownTable(id))
    }

    pub fn tuple_desc(&self, id: TableId) -> DbResult<TupleDesc> {
        Ok(self.table_file(id)?.desc().clone())
    }

    pub fn table_name(&self, id: TableId) -> DbResult<String> {
        self.tables
            .read()
            .get(&id)
            .map(|entry| entry.name.clone())
            .ok_or(DbError::UnknownTable(id))
    }

    pub fn table_id_for_name(&self, name: &str) -> DbResult<TableId> {
        self.names
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| DbError::InvalidOperation(format!("no table named {name}")))
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        self.tables.read().keys().copied().collect()
    }
}
