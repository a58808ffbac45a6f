//! Persistent registry backend on an embedded redb database.

use redb::{Database, ReadableTable, TableDefinition};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::storage::StreamBackend;
use super::stream::DataStream;
use crate::error::{Error, Result};

const STREAMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("streams");

const DB_FILE: &str = "registry.redb";

/// Streams keyed by name, values in their full stored encoding
pub struct RedbBackend {
    db: Database,
    db_path: PathBuf,
}

impl RedbBackend {
    /// Open (or create) the database inside the directory `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| {
            Error::internal(format!("failed to create registry directory {}: {e}", dir.display()))
        })?;
        let db_path = dir.join(DB_FILE);
        let db = Database::create(&db_path).map_err(Error::backend)?;

        let txn = db.begin_write().map_err(Error::backend)?;
        txn.open_table(STREAMS_TABLE).map_err(Error::backend)?;
        txn.commit().map_err(Error::backend)?;

        info!(path = %db_path.display(), "Opened registry database");
        Ok(Self { db, db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }
}

impl StreamBackend for RedbBackend {
    fn get(&self, name: &str) -> Result<Option<DataStream>> {
        let txn = self.db.begin_read().map_err(Error::backend)?;
        let table = txn.open_table(STREAMS_TABLE).map_err(Error::backend)?;
        let entry = table.get(name).map_err(Error::backend)?;
        entry
            .map(|raw| DataStream::from_stored_json(raw.value()))
            .transpose()
    }

    fn put(&self, stream: &DataStream) -> Result<()> {
        let encoded = stream.to_stored_json()?;
        let txn = self.db.begin_write().map_err(Error::backend)?;
        {
            let mut table = txn.open_table(STREAMS_TABLE).map_err(Error::backend)?;
            table
                .insert(stream.name.as_str(), encoded.as_slice())
                .map_err(Error::backend)?;
        }
        txn.commit().map_err(Error::backend)
    }

    fn remove(&self, name: &str) -> Result<bool> {
        let txn = self.db.begin_write().map_err(Error::backend)?;
        let removed = {
            let mut table = txn.open_table(STREAMS_TABLE).map_err(Error::backend)?;
            let removed = table.remove(name).map_err(Error::backend)?;
            removed.is_some()
        };
        txn.commit().map_err(Error::backend)?;
        Ok(removed)
    }

    fn count(&self) -> Result<usize> {
        let txn = self.db.begin_read().map_err(Error::backend)?;
        let table = txn.open_table(STREAMS_TABLE).map_err(Error::backend)?;
        let iter = table.range::<&str>(..).map_err(Error::backend)?;
        Ok(iter.count())
    }

    fn range(&self, offset: usize, limit: usize) -> Result<Vec<DataStream>> {
        let txn = self.db.begin_read().map_err(Error::backend)?;
        let table = txn.open_table(STREAMS_TABLE).map_err(Error::backend)?;
        let mut streams = Vec::with_capacity(limit.min(128));
        for entry in table
            .range::<&str>(..)
            .map_err(Error::backend)?
            .skip(offset)
            .take(limit)
        {
            let (_, value) = entry.map_err(Error::backend)?;
            streams.push(DataStream::from_stored_json(value.value())?);
        }
        Ok(streams)
    }

    fn scan(&self, visit: &mut dyn FnMut(DataStream) -> bool) -> Result<()> {
        let txn = self.db.begin_read().map_err(Error::backend)?;
        let table = txn.open_table(STREAMS_TABLE).map_err(Error::backend)?;
        for entry in table.range::<&str>(..).map_err(Error::backend)? {
            let (_, value) = entry.map_err(Error::backend)?;
            if !visit(DataStream::from_stored_json(value.value())?) {
                break;
            }
        }
        Ok(())
    }
}
