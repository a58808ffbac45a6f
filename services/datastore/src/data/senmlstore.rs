//! Embedded record storage on redb.
//!
//! All records live in one table keyed by `(stream, time, sequence)`. Times are
//! mapped onto `u64` so that key order equals numeric order, and the sequence
//! number keeps insertion order among records with equal times.

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::storage::{check_batch, Batches, DataStorage, TimeWindow};
use crate::error::{Error, Result};
use crate::registry::{DataStream, EventListener, ValueType};
use crate::senml::Record;

type RecordKey<'a> = (&'a str, u64, u64);

const RECORDS_TABLE: TableDefinition<RecordKey, &[u8]> = TableDefinition::new("records");
const STREAMS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("streams");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const SEQUENCE_KEY: &str = "sequence";
const DB_FILE: &str = "data.redb";

/// Value columns of a stored record
#[derive(Debug, Serialize, Deserialize)]
struct StoredValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    v: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vb: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    s: Option<f64>,
}

/// Map a float onto an unsigned integer with the same ordering
fn time_key(t: f64) -> u64 {
    let bits = t.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

fn key_time(key: u64) -> f64 {
    if key >> 63 == 1 {
        f64::from_bits(key & !(1 << 63))
    } else {
        f64::from_bits(!key)
    }
}

/// Record storage in an embedded database directory
///
/// redb transactions block, so every operation runs on the blocking pool.
pub struct SenmlStore {
    db: Arc<Database>,
}

impl SenmlStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| {
            Error::internal(format!("failed to create data directory {}: {e}", dir.display()))
        })?;
        let db = Database::create(dir.join(DB_FILE)).map_err(Error::backend)?;

        let txn = db.begin_write().map_err(Error::backend)?;
        txn.open_table(RECORDS_TABLE).map_err(Error::backend)?;
        txn.open_table(STREAMS_TABLE).map_err(Error::backend)?;
        txn.open_table(META_TABLE).map_err(Error::backend)?;
        txn.commit().map_err(Error::backend)?;

        info!(path = %dir.display(), "Opened embedded data storage");
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| Error::internal(format!("storage task failed: {e}")))?
    }
}

fn ensure_stream(db: &Database, name: &str) -> Result<()> {
    let txn = db.begin_read().map_err(Error::backend)?;
    let streams = txn.open_table(STREAMS_TABLE).map_err(Error::backend)?;
    if streams.get(name).map_err(Error::backend)?.is_none() {
        return Err(Error::internal(format!("no data table for stream '{name}'")));
    }
    Ok(())
}

/// Keys of a stream's records with time keys in `[from, to)`
fn keys_in(db: &Database, name: &str, from: u64, to: u64) -> Result<Vec<(u64, u64)>> {
    let txn = db.begin_read().map_err(Error::backend)?;
    let table = txn.open_table(RECORDS_TABLE).map_err(Error::backend)?;
    let mut keys = Vec::new();
    for entry in table
        .range((name, from, 0)..(name, to, 0))
        .map_err(Error::backend)?
    {
        let (key, _) = entry.map_err(Error::backend)?;
        let (_, t, seq) = key.value();
        keys.push((t, seq));
    }
    Ok(keys)
}

fn stream_keys(db: &Database, name: &str) -> Result<Vec<(u64, u64)>> {
    let txn = db.begin_read().map_err(Error::backend)?;
    let table = txn.open_table(RECORDS_TABLE).map_err(Error::backend)?;
    let mut keys = Vec::new();
    for entry in table
        .range((name, 0, 0)..=(name, u64::MAX, u64::MAX))
        .map_err(Error::backend)?
    {
        let (key, _) = entry.map_err(Error::backend)?;
        let (_, t, seq) = key.value();
        keys.push((t, seq));
    }
    Ok(keys)
}

fn remove_keys(db: &Database, name: &str, keys: &[(u64, u64)], drop_stream: bool) -> Result<()> {
    let txn = db.begin_write().map_err(Error::backend)?;
    {
        let mut table = txn.open_table(RECORDS_TABLE).map_err(Error::backend)?;
        for (t, seq) in keys {
            table.remove((name, *t, *seq)).map_err(Error::backend)?;
        }
        if drop_stream {
            let mut streams = txn.open_table(STREAMS_TABLE).map_err(Error::backend)?;
            streams.remove(name).map_err(Error::backend)?;
        }
    }
    txn.commit().map_err(Error::backend)
}

fn insert_batch(db: &Database, name: &str, records: &[Record]) -> Result<()> {
    ensure_stream(db, name)?;
    let txn = db.begin_write().map_err(Error::backend)?;
    {
        let mut meta = txn.open_table(META_TABLE).map_err(Error::backend)?;
        let mut sequence = meta
            .get(SEQUENCE_KEY)
            .map_err(Error::backend)?
            .map(|v| v.value())
            .unwrap_or(0);

        let mut table = txn.open_table(RECORDS_TABLE).map_err(Error::backend)?;
        for r in records {
            let stored = StoredValue {
                v: r.value,
                vs: r.string_value.clone(),
                vb: r.bool_value,
                vd: r.data_value.clone(),
                s: r.sum,
            };
            let encoded = serde_json::to_vec(&stored)?;
            sequence += 1;
            table
                .insert((name, time_key(r.time), sequence), encoded.as_slice())
                .map_err(Error::backend)?;
        }
        meta.insert(SEQUENCE_KEY, sequence).map_err(Error::backend)?;
    }
    txn.commit().map_err(Error::backend)
}

fn read_records(
    db: &Database,
    stream: &DataStream,
    window: TimeWindow,
    limit: usize,
    offset: usize,
) -> Result<Vec<Record>> {
    ensure_stream(db, &stream.name)?;
    let txn = db.begin_read().map_err(Error::backend)?;
    let table = txn.open_table(RECORDS_TABLE).map_err(Error::backend)?;
    let name = stream.name.as_str();
    let range = table
        .range((name, time_key(window.from), 0)..(name, time_key(window.to), 0))
        .map_err(Error::backend)?;

    let entries: Box<dyn Iterator<Item = _> + '_> = if window.sort_asc {
        Box::new(range)
    } else {
        Box::new(range.rev())
    };

    let mut records = Vec::with_capacity(limit.min(1024));
    for entry in entries.skip(offset).take(limit) {
        let (key, value) = entry.map_err(Error::backend)?;
        let (_, t, _) = key.value();
        let stored: StoredValue = serde_json::from_slice(value.value())?;
        let mut record = Record {
            name: stream.name.clone(),
            unit: stream.unit.clone(),
            time: key_time(t),
            sum: stored.s,
            ..Record::default()
        };
        match stream.value_type {
            ValueType::Float => record.value = stored.v,
            ValueType::String => record.string_value = stored.vs,
            ValueType::Bool => record.bool_value = stored.vb,
            ValueType::Data => record.data_value = stored.vd,
        }
        records.push(record);
    }
    Ok(records)
}

#[async_trait]
impl EventListener for SenmlStore {
    fn name(&self) -> &'static str {
        "senml-data-storage"
    }

    async fn on_create(&self, stream: &DataStream) -> Result<()> {
        let (name, value_type) = (stream.name.clone(), stream.value_type);
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(Error::backend)?;
            {
                let mut streams = txn.open_table(STREAMS_TABLE).map_err(Error::backend)?;
                streams
                    .insert(name.as_str(), value_type.as_str())
                    .map_err(Error::backend)?;
            }
            txn.commit().map_err(Error::backend)
        })
        .await?;
        debug!(stream = %stream.name, "Created data table");
        Ok(())
    }

    async fn on_update(&self, _old: &DataStream, _new: &DataStream) -> Result<()> {
        Ok(())
    }

    async fn on_delete(&self, old: &DataStream) -> Result<()> {
        let name = old.name.clone();
        self.blocking(move |db| {
            let keys = stream_keys(db, &name)?;
            remove_keys(db, &name, &keys, true)
        })
        .await?;
        debug!(stream = %old.name, "Dropped data table");
        Ok(())
    }
}

#[async_trait]
impl DataStorage for SenmlStore {
    #[instrument(skip_all, fields(streams = batches.len()))]
    async fn submit(&self, batches: &Batches, streams: &HashMap<String, DataStream>) -> Result<()> {
        for (name, records) in batches {
            let stream = streams
                .get(name)
                .ok_or_else(|| Error::internal(format!("no stream given for batch '{name}'")))?;
            check_batch(stream, records)?;

            let (batch_name, batch) = (name.clone(), records.clone());
            self.blocking(move |db| insert_batch(db, &batch_name, &batch))
                .await?;
            debug!(stream = %name, records = records.len(), "Stored batch");
        }
        Ok(())
    }

    async fn fetch(
        &self,
        stream: &DataStream,
        window: TimeWindow,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Record>> {
        let stream = stream.clone();
        self.blocking(move |db| read_records(db, &stream, window, limit, offset))
            .await
    }

    async fn count_stream(&self, stream: &DataStream, window: TimeWindow) -> Result<usize> {
        let name = stream.name.clone();
        self.blocking(move |db| {
            ensure_stream(db, &name)?;
            let txn = db.begin_read().map_err(Error::backend)?;
            let table = txn.open_table(RECORDS_TABLE).map_err(Error::backend)?;
            let range = table
                .range((name.as_str(), time_key(window.from), 0)..(name.as_str(), time_key(window.to), 0))
                .map_err(Error::backend)?;
            Ok(range.count())
        })
        .await
    }

    async fn delete(&self, streams: &[DataStream], window: TimeWindow) -> Result<()> {
        let names: Vec<String> = streams.iter().map(|s| s.name.clone()).collect();
        self.blocking(move |db| {
            for name in &names {
                ensure_stream(db, name)?;
                let keys = keys_in(db, name, time_key(window.from), time_key(window.to))?;
                remove_keys(db, name, &keys, false)?;
            }
            Ok(())
        })
        .await
    }
}
