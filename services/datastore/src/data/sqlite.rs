//! SQLite record storage: one table per stream.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info, instrument};

use super::storage::{check_batch, Batches, DataStorage, TimeWindow};
use crate::error::{Error, Result};
use crate::registry::{DataStream, EventListener, ValueType};
use crate::senml::Record;

/// Rows per INSERT statement
const INSERT_BATCH_SIZE: usize = 100;

/// Record storage backed by an SQLite database
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open the database at `dsn`; a bare path or `:memory:` is accepted
    pub async fn connect(dsn: &str) -> Result<Self> {
        let in_memory = dsn.contains(":memory:") || dsn.contains("mode=memory");
        let url = if dsn.starts_with("sqlite:") {
            dsn.to_string()
        } else if dsn == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{dsn}")
        };

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| Error::internal(format!("invalid sqlite DSN '{dsn}': {e}")))?
            .create_if_missing(true);
        if !in_memory {
            let filename = options.clone().get_filename();
            if let Some(parent) = filename.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        Error::internal(format!("failed to create {}: {e}", parent.display()))
                    })?;
                }
            }
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // an in-memory database lives only as long as its single connection
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| Error::internal(format!("failed to open sqlite database: {e}")))?;

        info!(dsn = %dsn, "Connected to SQLite data storage");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn table_name(stream: &str) -> String {
    quote_ident(stream)
}

/// Stream names start with an alphanumeric, so the prefix keeps index names
/// out of the table namespace
fn index_name(stream: &str) -> String {
    quote_ident(&format!("_idx:{stream}"))
}

fn column_type(value_type: ValueType) -> &'static str {
    match value_type {
        ValueType::Float => "REAL",
        ValueType::String | ValueType::Data => "TEXT",
        ValueType::Bool => "INTEGER",
    }
}

fn order(window: TimeWindow) -> &'static str {
    if window.sort_asc {
        "ORDER BY time ASC, rowid ASC"
    } else {
        "ORDER BY time DESC, rowid DESC"
    }
}

#[async_trait]
impl EventListener for SqliteStorage {
    fn name(&self) -> &'static str {
        "sqlite-data-storage"
    }

    #[instrument(skip(self, stream), fields(stream = %stream.name))]
    async fn on_create(&self, stream: &DataStream) -> Result<()> {
        let table = table_name(&stream.name);
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (time REAL NOT NULL, value {}, sum REAL)",
            column_type(stream.value_type)
        );
        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::internal(format!("error creating table for '{}': {e}", stream.name)))?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {table} (time)",
            index_name(&stream.name)
        );
        sqlx::query(&index)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::internal(format!("error creating index for '{}': {e}", stream.name)))?;

        debug!("Created data table");
        Ok(())
    }

    async fn on_update(&self, _old: &DataStream, _new: &DataStream) -> Result<()> {
        Ok(())
    }

    #[instrument(skip(self, old), fields(stream = %old.name))]
    async fn on_delete(&self, old: &DataStream) -> Result<()> {
        let drop = format!("DROP TABLE IF EXISTS {}", table_name(&old.name));
        sqlx::query(&drop)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::internal(format!("error dropping table for '{}': {e}", old.name)))?;
        debug!("Dropped data table");
        Ok(())
    }
}

#[async_trait]
impl DataStorage for SqliteStorage {
    #[instrument(skip_all, fields(streams = batches.len()))]
    async fn submit(&self, batches: &Batches, streams: &HashMap<String, DataStream>) -> Result<()> {
        for (name, records) in batches {
            let stream = streams
                .get(name)
                .ok_or_else(|| Error::internal(format!("no stream given for batch '{name}'")))?;
            check_batch(stream, records)?;
            if records.is_empty() {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            for chunk in records.chunks(INSERT_BATCH_SIZE) {
                let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                    "INSERT INTO {} (time, value, sum) ",
                    table_name(name)
                ));
                builder.push_values(chunk, |mut row, r| {
                    row.push_bind(r.time);
                    match stream.value_type {
                        ValueType::Float => row.push_bind(r.value),
                        ValueType::String => row.push_bind(r.string_value.clone()),
                        ValueType::Bool => row.push_bind(r.bool_value.map(i64::from)),
                        ValueType::Data => row.push_bind(r.data_value.clone()),
                    };
                    row.push_bind(r.sum);
                });
                builder.build().execute(&mut *tx).await.map_err(|e| {
                    Error::internal(format!("error writing data for '{name}': {e}"))
                })?;
            }
            tx.commit().await?;
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
        let sql = format!(
            "SELECT time, value, sum FROM {} WHERE time >= ? AND time < ? {} LIMIT ? OFFSET ?",
            table_name(&stream.name),
            order(window)
        );
        let rows = sqlx::query(&sql)
            .bind(window.from)
            .bind(window.to)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::internal(format!("error querying '{}': {e}", stream.name)))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let mut record = Record {
                name: stream.name.clone(),
                unit: stream.unit.clone(),
                time: row.try_get("time")?,
                sum: row.try_get("sum")?,
                ..Record::default()
            };
            match stream.value_type {
                ValueType::Float => record.value = row.try_get("value")?,
                ValueType::String => record.string_value = row.try_get("value")?,
                ValueType::Bool => {
                    let raw: Option<i64> = row.try_get("value")?;
                    record.bool_value = raw.map(|v| v != 0);
                }
                ValueType::Data => record.data_value = row.try_get("value")?,
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn count_stream(&self, stream: &DataStream, window: TimeWindow) -> Result<usize> {
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE time >= ? AND time < ?",
            table_name(&stream.name)
        );
        let count: i64 = sqlx::query(&sql)
            .bind(window.from)
            .bind(window.to)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::internal(format!("error counting '{}': {e}", stream.name)))?
            .try_get("n")?;
        Ok(count as usize)
    }

    #[instrument(skip_all, fields(streams = streams.len()))]
    async fn delete(&self, streams: &[DataStream], window: TimeWindow) -> Result<()> {
        for stream in streams {
            let sql = format!(
                "DELETE FROM {} WHERE time >= ? AND time < ?",
                table_name(&stream.name)
            );
            sqlx::query(&sql)
                .bind(window.from)
                .bind(window.to)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    Error::internal(format!("error deleting data of '{}': {e}", stream.name))
                })?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Closed SQLite data storage");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::storage::Query;

    async fn storage_with(streams: &[DataStream]) -> SqliteStorage {
        let storage = SqliteStorage::connect(":memory:").await.unwrap();
        for s in streams {
            storage.on_create(s).await.unwrap();
        }
        storage
    }

    fn float(name: &str, t: f64, v: f64) -> Record {
        Record {
            name: name.into(),
            time: t,
            value: Some(v),
            ..Record::default()
        }
    }

    fn stream_map(streams: &[DataStream]) -> HashMap<String, DataStream> {
        streams.iter().map(|s| (s.name.clone(), s.clone())).collect()
    }

    fn window(from: f64, to: f64) -> Query {
        Query {
            from,
            to,
            sort_asc: true,
            ..Query::default()
        }
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("room/temp"), "\"room/temp\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[tokio::test]
    async fn test_submit_and_query_typed_values() {
        let streams = vec![
            DataStream::new("temp", ValueType::Float).with_unit("Cel"),
            DataStream::new("switch", ValueType::Bool),
            DataStream::new("label", ValueType::String),
        ];
        let storage = storage_with(&streams).await;

        let mut batches = Batches::new();
        batches.insert("temp".into(), vec![float("temp", 10.0, 1.5), float("temp", 11.0, 2.5)]);
        batches.insert(
            "switch".into(),
            vec![Record {
                name: "switch".into(),
                time: 10.0,
                bool_value: Some(true),
                ..Record::default()
            }],
        );
        batches.insert(
            "label".into(),
            vec![Record {
                name: "label".into(),
                time: 12.0,
                string_value: Some("hello".into()),
                ..Record::default()
            }],
        );
        storage.submit(&batches, &stream_map(&streams)).await.unwrap();

        let (pack, total) = storage.query(&window(0.0, 100.0), &streams[..1]).await.unwrap();
        assert_eq!(total, None);
        assert_eq!(pack.len(), 2);
        assert_eq!(pack[0].value, Some(1.5));
        assert_eq!(pack[0].unit, "Cel");

        let (pack, _) = storage.query(&window(0.0, 100.0), &streams[1..2]).await.unwrap();
        assert_eq!(pack[0].bool_value, Some(true));

        let (pack, _) = storage.query(&window(0.0, 100.0), &streams[2..]).await.unwrap();
        assert_eq!(pack[0].string_value.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_window_is_half_open() {
        let streams = vec![DataStream::new("a", ValueType::Float)];
        let storage = storage_with(&streams).await;
        let mut batches = Batches::new();
        batches.insert(
            "a".into(),
            (0..10).map(|i| float("a", f64::from(i), f64::from(i))).collect(),
        );
        storage.submit(&batches, &stream_map(&streams)).await.unwrap();

        let q = Query {
            count: true,
            ..window(2.0, 5.0)
        };
        let (pack, total) = storage.query(&q, &streams).await.unwrap();
        assert_eq!(total, Some(3));
        let times: Vec<_> = pack.iter().map(|r| r.time).collect();
        assert_eq!(times, [2.0, 3.0, 4.0]);

        let empty = storage.query(&window(5.0, 2.0), &streams).await.unwrap();
        assert!(empty.0.is_empty());
    }

    #[tokio::test]
    async fn test_per_item_pages() {
        let streams = vec![
            DataStream::new("a", ValueType::Float),
            DataStream::new("b", ValueType::Float),
        ];
        let storage = storage_with(&streams).await;
        let mut batches = Batches::new();
        batches.insert("a".into(), (0..5).map(|i| float("a", f64::from(i), 0.0)).collect());
        batches.insert("b".into(), (0..3).map(|i| float("b", f64::from(i), 0.0)).collect());
        storage.submit(&batches, &stream_map(&streams)).await.unwrap();

        let q = Query {
            per_page: 4,
            page: 1,
            ..window(0.0, 100.0)
        };
        let (pack, _) = storage.query(&q, &streams).await.unwrap();
        assert_eq!(pack.iter().filter(|r| r.name == "a").count(), 2);
        assert_eq!(pack.iter().filter(|r| r.name == "b").count(), 2);

        let q = Query { page: 2, ..q };
        let (pack, _) = storage.query(&q, &streams).await.unwrap();
        assert_eq!(pack.iter().filter(|r| r.name == "a").count(), 2);
        assert_eq!(pack.iter().filter(|r| r.name == "b").count(), 1);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_internal() {
        let streams = vec![DataStream::new("a", ValueType::Bool)];
        let storage = storage_with(&streams).await;
        let mut batches = Batches::new();
        batches.insert("a".into(), vec![float("a", 1.0, 1.0)]);
        let err = storage.submit(&batches, &stream_map(&streams)).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_delete_and_drop() {
        let streams = vec![DataStream::new("a", ValueType::Float)];
        let storage = storage_with(&streams).await;
        let mut batches = Batches::new();
        batches.insert("a".into(), (0..4).map(|i| float("a", f64::from(i), 0.0)).collect());
        storage.submit(&batches, &stream_map(&streams)).await.unwrap();

        storage
            .delete(&streams, window(0.0, 2.0).window())
            .await
            .unwrap();
        assert_eq!(storage.count(&window(0.0, 100.0), &streams).await.unwrap(), 2);

        storage.on_delete(&streams[0]).await.unwrap();
        assert!(storage.count(&window(0.0, 100.0), &streams).await.is_err());
    }

    #[tokio::test]
    async fn test_index_names_do_not_clash_with_streams() {
        let first = DataStream::new("a", ValueType::Float);
        let second = DataStream::new("a_time_idx", ValueType::Float);
        storage_with(&[first.clone(), second.clone()]).await;
        storage_with(&[second, first]).await;
    }

    #[tokio::test]
    async fn test_connect_creates_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.db");
        let storage = SqliteStorage::connect(path.to_str().unwrap()).await.unwrap();

        let streams = vec![DataStream::new("temp", ValueType::Float)];
        storage.on_create(&streams[0]).await.unwrap();
        let mut batches = Batches::new();
        batches.insert("temp".into(), vec![float("temp", 1.0, 2.0)]);
        storage.submit(&batches, &stream_map(&streams)).await.unwrap();
        storage.close().await;
        assert!(path.exists());

        let reopened = SqliteStorage::connect(path.to_str().unwrap()).await.unwrap();
        assert_eq!(reopened.count(&window(0.0, 10.0), &streams).await.unwrap(), 1);
    }
}
