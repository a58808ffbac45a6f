//! Data controller: submission, queries and live subscriptions.

use futures::stream::{Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, instrument, warn};

use super::storage::{Batches, DataStorage, Query, TimeWindow};
use crate::error::{Error, Result};
use crate::pagination::validate_per_item_limit;
use crate::registry::{DataStream, RegistryController};
use crate::senml::{self, Pack, Record, MAX_RECORD_TIME};

/// Capacity of the live feed before slow subscribers start lagging
const FEED_CAPACITY: usize = 1024;

/// Outcome of an accepted submission
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitReceipt {
    /// Number of records written
    pub records: usize,
    /// Streams that received records, in name order
    pub streams: Vec<String>,
    /// Streams created on the fly for this submission
    pub registered: Vec<String>,
}

pub struct DataController {
    registry: Arc<RegistryController>,
    storage: Arc<dyn DataStorage>,
    auto_registration: bool,
    feed: broadcast::Sender<Arc<Batches>>,
}

impl DataController {
    pub fn new(
        registry: Arc<RegistryController>,
        storage: Arc<dyn DataStorage>,
        auto_registration: bool,
    ) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            registry,
            storage,
            auto_registration,
            feed,
        }
    }

    pub fn storage(&self) -> &Arc<dyn DataStorage> {
        &self.storage
    }

    /// Sender side of the live feed, for other ingestion paths
    pub fn feed(&self) -> broadcast::Sender<Arc<Batches>> {
        self.feed.clone()
    }

    /// Normalize, resolve and store a pack.
    ///
    /// With `ids`, every record must belong to one of the listed streams;
    /// otherwise streams are looked up by record name and, if enabled,
    /// registered on first sight.
    #[instrument(skip(self, pack), fields(records = pack.len()))]
    pub async fn submit(&self, pack: &[Record], ids: Option<&[String]>) -> Result<SubmitReceipt> {
        let records = senml::normalize(pack)?;

        let mut streams: HashMap<String, DataStream> = HashMap::new();
        if let Some(ids) = ids {
            for id in ids {
                let stream = self.registry.get(id).await?;
                streams.insert(id.clone(), stream);
            }
        }

        let mut receipt = SubmitReceipt::default();
        let mut batches = Batches::new();
        for record in records {
            if record.time > MAX_RECORD_TIME {
                return Err(Error::bad_request(format!(
                    "the time of senml entry {} is beyond the year 3000",
                    record.name
                )));
            }

            if !streams.contains_key(&record.name) {
                if ids.is_some() {
                    return Err(Error::bad_request(format!(
                        "senml entry {} does not match the provided time series",
                        record.name
                    )));
                }
                let (stream, created) = self.resolve(&record).await?;
                if created {
                    receipt.registered.push(stream.name.clone());
                }
                streams.insert(record.name.clone(), stream);
            }
            let stream = &streams[&record.name];

            record.check_type(stream.value_type)?;
            if !record.unit.is_empty() && record.unit != stream.unit {
                return Err(Error::bad_request(format!(
                    "unit mismatch for senml entry {}: got '{}', time series has '{}'",
                    record.name, record.unit, stream.unit
                )));
            }
            batches.entry(record.name.clone()).or_default().push(record);
        }

        self.storage
            .submit(&batches, &streams)
            .await
            .map_err(|e| Error::internal(format!("error writing data to the database: {e}")))?;

        receipt.records = batches.values().map(Vec::len).sum();
        receipt.streams = batches.keys().cloned().collect();
        metrics::counter!("hds.data.records.ingested").increment(receipt.records as u64);
        debug!(records = receipt.records, streams = receipt.streams.len(), "Stored pack");

        // nobody listening is fine
        let _ = self.feed.send(Arc::new(batches));
        Ok(receipt)
    }

    /// Look up the stream of a record, registering it when allowed
    async fn resolve(&self, record: &Record) -> Result<(DataStream, bool)> {
        match self.registry.get(&record.name).await {
            Ok(stream) => Ok((stream, false)),
            Err(e) if e.is_not_found() => {
                if !self.auto_registration {
                    return Err(Error::not_found(format!(
                        "Time series with name {} is not registered.",
                        record.name
                    )));
                }
                let value_type = record.inferred_type().ok_or_else(|| {
                    Error::bad_request(format!(
                        "cannot infer the value type of senml entry {}",
                        record.name
                    ))
                })?;
                let stream = DataStream::new(record.name.clone(), value_type)
                    .with_unit(record.unit.clone());
                match self.registry.add(stream).await {
                    Ok(added) => {
                        info!(stream = %added.name, value_type = %added.value_type, "Auto-registered stream");
                        Ok((added, true))
                    }
                    // registered concurrently by another submission
                    Err(e) if e.is_conflict() => Ok((self.registry.get(&record.name).await?, false)),
                    Err(e) => Err(Error::bad_request(format!(
                        "error registering time series {}: {}",
                        record.name,
                        e.message()
                    ))),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve stream names, skipping the ones that do not exist
    async fn resolve_existing(&self, ids: &[String]) -> Result<Vec<DataStream>> {
        let mut streams = Vec::with_capacity(ids.len());
        for id in ids {
            match self.registry.get(id).await {
                Ok(stream) => streams.push(stream),
                Err(e) if e.is_not_found() => debug!(stream = %id, "Skipping unknown stream"),
                Err(e) => return Err(e),
            }
        }
        if streams.is_empty() {
            return Err(Error::not_found(
                "None of the specified time series could be retrieved from the registry.",
            ));
        }
        Ok(streams)
    }

    /// Query one page and compact it according to the query's mask
    #[instrument(skip(self, q), fields(page = q.page, per_page = q.per_page))]
    pub async fn query(&self, q: &Query, ids: &[String]) -> Result<(Pack, Option<usize>)> {
        let streams = self.resolve_existing(ids).await?;
        validate_per_item_limit(q.limit, q.per_page, streams.len())?;

        let started = Instant::now();
        let (records, total) = self
            .storage
            .query(q, &streams)
            .await
            .map_err(|e| Error::internal(format!("error retrieving data from the database: {e}")))?;
        metrics::histogram!("hds.data.query.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        Ok((senml::compact(records, q.denormalize), total))
    }

    /// Number of records in the query window across the listed streams
    #[instrument(skip(self, q))]
    pub async fn count(&self, q: &Query, ids: &[String]) -> Result<usize> {
        let streams = self.resolve_existing(ids).await?;
        self.storage
            .count(q, &streams)
            .await
            .map_err(|e| Error::internal(format!("error counting data in the database: {e}")))
    }

    /// Remove the records of every listed stream inside the window
    #[instrument(skip(self))]
    pub async fn delete(&self, ids: &[String], window: TimeWindow) -> Result<()> {
        let mut streams = Vec::with_capacity(ids.len());
        for id in ids {
            streams.push(self.registry.get(id).await?);
        }
        let window = TimeWindow {
            from: window.from.max(0.0),
            ..window
        };
        if window.is_empty() {
            return Ok(());
        }
        self.storage
            .delete(&streams, window)
            .await
            .map_err(|e| Error::internal(format!("error deleting data from the database: {e}")))?;
        info!(streams = streams.len(), from = window.from, to = window.to, "Deleted records");
        Ok(())
    }

    /// Live feed of records accepted from now on for the named streams.
    ///
    /// Every name must be registered. Records missed by a lagging subscriber
    /// are skipped.
    pub async fn subscribe(&self, names: &[String]) -> Result<impl Stream<Item = Record> + Send + 'static> {
        for name in names {
            self.registry.get(name).await?;
        }
        let wanted: HashSet<String> = names.iter().cloned().collect();
        let feed = BroadcastStream::new(self.feed.subscribe());

        Ok(feed
            .filter_map(|batches| async move {
                match batches {
                    Ok(batches) => Some(batches),
                    Err(e) => {
                        warn!(error = %e, "Subscriber lagging behind live feed");
                        None
                    }
                }
            })
            .flat_map(move |batches| {
                let records: Vec<Record> = batches
                    .iter()
                    .filter(|(name, _)| wanted.contains(*name))
                    .flat_map(|(_, records)| records.iter().cloned())
                    .collect();
                futures::stream::iter(records)
            }))
    }
}
