//! Registry storage: a name-ordered map of streams with listener fan-out.
//!
//! Backends only provide ordered key-value primitives. [`RegistryStorage`]
//! serializes writers, dispatches registry events to the listeners while the
//! writer lock is held, and rolls a create back when a listener rejects it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument};

use super::events::{EventListener, EventListeners};
use super::filter::Filter;
use super::stream::DataStream;
use super::validation::validate_update;
use crate::error::{Error, Result};
use crate::pagination::{page_range, validate_paging};

/// Upper bound for `per_page` on registry listings
pub const MAX_PER_PAGE: usize = 100;

/// Ordered key-value primitives implemented by registry backends
pub trait StreamBackend: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<DataStream>>;

    /// Insert or replace
    fn put(&self, stream: &DataStream) -> Result<()>;

    /// Returns whether an entry was removed
    fn remove(&self, name: &str) -> Result<bool>;

    fn count(&self) -> Result<usize>;

    /// Entries in ascending name order, skipping `offset`, at most `limit`
    fn range(&self, offset: usize, limit: usize) -> Result<Vec<DataStream>>;

    /// Visit entries in ascending name order until `visit` returns false
    fn scan(&self, visit: &mut dyn FnMut(DataStream) -> bool) -> Result<()>;
}

/// Registry storage shared by the controller, the connector and the surfaces
pub struct RegistryStorage {
    backend: Arc<dyn StreamBackend>,
    /// Held for the whole of a mutation, listener fan-out included
    write_lock: Mutex<()>,
    listeners: RwLock<EventListeners>,
    last_modified: RwLock<DateTime<Utc>>,
}

impl RegistryStorage {
    pub fn new(backend: Arc<dyn StreamBackend>) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
            listeners: RwLock::new(EventListeners::new()),
            last_modified: RwLock::new(Utc::now()),
        }
    }

    /// Append a listener; listeners run in the order they were added
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    fn listeners(&self) -> EventListeners {
        self.listeners.read().clone()
    }

    fn touch(&self) {
        *self.last_modified.write() = Utc::now();
    }

    #[instrument(skip(self, stream), fields(stream = %stream.name))]
    pub async fn add(&self, mut stream: DataStream) -> Result<DataStream> {
        let _guard = self.write_lock.lock().await;

        if self.backend.get(&stream.name)?.is_some() {
            return Err(Error::conflict(format!(
                "stream with name '{}' already exists",
                stream.name
            )));
        }

        let now = Utc::now();
        stream.created_at = Some(now);
        stream.updated_at = Some(now);
        self.backend.put(&stream)?;

        if let Err(err) = self.listeners().created(&stream).await {
            error!(error = %err, "Create listener failed, rolling back");
            return match self.backend.remove(&stream.name) {
                Ok(_) => Err(err),
                Err(rollback) => Err(Error::internal(format!(
                    "{err}; additionally, rolling back the registry entry failed: {rollback}"
                ))),
            };
        }

        self.touch();
        debug!("Stream added");
        Ok(stream)
    }

    #[instrument(skip(self, stream))]
    pub async fn update(&self, name: &str, stream: DataStream) -> Result<DataStream> {
        let _guard = self.write_lock.lock().await;

        let old = self
            .backend
            .get(name)?
            .ok_or_else(|| Error::not_found(format!("stream '{name}' is not found")))?;
        validate_update(&old, &stream)?;

        let mut merged = old.clone();
        merged.source = stream.source;
        merged.meta = stream.meta;
        merged.unit = stream.unit;
        merged.retention = stream.retention;
        merged.updated_at = Some(Utc::now());

        self.listeners().updated(&old, &merged).await?;
        self.backend.put(&merged)?;

        self.touch();
        debug!("Stream updated");
        Ok(merged)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let old = self
            .backend
            .get(name)?
            .ok_or_else(|| Error::not_found(format!("stream '{name}' is not found")))?;

        self.listeners().deleted(&old).await?;
        self.backend.remove(name)?;

        self.touch();
        debug!("Stream deleted");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<DataStream> {
        self.backend
            .get(name)?
            .ok_or_else(|| Error::not_found(format!("stream '{name}' is not found")))
    }

    /// One page of streams in name order, with the total number of streams
    pub async fn get_many(&self, page: usize, per_page: usize) -> Result<(Vec<DataStream>, usize)> {
        validate_paging(page, per_page, MAX_PER_PAGE)?;
        let total = self.backend.count()?;
        let range = page_range(page, per_page, total);
        let streams = self.backend.range(range.start, range.len())?;
        Ok((streams, total))
    }

    pub async fn filter_one(&self, filter: &Filter) -> Result<Option<DataStream>> {
        let mut found = None;
        self.backend.scan(&mut |stream| {
            if filter.matches(&stream) {
                found = Some(stream);
                false
            } else {
                true
            }
        })?;
        Ok(found)
    }

    pub async fn filter(
        &self,
        filter: &Filter,
        page: usize,
        per_page: usize,
    ) -> Result<(Vec<DataStream>, usize)> {
        validate_paging(page, per_page, MAX_PER_PAGE)?;
        let mut matches = Vec::new();
        self.backend.scan(&mut |stream| {
            if filter.matches(&stream) {
                matches.push(stream);
            }
            true
        })?;
        let total = matches.len();
        let range = page_range(page, per_page, total);
        let streams = matches.drain(range).collect();
        Ok((streams, total))
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        *self.last_modified.read()
    }
}
