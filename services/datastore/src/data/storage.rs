//! Storage contract for SenML records.
//!
//! Backends implement the per-stream primitives; multi-stream queries, per-item
//! pagination, merging and counting are shared by every backend.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::pagination::per_item_pagination;
use crate::registry::{DataStream, EventListener};
use crate::senml::{self, DenormMask, Pack, Record};

/// Upper bound for `per_page` on data queries
pub const MAX_PER_PAGE: usize = 1000;

/// Bound on a single query against the backend
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Records grouped by stream name, in submission order within each stream
pub type Batches = BTreeMap<String, Vec<Record>>;

/// Half-open time window `[from, to)` in seconds since the epoch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeWindow {
    pub from: f64,
    pub to: f64,
    pub sort_asc: bool,
}

impl TimeWindow {
    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }
}

/// Data query over one or more streams
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Inclusive start, seconds since the epoch
    pub from: f64,
    /// Exclusive end, seconds since the epoch
    pub to: f64,
    pub sort_asc: bool,
    /// Cap on the number of records across all pages
    pub limit: Option<usize>,
    /// 1-based page number
    pub page: usize,
    pub per_page: usize,
    pub denormalize: DenormMask,
    /// Report the number of records in the window
    pub count: bool,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            from: 0.0,
            to: senml::now_secs(),
            sort_asc: false,
            limit: None,
            page: 1,
            per_page: 100,
            denormalize: DenormMask::NONE,
            count: false,
        }
    }
}

impl Query {
    /// Window with the start clamped to the epoch
    pub fn window(&self) -> TimeWindow {
        TimeWindow {
            from: self.from.max(0.0),
            to: self.to,
            sort_asc: self.sort_asc,
        }
    }
}

/// Record storage; also a registry listener that owns per-stream tables
#[async_trait]
pub trait DataStorage: EventListener {
    /// Insert every batch; each stream's batch is atomic, and the first
    /// failing stream aborts the remaining ones
    async fn submit(&self, batches: &Batches, streams: &HashMap<String, DataStream>) -> Result<()>;

    /// Records of one stream in the window, already resolved and ordered
    async fn fetch(
        &self,
        stream: &DataStream,
        window: TimeWindow,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Record>>;

    async fn count_stream(&self, stream: &DataStream, window: TimeWindow) -> Result<usize>;

    /// Remove the records of `streams` inside the window
    async fn delete(&self, streams: &[DataStream], window: TimeWindow) -> Result<()>;

    /// Flush and release backend resources on shutdown
    async fn close(&self) {}

    /// One page across `streams` with per-item fair allocation
    async fn query(&self, q: &Query, streams: &[DataStream]) -> Result<(Pack, Option<usize>)> {
        tokio::time::timeout(QUERY_TIMEOUT, async {
            let window = q.window();
            let total = if q.count {
                Some(self.count(q, streams).await?)
            } else {
                None
            };
            if window.is_empty() || streams.is_empty() {
                return Ok((Vec::new(), total));
            }

            let slices = per_item_pagination(q.limit, q.page, q.per_page, streams.len());
            let mut pages = Vec::with_capacity(streams.len());
            for (stream, (limit, offset)) in streams.iter().zip(slices) {
                if limit == 0 {
                    continue;
                }
                pages.push(self.fetch(stream, window, limit, offset).await?);
            }
            Ok((merge_pages(pages, q.sort_asc), total))
        })
        .await
        .map_err(|_| Error::internal("query timed out"))?
    }

    /// Records in the window across all `streams`
    async fn count(&self, q: &Query, streams: &[DataStream]) -> Result<usize> {
        let window = q.window();
        if window.is_empty() {
            return Ok(0);
        }
        let mut total = 0;
        for stream in streams {
            total += self.count_stream(stream, window).await?;
        }
        Ok(total)
    }
}

/// Concatenate per-stream pages and order them by time.
///
/// The sort is stable, so records with equal times keep stream order and the
/// backend's insertion order.
pub fn merge_pages(pages: Vec<Vec<Record>>, sort_asc: bool) -> Pack {
    let mut merged: Pack = pages.into_iter().flatten().collect();
    if sort_asc {
        merged.sort_by(|a, b| a.time.total_cmp(&b.time));
    } else {
        merged.sort_by(|a, b| b.time.total_cmp(&a.time));
    }
    merged
}

/// Check a batch against its stream before it reaches the backend
pub(crate) fn check_batch(stream: &DataStream, records: &[Record]) -> Result<()> {
    for r in records {
        r.check_type(stream.value_type).map_err(|e| {
            Error::internal(format!("invalid record for stream '{}': {e}", stream.name))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(name: &str, t: f64) -> Record {
        Record {
            name: name.to_string(),
            time: t,
            value: Some(t),
            ..Record::default()
        }
    }

    #[test]
    fn test_merge_pages_orders_by_time() {
        let pages = vec![vec![rec("a", 1.0), rec("a", 3.0)], vec![rec("b", 2.0), rec("b", 3.0)]];
        let asc = merge_pages(pages.clone(), true);
        let order: Vec<_> = asc.iter().map(|r| (r.name.as_str(), r.time)).collect();
        assert_eq!(order, [("a", 1.0), ("b", 2.0), ("a", 3.0), ("b", 3.0)]);

        let desc = merge_pages(pages, false);
        assert_eq!(desc[0].time, 3.0);
        assert_eq!(desc[0].name, "a");
        assert_eq!(desc[3].time, 1.0);
    }

    #[test]
    fn test_window_clamps_to_epoch() {
        let q = Query {
            from: -100.0,
            to: 10.0,
            ..Query::default()
        };
        assert_eq!(q.window().from, 0.0);
        assert!(!q.window().is_empty());

        let reversed = Query {
            from: 20.0,
            to: 10.0,
            ..Query::default()
        };
        assert!(reversed.window().is_empty());
    }
}
