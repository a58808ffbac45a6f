//! In-memory registry backend.

use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::storage::StreamBackend;
use super::stream::DataStream;
use crate::error::Result;

/// Sorted map of streams; contents are lost on restart
#[derive(Default)]
pub struct MemoryBackend {
    streams: RwLock<BTreeMap<String, DataStream>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamBackend for MemoryBackend {
    fn get(&self, name: &str) -> Result<Option<DataStream>> {
        Ok(self.streams.read().get(name).cloned())
    }

    fn put(&self, stream: &DataStream) -> Result<()> {
        self.streams
            .write()
            .insert(stream.name.clone(), stream.clone());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<bool> {
        Ok(self.streams.write().remove(name).is_some())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.streams.read().len())
    }

    fn range(&self, offset: usize, limit: usize) -> Result<Vec<DataStream>> {
        Ok(self
            .streams
            .read()
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn scan(&self, visit: &mut dyn FnMut(DataStream) -> bool) -> Result<()> {
        let snapshot: Vec<DataStream> = self.streams.read().values().cloned().collect();
        for stream in snapshot {
            if !visit(stream) {
                break;
            }
        }
        Ok(())
    }
}
