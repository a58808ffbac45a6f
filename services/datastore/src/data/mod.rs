//! Data plane: record storage backends and the data controller.

pub mod controller;
pub mod senmlstore;
pub mod sqlite;
pub mod storage;

pub use controller::{DataController, SubmitReceipt};
pub use senmlstore::SenmlStore;
pub use sqlite::SqliteStorage;
pub use storage::{Batches, DataStorage, Query, TimeWindow, MAX_PER_PAGE};
