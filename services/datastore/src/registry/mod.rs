//! Stream registry: model, storage backends, listener fan-out and controller.

pub mod controller;
pub mod embedded;
pub mod events;
pub mod filter;
pub mod memory;
pub mod storage;
pub mod stream;
pub mod validation;

pub use controller::RegistryController;
pub use events::{EventListener, EventListeners};
pub use filter::{Filter, FilterOp};
pub use storage::{RegistryStorage, StreamBackend, MAX_PER_PAGE};
pub use stream::{DataStream, MqttSource, Retention, SeriesSource, Source, ValueType};
