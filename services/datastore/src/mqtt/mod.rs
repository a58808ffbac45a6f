//! MQTT ingestion: broker sessions and the connector that feeds data storage.

pub mod client;
pub mod connector;

pub use client::{BrokerConnector, BrokerSession, Inbound, RumqttConnector};
pub use connector::{MqttConnector, DISCONNECT_TIMEOUT, RETRY_INTERVAL};
