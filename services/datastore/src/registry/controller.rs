//! Registry controller: the single entry point the surfaces use.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument};

use super::filter::Filter;
use super::storage::RegistryStorage;
use super::stream::DataStream;
use super::validation::validate_create;
use crate::error::Result;

/// Validates requests and classifies storage errors
#[derive(Clone)]
pub struct RegistryController {
    storage: Arc<RegistryStorage>,
}

impl RegistryController {
    pub fn new(storage: Arc<RegistryStorage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<RegistryStorage> {
        &self.storage
    }

    #[instrument(skip(self, stream), fields(stream = %stream.name))]
    pub async fn add(&self, stream: DataStream) -> Result<DataStream> {
        validate_create(&stream)
            .map_err(|e| e.context(format!("invalid stream '{}'", stream.name)))?;
        let name = stream.name.clone();
        let added = self
            .storage
            .add(stream)
            .await
            .map_err(|e| e.context(format!("error storing stream '{name}'")))?;
        metrics::counter!("hds.registry.streams.created").increment(1);
        info!(value_type = %added.value_type, "Registered stream");
        Ok(added)
    }

    pub async fn get(&self, name: &str) -> Result<DataStream> {
        self.storage
            .get(name)
            .await
            .map_err(|e| e.context(format!("error retrieving stream '{name}' from registry")))
    }

    #[instrument(skip(self, stream))]
    pub async fn update(&self, name: &str, mut stream: DataStream) -> Result<DataStream> {
        if stream.name.is_empty() {
            stream.name = name.to_string();
        }
        self.storage
            .update(name, stream)
            .await
            .map_err(|e| e.context(format!("error updating stream '{name}'")))
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.storage
            .delete(name)
            .await
            .map_err(|e| e.context(format!("error deleting stream '{name}'")))?;
        metrics::counter!("hds.registry.streams.deleted").increment(1);
        info!(stream = %name, "Deleted stream");
        Ok(())
    }

    pub async fn get_many(&self, page: usize, per_page: usize) -> Result<(Vec<DataStream>, usize)> {
        self.storage
            .get_many(page, per_page)
            .await
            .map_err(|e| e.context("error retrieving streams from registry"))
    }

    pub async fn filter_one(&self, filter: &Filter) -> Result<Option<DataStream>> {
        self.storage
            .filter_one(filter)
            .await
            .map_err(|e| e.context("error filtering registry"))
    }

    pub async fn filter(
        &self,
        filter: &Filter,
        page: usize,
        per_page: usize,
    ) -> Result<(Vec<DataStream>, usize)> {
        self.storage
            .filter(filter, page, per_page)
            .await
            .map_err(|e| e.context("error filtering registry"))
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.storage.last_modified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::registry::memory::MemoryBackend;
    use crate::registry::stream::{MqttSource, Source, ValueType};

    fn controller() -> RegistryController {
        RegistryController::new(Arc::new(RegistryStorage::new(Arc::new(MemoryBackend::new()))))
    }

    #[tokio::test]
    async fn test_add_validates() {
        let c = controller();
        let err = c.add(DataStream::new("", ValueType::Float)).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));

        let bad_qos = DataStream::new("s", ValueType::Float).with_source(Source::Mqtt(MqttSource {
            url: "tcp://localhost:1883".into(),
            topic: "t".into(),
            qos: 7,
            username: None,
            password: None,
            ca_file: None,
            cert_file: None,
            key_file: None,
            insecure: false,
        }));
        assert!(matches!(c.add(bad_qos).await, Err(Error::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_errors_keep_category_with_context() {
        let c = controller();
        let err = c.get("nothing").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.message().starts_with("error retrieving stream 'nothing'"));
    }

    #[tokio::test]
    async fn test_update_fills_missing_name() {
        let c = controller();
        c.add(DataStream::new("s", ValueType::Float)).await.unwrap();

        let mut body = DataStream::new("", ValueType::Float);
        body.unit = "Cel".into();
        let updated = c.update("s", body).await.unwrap();
        assert_eq!(updated.name, "s");
        assert_eq!(updated.unit, "Cel");

        let err = c
            .update("s", DataStream::new("other", ValueType::Float))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
}
