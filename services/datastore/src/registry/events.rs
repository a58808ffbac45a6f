//! Registry event fan-out.
//!
//! Listeners are invoked sequentially, in registration order, while the
//! registry holds its write lock. The first failing listener short-circuits the
//! chain and its error is returned to the registry.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::stream::DataStream;
use crate::error::Result;

/// Receiver of registry mutations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Listener name used in logs
    fn name(&self) -> &'static str;

    async fn on_create(&self, stream: &DataStream) -> Result<()>;

    async fn on_update(&self, old: &DataStream, new: &DataStream) -> Result<()>;

    async fn on_delete(&self, old: &DataStream) -> Result<()>;
}

/// Ordered set of listeners
#[derive(Clone, Default)]
pub struct EventListeners {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub async fn created(&self, stream: &DataStream) -> Result<()> {
        for listener in &self.listeners {
            debug!(listener = listener.name(), stream = %stream.name, "Dispatching create event");
            listener.on_create(stream).await?;
        }
        Ok(())
    }

    pub async fn updated(&self, old: &DataStream, new: &DataStream) -> Result<()> {
        for listener in &self.listeners {
            debug!(listener = listener.name(), stream = %new.name, "Dispatching update event");
            listener.on_update(old, new).await?;
        }
        Ok(())
    }

    pub async fn deleted(&self, old: &DataStream) -> Result<()> {
        for listener in &self.listeners {
            debug!(listener = listener.name(), stream = %old.name, "Dispatching delete event");
            listener.on_delete(old).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::registry::stream::ValueType;
    use mockall::Sequence;

    fn named_mock(name: &'static str) -> MockEventListener {
        let mut mock = MockEventListener::new();
        mock.expect_name().return_const(name);
        mock
    }

    #[tokio::test]
    async fn test_listeners_run_in_order() {
        let mut seq = Sequence::new();
        let mut first = named_mock("first");
        first
            .expect_on_create()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let mut second = named_mock("second");
        second
            .expect_on_create()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let mut listeners = EventListeners::new();
        listeners.push(Arc::new(first));
        listeners.push(Arc::new(second));

        let stream = DataStream::new("s", ValueType::Float);
        assert!(listeners.created(&stream).await.is_ok());
    }

    #[tokio::test]
    async fn test_first_error_short_circuits() {
        let mut failing = named_mock("failing");
        failing
            .expect_on_delete()
            .times(1)
            .returning(|_| Err(Error::internal("boom")));
        let mut never = named_mock("never");
        never.expect_on_delete().times(0);

        let mut listeners = EventListeners::new();
        listeners.push(Arc::new(failing));
        listeners.push(Arc::new(never));

        let stream = DataStream::new("s", ValueType::Float);
        let err = listeners.deleted(&stream).await.unwrap_err();
        assert_eq!(err, Error::internal("boom"));
    }
}
