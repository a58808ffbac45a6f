//! MQTT connector.
//!
//! Keeps one broker session per broker URL and one subscription per topic
//! filter, reference counted by the streams that use them. Messages are
//! decoded as SenML, matched against the registry and written to data storage.
//! Registrations that fail are parked and retried every [`RETRY_INTERVAL`].

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::client::{topic_matches, BrokerConnector, BrokerSession, Inbound};
use crate::data::{Batches, DataStorage};
use crate::error::{Error, Result};
use crate::registry::{DataStream, EventListener, Filter, FilterOp, MqttSource, RegistryController};
use crate::senml::{self, MAX_RECORD_TIME};

pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound on waiting for a broker to take a DISCONNECT
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(250);

const REGISTRY_PAGE_SIZE: usize = 100;

struct Subscription {
    qos: u8,
    receivers: usize,
}

struct Manager {
    session: Arc<dyn BrokerSession>,
    /// Keyed by topic filter
    subscriptions: HashMap<String, Subscription>,
}

#[derive(Default)]
struct State {
    /// Keyed by broker URL
    managers: HashMap<String, Manager>,
    cache: HashMap<String, DataStream>,
    /// Sources of streams whose registration failed, keyed by stream name
    failed_registrations: HashMap<String, MqttSource>,
}

pub struct MqttConnector {
    client_id: String,
    broker: Arc<dyn BrokerConnector>,
    storage: Arc<dyn DataStorage>,
    registry: OnceLock<Weak<RegistryController>>,
    feed: Option<broadcast::Sender<Arc<Batches>>>,
    state: Mutex<State>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    cancel: CancellationToken,
}

async fn disconnect(url: &str, session: &Arc<dyn BrokerSession>) {
    match tokio::time::timeout(DISCONNECT_TIMEOUT, session.disconnect()).await {
        Ok(Ok(())) => info!(%url, "Disconnected from broker"),
        Ok(Err(e)) => warn!(%url, error = %e, "Error disconnecting from broker"),
        Err(_) => warn!(%url, "Broker did not take the disconnect in time"),
    }
}

impl MqttConnector {
    pub fn new(
        service_id: &str,
        broker: Arc<dyn BrokerConnector>,
        storage: Arc<dyn DataStorage>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            client_id: format!("HDS-{service_id}"),
            broker,
            storage,
            registry: OnceLock::new(),
            feed: None,
            state: Mutex::new(State::default()),
            inbound_tx,
            inbound_rx: parking_lot::Mutex::new(Some(inbound_rx)),
            cancel: CancellationToken::new(),
        }
    }

    /// Publish ingested batches to live subscribers
    pub fn with_feed(mut self, feed: broadcast::Sender<Arc<Batches>>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Subscribe for every MQTT stream in the registry and start the
    /// dispatcher and retry tasks
    pub async fn start(self: &Arc<Self>, registry: &Arc<RegistryController>) -> Result<()> {
        self.registry
            .set(Arc::downgrade(registry))
            .map_err(|_| Error::internal("MQTT connector already started"))?;
        let mut inbound = self
            .inbound_rx
            .lock()
            .take()
            .ok_or_else(|| Error::internal("MQTT connector already started"))?;

        let connector = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = connector.cancel.cancelled() => break,
                    event = inbound.recv() => match event {
                        Some(event) => connector.handle_inbound(event).await,
                        None => break,
                    }
                }
            }
            debug!("MQTT dispatcher stopped");
        });

        {
            let mut state = self.state.lock().await;
            let mut page = 1;
            loop {
                let (streams, total) = registry
                    .get_many(page, REGISTRY_PAGE_SIZE)
                    .await
                    .map_err(|e| e.context("MQTT: error getting data streams"))?;
                for stream in &streams {
                    if let Some(source) = stream.mqtt_source() {
                        self.register_or_park(&mut state, &stream.name, source).await;
                    }
                }
                if page * REGISTRY_PAGE_SIZE >= total {
                    break;
                }
                page += 1;
            }
            info!(
                brokers = state.managers.len(),
                failed = state.failed_registrations.len(),
                "MQTT connector started"
            );
        }

        let connector = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = connector.cancel.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_INTERVAL) => {
                        connector.retry_failed_registrations().await;
                    }
                }
            }
        });
        Ok(())
    }

    /// Stop the background tasks and disconnect from every broker
    pub async fn stop(&self) {
        self.cancel.cancel();
        let managers: Vec<_> = self.state.lock().await.managers.drain().collect();
        for (url, manager) in managers {
            disconnect(&url, &manager.session).await;
        }
        info!("MQTT connector stopped");
    }

    /// Try every parked registration once
    pub async fn retry_failed_registrations(&self) {
        let mut state = self.state.lock().await;
        let parked: Vec<(String, MqttSource)> = state
            .failed_registrations
            .iter()
            .map(|(name, source)| (name.clone(), source.clone()))
            .collect();
        for (name, source) in parked {
            match self.register(&mut state, &source).await {
                Ok(()) => {
                    state.failed_registrations.remove(&name);
                    info!(stream = %name, url = %source.url, "Registered parked subscription");
                }
                Err(e) => warn!(
                    stream = %name,
                    error = %e,
                    "MQTT: error registering subscription, retrying in {}s",
                    RETRY_INTERVAL.as_secs()
                ),
            }
        }
    }

    /// Names of streams whose subscription is waiting for a retry
    pub async fn failed_registrations(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().await.failed_registrations.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of streams sharing the subscription to `topic` on `url`
    pub async fn receivers(&self, url: &str, topic: &str) -> Option<usize> {
        let state = self.state.lock().await;
        state
            .managers
            .get(url)
            .and_then(|m| m.subscriptions.get(topic))
            .map(|s| s.receivers)
    }

    pub async fn broker_count(&self) -> usize {
        self.state.lock().await.managers.len()
    }

    async fn register(&self, state: &mut State, source: &MqttSource) -> Result<()> {
        if let Some(manager) = state.managers.get_mut(&source.url) {
            if let Some(subscription) = manager.subscriptions.get_mut(&source.topic) {
                subscription.receivers += 1;
                debug!(url = %source.url, topic = %source.topic, "Already subscribed");
                return Ok(());
            }
            manager.session.subscribe(&source.topic, source.qos).await?;
            manager.subscriptions.insert(
                source.topic.clone(),
                Subscription {
                    qos: source.qos,
                    receivers: 1,
                },
            );
            info!(url = %source.url, topic = %source.topic, "Subscribed");
            return Ok(());
        }

        let session = self
            .broker
            .connect(source, &self.client_id, self.inbound_tx.clone())
            .await
            .map_err(|e| e.context(format!("error connecting to broker {}", source.url)))?;
        if let Err(e) = session.subscribe(&source.topic, source.qos).await {
            disconnect(&source.url, &session).await;
            return Err(e);
        }
        let mut subscriptions = HashMap::new();
        subscriptions.insert(
            source.topic.clone(),
            Subscription {
                qos: source.qos,
                receivers: 1,
            },
        );
        state.managers.insert(
            source.url.clone(),
            Manager {
                session,
                subscriptions,
            },
        );
        info!(url = %source.url, topic = %source.topic, "Subscribed");
        Ok(())
    }

    async fn register_or_park(&self, state: &mut State, name: &str, source: &MqttSource) {
        if let Err(e) = self.register(state, source).await {
            warn!(
                stream = %name,
                error = %e,
                "MQTT: error registering subscription, retrying in {}s",
                RETRY_INTERVAL.as_secs()
            );
            metrics::counter!("hds.mqtt.registrations.failed").increment(1);
            state.failed_registrations.insert(name.to_string(), source.clone());
        }
    }

    async fn unregister(&self, state: &mut State, source: &MqttSource) {
        let Some(manager) = state.managers.get_mut(&source.url) else {
            return;
        };
        let Some(subscription) = manager.subscriptions.get_mut(&source.topic) else {
            return;
        };
        subscription.receivers = subscription.receivers.saturating_sub(1);
        if subscription.receivers == 0 {
            manager.subscriptions.remove(&source.topic);
            match manager.session.unsubscribe(&source.topic).await {
                Ok(()) => info!(url = %source.url, topic = %source.topic, "Unsubscribed"),
                Err(e) => warn!(url = %source.url, error = %e, "Error unsubscribing"),
            }
        }
        if manager.subscriptions.is_empty() {
            if let Some(manager) = state.managers.remove(&source.url) {
                disconnect(&source.url, &manager.session).await;
            }
        }
    }

    /// Handle one event from a broker session
    pub async fn handle_inbound(&self, event: Inbound) {
        match event {
            Inbound::Reconnected { url } => self.resubscribe(&url).await,
            Inbound::Message {
                url,
                topic,
                qos,
                payload,
            } => self.on_message(&url, &topic, qos, &payload).await,
        }
    }

    async fn resubscribe(&self, url: &str) {
        let state = self.state.lock().await;
        let Some(manager) = state.managers.get(url) else {
            return;
        };
        for (topic, subscription) in &manager.subscriptions {
            match manager.session.subscribe(topic, subscription.qos).await {
                Ok(()) => info!(%url, %topic, "Subscribed"),
                Err(e) => error!(%url, %topic, error = %e, "Error subscribing"),
            }
        }
    }

    async fn lookup(&self, name: &str) -> Result<Option<DataStream>> {
        if let Some(stream) = self.state.lock().await.cache.get(name) {
            return Ok(Some(stream.clone()));
        }
        let registry = self
            .registry
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::internal("registry is not available"))?;
        let found = registry
            .filter_one(&Filter::new("name", FilterOp::Equals, name))
            .await?;
        if let Some(stream) = &found {
            self.state
                .lock()
                .await
                .cache
                .insert(name.to_string(), stream.clone());
        }
        Ok(found)
    }

    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    async fn on_message(&self, url: &str, topic: &str, qos: u8, payload: &Bytes) {
        let started = Instant::now();
        metrics::counter!("hds.mqtt.messages.received").increment(1);
        let header = format!("\"SUB {topic} MQTT/QOS{qos}\"");
        let log_error = |code: u16, message: String| {
            warn!("{header} {code} {:?} {message}", started.elapsed());
            metrics::counter!("hds.mqtt.messages.dropped").increment(1);
        };

        // topic filters of this broker that the message was delivered for
        let filters: Vec<String> = {
            let state = self.state.lock().await;
            state
                .managers
                .get(url)
                .map(|m| {
                    m.subscriptions
                        .keys()
                        .filter(|filter| topic_matches(filter, topic))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        if filters.is_empty() {
            debug!(%url, %topic, "Ignoring message without subscription");
            return;
        }

        let records = match senml::decode(payload).and_then(|pack| senml::normalize(&pack)) {
            Ok(records) => records,
            Err(e) => return log_error(400, format!("Error parsing json: {e}")),
        };

        let mut batches = Batches::new();
        let mut streams = HashMap::new();
        for record in records {
            let stream = match self.lookup(&record.name).await {
                Ok(Some(stream)) => stream,
                Ok(None) => {
                    log_error(404, format!("Warning: Resource not found: {}", record.name));
                    continue;
                }
                Err(e) => {
                    log_error(500, format!("Error finding resource {}: {e}", record.name));
                    continue;
                }
            };

            let wanted = stream
                .mqtt_source()
                .is_some_and(|source| source.url == url && filters.contains(&source.topic));
            if !wanted {
                log_error(406, format!("Ignoring unwanted message for resource: {}", record.name));
                continue;
            }

            if record.time > MAX_RECORD_TIME {
                return log_error(400, format!("time of {} is beyond the year 3000", record.name));
            }
            if let Err(e) = record.check_type(stream.value_type) {
                return log_error(400, format!("Error validating the record: {e}"));
            }

            streams.entry(stream.name.clone()).or_insert(stream);
            batches.entry(record.name.clone()).or_default().push(record);
        }

        if batches.is_empty() {
            return;
        }
        if let Err(e) = self.storage.submit(&batches, &streams).await {
            return log_error(500, format!("Error writing data to the database: {e}"));
        }

        let count: usize = batches.values().map(Vec::len).sum();
        metrics::counter!("hds.data.records.ingested").increment(count as u64);
        info!("{header} 202 {:?}", started.elapsed());
        if let Some(feed) = &self.feed {
            let _ = feed.send(Arc::new(batches));
        }
    }
}

#[async_trait]
impl EventListener for MqttConnector {
    fn name(&self) -> &'static str {
        "mqtt-connector"
    }

    async fn on_create(&self, stream: &DataStream) -> Result<()> {
        if let Some(source) = stream.mqtt_source() {
            let mut state = self.state.lock().await;
            self.register_or_park(&mut state, &stream.name, source).await;
        }
        Ok(())
    }

    async fn on_update(&self, old: &DataStream, new: &DataStream) -> Result<()> {
        let mut state = self.state.lock().await;
        if old.retention != new.retention {
            state.cache.clear();
        } else {
            state.cache.remove(&old.name);
        }

        if old.mqtt_source() != new.mqtt_source() {
            // a parked source never got a subscription
            if state.failed_registrations.remove(&old.name).is_none() {
                if let Some(source) = old.mqtt_source() {
                    self.unregister(&mut state, source).await;
                }
            }
            if let Some(source) = new.mqtt_source() {
                self.register_or_park(&mut state, &new.name, source).await;
            }
        }
        Ok(())
    }

    async fn on_delete(&self, old: &DataStream) -> Result<()> {
        let mut state = self.state.lock().await;
        state.cache.remove(&old.name);
        if state.failed_registrations.remove(&old.name).is_none() {
            if let Some(source) = old.mqtt_source() {
                self.unregister(&mut state, source).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Query, SqliteStorage};
    use crate::registry::memory::MemoryBackend;
    use crate::registry::{RegistryStorage, Source, ValueType};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakeBroker {
        refuse: AtomicBool,
        calls: Arc<parking_lot::Mutex<Vec<String>>>,
        /// Topics whose SUBACK carries a failure code
        rejected_topics: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    struct FakeSession {
        url: String,
        calls: Arc<parking_lot::Mutex<Vec<String>>>,
        rejected_topics: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl BrokerSession for FakeSession {
        async fn subscribe(&self, topic: &str, _qos: u8) -> Result<()> {
            if self.rejected_topics.lock().iter().any(|t| t == topic) {
                return Err(Error::internal(format!(
                    "error subscribing to {topic}: subscription refused by broker"
                )));
            }
            self.calls.lock().push(format!("subscribe {} {topic}", self.url));
            Ok(())
        }

        async fn unsubscribe(&self, topic: &str) -> Result<()> {
            self.calls.lock().push(format!("unsubscribe {} {topic}", self.url));
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.calls.lock().push(format!("disconnect {}", self.url));
            Ok(())
        }
    }

    #[async_trait]
    impl BrokerConnector for FakeBroker {
        async fn connect(
            &self,
            source: &MqttSource,
            _client_id: &str,
            _inbound: mpsc::UnboundedSender<Inbound>,
        ) -> Result<Arc<dyn BrokerSession>> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(Error::internal("connection refused"));
            }
            self.calls.lock().push(format!("connect {}", source.url));
            Ok(Arc::new(FakeSession {
                url: source.url.clone(),
                calls: self.calls.clone(),
                rejected_topics: self.rejected_topics.clone(),
            }))
        }
    }

    fn mqtt_stream(name: &str, url: &str, topic: &str) -> DataStream {
        DataStream::new(name, ValueType::Float).with_source(Source::Mqtt(MqttSource {
            url: url.into(),
            topic: topic.into(),
            qos: 1,
            username: None,
            password: None,
            ca_file: None,
            cert_file: None,
            key_file: None,
            insecure: false,
        }))
    }

    struct Fixture {
        broker: Arc<FakeBroker>,
        connector: Arc<MqttConnector>,
        registry: Arc<RegistryController>,
        storage: Arc<SqliteStorage>,
    }

    async fn fixture() -> Fixture {
        let broker = Arc::new(FakeBroker::default());
        let storage = Arc::new(SqliteStorage::connect(":memory:").await.unwrap());
        let connector = Arc::new(MqttConnector::new("test", broker.clone(), storage.clone()));
        let registry_storage = Arc::new(RegistryStorage::new(Arc::new(MemoryBackend::default())));
        registry_storage.add_listener(storage.clone());
        registry_storage.add_listener(connector.clone());
        let registry = Arc::new(RegistryController::new(registry_storage));
        connector.start(&registry).await.unwrap();
        Fixture {
            broker,
            connector,
            registry,
            storage,
        }
    }

    #[tokio::test]
    async fn test_shared_subscription_is_reference_counted() {
        let f = fixture().await;
        let url = "tcp://broker:1883";
        f.registry.add(mqtt_stream("a", url, "t")).await.unwrap();
        f.registry.add(mqtt_stream("b", url, "t")).await.unwrap();
        assert_eq!(f.connector.receivers(url, "t").await, Some(2));
        assert_eq!(f.broker.calls.lock().len(), 2);

        f.registry.delete("a").await.unwrap();
        assert_eq!(f.connector.receivers(url, "t").await, Some(1));
        assert_eq!(f.connector.broker_count().await, 1);

        f.registry.delete("b").await.unwrap();
        assert_eq!(f.connector.receivers(url, "t").await, None);
        assert_eq!(f.connector.broker_count().await, 0);
        let calls = f.broker.calls.lock().clone();
        assert_eq!(
            calls,
            [
                "connect tcp://broker:1883",
                "subscribe tcp://broker:1883 t",
                "unsubscribe tcp://broker:1883 t",
                "disconnect tcp://broker:1883",
            ]
        );
        f.connector.stop().await;
    }

    #[tokio::test]
    async fn test_failed_registration_is_parked_and_retried() {
        let f = fixture().await;
        f.broker.refuse.store(true, Ordering::SeqCst);
        f.registry
            .add(mqtt_stream("a", "tcp://down:1883", "t"))
            .await
            .unwrap();
        assert_eq!(f.connector.failed_registrations().await, ["a"]);

        f.broker.refuse.store(false, Ordering::SeqCst);
        f.connector.retry_failed_registrations().await;
        assert!(f.connector.failed_registrations().await.is_empty());
        assert_eq!(f.connector.receivers("tcp://down:1883", "t").await, Some(1));
        f.connector.stop().await;
    }

    #[tokio::test]
    async fn test_refused_subscription_leaves_state_unchanged() {
        let f = fixture().await;
        let url = "tcp://broker:1883";
        f.broker.rejected_topics.lock().push("locked".into());

        f.registry.add(mqtt_stream("a", url, "t")).await.unwrap();
        f.registry.add(mqtt_stream("b", url, "locked")).await.unwrap();
        assert_eq!(f.connector.receivers(url, "locked").await, None);
        assert_eq!(f.connector.receivers(url, "t").await, Some(1));
        assert_eq!(f.connector.failed_registrations().await, ["b"]);

        // a refused first subscription drops the fresh connection
        f.registry
            .add(mqtt_stream("c", "tcp://other:1883", "locked"))
            .await
            .unwrap();
        assert_eq!(f.connector.broker_count().await, 1);
        assert!(f
            .broker
            .calls
            .lock()
            .contains(&"disconnect tcp://other:1883".to_string()));

        f.broker.rejected_topics.lock().clear();
        f.connector.retry_failed_registrations().await;
        assert!(f.connector.failed_registrations().await.is_empty());
        assert_eq!(f.connector.receivers(url, "locked").await, Some(1));
        assert_eq!(f.connector.receivers("tcp://other:1883", "locked").await, Some(1));
        f.connector.stop().await;
    }

    #[tokio::test]
    async fn test_delete_of_parked_stream_skips_unregister() {
        let f = fixture().await;
        f.broker.refuse.store(true, Ordering::SeqCst);
        f.registry
            .add(mqtt_stream("a", "tcp://down:1883", "t"))
            .await
            .unwrap();
        f.registry.delete("a").await.unwrap();
        assert!(f.connector.failed_registrations().await.is_empty());
        assert!(f.broker.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_update_moves_subscription() {
        let f = fixture().await;
        f.registry
            .add(mqtt_stream("a", "tcp://one:1883", "t"))
            .await
            .unwrap();
        f.registry
            .update("a", mqtt_stream("a", "tcp://two:1883", "t"))
            .await
            .unwrap();
        assert_eq!(f.connector.receivers("tcp://one:1883", "t").await, None);
        assert_eq!(f.connector.receivers("tcp://two:1883", "t").await, Some(1));
    }

    #[tokio::test]
    async fn test_dispatch_stores_matching_records() {
        let f = fixture().await;
        let url = "tcp://broker:1883";
        f.registry
            .add(mqtt_stream("room/temp", url, "sensors/#"))
            .await
            .unwrap();
        f.registry
            .add(mqtt_stream("other", url, "elsewhere"))
            .await
            .unwrap();

        let payload = br#"[{"bn":"room/","n":"temp","t":1600000000,"v":21.5},
            {"n":"other","t":1600000000,"v":1},
            {"n":"unknown","t":1600000000,"v":1}]"#;
        f.connector
            .handle_inbound(Inbound::Message {
                url: url.into(),
                topic: "sensors/room".into(),
                qos: 1,
                payload: Bytes::from_static(payload),
            })
            .await;

        let q = Query {
            from: 0.0,
            to: 2_000_000_000.0,
            count: true,
            ..Query::default()
        };
        let temp = f.registry.get("room/temp").await.unwrap();
        let other = f.registry.get("other").await.unwrap();
        assert_eq!(f.storage.count(&q, &[temp]).await.unwrap(), 1);
        assert_eq!(f.storage.count(&q, &[other]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_drops_message_with_type_mismatch() {
        let f = fixture().await;
        let url = "tcp://broker:1883";
        f.registry.add(mqtt_stream("a", url, "t")).await.unwrap();

        let payload = br#"[{"n":"a","t":1600000000,"v":1},{"n":"a","t":1600000001,"vs":"x"}]"#;
        f.connector
            .handle_inbound(Inbound::Message {
                url: url.into(),
                topic: "t".into(),
                qos: 0,
                payload: Bytes::from_static(payload),
            })
            .await;

        let q = Query {
            from: 0.0,
            to: 2_000_000_000.0,
            ..Query::default()
        };
        let a = f.registry.get("a").await.unwrap();
        assert_eq!(f.storage.count(&q, &[a]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes() {
        let f = fixture().await;
        let url = "tcp://broker:1883";
        f.registry.add(mqtt_stream("a", url, "t")).await.unwrap();
        f.connector
            .handle_inbound(Inbound::Reconnected { url: url.into() })
            .await;
        let subscribes = f
            .broker
            .calls
            .lock()
            .iter()
            .filter(|c| c.starts_with("subscribe"))
            .count();
        assert_eq!(subscribes, 2);
    }
}
