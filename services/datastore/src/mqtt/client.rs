//! Broker sessions on top of rumqttc.
//!
//! The connector only sees the [`BrokerConnector`] and [`BrokerSession`]
//! traits. Incoming publishes and reconnects are forwarded over a channel as
//! [`Inbound`] events, one event loop task per broker.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::registry::MqttSource;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 64;
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Events from a broker connection
#[derive(Debug, Clone)]
pub enum Inbound {
    /// The session came back after a connection loss
    Reconnected { url: String },
    Message {
        url: String,
        topic: String,
        qos: u8,
        payload: Bytes,
    },
}

/// An established connection to one broker
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: u8) -> Result<()>;
    async fn unsubscribe(&self, topic: &str) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
}

/// Opens broker sessions; returns once the broker acknowledged the connection
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(
        &self,
        source: &MqttSource,
        client_id: &str,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Result<Arc<dyn BrokerSession>>;
}

pub fn map_qos(qos: u8) -> Result<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(Error::bad_request(format!("unsupported MQTT QoS level: {other}"))),
    }
}

/// Whether an MQTT topic filter (with `+` and `#` wildcards) matches a topic
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match part {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            }
            exact => {
                if levels.next() != Some(exact) {
                    return false;
                }
            }
        }
    }
    levels.next().is_none()
}

fn read_file(path: &str, what: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::internal(format!("error reading {what} {path}: {e}")))
}

fn build_options(source: &MqttSource, client_id: &str) -> Result<MqttOptions> {
    let endpoint = source.endpoint()?;
    let mut options = MqttOptions::new(client_id, endpoint.host, endpoint.port);
    options.set_keep_alive(KEEP_ALIVE);

    if let Some(username) = source.username.as_deref().filter(|u| !u.is_empty()) {
        options.set_credentials(username, source.password.clone().unwrap_or_default());
    }

    if endpoint.tls {
        if source.insecure {
            warn!(url = %source.url, "Certificate verification cannot be disabled, verifying anyway");
        }
        let client_auth = match (&source.cert_file, &source.key_file) {
            (Some(cert), Some(key)) => {
                Some((read_file(cert, "client certificate")?, read_file(key, "client key")?))
            }
            _ => None,
        };
        let transport = match (&source.ca_file, client_auth) {
            (Some(ca), client_auth) => Transport::tls(read_file(ca, "CA file")?, client_auth, None),
            (None, None) => Transport::tls_with_default_config(),
            (None, Some(_)) => {
                return Err(Error::bad_request(
                    "a client certificate requires caFile to be set",
                ))
            }
        };
        options.set_transport(transport);
    }
    Ok(options)
}

/// Poll until the broker accepts the connection
async fn await_connack(event_loop: &mut EventLoop) -> Result<()> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(Error::internal(format!("connection refused: {code:?}"))),
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(Error::internal(format!("error connecting: {e}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckKind {
    Subscribe,
    Unsubscribe,
}

type AckSender = oneshot::Sender<Result<()>>;

/// Matches SUBACK/UNSUBACK packets to the requests waiting for them
///
/// Requests are queued in the order they enter the client channel; the event
/// loop reports the packet id once a request is written, and the broker's
/// acknowledgement carries the same id.
#[derive(Default)]
struct PendingAcks {
    subscribes: VecDeque<AckSender>,
    unsubscribes: VecDeque<AckSender>,
    in_flight: HashMap<u16, AckSender>,
}

impl PendingAcks {
    fn queue(&mut self, kind: AckKind) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        match kind {
            AckKind::Subscribe => self.subscribes.push_back(tx),
            AckKind::Unsubscribe => self.unsubscribes.push_back(tx),
        }
        rx
    }

    /// Undo the latest `queue` when the request never reached the client
    fn dequeue_last(&mut self, kind: AckKind) {
        match kind {
            AckKind::Subscribe => self.subscribes.pop_back(),
            AckKind::Unsubscribe => self.unsubscribes.pop_back(),
        };
    }

    fn sent(&mut self, kind: AckKind, pkid: u16) {
        let waiter = match kind {
            AckKind::Subscribe => self.subscribes.pop_front(),
            AckKind::Unsubscribe => self.unsubscribes.pop_front(),
        };
        if let Some(waiter) = waiter {
            self.in_flight.insert(pkid, waiter);
        }
    }

    fn acked(&mut self, pkid: u16, result: Result<()>) {
        if let Some(waiter) = self.in_flight.remove(&pkid) {
            let _ = waiter.send(result);
        }
    }

    /// Acknowledgements for written requests never arrive after a connection loss
    fn fail_in_flight(&mut self, reason: &str) {
        for (_, waiter) in self.in_flight.drain() {
            let _ = waiter.send(Err(Error::internal(reason.to_string())));
        }
    }
}

fn suback_result(return_codes: &[SubscribeReasonCode]) -> Result<()> {
    if return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
    {
        Err(Error::internal("subscription refused by broker"))
    } else {
        Ok(())
    }
}

fn spawn_event_loop(
    url: String,
    mut event_loop: EventLoop,
    inbound: mpsc::UnboundedSender<Inbound>,
    acks: Arc<Mutex<PendingAcks>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = Inbound::Message {
                            url: url.clone(),
                            topic: publish.topic,
                            qos: publish.qos as u8,
                            payload: publish.payload,
                        };
                        if inbound.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(%url, "Reconnected to broker");
                        if inbound.send(Inbound::Reconnected { url: url.clone() }).is_err() {
                            break;
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                        acks.lock().sent(AckKind::Subscribe, pkid);
                    }
                    Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                        acks.lock().sent(AckKind::Unsubscribe, pkid);
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        acks.lock().acked(ack.pkid, suback_result(&ack.return_codes));
                    }
                    Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                        acks.lock().acked(ack.pkid, Ok(()));
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(%url, error = %e, "Connection lost");
                        acks.lock().fail_in_flight("connection lost before acknowledgement");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                    }
                }
            }
        }
        acks.lock().fail_in_flight("event loop stopped");
        debug!(%url, "Event loop stopped");
    })
}

struct RumqttSession {
    client: AsyncClient,
    acks: Arc<Mutex<PendingAcks>>,
    /// Keeps `acks` queue order equal to the client channel order
    requests: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttSession {
    /// Send one request and wait for the broker to acknowledge it
    async fn request<F, Fut>(&self, kind: AckKind, send: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<(), rumqttc::ClientError>>,
    {
        let ack = {
            let _order = self.requests.lock().await;
            let ack = self.acks.lock().queue(kind);
            if let Err(e) = send().await {
                self.acks.lock().dequeue_last(kind);
                return Err(Error::internal(e.to_string()));
            }
            ack
        };
        match tokio::time::timeout(ACK_TIMEOUT, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::internal("session closed before acknowledgement")),
            Err(_) => Err(Error::internal("timed out waiting for acknowledgement")),
        }
    }
}

#[async_trait]
impl BrokerSession for RumqttSession {
    async fn subscribe(&self, topic: &str, qos: u8) -> Result<()> {
        let qos = map_qos(qos)?;
        self.request(AckKind::Subscribe, || self.client.subscribe(topic, qos))
            .await
            .map_err(|e| e.context(format!("error subscribing to {topic}")))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.request(AckKind::Unsubscribe, || self.client.unsubscribe(topic))
            .await
            .map_err(|e| e.context(format!("error unsubscribing from {topic}")))
    }

    /// Waits until the DISCONNECT packet is written; callers bound the wait
    async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| Error::internal(format!("error disconnecting: {e}")))?;
        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

impl Drop for RumqttSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Connects to brokers with rumqttc
#[derive(Debug, Default, Clone)]
pub struct RumqttConnector;

#[async_trait]
impl BrokerConnector for RumqttConnector {
    async fn connect(
        &self,
        source: &MqttSource,
        client_id: &str,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Result<Arc<dyn BrokerSession>> {
        let options = build_options(source, client_id)?;
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

        tokio::time::timeout(CONNECT_TIMEOUT, await_connack(&mut event_loop))
            .await
            .map_err(|_| Error::internal(format!("timed out connecting to {}", source.url)))??;
        info!(url = %source.url, "Connected to broker");

        let cancel = CancellationToken::new();
        let acks = Arc::new(Mutex::new(PendingAcks::default()));
        let handle = spawn_event_loop(
            source.url.clone(),
            event_loop,
            inbound,
            acks.clone(),
            cancel.clone(),
        );
        Ok(Arc::new(RumqttSession {
            client,
            acks,
            requests: tokio::sync::Mutex::new(()),
            cancel,
            event_loop: Mutex::new(Some(handle)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches_wildcards() {
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(topic_matches("a/+/c", "a/x/c"));
        assert!(!topic_matches("a/+", "a/x/c"));
        assert!(topic_matches("a/#", "a/x/c"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("a/+/c", "a/x"));
    }

    #[test]
    fn test_map_qos() {
        assert_eq!(map_qos(1).unwrap(), QoS::AtLeastOnce);
        assert!(map_qos(3).is_err());
    }

    #[test]
    fn test_build_options_plain_and_tls() {
        let source = MqttSource {
            url: "tcp://broker.local:1884".into(),
            topic: "t".into(),
            qos: 0,
            username: Some("user".into()),
            password: Some("secret".into()),
            ca_file: None,
            cert_file: None,
            key_file: None,
            insecure: false,
        };
        let options = build_options(&source, "HDS-test").unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.client_id(), "HDS-test");
        assert_eq!(options.credentials(), Some(("user".to_string(), "secret".to_string())));

        let tls = MqttSource {
            url: "ssl://broker.local".into(),
            cert_file: Some("/nonexistent/cert.pem".into()),
            key_file: Some("/nonexistent/key.pem".into()),
            ..source
        };
        assert!(build_options(&tls, "HDS-test").is_err());
    }

    #[tokio::test]
    async fn test_acks_follow_packet_ids() {
        let mut acks = PendingAcks::default();
        let first = acks.queue(AckKind::Subscribe);
        let second = acks.queue(AckKind::Subscribe);
        let unsub = acks.queue(AckKind::Unsubscribe);

        acks.sent(AckKind::Subscribe, 1);
        acks.sent(AckKind::Unsubscribe, 2);
        acks.sent(AckKind::Subscribe, 3);

        acks.acked(3, suback_result(&[SubscribeReasonCode::Failure]));
        acks.acked(1, suback_result(&[SubscribeReasonCode::Success(QoS::AtLeastOnce)]));
        acks.acked(2, Ok(()));

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_err());
        assert!(unsub.await.unwrap().is_ok());
        assert!(acks.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_connection_loss_fails_waiting_requests() {
        let mut acks = PendingAcks::default();
        let written = acks.queue(AckKind::Subscribe);
        let queued = acks.queue(AckKind::Subscribe);
        acks.sent(AckKind::Subscribe, 7);

        acks.fail_in_flight("connection lost");
        assert!(written.await.unwrap().is_err());

        acks.dequeue_last(AckKind::Subscribe);
        assert!(queued.await.is_err());
    }
}
