//! Data stream model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::{Error, Result};

/// Replacement for sensitive source fields in user-facing serializations
pub const REDACTED: &str = "*****";

/// Value type of every record in a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Float,
    String,
    Bool,
    Data,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Float => "float",
            ValueType::String => "string",
            ValueType::Bool => "bool",
            ValueType::Data => "data",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "float" => Ok(ValueType::Float),
            "string" => Ok(ValueType::String),
            "bool" => Ok(ValueType::Bool),
            "data" => Ok(ValueType::Data),
            other => Err(Error::bad_request(format!("unknown value type '{other}'"))),
        }
    }
}

/// Advisory retention policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    /// Keep records for at least this long
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    /// Keep records for at most this long
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
}

impl Retention {
    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }
}

/// Ingestion source bound to a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Source {
    #[serde(rename = "MQTT")]
    Mqtt(MqttSource),
    #[serde(rename = "Series")]
    Series(SeriesSource),
}

/// Subscription to a topic on an MQTT broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MqttSource {
    /// Broker URL, e.g. `tcp://localhost:1883`
    #[serde(alias = "brokerURL", alias = "brokerUrl")]
    pub url: String,
    /// Topic filter
    pub topic: String,
    /// Subscription QoS
    #[serde(default)]
    pub qos: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// CA certificate (PEM) used to verify the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
    /// Client certificate (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    /// Client private key (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    /// Skip verification of the broker certificate
    #[serde(default, skip_serializing_if = "is_false")]
    pub insecure: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Stream derived from another stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeriesSource {
    pub name: String,
}

/// Host, port and transport of a broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl MqttSource {
    /// Parse the broker URL; a missing scheme means plain TCP
    pub fn endpoint(&self) -> Result<BrokerEndpoint> {
        let normalized = if self.url.contains("://") {
            self.url.clone()
        } else {
            format!("tcp://{}", self.url)
        };
        let parsed = Url::parse(&normalized)
            .map_err(|e| Error::bad_request(format!("invalid broker URL '{}': {e}", self.url)))?;

        let scheme = parsed.scheme();
        let tls = match scheme {
            "tcp" | "mqtt" => false,
            "ssl" | "tls" | "mqtts" | "tcps" => true,
            other => {
                return Err(Error::bad_request(format!(
                    "unsupported broker URL scheme '{other}'"
                )))
            }
        };

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::bad_request(format!("broker URL '{}' missing host", self.url)))?
            .to_string();
        let port = parsed.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(BrokerEndpoint { host, port, tls })
    }

    fn redacted(&self) -> MqttSource {
        let mask = |field: &Option<String>| field.as_ref().map(|_| REDACTED.to_string());
        MqttSource {
            url: self.url.clone(),
            topic: self.topic.clone(),
            qos: self.qos,
            username: mask(&self.username),
            password: mask(&self.password),
            ca_file: mask(&self.ca_file),
            cert_file: mask(&self.cert_file),
            key_file: mask(&self.key_file),
            insecure: false,
        }
    }
}

/// Registry entry describing one time series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStream {
    /// Unique, immutable name
    #[serde(default)]
    pub name: String,
    /// Immutable value type
    #[serde(rename = "type", alias = "dataType")]
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
    #[serde(default, alias = "retain", skip_serializing_if = "Retention::is_empty")]
    pub retention: Retention,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl DataStream {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            unit: String::new(),
            meta: Map::new(),
            retention: Retention::default(),
            source: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    pub fn mqtt_source(&self) -> Option<&MqttSource> {
        match &self.source {
            Some(Source::Mqtt(src)) => Some(src),
            _ => None,
        }
    }

    /// Copy suitable for users: credentials and key material masked
    pub fn redacted(&self) -> DataStream {
        let mut copy = self.clone();
        if let Some(Source::Mqtt(src)) = &self.source {
            copy.source = Some(Source::Mqtt(src.redacted()));
        }
        copy
    }

    /// Full JSON encoding, credentials included
    pub fn to_stored_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_stored_json(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| Error::internal(format!("corrupted stream record: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mqtt_source() -> MqttSource {
        MqttSource {
            url: "tcp://localhost:1883".to_string(),
            topic: "sensors/#".to_string(),
            qos: 1,
            username: Some("user".to_string()),
            password: Some("secret".to_string()),
            ca_file: None,
            cert_file: Some("/etc/cert.pem".to_string()),
            key_file: None,
            insecure: true,
        }
    }

    #[test]
    fn test_value_type_encoding() {
        assert_eq!(serde_json::to_value(ValueType::Bool).unwrap(), json!("bool"));
        assert_eq!("FLOAT".parse::<ValueType>().unwrap(), ValueType::Float);
        assert!("int".parse::<ValueType>().is_err());
    }

    #[test]
    fn test_stream_json_shape() {
        let raw = json!({
            "name": "room/temp",
            "type": "float",
            "unit": "Cel",
            "retain": {"max": "24h"},
            "source": {"kind": "MQTT", "brokerURL": "tcp://localhost:1883", "topic": "a/b", "qos": 2}
        });
        let stream: DataStream = serde_json::from_value(raw).unwrap();
        assert_eq!(stream.value_type, ValueType::Float);
        assert_eq!(stream.retention.max.as_deref(), Some("24h"));
        let src = stream.mqtt_source().unwrap();
        assert_eq!(src.url, "tcp://localhost:1883");
        assert_eq!(src.qos, 2);

        let encoded = serde_json::to_value(&stream).unwrap();
        assert_eq!(encoded["source"]["kind"], "MQTT");
        assert_eq!(encoded["source"]["url"], "tcp://localhost:1883");
        assert_eq!(encoded["retention"]["max"], "24h");
    }

    #[test]
    fn test_source_payload_must_match_kind() {
        let raw = json!({
            "name": "x",
            "type": "float",
            "source": {"kind": "Series", "url": "tcp://localhost", "topic": "t"}
        });
        assert!(serde_json::from_value::<DataStream>(raw).is_err());

        let raw = json!({
            "name": "x",
            "type": "float",
            "source": {"kind": "MQTT", "name": "other"}
        });
        assert!(serde_json::from_value::<DataStream>(raw).is_err());
    }

    #[test]
    fn test_redaction() {
        let stream = DataStream::new("s", ValueType::Float).with_source(Source::Mqtt(mqtt_source()));
        let redacted = stream.redacted();
        let src = redacted.mqtt_source().unwrap();
        assert_eq!(src.username.as_deref(), Some(REDACTED));
        assert_eq!(src.password.as_deref(), Some(REDACTED));
        assert_eq!(src.cert_file.as_deref(), Some(REDACTED));
        assert_eq!(src.ca_file, None);
        assert!(!src.insecure);

        let stored = DataStream::from_stored_json(&stream.to_stored_json().unwrap()).unwrap();
        assert_eq!(stored, stream);
    }

    #[test]
    fn test_broker_endpoint() {
        let mut src = mqtt_source();
        src.url = "localhost".to_string();
        assert_eq!(
            src.endpoint().unwrap(),
            BrokerEndpoint { host: "localhost".into(), port: 1883, tls: false }
        );

        src.url = "ssl://broker.example.com".to_string();
        let endpoint = src.endpoint().unwrap();
        assert_eq!(endpoint.port, 8883);
        assert!(endpoint.tls);

        src.url = "http://broker:80".to_string();
        assert!(src.endpoint().is_err());
    }
}
