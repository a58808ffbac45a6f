//! gRPC surface mirroring the HTTP registry and data APIs.

pub mod data;
pub mod registry;

use anyhow::Context;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::info;

use crate::config::PkiConfig;
use crate::data::DataController;
use crate::error::{Error, Result};
use crate::registry::{DataStream, RegistryController, Retention, ValueType};
use crate::senml::Record;

pub use data::DataService;
pub use registry::RegistryService;

/// Generated protobuf types and service stubs
pub mod proto {
    tonic::include_proto!("hds.v1");
}

use proto::{data_server::DataServer, registry_server::RegistryServer};

impl From<ValueType> for proto::ValueType {
    fn from(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Float => proto::ValueType::Float,
            ValueType::String => proto::ValueType::String,
            ValueType::Bool => proto::ValueType::Bool,
            ValueType::Data => proto::ValueType::Data,
        }
    }
}

impl From<proto::ValueType> for ValueType {
    fn from(value_type: proto::ValueType) -> Self {
        match value_type {
            proto::ValueType::Float => ValueType::Float,
            proto::ValueType::String => ValueType::String,
            proto::ValueType::Bool => ValueType::Bool,
            proto::ValueType::Data => ValueType::Data,
        }
    }
}

impl From<&Record> for proto::Record {
    fn from(r: &Record) -> Self {
        Self {
            bn: r.base_name.clone(),
            bt: r.base_time,
            bu: r.base_unit.clone(),
            bv: r.base_value,
            bs: r.base_sum,
            n: r.name.clone(),
            u: r.unit.clone(),
            t: r.time,
            ut: r.update_time,
            v: r.value,
            vs: r.string_value.clone(),
            vb: r.bool_value,
            vd: r.data_value.clone(),
            s: r.sum,
        }
    }
}

impl From<proto::Record> for Record {
    fn from(r: proto::Record) -> Self {
        Self {
            base_name: r.bn,
            base_time: r.bt,
            base_unit: r.bu,
            base_value: r.bv,
            base_sum: r.bs,
            name: r.n,
            unit: r.u,
            time: r.t,
            update_time: r.ut,
            value: r.v,
            string_value: r.vs,
            bool_value: r.vb,
            data_value: r.vd,
            sum: r.s,
        }
    }
}

/// Encode a stream for clients; credentials are masked
pub fn series_to_proto(stream: &DataStream) -> Result<proto::Series> {
    let stream = stream.redacted();
    let meta: HashMap<String, String> = stream
        .meta
        .iter()
        .map(|(k, v)| -> Result<(String, String)> { Ok((k.clone(), serde_json::to_string(v)?)) })
        .collect::<Result<_>>()?;
    let source = match &stream.source {
        Some(source) => serde_json::to_string(source)?,
        None => String::new(),
    };
    let retention = (!stream.retention.is_empty()).then(|| proto::Retention {
        min: stream.retention.min.clone().unwrap_or_default(),
        max: stream.retention.max.clone().unwrap_or_default(),
    });

    Ok(proto::Series {
        name: stream.name,
        r#type: proto::ValueType::from(stream.value_type) as i32,
        unit: stream.unit,
        meta,
        retention,
        source,
    })
}

pub fn series_from_proto(series: proto::Series) -> Result<DataStream> {
    let value_type = proto::ValueType::try_from(series.r#type)
        .map_err(|_| Error::bad_request(format!("unknown value type {}", series.r#type)))?;

    let mut meta = Map::new();
    for (key, raw) in series.meta {
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| Error::bad_request(format!("invalid meta value for {key}: {e}")))?;
        meta.insert(key, value);
    }

    let source = if series.source.is_empty() {
        None
    } else {
        Some(
            serde_json::from_str(&series.source)
                .map_err(|e| Error::bad_request(format!("invalid source: {e}")))?,
        )
    };

    let non_empty = |s: String| (!s.is_empty()).then_some(s);
    let retention = series
        .retention
        .map(|r| Retention {
            min: non_empty(r.min),
            max: non_empty(r.max),
        })
        .unwrap_or_default();

    let mut stream = DataStream::new(series.name, value_type.into()).with_unit(series.unit);
    stream.meta = meta;
    stream.source = source;
    stream.retention = retention;
    Ok(stream)
}

fn load_tls(pki: &PkiConfig) -> anyhow::Result<ServerTlsConfig> {
    let cert = std::fs::read(&pki.server_cert)
        .with_context(|| format!("Failed to read server certificate {}", pki.server_cert))?;
    let key = std::fs::read(&pki.server_key)
        .with_context(|| format!("Failed to read server key {}", pki.server_key))?;
    let mut tls = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));
    if !pki.ca_cert.is_empty() {
        let ca = std::fs::read(&pki.ca_cert)
            .with_context(|| format!("Failed to read CA certificate {}", pki.ca_cert))?;
        tls = tls.client_ca_root(Certificate::from_pem(ca));
    }
    Ok(tls)
}

/// Serve both services until `shutdown` resolves; TLS is used when PKI is configured
pub async fn serve(
    addr: SocketAddr,
    registry: Arc<RegistryController>,
    data: Arc<DataController>,
    pki: &PkiConfig,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let mut builder = Server::builder();
    if !pki.is_empty() {
        builder = builder
            .tls_config(load_tls(pki)?)
            .context("Failed to configure gRPC TLS")?;
    }
    info!(%addr, tls = !pki.is_empty(), "gRPC server listening");

    builder
        .add_service(RegistryServer::new(RegistryService::new(registry)))
        .add_service(DataServer::new(DataService::new(data)))
        .serve_with_shutdown(addr, shutdown)
        .await
        .context("gRPC server error")
}
