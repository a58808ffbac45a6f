//! Client for the gRPC services.

use futures::{Stream, StreamExt};
use tonic::transport::Channel;
use tracing::debug;

use crate::data::Query;
use crate::error::{Error, Result};
use crate::grpc::proto::{
    data_client::DataClient, registry_client::RegistryClient, DeleteRequest, FilterRequest,
    PageParams, QueryRequest, Record as ProtoRecord, SeriesName, SubmitRequest, SubscribeRequest,
    UpdateRequest,
};
use crate::grpc::{series_from_proto, series_to_proto};
use crate::registry::DataStream;
use crate::senml::Record;

fn to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn query_request(ids: &[String], q: &Query) -> QueryRequest {
    QueryRequest {
        series: ids.to_vec(),
        from: q.from,
        to: q.to,
        sort_asc: q.sort_asc,
        limit: q.limit.map(to_u32).unwrap_or(0),
        page: to_u32(q.page),
        per_page: to_u32(q.per_page),
        denormalize: q
            .denormalize
            .field_names()
            .into_iter()
            .map(str::to_string)
            .collect(),
        count: q.count,
    }
}

fn streams_from(series: Vec<crate::grpc::proto::Series>) -> Result<Vec<DataStream>> {
    series.into_iter().map(series_from_proto).collect()
}

/// Registry and data client over one channel
#[derive(Debug, Clone)]
pub struct GrpcClient {
    registry: RegistryClient<Channel>,
    data: DataClient<Channel>,
}

impl GrpcClient {
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let channel = Channel::from_shared(endpoint.to_string())
            .map_err(|e| Error::bad_request(format!("invalid endpoint {endpoint}: {e}")))?
            .connect()
            .await
            .map_err(|e| Error::internal(format!("error connecting to {endpoint}: {e}")))?;
        debug!(endpoint, "Connected to gRPC server");
        Ok(Self::from_channel(channel))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            registry: RegistryClient::new(channel.clone()),
            data: DataClient::new(channel),
        }
    }

    pub async fn add(&self, stream: &DataStream) -> Result<()> {
        self.registry.clone().add(series_to_proto(stream)?).await?;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<DataStream> {
        let series = self
            .registry
            .clone()
            .get(SeriesName { name: name.into() })
            .await?
            .into_inner();
        series_from_proto(series)
    }

    pub async fn update(&self, name: &str, stream: &DataStream) -> Result<()> {
        self.registry
            .clone()
            .update(UpdateRequest {
                name: name.into(),
                series: Some(series_to_proto(stream)?),
            })
            .await?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.registry
            .clone()
            .delete(SeriesName { name: name.into() })
            .await?;
        Ok(())
    }

    /// One page of the registry and the registry size
    pub async fn get_many(&self, page: usize, per_page: usize) -> Result<(Vec<DataStream>, usize)> {
        let list = self
            .registry
            .clone()
            .get_many(PageParams {
                page: to_u32(page),
                per_page: to_u32(per_page),
            })
            .await?
            .into_inner();
        Ok((streams_from(list.series)?, list.total as usize))
    }

    pub async fn filter_one(&self, path: &str, op: &str, value: &str) -> Result<DataStream> {
        let series = self
            .registry
            .clone()
            .filter_one(FilterRequest {
                path: path.into(),
                op: op.into(),
                value: value.into(),
                ..Default::default()
            })
            .await?
            .into_inner();
        series_from_proto(series)
    }

    pub async fn filter(
        &self,
        path: &str,
        op: &str,
        value: &str,
        page: usize,
        per_page: usize,
    ) -> Result<(Vec<DataStream>, usize)> {
        let list = self
            .registry
            .clone()
            .filter(FilterRequest {
                path: path.into(),
                op: op.into(),
                value: value.into(),
                page: to_u32(page),
                per_page: to_u32(per_page),
            })
            .await?
            .into_inner();
        Ok((streams_from(list.series)?, list.total as usize))
    }

    pub async fn submit(&self, pack: &[Record], ids: &[String]) -> Result<()> {
        self.data
            .clone()
            .submit(SubmitRequest {
                series: ids.to_vec(),
                records: pack.iter().map(ProtoRecord::from).collect(),
            })
            .await?;
        Ok(())
    }

    /// One page of records and, when `q.count` is set, the window total
    pub async fn query(&self, ids: &[String], q: &Query) -> Result<(Vec<Record>, Option<usize>)> {
        let response = self
            .data
            .clone()
            .query(query_request(ids, q))
            .await?
            .into_inner();
        Ok((
            response.records.into_iter().map(Record::from).collect(),
            response.total.map(|t| t as usize),
        ))
    }

    /// Every record of the window from `q.page` on
    pub async fn query_stream(
        &self,
        ids: &[String],
        q: &Query,
    ) -> Result<impl Stream<Item = Result<Record>>> {
        let stream = self
            .data
            .clone()
            .query_stream(query_request(ids, q))
            .await?
            .into_inner();
        Ok(stream.map(|item| item.map(Record::from).map_err(Error::from)))
    }

    pub async fn count(&self, ids: &[String], q: &Query) -> Result<usize> {
        let response = self
            .data
            .clone()
            .count(query_request(ids, q))
            .await?
            .into_inner();
        Ok(response.total as usize)
    }

    pub async fn delete_records(&self, ids: &[String], from: f64, to: f64) -> Result<()> {
        self.data
            .clone()
            .delete(DeleteRequest {
                series: ids.to_vec(),
                from,
                to,
            })
            .await?;
        Ok(())
    }

    /// Live records of `ids` as they are stored
    pub async fn subscribe(&self, ids: &[String]) -> Result<impl Stream<Item = Result<Record>>> {
        let stream = self
            .data
            .clone()
            .subscribe(SubscribeRequest {
                series: ids.to_vec(),
            })
            .await?
            .into_inner();
        Ok(stream.map(|item| item.map(Record::from).map_err(Error::from)))
    }
}
