use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use super::proto::{
    data_server::Data, CountResponse, DeleteRequest, QueryRequest, QueryResponse,
    Record as ProtoRecord, SubmitRequest, SubscribeRequest, Void,
};
use crate::data::{DataController, Query, TimeWindow, MAX_PER_PAGE};
use crate::error::Result;
use crate::pagination::{validate_paging, DEFAULT_PAGE, DEFAULT_PER_PAGE};
use crate::senml::{self, DenormMask, Record};

/// Records buffered ahead of a slow `QueryStream` reader
const STREAM_BUFFER: usize = 256;

pub struct DataService {
    controller: Arc<DataController>,
}

impl DataService {
    pub fn new(controller: Arc<DataController>) -> Self {
        Self { controller }
    }
}

fn or_default(value: u32, default: usize) -> usize {
    if value == 0 {
        default
    } else {
        value as usize
    }
}

/// `to = 0` means now
fn end_time(to: f64) -> f64 {
    if to == 0.0 {
        senml::now_secs()
    } else {
        to
    }
}

fn build_query(req: &QueryRequest) -> Result<Query> {
    let page = or_default(req.page, DEFAULT_PAGE);
    let per_page = or_default(req.per_page, DEFAULT_PER_PAGE);
    validate_paging(page, per_page, MAX_PER_PAGE)?;

    Ok(Query {
        from: req.from,
        to: end_time(req.to),
        sort_asc: req.sort_asc,
        limit: (req.limit > 0).then_some(req.limit as usize),
        page,
        per_page,
        denormalize: DenormMask::parse(req.denormalize.iter().map(String::as_str))?,
        count: req.count,
    })
}

type RecordStream = Pin<Box<dyn Stream<Item = std::result::Result<ProtoRecord, Status>> + Send>>;

#[tonic::async_trait]
impl Data for DataService {
    #[instrument(skip(self, request))]
    async fn submit(&self, request: Request<SubmitRequest>) -> std::result::Result<Response<Void>, Status> {
        let req = request.into_inner();
        let pack: Vec<Record> = req.records.into_iter().map(Record::from).collect();
        let ids = (!req.series.is_empty()).then_some(req.series);
        let receipt = self.controller.submit(&pack, ids.as_deref()).await?;
        debug!(records = receipt.records, "Accepted pack");
        Ok(Response::new(Void {}))
    }

    async fn query(
        &self,
        request: Request<QueryRequest>,
    ) -> std::result::Result<Response<QueryResponse>, Status> {
        let req = request.into_inner();
        let q = build_query(&req)?;
        let (records, total) = self.controller.query(&q, &req.series).await?;
        Ok(Response::new(QueryResponse {
            records: records.iter().map(ProtoRecord::from).collect(),
            total: total.map(|t| t as u64),
        }))
    }

    type QueryStreamStream = RecordStream;

    async fn query_stream(
        &self,
        request: Request<QueryRequest>,
    ) -> std::result::Result<Response<Self::QueryStreamStream>, Status> {
        let req = request.into_inner();
        let mut q = build_query(&req)?;
        q.count = false;
        // records travel one by one, so none may lean on the base fields of another
        q.denormalize = DenormMask::ALL;
        // errors of the first page are reported as the call status
        let (first, _) = self.controller.query(&q, &req.series).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let controller = self.controller.clone();
        let series = req.series;
        tokio::spawn(async move {
            let mut page = first;
            loop {
                let full = page.len() >= q.per_page;
                for record in &page {
                    if tx.send(Ok(ProtoRecord::from(record))).await.is_err() {
                        debug!("QueryStream reader went away");
                        return;
                    }
                }
                if !full {
                    return;
                }
                q.page += 1;
                match controller.query(&q, &series).await {
                    Ok((next, _)) => page = next,
                    Err(e) => {
                        warn!(error = %e, page = q.page, "QueryStream aborted");
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                }
            }
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as Self::QueryStreamStream))
    }

    async fn count(
        &self,
        request: Request<QueryRequest>,
    ) -> std::result::Result<Response<CountResponse>, Status> {
        let req = request.into_inner();
        let q = build_query(&req)?;
        let total = self.controller.count(&q, &req.series).await?;
        Ok(Response::new(CountResponse {
            total: total as u64,
        }))
    }

    #[instrument(skip(self, request))]
    async fn delete(&self, request: Request<DeleteRequest>) -> std::result::Result<Response<Void>, Status> {
        let req = request.into_inner();
        let window = TimeWindow {
            from: req.from,
            to: end_time(req.to),
            sort_asc: false,
        };
        self.controller.delete(&req.series, window).await?;
        Ok(Response::new(Void {}))
    }

    type SubscribeStream = RecordStream;

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> std::result::Result<Response<Self::SubscribeStream>, Status> {
        let names = request.into_inner().series;
        let records = self.controller.subscribe(&names).await?;
        let stream = records.map(|record| Ok(ProtoRecord::from(&record)));
        Ok(Response::new(Box::pin(stream) as Self::SubscribeStream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::state;
    use tonic::Code;

    fn record(name: &str, t: f64, v: f64) -> ProtoRecord {
        ProtoRecord {
            n: name.into(),
            t,
            v: Some(v),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_submit_query_delete() {
        let service = DataService::new(state(true).await.data);
        service
            .submit(Request::new(SubmitRequest {
                series: vec![],
                records: vec![
                    record("temp", 1_700_000_000.0, 1.0),
                    record("temp", 1_700_000_001.0, 2.0),
                ],
            }))
            .await
            .unwrap();

        let response = service
            .query(Request::new(QueryRequest {
                series: vec!["temp".into()],
                sort_asc: true,
                count: true,
                denormalize: vec!["n".into(), "t".into()],
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.total, Some(2));
        assert_eq!(response.records[0].v, Some(1.0));
        assert_eq!(response.records[1].n, "temp");

        service
            .delete(Request::new(DeleteRequest {
                series: vec!["temp".into()],
                from: 0.0,
                to: 1_700_000_001.0,
            }))
            .await
            .unwrap();
        let response = service
            .query(Request::new(QueryRequest {
                series: vec!["temp".into()],
                count: true,
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.total, Some(1));
    }

    #[tokio::test]
    async fn test_errors_map_to_status_codes() {
        let service = DataService::new(state(false).await.data);
        let status = service
            .submit(Request::new(SubmitRequest {
                series: vec![],
                records: vec![record("unknown", 1_700_000_000.0, 1.0)],
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        let status = service
            .query(Request::new(QueryRequest {
                series: vec!["x".into()],
                per_page: 5000,
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_subscribe_streams_new_records() {
        let service = DataService::new(state(true).await.data);
        service
            .submit(Request::new(SubmitRequest {
                series: vec![],
                records: vec![record("live", 1_700_000_000.0, 1.0)],
            }))
            .await
            .unwrap();

        let mut stream = service
            .subscribe(Request::new(SubscribeRequest {
                series: vec!["live".into()],
            }))
            .await
            .unwrap()
            .into_inner();

        service
            .submit(Request::new(SubmitRequest {
                series: vec!["live".into()],
                records: vec![record("live", 1_700_000_005.0, 7.0)],
            }))
            .await
            .unwrap();

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.n, "live");
        assert_eq!(received.v, Some(7.0));
    }

    #[tokio::test]
    async fn test_query_stream_walks_every_page() {
        let service = DataService::new(state(true).await.data);
        service
            .submit(Request::new(SubmitRequest {
                series: vec![],
                records: (0..5)
                    .map(|i| record("walk", 1_700_000_000.0 + f64::from(i), f64::from(i)))
                    .collect(),
            }))
            .await
            .unwrap();

        let stream = service
            .query_stream(Request::new(QueryRequest {
                series: vec!["walk".into()],
                sort_asc: true,
                per_page: 2,
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        let records: Vec<ProtoRecord> = stream.map(|r| r.unwrap()).collect().await;
        let values: Vec<_> = records.iter().map(|r| r.v.unwrap()).collect();
        assert_eq!(values, [0.0, 1.0, 2.0, 3.0, 4.0]);
        assert!(records.iter().all(|r| r.n == "walk" && r.bn.is_empty()));

        let status = service
            .query_stream(Request::new(QueryRequest {
                series: vec!["missing".into()],
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_count() {
        let service = DataService::new(state(true).await.data);
        service
            .submit(Request::new(SubmitRequest {
                series: vec![],
                records: vec![
                    record("c", 1_700_000_000.0, 1.0),
                    record("c", 1_700_000_001.0, 2.0),
                    record("c", 1_700_000_002.0, 3.0),
                ],
            }))
            .await
            .unwrap();

        let response = service
            .count(Request::new(QueryRequest {
                series: vec!["c".into()],
                from: 1_700_000_001.0,
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.total, 2);
    }
}
