use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::instrument;

use super::proto::{
    registry_server::Registry, FilterRequest, PageParams, Registrations, Series, SeriesName,
    UpdateRequest, Void,
};
use super::{series_from_proto, series_to_proto};
use crate::error::{Error, Result};
use crate::pagination::{DEFAULT_PAGE, DEFAULT_PER_PAGE};
use crate::registry::{DataStream, Filter, RegistryController};

pub struct RegistryService {
    controller: Arc<RegistryController>,
}

impl RegistryService {
    pub fn new(controller: Arc<RegistryController>) -> Self {
        Self { controller }
    }
}

/// Zero means "use the default"
fn paging(page: u32, per_page: u32) -> (usize, usize) {
    let or_default = |v: u32, default: usize| if v == 0 { default } else { v as usize };
    (or_default(page, DEFAULT_PAGE), or_default(per_page, DEFAULT_PER_PAGE))
}

fn registrations(
    streams: &[DataStream],
    page: usize,
    per_page: usize,
    total: usize,
) -> Result<Registrations> {
    Ok(Registrations {
        series: streams.iter().map(series_to_proto).collect::<Result<_>>()?,
        page: page as u32,
        per_page: per_page as u32,
        total: total as u32,
    })
}

#[tonic::async_trait]
impl Registry for RegistryService {
    #[instrument(skip(self, request))]
    async fn add(&self, request: Request<Series>) -> std::result::Result<Response<Void>, Status> {
        let stream = series_from_proto(request.into_inner())?;
        self.controller.add(stream).await?;
        Ok(Response::new(Void {}))
    }

    async fn get(&self, request: Request<SeriesName>) -> std::result::Result<Response<Series>, Status> {
        let stream = self.controller.get(&request.into_inner().name).await?;
        Ok(Response::new(series_to_proto(&stream)?))
    }

    #[instrument(skip(self, request))]
    async fn update(&self, request: Request<UpdateRequest>) -> std::result::Result<Response<Void>, Status> {
        let req = request.into_inner();
        let series = req
            .series
            .ok_or_else(|| Error::bad_request("missing series definition"))?;
        self.controller
            .update(&req.name, series_from_proto(series)?)
            .await?;
        Ok(Response::new(Void {}))
    }

    #[instrument(skip(self, request))]
    async fn delete(&self, request: Request<SeriesName>) -> std::result::Result<Response<Void>, Status> {
        self.controller.delete(&request.into_inner().name).await?;
        Ok(Response::new(Void {}))
    }

    async fn get_many(
        &self,
        request: Request<PageParams>,
    ) -> std::result::Result<Response<Registrations>, Status> {
        let req = request.into_inner();
        let (page, per_page) = paging(req.page, req.per_page);
        let (streams, total) = self.controller.get_many(page, per_page).await?;
        Ok(Response::new(registrations(&streams, page, per_page, total)?))
    }

    async fn filter_one(
        &self,
        request: Request<FilterRequest>,
    ) -> std::result::Result<Response<Series>, Status> {
        let req = request.into_inner();
        let filter = Filter::parse(&req.path, &req.op, &req.value)?;
        let stream = self
            .controller
            .filter_one(&filter)
            .await?
            .ok_or_else(|| Error::not_found("no time series matches the filter"))?;
        Ok(Response::new(series_to_proto(&stream)?))
    }

    async fn filter(
        &self,
        request: Request<FilterRequest>,
    ) -> std::result::Result<Response<Registrations>, Status> {
        let req = request.into_inner();
        let filter = Filter::parse(&req.path, &req.op, &req.value)?;
        let (page, per_page) = paging(req.page, req.per_page);
        let (streams, total) = self.controller.filter(&filter, page, per_page).await?;
        Ok(Response::new(registrations(&streams, page, per_page, total)?))
    }
}
