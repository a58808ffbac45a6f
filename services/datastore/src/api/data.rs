//! Data endpoints: submission, queries and deletion.

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, Path, Query as QueryParams, Request, State},
    http::{header, HeaderMap, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, instrument};
use url::form_urlencoded;

use super::{api_error, json_response, ApiError, AppState, DATA_PATH, ID_SEPARATOR};
use crate::data::{Query, TimeWindow, MAX_PER_PAGE};
use crate::error::{Error, Result};
use crate::pagination::{parse_paging, PARAM_LIMIT, PARAM_PAGE, PARAM_PER_PAGE};
use crate::senml::{self, DenormMask, Pack, MEDIA_TYPE_SENML_JSON};

const PARAM_FROM: &str = "from";
const PARAM_TO: &str = "to";
const PARAM_SORT: &str = "sort";
const PARAM_DENORMALIZE: &str = "denormalize";
const PARAM_COUNT: &str = "count";

const SORT_ASC: &str = "asc";
const SORT_DESC: &str = "desc";

const MEDIA_TYPE_JSON: &str = "application/json";

type Params = Vec<(String, String)>;

/// One page of query results
#[derive(Debug, Serialize, Deserialize)]
pub struct DataPage {
    /// Request that produced this page
    pub url: String,
    pub data: Pack,
    /// Seconds spent querying storage
    pub time: f64,
    pub page: usize,
    pub per_page: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(rename = "nextLink", skip_serializing_if = "Option::is_none")]
    pub next_link: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(DATA_PATH, post(submit))
        .route(
            "/data/:ids",
            post(submit_to).get(query).delete(delete_records),
        )
}

/// Reject bodies in encodings other than gzip before decompression sees them
pub async fn reject_unknown_encoding(request: Request, next: Next) -> Response {
    let encoding = request
        .headers()
        .get(header::CONTENT_ENCODING)
        .map(|v| v.to_str().unwrap_or_default().trim().to_ascii_lowercase());
    match encoding.as_deref() {
        None | Some("") | Some("gzip") | Some("identity") => next.run(request).await,
        Some(other) => api_error(Error::bad_request(format!(
            "unsupported Content-Encoding: {other}"
        )))
        .into_response(),
    }
}

fn split_ids(ids: &str) -> Vec<String> {
    ids.split(ID_SEPARATOR)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect()
}

/// Check the body media type; a missing header is only an error when `required`
fn check_content_type(headers: &HeaderMap, required: bool) -> Result<()> {
    let raw = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let essence = raw
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if essence.is_empty() {
        return if required {
            Err(Error::bad_request("Missing Content-Type"))
        } else {
            Ok(())
        };
    }
    if essence == MEDIA_TYPE_SENML_JSON || essence == MEDIA_TYPE_JSON {
        Ok(())
    } else {
        Err(Error::UnsupportedMediaType(format!(
            "unsupported Content-Type {raw}: expected {MEDIA_TYPE_SENML_JSON} or {MEDIA_TYPE_JSON}"
        )))
    }
}

fn read_body(body: std::result::Result<Bytes, BytesRejection>) -> Result<Bytes> {
    body.map_err(|e| Error::bad_request(format!("error reading request body: {e}")))
}

async fn accept(
    state: &AppState,
    headers: &HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
    ids: Option<&[String]>,
) -> std::result::Result<StatusCode, ApiError> {
    check_content_type(headers, ids.is_none()).map_err(api_error)?;
    let body = read_body(body).map_err(api_error)?;
    let pack = senml::decode(&body).map_err(api_error)?;
    let receipt = state.data.submit(&pack, ids).await.map_err(api_error)?;
    debug!(records = receipt.records, registered = receipt.registered.len(), "Accepted pack");
    Ok(StatusCode::ACCEPTED)
}

/// Submit records addressed by their names
#[instrument(skip(state, headers, body))]
async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> std::result::Result<StatusCode, ApiError> {
    accept(&state, &headers, body, None).await
}

/// Submit records that must belong to the listed streams
#[instrument(skip(state, headers, body))]
async fn submit_to(
    State(state): State<AppState>,
    Path(ids): Path<String>,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> std::result::Result<StatusCode, ApiError> {
    let ids = split_ids(&ids);
    accept(&state, &headers, body, Some(&ids)).await
}

fn param<'a>(params: &'a Params, name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// RFC3339 or seconds since the epoch; empty means unset
fn parse_time(name: &str, raw: Option<&str>) -> Result<Option<f64>> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    if let Ok(secs) = raw.parse::<f64>() {
        return Ok(Some(secs));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| Some(t.timestamp() as f64 + f64::from(t.timestamp_subsec_nanos()) / 1e9))
        .map_err(|e| Error::bad_request(format!("error parsing {name} time {raw}: {e}")))
}

fn format_time(secs: f64) -> String {
    let whole = secs.floor();
    let nanos = (((secs - whole) * 1e9).round() as u32).min(999_999_999);
    DateTime::from_timestamp(whole as i64, nanos)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .unwrap_or_else(|| secs.to_string())
}

fn parse_window(params: &Params) -> Result<(f64, f64)> {
    let from = parse_time(PARAM_FROM, param(params, PARAM_FROM))?.unwrap_or(0.0);
    let to = parse_time(PARAM_TO, param(params, PARAM_TO))?.unwrap_or_else(senml::now_secs);
    Ok((from, to))
}

/// Build a query from request parameters
fn parse_query(params: &Params) -> Result<Query> {
    let (from, to) = parse_window(params)?;

    let sort_asc = match param(params, PARAM_SORT).unwrap_or_default() {
        "" | SORT_DESC => false,
        SORT_ASC => true,
        other => {
            return Err(Error::bad_request(format!(
                "invalid {PARAM_SORT} {other}: expected '{SORT_ASC}' or '{SORT_DESC}'"
            )))
        }
    };

    let limit = match param(params, PARAM_LIMIT).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => Some(raw.parse::<usize>().map_err(|_| {
            Error::bad_request(format!("invalid value for parameter {PARAM_LIMIT}: {raw}"))
        })?),
    };

    let (page, per_page) = parse_paging(
        param(params, PARAM_PAGE),
        param(params, PARAM_PER_PAGE),
        MAX_PER_PAGE,
    )?;

    let denormalize = DenormMask::parse(
        params
            .iter()
            .filter(|(key, _)| key == PARAM_DENORMALIZE)
            .flat_map(|(_, value)| value.split(',')),
    )?;

    // a bare `count` counts as true
    let count = match param(params, PARAM_COUNT).map(str::trim) {
        None | Some("false") | Some("0") => false,
        Some("") | Some("true") | Some("1") => true,
        Some(other) => {
            return Err(Error::bad_request(format!(
                "invalid value for parameter {PARAM_COUNT}: {other}"
            )))
        }
    };

    Ok(Query {
        from,
        to,
        sort_asc,
        limit,
        page,
        per_page,
        denormalize,
        count,
    })
}

/// `/data/<ids>` with every name encoded as one segment
pub(crate) fn data_path(names: &[String]) -> String {
    let ids: Vec<String> = names
        .iter()
        .map(|name| form_urlencoded::byte_serialize(name.as_bytes()).collect())
        .collect();
    format!("{DATA_PATH}/{}", ids.join(ID_SEPARATOR.to_string().as_str()))
}

/// Query string that [`parse_query`] reads back into `q`
pub(crate) fn query_string(q: &Query) -> String {
    let mut form = form_urlencoded::Serializer::new(String::new());
    form.append_pair(PARAM_SORT, if q.sort_asc { SORT_ASC } else { SORT_DESC })
        .append_pair(PARAM_FROM, &format_time(q.from))
        .append_pair(PARAM_TO, &format_time(q.to))
        .append_pair(PARAM_PAGE, &q.page.to_string())
        .append_pair(PARAM_PER_PAGE, &q.per_page.to_string());
    if let Some(limit) = q.limit {
        form.append_pair(PARAM_LIMIT, &limit.to_string());
    }
    let fields = q.denormalize.field_names();
    if !fields.is_empty() {
        form.append_pair(PARAM_DENORMALIZE, &fields.join(","));
    }
    if q.count {
        form.append_pair(PARAM_COUNT, "true");
    }
    form.finish()
}

/// `[from, to)` as query parameters
pub(crate) fn window_string(from: f64, to: f64) -> String {
    form_urlencoded::Serializer::new(String::new())
        .append_pair(PARAM_FROM, &format_time(from))
        .append_pair(PARAM_TO, &format_time(to))
        .finish()
}

/// Link to the page after `q`; the total is not requested again
fn next_link(names: &[String], q: &Query) -> String {
    let next = Query {
        page: q.page.saturating_add(1),
        count: false,
        ..q.clone()
    };
    format!("{}?{}", data_path(names), query_string(&next))
}

#[instrument(skip(state, params))]
async fn query(
    State(state): State<AppState>,
    Path(ids): Path<String>,
    uri: Uri,
    QueryParams(params): QueryParams<Params>,
) -> std::result::Result<Response, ApiError> {
    let q = parse_query(&params).map_err(api_error)?;
    let names = split_ids(&ids);

    let started = Instant::now();
    let (data, total) = state.data.query(&q, &names).await.map_err(api_error)?;
    let elapsed = started.elapsed().as_secs_f64();

    let next_link = (data.len() >= q.per_page).then(|| next_link(&names, &q));
    let page = DataPage {
        url: uri.to_string(),
        data,
        time: elapsed,
        page: q.page,
        per_page: q.per_page,
        total,
        next_link,
    };
    json_response(&state, StatusCode::OK, &page)
}

/// Drop the records of the listed streams in `[from, to)`
#[instrument(skip(state, params))]
async fn delete_records(
    State(state): State<AppState>,
    Path(ids): Path<String>,
    QueryParams(params): QueryParams<Params>,
) -> std::result::Result<StatusCode, ApiError> {
    let (from, to) = parse_window(&params).map_err(api_error)?;
    let window = TimeWindow {
        from,
        to,
        sort_asc: false,
    };
    state
        .data
        .delete(&split_ids(&ids), window)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}
