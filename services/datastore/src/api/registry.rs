//! Registry endpoints.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::instrument;
use url::form_urlencoded;

use super::{api_error, json_response, ApiError, AppState, DATA_PATH, ID_SEPARATOR, REGISTRY_PATH};
use crate::error::Error;
use crate::pagination::{parse_paging, PARAM_PAGE, PARAM_PER_PAGE};
use crate::registry::{DataStream, Filter, MAX_PER_PAGE};

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// One page of registry entries
#[derive(Debug, Serialize, Deserialize)]
pub struct RegistryList {
    pub streams: Vec<DataStream>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    /// Data endpoint covering every listed stream
    #[serde(rename = "dataLink", skip_serializing_if = "Option::is_none")]
    pub data_link: Option<String>,
}

impl RegistryList {
    fn new(streams: Vec<DataStream>, page: usize, per_page: usize, total: usize) -> Self {
        let data_link = (!streams.is_empty()).then(|| {
            let names: Vec<String> = streams
                .iter()
                .map(|s| form_urlencoded::byte_serialize(s.name.as_bytes()).collect())
                .collect();
            format!("{DATA_PATH}/{}", names.join(ID_SEPARATOR.to_string().as_str()))
        });
        Self {
            streams: streams.iter().map(DataStream::redacted).collect(),
            page,
            per_page,
            total,
            data_link,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(REGISTRY_PATH, get(index).post(create))
        .route("/registry/", get(index).post(create))
        .route(
            "/registry/:name",
            get(retrieve).put(update).delete(delete_stream),
        )
        // the first segment shares its name with the route above; it carries the filter type
        .route("/registry/:name/:path/:op/*value", get(filter))
}

fn paging(params: &HashMap<String, String>) -> Result<(usize, usize), ApiError> {
    parse_paging(
        params.get(PARAM_PAGE).map(String::as_str),
        params.get(PARAM_PER_PAGE).map(String::as_str),
        MAX_PER_PAGE,
    )
    .map_err(api_error)
}

fn decode_stream(body: &[u8]) -> Result<DataStream, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| api_error(Error::bad_request(format!("Error processing input: {e}"))))
}

/// `/registry/<name>` with the name as a single encoded path segment
fn location(name: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(name.as_bytes()).collect();
    format!("{REGISTRY_PATH}/{encoded}")
}

fn created(name: &str) -> Response {
    let location = location(name);
    match HeaderValue::from_str(&location) {
        Ok(value) => (StatusCode::CREATED, [(header::LOCATION, value)]).into_response(),
        Err(_) => StatusCode::CREATED.into_response(),
    }
}

/// `If-Modified-Since` as a timestamp; malformed values are rejected
fn if_modified_since(headers: &HeaderMap) -> Result<Option<DateTime<Utc>>, ApiError> {
    let Some(raw) = headers.get(header::IF_MODIFIED_SINCE) else {
        return Ok(None);
    };
    raw.to_str()
        .ok()
        .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
        .map(|t| Some(t.with_timezone(&Utc)))
        .ok_or_else(|| {
            api_error(Error::bad_request(format!(
                "invalid {} header",
                header::IF_MODIFIED_SINCE
            )))
        })
}

#[instrument(skip(state, headers))]
async fn index(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let (page, per_page) = paging(&params)?;

    let last_modified = state.registry.last_modified();
    if let Some(since) = if_modified_since(&headers)? {
        // HTTP dates carry whole seconds
        if since.timestamp() >= last_modified.timestamp() {
            return Ok(StatusCode::NOT_MODIFIED.into_response());
        }
    }

    let (streams, total) = state
        .registry
        .get_many(page, per_page)
        .await
        .map_err(api_error)?;
    let list = RegistryList::new(streams, page, per_page, total);

    let mut response = json_response(&state, StatusCode::OK, &list)?;
    if let Ok(value) = HeaderValue::from_str(&last_modified.format(HTTP_DATE_FORMAT).to_string()) {
        response.headers_mut().insert(header::LAST_MODIFIED, value);
    }
    Ok(response)
}

#[instrument(skip(state, body))]
async fn create(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let stream = decode_stream(&body)?;
    let added = state.registry.add(stream).await.map_err(api_error)?;
    Ok(created(&added.name))
}

#[instrument(skip(state))]
async fn retrieve(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let stream = state.registry.get(&name).await.map_err(api_error)?;
    json_response(&state, StatusCode::OK, &stream.redacted())
}

/// Update in place, or create the stream when it does not exist yet
#[instrument(skip(state, body))]
async fn update(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let mut stream = decode_stream(&body)?;
    match state.registry.update(&name, stream.clone()).await {
        Ok(_) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(e) if e.is_not_found() => {
            if stream.name.is_empty() {
                stream.name = name;
            }
            let added = state.registry.add(stream).await.map_err(api_error)?;
            Ok(created(&added.name))
        }
        Err(e) => Err(api_error(e)),
    }
}

#[instrument(skip(state))]
async fn delete_stream(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.delete(&name).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
async fn filter(
    State(state): State<AppState>,
    Path((kind, path, op, value)): Path<(String, String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let filter = Filter::parse(&path, &op, &value).map_err(api_error)?;

    let list = match kind.as_str() {
        "one" => {
            let found = state.registry.filter_one(&filter).await.map_err(api_error)?;
            let total = usize::from(found.is_some());
            RegistryList::new(found.into_iter().collect(), 1, 1, total)
        }
        "many" => {
            let (page, per_page) = paging(&params)?;
            let (streams, total) = state
                .registry
                .filter(&filter, page, per_page)
                .await
                .map_err(api_error)?;
            RegistryList::new(streams, page, per_page, total)
        }
        other => {
            return Err(api_error(Error::bad_request(format!(
                "Invalid filter command {other}: expected: 'many' or 'one'"
            ))))
        }
    };
    json_response(&state, StatusCode::OK, &list)
}

#[cfg(test)]
mod tests {
    use super::location;
    use crate::api::create_router;
    use crate::api::test_support::{body_json, state};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use tower::ServiceExt;

    async fn app() -> Router {
        create_router(state(false).await, None)
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_retrieve() {
        let app = app().await;
        let response = app
            .clone()
            .oneshot(post("/registry", r#"{"name":"room/temp","type":"float","unit":"Cel"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let location = response.headers()[header::LOCATION].to_str().unwrap().to_string();
        assert_eq!(location, "/registry/room%2Ftemp");

        let response = app
            .clone()
            .oneshot(Request::get(location.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json;version=1.0.0"
        );
        let body = body_json(response).await;
        assert_eq!(body["name"], "room/temp");
        assert_eq!(body["unit"], "Cel");

        let response = app
            .oneshot(post("/registry", r#"{"name":"room/temp","type":"float"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_create_rejects_malformed_body() {
        let response = app()
            .await
            .oneshot(post("/registry", "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["message"].as_str().unwrap().starts_with("Error processing input"));
    }

    #[tokio::test]
    async fn test_index_paging_and_conditional_get() {
        let app = app().await;
        for name in ["a", "b", "c"] {
            let body = format!(r#"{{"name":"{name}","type":"float"}}"#);
            app.clone().oneshot(post("/registry", &body)).await.unwrap();
        }

        let response = app
            .clone()
            .oneshot(
                Request::get("/registry?page=2&per_page=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let last_modified = response.headers()[header::LAST_MODIFIED]
            .to_str()
            .unwrap()
            .to_string();
        let body = body_json(response).await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["page"], 2);
        assert_eq!(body["streams"].as_array().unwrap().len(), 1);
        assert_eq!(body["dataLink"], "/data/c");

        let response = app
            .clone()
            .oneshot(
                Request::get("/registry")
                    .header(header::IF_MODIFIED_SINCE, last_modified)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

        let response = app
            .clone()
            .oneshot(
                Request::get("/registry")
                    .header(header::IF_MODIFIED_SINCE, "yesterday")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(Request::get("/registry?per_page=0").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_put_updates_or_creates() {
        let app = app().await;
        let put = |body: &str| {
            Request::put("/registry/dev")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap()
        };

        let response = app
            .clone()
            .oneshot(put(r#"{"type":"string"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[header::LOCATION], "/registry/dev");

        let response = app
            .clone()
            .oneshot(put(r#"{"type":"string","meta":{"room":"lab"}}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(put(r#"{"type":"float"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(Request::delete("/registry/dev").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(Request::get("/registry/dev").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_filter_routes() {
        let app = app().await;
        for (name, room) in [("t1", "lab"), ("t2", "lab"), ("t3", "office")] {
            let body = format!(r#"{{"name":"{name}","type":"float","meta":{{"room":"{room}"}}}}"#);
            app.clone().oneshot(post("/registry", &body)).await.unwrap();
        }

        let response = app
            .clone()
            .oneshot(
                Request::get("/registry/many/meta.room/equals/lab")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total"], 2);

        let response = app
            .clone()
            .oneshot(
                Request::get("/registry/one/name/prefix/t3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["streams"][0]["name"], "t3");

        let response = app
            .oneshot(
                Request::get("/registry/some/name/prefix/t")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(
            body["message"],
            "Invalid filter command some: expected: 'many' or 'one'"
        );
    }

    #[test]
    fn test_location_encodes_name() {
        assert_eq!(location("dev"), "/registry/dev");
        assert_eq!(location("site:a/temp_1.x"), "/registry/site%3Aa%2Ftemp_1.x");
    }
}
