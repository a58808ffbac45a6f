//! HTTP API: registry and data endpoints.

pub mod auth;
pub mod data;
pub mod registry;

use axum::{
    http::{header, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::data::DataController;
use crate::error::{Error, ErrorResponse};
use crate::registry::RegistryController;
use auth::RequestValidator;

pub const REGISTRY_PATH: &str = "/registry";
pub const DATA_PATH: &str = "/data";

/// Separator of stream names in data paths
pub const ID_SEPARATOR: char = ',';

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RegistryController>,
    pub data: Arc<DataController>,
    /// `application/json;version=<api version>`
    pub content_type: HeaderValue,
}

impl AppState {
    pub fn new(
        registry: Arc<RegistryController>,
        data: Arc<DataController>,
        api_version: &str,
    ) -> Self {
        let content_type = HeaderValue::from_str(&format!("application/json;version={api_version}"))
            .unwrap_or_else(|_| HeaderValue::from_static("application/json"));
        Self {
            registry,
            data,
            content_type,
        }
    }
}

/// Error half of every handler result
pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn api_error(err: Error) -> ApiError {
    let status = err.http_status();
    if status.is_server_error() {
        error!(error = %err, "Request failed");
    }
    (status, Json(ErrorResponse::from(&err)))
}

/// JSON body with the versioned content type
pub(crate) fn json_response<T: serde::Serialize>(
    state: &AppState,
    status: StatusCode,
    body: &T,
) -> Result<Response, ApiError> {
    let body = serde_json::to_vec(body).map_err(|e| api_error(e.into()))?;
    Ok((
        status,
        [(header::CONTENT_TYPE, state.content_type.clone())],
        body,
    )
        .into_response())
}

fn panic_response(_: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let err = Error::internal("internal server error");
    api_error(err).into_response()
}

/// Create the API router
pub fn create_router(state: AppState, validator: Option<Arc<dyn RequestValidator>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    let data_routes = data::routes()
        .layer(RequestDecompressionLayer::new())
        .layer(middleware::from_fn(data::reject_unknown_encoding));

    let mut router = Router::new()
        .route("/health", get(health_check))
        .merge(registry::routes())
        .merge(data_routes);

    if let Some(validator) = validator {
        router = router.layer(middleware::from_fn_with_state(validator, auth::validate_request));
    }

    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "OK" }))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health() {
        let app = create_router(state(false).await, None);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "OK");
    }

    #[tokio::test]
    async fn test_cors_headers() {
        let app = create_router(state(false).await, None);
        let response = app
            .oneshot(
                Request::get("/health")
                    .header("Origin", "http://example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
    }
}
