//! Client for the HTTP API.

use reqwest::{header, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::{form_urlencoded, Url};

use crate::api::data::{data_path, query_string, window_string, DataPage};
use crate::api::registry::RegistryList;
use crate::api::{DATA_PATH, REGISTRY_PATH};
use crate::data::Query;
use crate::error::{Error, ErrorResponse, Result};
use crate::pagination::{PARAM_PAGE, PARAM_PER_PAGE};
use crate::registry::DataStream;
use crate::senml::{self, Record, MEDIA_TYPE_SENML_JSON};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One percent-encoded path segment; paths decode `+` literally
fn encode(segment: &str) -> String {
    form_urlencoded::byte_serialize(segment.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn paging(page: usize, per_page: usize) -> String {
    form_urlencoded::Serializer::new(String::new())
        .append_pair(PARAM_PAGE, &page.to_string())
        .append_pair(PARAM_PER_PAGE, &per_page.to_string())
        .finish()
}

/// Registry and data client for a remote datastore
#[derive(Debug, Clone)]
pub struct HttpClient {
    http: Client,
    /// Base URL without a trailing slash
    base: String,
    token: Option<String>,
}

impl HttpClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::bad_request(format!("invalid server url {base_url}: {e}")))?;
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::internal(format!("error creating http client: {e}")))?;
        Ok(Self {
            http,
            base: base.as_str().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base);
        debug!(%method, %url, "Sending request");
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::internal(format!("request failed: {e}")))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        Err(Error::from_http_status(status, message))
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        self.send(builder)
            .await?
            .json()
            .await
            .map_err(|e| Error::internal(format!("error decoding response: {e}")))
    }

    /// One page of the registry
    pub async fn get_many(&self, page: usize, per_page: usize) -> Result<RegistryList> {
        let path = format!("{REGISTRY_PATH}?{}", paging(page, per_page));
        self.json(self.request(reqwest::Method::GET, &path)).await
    }

    /// Register a stream; returns the `Location` of the new entry
    pub async fn add(&self, stream: &DataStream) -> Result<String> {
        let response = self
            .send(self.request(reqwest::Method::POST, REGISTRY_PATH).json(stream))
            .await?;
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::internal("response carries no location"))
    }

    pub async fn get(&self, name: &str) -> Result<DataStream> {
        let path = format!("{REGISTRY_PATH}/{}", encode(name));
        self.json(self.request(reqwest::Method::GET, &path)).await
    }

    pub async fn update(&self, name: &str, stream: &DataStream) -> Result<()> {
        let path = format!("{REGISTRY_PATH}/{}", encode(name));
        self.send(self.request(reqwest::Method::PUT, &path).json(stream))
            .await?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = format!("{REGISTRY_PATH}/{}", encode(name));
        self.send(self.request(reqwest::Method::DELETE, &path))
            .await?;
        Ok(())
    }

    /// First stream whose `path` matches; `None` when nothing does
    pub async fn filter_one(&self, path: &str, op: &str, value: &str) -> Result<Option<DataStream>> {
        let url = format!(
            "{REGISTRY_PATH}/one/{}/{}/{}",
            encode(path),
            encode(op),
            encode(value)
        );
        let list: RegistryList = self.json(self.request(reqwest::Method::GET, &url)).await?;
        Ok(list.streams.into_iter().next())
    }

    pub async fn filter(
        &self,
        path: &str,
        op: &str,
        value: &str,
        page: usize,
        per_page: usize,
    ) -> Result<RegistryList> {
        let url = format!(
            "{REGISTRY_PATH}/many/{}/{}/{}?{}",
            encode(path),
            encode(op),
            encode(value),
            paging(page, per_page)
        );
        self.json(self.request(reqwest::Method::GET, &url)).await
    }

    /// Submit a SenML pack; with `ids` every record must belong to one of them
    pub async fn submit(&self, pack: &[Record], ids: &[String]) -> Result<()> {
        let path = if ids.is_empty() {
            DATA_PATH.to_string()
        } else {
            data_path(ids)
        };
        let body = senml::encode(pack)?;
        self.send(
            self.request(reqwest::Method::POST, &path)
                .header(header::CONTENT_TYPE, MEDIA_TYPE_SENML_JSON)
                .body(body),
        )
        .await?;
        Ok(())
    }

    pub async fn query(&self, ids: &[String], q: &Query) -> Result<DataPage> {
        let path = format!("{}?{}", data_path(ids), query_string(q));
        self.json(self.request(reqwest::Method::GET, &path)).await
    }

    /// Page behind `page.next_link`, if any
    pub async fn next_page(&self, page: &DataPage) -> Result<Option<DataPage>> {
        match &page.next_link {
            Some(link) => self
                .json(self.request(reqwest::Method::GET, link))
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    /// Drop the records of `ids` in `[from, to)`
    pub async fn delete_records(&self, ids: &[String], from: f64, to: f64) -> Result<()> {
        let path = format!("{}?{}", data_path(ids), window_string(from, to));
        self.send(self.request(reqwest::Method::DELETE, &path))
            .await?;
        Ok(())
    }
}
