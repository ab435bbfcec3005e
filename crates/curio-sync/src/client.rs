//! REST client for the admin API.

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::key::QueryKey;
use crate::query::QueryFetcher;

/// Relative API path with query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiPath {
    pub segments: Vec<String>,
    pub query: Vec<(String, String)>,
}

impl ApiPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
            query: Vec::new(),
        }
    }

    /// Map a query key onto a path.
    ///
    /// Scalar segments become path segments; object segments become query
    /// parameters sorted by name. `null` values are skipped.
    pub fn from_key(key: &QueryKey) -> Self {
        let mut path = Self::default();
        for segment in key.segments() {
            match segment {
                Value::Null => {}
                Value::Object(fields) => {
                    for (name, value) in fields {
                        if !value.is_null() {
                            path.query.push((name.clone(), segment_text(value)));
                        }
                    }
                }
                scalar => path.segments.push(segment_text(scalar)),
            }
        }
        path.query.sort();
        path
    }
}

/// Text of a JSON value as it appears in a URL.
pub fn segment_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Request/response transport used by domain actions.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(
        &self,
        method: Method,
        path: &ApiPath,
        body: Option<Value>,
    ) -> Result<Value, ApiError>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

/// reqwest-backed API client.
pub struct ApiClient {
    http: Client,
    base_url: Url,
    prefix: Vec<String>,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let base_url = Url::parse(config.base_url.trim())
            .map_err(|e| ApiError::network(format!("invalid base url {}: {}", config.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::network(format!(
                "base url cannot carry a path: {}",
                config.base_url
            )));
        }
        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(ApiError::from)?;
        Ok(Self {
            http,
            base_url,
            prefix: config
                .prefix
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            token: config.token.clone(),
        })
    }

    /// Client for `base_url` with default settings.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ApiError> {
        Self::new(&ApiConfig {
            base_url: base_url.into(),
            ..ApiConfig::default()
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Absolute URL for `path`.
    pub fn url_for(&self, path: &ApiPath) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(&self.prefix)
                .extend(&path.segments);
        }
        if !path.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&path.query);
        }
        url
    }

    /// GET `path` as JSON.
    pub async fn get(&self, path: &ApiPath) -> Result<Value, ApiError> {
        self.request(Method::GET, path, None).await
    }

    async fn handle_response(response: reqwest::Response) -> Result<Value, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .ok()
                .and_then(|body| body.message.or(body.error))
                .or_else(|| (!text.trim().is_empty()).then(|| text.trim().to_string()));
            return Err(ApiError::from_status(status.as_u16(), message));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| ApiError::decode(e.to_string()))
    }
}

#[async_trait]
impl Transport for ApiClient {
    async fn request(
        &self,
        method: Method,
        path: &ApiPath,
        body: Option<Value>,
    ) -> Result<Value, ApiError> {
        let url = self.url_for(path);
        debug!(method = %method, url = %url, "api request");

        let mut request = self.http.request(method.clone(), url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = &body {
            request = request.json(body);
        }

        let result = match request.send().await {
            Ok(response) => Self::handle_response(response).await,
            Err(e) => Err(ApiError::from(e)),
        };
        if let Err(e) = &result {
            warn!(method = %method, error = %e, "api request failed");
        }
        result
    }
}

#[async_trait]
impl QueryFetcher for ApiClient {
    async fn fetch(&self, key: &QueryKey) -> Result<Value, ApiError> {
        self.get(&ApiPath::from_key(key)).await
    }
}
