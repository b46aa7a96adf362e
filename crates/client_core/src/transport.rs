//! Request execution against the ML backend (or the proxy in front of it).
//!
//! Every call goes through [`Transport::execute`] or [`Transport::open_stream`]; both
//! collapse non-2xx responses into [`TransportError::RequestFailed`] carrying the body
//! text. Nothing here retries.

use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use reqwest::{header, multipart, Client, Method, Response};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Used when a failing response has an empty body.
pub const FALLBACK_FAILURE_MESSAGE: &str = "server error";

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {message}")]
    RequestFailed { status: Option<u16>, message: String },
    #[error("failed to reach server: {0}")]
    Network(#[source] reqwest::Error),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::RequestFailed { status, .. } => *status,
            TransportError::Network(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    File {
        field: String,
        filename: String,
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: RequestBody,
    pub include_credentials: bool,
    pub event_stream: bool,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: RequestBody::Empty,
            include_credentials: true,
            event_stream: false,
        }
    }

    pub fn post_json<T: Serialize>(
        path: impl Into<String>,
        body: &T,
    ) -> Result<Self, TransportError> {
        let value =
            serde_json::to_value(body).map_err(|err| TransportError::Decode(err.to_string()))?;
        Ok(Self {
            method: Method::POST,
            path: path.into(),
            body: RequestBody::Json(value),
            include_credentials: true,
            event_stream: false,
        })
    }

    pub fn post_file(
        path: impl Into<String>,
        field: impl Into<String>,
        filename: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: RequestBody::File {
                field: field.into(),
                filename: filename.into(),
                bytes,
            },
            include_credentials: true,
            event_stream: false,
        }
    }

    pub fn without_credentials(mut self) -> Self {
        self.include_credentials = false;
        self
    }
}

#[derive(Clone)]
pub struct Transport {
    base_url: String,
    http: Client,
    anonymous: Client,
}

impl Transport {
    /// `base_url` is the prefix every endpoint path is appended to, e.g.
    /// `http://127.0.0.1:3000/api`.
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let parsed = Url::parse(trimmed).map_err(|err| TransportError::InvalidUrl {
            url: base_url.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TransportError::InvalidUrl {
                url: base_url.to_string(),
                reason: "base url must start with http:// or https://".to_string(),
            });
        }
        let http = Client::builder()
            .cookie_store(true)
            .build()
            .map_err(TransportError::Network)?;
        Ok(Self {
            base_url: trimmed.to_string(),
            http,
            anonymous: Client::new(),
        })
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        let raw = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        Url::parse(&raw).map_err(|err| TransportError::InvalidUrl {
            url: raw,
            reason: err.to_string(),
        })
    }

    /// Performs the request and returns the parsed JSON body of a 2xx response.
    pub async fn execute(&self, request: ApiRequest) -> Result<Value, TransportError> {
        let path = request.path.clone();
        let response = self.send(request).await?;
        let body = response.bytes().await.map_err(TransportError::Network)?;
        serde_json::from_slice(&body).map_err(|err| {
            warn!(%path, error = %err, "transport: response body is not valid JSON");
            TransportError::Decode(err.to_string())
        })
    }

    pub async fn call<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> Result<T, TransportError> {
        let value = self.execute(request).await?;
        serde_json::from_value(value).map_err(|err| TransportError::Decode(err.to_string()))
    }

    /// Opens a long-lived event-stream GET. The returned stream owns the connection;
    /// dropping it releases the connection.
    pub async fn open_stream(
        &self,
        path: &str,
        include_credentials: bool,
    ) -> Result<ByteStream, TransportError> {
        let mut request = ApiRequest::get(path);
        request.include_credentials = include_credentials;
        request.event_stream = true;
        let response = self.send(request).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::Network))
            .boxed())
    }

    async fn send(&self, request: ApiRequest) -> Result<Response, TransportError> {
        let url = self.endpoint(&request.path)?;
        let client = if request.include_credentials {
            &self.http
        } else {
            &self.anonymous
        };
        debug!(method = %request.method, %url, "transport: sending request");

        let mut builder = client.request(request.method, url.clone());
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::File {
                field,
                filename,
                bytes,
            } => {
                let part = multipart::Part::bytes(bytes).file_name(filename);
                builder.multipart(multipart::Form::new().part(field, part))
            }
        };
        if request.event_stream {
            builder = builder
                .header(header::ACCEPT, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache");
        }

        let response = builder.send().await.map_err(|err| {
            warn!(%url, error = %err, "transport: request did not reach the server");
            TransportError::Network(err)
        })?;
        ensure_success(response).await
    }
}

async fn ensure_success(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let body = body.trim();
    let message = if body.is_empty() {
        FALLBACK_FAILURE_MESSAGE.to_string()
    } else {
        body.to_string()
    };
    warn!(status = status.as_u16(), %message, "transport: non-success response");
    Err(TransportError::RequestFailed {
        status: Some(status.as_u16()),
        message,
    })
}
