use axum::{
    body::Bytes,
    http::{header, HeaderMap, HeaderValue, Method},
};
use reqwest::{Client, Response};
use shared::error::{ApiException, ErrorCode};
use tracing::debug;

/// Request headers copied to the backend. Everything else stays at the proxy.
const FORWARDED_REQUEST_HEADERS: [header::HeaderName; 3] =
    [header::CONTENT_TYPE, header::COOKIE, header::ACCEPT];

/// The fixed ML backend every `/api` route is relayed to.
#[derive(Clone)]
pub struct Upstream {
    base_url: String,
    http: Client,
}

impl Upstream {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: Client::new(),
        }
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Sends `body` verbatim. A non-2xx answer is an error carrying the upstream body text.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, ApiException> {
        let url = self.url_for(path);
        debug!(%method, %url, bytes = body.len(), "proxy: relaying request");

        let mut request = self.http.request(method, &url);
        for name in FORWARDED_REQUEST_HEADERS {
            for value in headers.get_all(&name) {
                request = request.header(&name, value.clone());
            }
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|err| {
            ApiException::new(
                ErrorCode::Upstream,
                format!("upstream request to {url} failed: {err}"),
            )
        })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ApiException::new(
                ErrorCode::Upstream,
                format!("upstream returned {status}: {}", text.trim()),
            ));
        }
        Ok(response)
    }
}

pub fn set_cookie_headers(response: &Response) -> Vec<HeaderValue> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .cloned()
        .collect()
}
