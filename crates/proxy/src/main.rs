use std::{io, net::SocketAddr, sync::Arc};

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, on, MethodFilter, MethodRouter},
    Json, Router,
};
use futures::{
    future::{self, Either},
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use shared::error::{ApiError, ApiException, ErrorCode};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod upstream;

use config::load_settings;
use upstream::{set_cookie_headers, Upstream};

struct AppState {
    upstream: Upstream,
    max_upload_bytes: usize,
}

/// One `/api` route: where it goes upstream and what the client sees when that fails.
#[derive(Debug, Clone, Copy)]
struct ProxyRoute {
    upstream_path: &'static str,
    failure: &'static str,
}

const NPY_UPLOAD: ProxyRoute = ProxyRoute {
    upstream_path: "/input_npy_data_test",
    failure: "an error occurred while uploading the file",
};
const CSV_UPLOAD: ProxyRoute = ProxyRoute {
    upstream_path: "/input_csv_data_test",
    failure: "an error occurred while uploading the CSV file",
};
const VALIDATE: ProxyRoute = ProxyRoute {
    upstream_path: "/validate_parameters",
    failure: "an error occurred while validating parameters",
};
const PROCESS: ProxyRoute = ProxyRoute {
    upstream_path: "/process_and_save",
    failure: "an error occurred while creating the segment file",
};
const DEBUG_SESSION: ProxyRoute = ProxyRoute {
    upstream_path: "/debug_session",
    failure: "an error occurred while checking the session",
};
const TEST_STREAM: ProxyRoute = ProxyRoute {
    upstream_path: "/test",
    failure: "an error occurred during the test",
};
const TRAIN_STREAM: ProxyRoute = ProxyRoute {
    upstream_path: "/train_data",
    failure: "an error occurred during training",
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings()?;
    let state = AppState {
        upstream: Upstream::new(settings.upstream_url.clone()),
        max_upload_bytes: settings.max_upload_bytes,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, upstream = %settings.upstream_url, "proxy listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/input_npy_data_test", json_route(MethodFilter::POST, NPY_UPLOAD))
        .route("/input_csv_data_test", json_route(MethodFilter::POST, CSV_UPLOAD))
        .route("/test_csv/upload", json_route(MethodFilter::POST, CSV_UPLOAD))
        .route("/validate_parameters", json_route(MethodFilter::POST, VALIDATE))
        .route("/test_csv/validate", json_route(MethodFilter::POST, VALIDATE))
        .route("/process_and_save", json_route(MethodFilter::POST, PROCESS))
        .route("/test_csv/process", json_route(MethodFilter::POST, PROCESS))
        .route("/debug_session", json_route(MethodFilter::GET, DEBUG_SESSION))
        .route("/test", stream_route(TEST_STREAM))
        .route("/train_data", stream_route(TRAIN_STREAM));

    let max_upload_bytes = state.max_upload_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn json_route(filter: MethodFilter, route: ProxyRoute) -> MethodRouter<Arc<AppState>> {
    on(
        filter,
        move |State(state): State<Arc<AppState>>,
              method: Method,
              headers: HeaderMap,
              body: Bytes| async move {
            forward_json(&state, method, route, &headers, body).await
        },
    )
}

fn stream_route(route: ProxyRoute) -> MethodRouter<Arc<AppState>> {
    get(
        move |State(state): State<Arc<AppState>>, headers: HeaderMap| async move {
            forward_stream(&state, route, &headers).await
        },
    )
}

async fn forward_json(
    state: &AppState,
    method: Method,
    route: ProxyRoute,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let upstream = match state
        .upstream
        .send(method, route.upstream_path, headers, body)
        .await
    {
        Ok(upstream) => upstream,
        Err(err) => return route_failure(route, &err),
    };
    let cookies = set_cookie_headers(&upstream);

    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(err) => {
            let err = ApiException::new(ErrorCode::Upstream, err.to_string());
            return route_failure(route, &err);
        }
    };
    if let Err(err) = serde_json::from_slice::<serde::de::IgnoredAny>(&body) {
        let err = ApiException::new(
            ErrorCode::Upstream,
            format!("upstream body is not JSON: {err}"),
        );
        return route_failure(route, &err);
    }

    let mut response = (StatusCode::OK, body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    append_cookies(&mut response, cookies);
    response
}

async fn forward_stream(state: &AppState, route: ProxyRoute, headers: &HeaderMap) -> Response {
    let (frames, cookies) = match state
        .upstream
        .send(Method::GET, route.upstream_path, headers, Bytes::new())
        .await
    {
        Ok(upstream) => {
            let cookies = set_cookie_headers(&upstream);
            (relay_frames(upstream.bytes_stream(), route.failure), cookies)
        }
        Err(err) => {
            warn!(path = route.upstream_path, error = %err, "proxy: stream could not be opened");
            (failure_frames(route.failure), Vec::new())
        }
    };

    let mut response = Response::new(Body::from_stream(frames));
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response_headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    append_cookies(&mut response, cookies);
    response
}

/// Passes chunks through untouched. A read error ends the stream with [`failure_frames`].
fn relay_frames(
    chunks: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    failure: &'static str,
) -> BoxStream<'static, io::Result<Bytes>> {
    chunks
        .scan(false, move |failed, chunk| {
            if *failed {
                return future::ready(None);
            }
            let frames = match chunk {
                Ok(bytes) => Either::Left(stream::once(future::ready(Ok::<_, io::Error>(bytes)))),
                Err(err) => {
                    warn!(error = %err, "proxy: upstream stream broke");
                    *failed = true;
                    Either::Right(failure_frames(failure))
                }
            };
            future::ready(Some(frames))
        })
        .flatten()
        .boxed()
}

/// One `data:` frame carrying `message`, then a body error so the client sees a broken
/// stream rather than a clean end of data.
fn failure_frames(message: &'static str) -> BoxStream<'static, io::Result<Bytes>> {
    let frame = Bytes::from(format!("data: {message}\n\n"));
    stream::once(future::ready(Ok(frame)))
        .chain(stream::once(async move {
            // lets the frame reach the socket before the connection is cut
            tokio::task::yield_now().await;
            Err(io::Error::other(message))
        }))
        .boxed()
}

fn route_failure(route: ProxyRoute, err: &ApiException) -> Response {
    warn!(path = route.upstream_path, error = %err, "proxy: upstream call failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::new(ErrorCode::Upstream, route.failure)),
    )
        .into_response()
}

fn append_cookies(response: &mut Response, cookies: Vec<HeaderValue>) {
    for cookie in cookies {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
