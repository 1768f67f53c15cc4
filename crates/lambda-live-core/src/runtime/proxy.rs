//! `/proxy/<absolute-url>`: lets a local worker reach arbitrary URLs with
//! permissive CORS headers.

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_REQUEST_HEADERS, HOST,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use super::server::RuntimeState;

const PREFIX: &str = "/proxy/";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(super) async fn forward(
    State(state): State<RuntimeState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let requested = headers.get(ACCESS_CONTROL_REQUEST_HEADERS).cloned();

    let mut response = if method == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        match target(&uri) {
            Some(url) => send(&state.http, method, url, &headers, body).await,
            None => (
                StatusCode::BAD_REQUEST,
                "Proxy target must be an absolute http(s) URL",
            )
                .into_response(),
        }
    };

    let cors = response.headers_mut();
    cors.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    cors.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, PUT, PATCH, POST, DELETE"),
    );
    if let Some(requested) = requested {
        cors.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested);
    }
    response
}

fn target(uri: &Uri) -> Option<reqwest::Url> {
    let raw = uri.path_and_query()?.as_str().strip_prefix(PREFIX)?;
    let url = reqwest::Url::parse(raw).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

async fn send(
    client: &reqwest::Client,
    method: Method,
    url: reqwest::Url,
    headers: &HeaderMap,
    body: Body,
) -> Response {
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers {
        if name != HOST && !is_hop_by_hop(name) {
            forwarded.append(name.clone(), value.clone());
        }
    }

    debug!(method = %method, url = %url, "Proxying request");
    let has_body = !matches!(method, Method::GET | Method::DELETE | Method::HEAD);
    let mut request = client.request(method, url.clone()).headers(forwarded);
    if has_body {
        request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    let upstream = match request.send().await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(url = %url, error = %e, "Proxy request failed");
            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
        }
    };

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in &upstream_headers {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    response
}
