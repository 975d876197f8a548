//! Forwarding proxy: `/builds/{id}/fwd/...` relays HTTP to the container
//! started from that build, rewriting URLs so the app works under the prefix.

use std::sync::LazyLock;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::header::{
    ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, LOCATION, ORIGIN, REFERER,
    SET_COOKIE,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{any, get};
use axum::Router;
use regex::{Captures, Regex};
use serde::Deserialize;

use crate::error::ServiceError;
use crate::models::build::{Build, ContainerStatus};
use crate::routes::AppState;
use crate::services::build_service;

/// Cookies the NoHands UI sets for itself; never forwarded to containers.
pub const COOKIE_PREFIX: &str = "nohands_";

const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

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

const CONTAINER_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "0.0.0.0"];

static URL_ATTR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(href|src|action)(\s*=\s*)(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Build not found")]
    BuildNotFound,
    #[error("Container is not running for this build")]
    NotRunning,
    #[error("Failed to reach container: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BuildNotFound => StatusCode::NOT_FOUND,
            ProxyError::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Service(e) => e.status(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        if let ProxyError::Service(e) = self {
            return e.into_response();
        }
        (self.status(), self.to_string()).into_response()
    }
}

/// Where a build's container listens on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub build_id: i64,
    pub host_port: u16,
}

impl ProxyTarget {
    pub fn for_build(build: &Build) -> Result<Self, ProxyError> {
        match (build.container_status, build.host_port) {
            (ContainerStatus::Running, Some(port)) => Ok(ProxyTarget {
                build_id: build.id,
                host_port: u16::try_from(port).map_err(|_| ProxyError::NotRunning)?,
            }),
            _ => Err(ProxyError::NotRunning),
        }
    }

    /// `/builds/{id}/fwd`, without the trailing slash.
    pub fn prefix(&self) -> String {
        format!("/builds/{}/fwd", self.build_id)
    }

    pub fn authority(&self) -> String {
        format!("127.0.0.1:{}", self.host_port)
    }

    pub fn origin(&self) -> String {
        format!("http://{}", self.authority())
    }

    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> String {
        match query {
            Some(query) if !query.is_empty() => format!("{}/{path}?{query}", self.origin()),
            _ => format!("{}/{path}", self.origin()),
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Drop NoHands' own cookies from a `Cookie` header value.
pub fn filter_cookies(header: &str) -> Option<String> {
    let kept: Vec<&str> = header
        .split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let name = pair.split('=').next().unwrap_or_default().trim();
            !name.starts_with(COOKIE_PREFIX)
        })
        .collect();
    (!kept.is_empty()).then(|| kept.join("; "))
}

/// Request headers as the container should see them.
pub fn upstream_headers(incoming: &HeaderMap, target: &ProxyTarget, path: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming {
        let replaced = [HOST, CONTENT_LENGTH, COOKIE, ORIGIN, REFERER, ACCEPT_ENCODING];
        if is_hop_by_hop(name) || replaced.contains(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let cookies: Vec<&str> = incoming
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if let Some(cookie) = filter_cookies(&cookies.join("; ")) {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            headers.insert(COOKIE, value);
        }
    }

    let origin = target.origin();
    let pairs = [
        (HOST, target.authority()),
        (ORIGIN, origin.clone()),
        (REFERER, format!("{origin}/{path}")),
        (HeaderName::from_static(X_FORWARDED_PREFIX), target.prefix()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
    headers
}

/// Remainder of `url` after a container origin (`http://localhost:PORT`, ...).
fn strip_container_origin(url: &str, port: u16) -> Option<&str> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))?;
    CONTAINER_HOSTS.iter().find_map(|host| {
        let tail = rest.strip_prefix(&format!("{host}:{port}"))?;
        (tail.is_empty() || tail.starts_with(['/', '?', '#'])).then_some(tail)
    })
}

/// Move a container URL under the proxy prefix. Absolute container URLs and
/// root-relative paths are rewritten; everything else is left alone.
pub fn rewrite_url(url: &str, target: &ProxyTarget) -> String {
    let prefix = target.prefix();
    let path = match strip_container_origin(url, target.host_port) {
        Some(tail) if tail.starts_with('/') => tail.to_string(),
        Some(tail) => format!("/{tail}"),
        None => url.to_string(),
    };
    let already_prefixed = path == prefix || path.starts_with(&format!("{prefix}/"));
    if path.starts_with('/') && !path.starts_with("//") && !already_prefixed {
        format!("{prefix}{path}")
    } else {
        path
    }
}

/// Scope a `Set-Cookie` to the proxy prefix and drop its `Domain`.
pub fn rewrite_set_cookie(value: &str, target: &ProxyTarget) -> String {
    let prefix = target.prefix();
    let mut parts = Vec::new();
    let mut has_path = false;
    for (i, part) in value.split(';').map(str::trim).enumerate() {
        if i == 0 {
            parts.push(part.to_string());
            continue;
        }
        let lower = part.to_ascii_lowercase();
        if lower.starts_with("domain=") || part.is_empty() {
            continue;
        }
        if lower.starts_with("path=") {
            has_path = true;
            let path = &part["path=".len()..];
            if path.starts_with('/') {
                parts.push(format!("Path={prefix}{path}"));
            } else {
                parts.push(format!("Path={prefix}/"));
            }
            continue;
        }
        parts.push(part.to_string());
    }
    if !has_path {
        parts.push(format!("Path={prefix}/"));
    }
    parts.join("; ")
}

/// Rewrite `href`/`src`/`action` attributes and bare container URLs in HTML.
pub fn rewrite_html(body: &str, target: &ProxyTarget) -> String {
    let rewritten = URL_ATTR_REGEX.replace_all(body, |caps: &Captures<'_>| {
        let (url, quote) = match (caps.get(3), caps.get(4)) {
            (Some(url), _) => (url.as_str(), '"'),
            (None, Some(url)) => (url.as_str(), '\''),
            (None, None) => ("", '"'),
        };
        format!(
            "{}{}{quote}{}{quote}",
            &caps[1],
            &caps[2],
            rewrite_url(url, target)
        )
    });

    let prefix = format!("{}/", target.prefix());
    let mut html = rewritten.into_owned();
    for scheme in ["http", "https"] {
        for host in CONTAINER_HOSTS {
            html = html.replace(&format!("{scheme}://{host}:{}/", target.host_port), &prefix);
        }
    }
    html
}

fn rewrite_header(value: &HeaderValue, rewrite: impl Fn(&str) -> String) -> HeaderValue {
    value
        .to_str()
        .ok()
        .and_then(|v| HeaderValue::from_str(&rewrite(v)).ok())
        .unwrap_or_else(|| value.clone())
}

/// Relay one request to the container and rewrite the response.
pub async fn forward(
    client: &reqwest::Client,
    target: &ProxyTarget,
    method: Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let upstream = client
        .request(method, target.upstream_url(path, query))
        .headers(upstream_headers(headers, target, path))
        .body(body)
        .send()
        .await?;

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name) || name == CONTENT_LENGTH {
            continue;
        }
        let value = if name == LOCATION {
            rewrite_header(value, |v| rewrite_url(v, target))
        } else if name == SET_COOKIE {
            rewrite_header(value, |v| rewrite_set_cookie(v, target))
        } else {
            value.clone()
        };
        response_headers.append(name.clone(), value);
    }

    let bytes = upstream.bytes().await?;
    let body = response_body(&response_headers, bytes, target);

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// Rewrite plain UTF-8 HTML. Encoded or non-UTF-8 bodies are passed on
/// byte for byte.
fn response_body(headers: &HeaderMap, bytes: Bytes, target: &ProxyTarget) -> Body {
    let is_html = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/html"));
    if !is_html || headers.contains_key(CONTENT_ENCODING) {
        return Body::from(bytes);
    }
    match std::str::from_utf8(&bytes) {
        Ok(html) => Body::from(rewrite_html(html, target)),
        Err(_) => Body::from(bytes),
    }
}

/// Raw (still percent-encoded) path after `/builds/{id}/fwd/`.
fn forwarded_path(uri: &Uri, build_id: i64) -> &str {
    let prefix = format!("/builds/{build_id}/fwd/");
    uri.path().strip_prefix(prefix.as_str()).unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct ProxyPath {
    build_id: i64,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/builds/{build_id}/fwd", get(add_trailing_slash))
        .route("/builds/{build_id}/fwd/", any(proxy_handler))
        .route("/builds/{build_id}/fwd/{*path}", any(proxy_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}

async fn add_trailing_slash(Path(params): Path<ProxyPath>) -> Redirect {
    Redirect::permanent(&format!("/builds/{}/fwd/", params.build_id))
}

async fn proxy_handler(
    State(state): State<AppState>,
    Path(params): Path<ProxyPath>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let build_id = params.build_id;
    let result = async {
        let mut conn = state.pool.get().await.map_err(ServiceError::from)?;
        let build = match build_service::get_build_record(&mut conn, build_id).await {
            Ok(build) => build,
            Err(ServiceError::NotFound(_)) => return Err(ProxyError::BuildNotFound),
            Err(e) => return Err(e.into()),
        };
        drop(conn);

        let target = ProxyTarget::for_build(&build)?;
        let path = forwarded_path(&uri, build_id);
        forward(&state.http, &target, method, path, uri.query(), &headers, body).await
    }
    .await;

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            if let ProxyError::Upstream(ref err) = e {
                tracing::warn!(build_id, "Proxy upstream error: {err}");
            }
            e.into_response()
        }
    };
    crate::metrics::proxy_request(response.status().as_u16());
    response
}
