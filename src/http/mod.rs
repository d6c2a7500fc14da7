//! HTTP frontend
//!
//! URL routing, CORS, response shaping, and the status endpoint. The
//! streaming data plane hangs off the wildcard file route; everything else
//! is a handful of small handlers.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap, HeaderValue};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use crate::ledger::Ledger;
use crate::pool::SessionPool;
use crate::resolver::Resolver;

pub mod handlers;
pub mod path;
pub mod render;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    /// Live upstream sessions.
    pub pool: Arc<SessionPool>,
    /// Routing ledger.
    pub ledger: Arc<Ledger>,
    /// Descriptor cache and single-flight resolver.
    pub resolver: Arc<Resolver>,
    /// Process start, for `/status` uptime.
    pub started_at: Instant,
    /// Redirect target of `GET /`.
    pub doc_url: String,
}

/// Build the gateway router over the given state.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root).options(handlers::preflight))
        .route(
            "/status",
            get(handlers::status).options(handlers::preflight),
        )
        .route(
            "/watch/*path",
            get(handlers::watch).options(handlers::preflight),
        )
        .route("/*path", get(handlers::media).options(handlers::preflight))
        .with_state(state)
}

/// Serve the gateway until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    listener: TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// The fixed CORS preamble carried by media and preflight responses.
pub(crate) fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Range, Content-Type, *"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Content-Length, Content-Range, Content-Disposition"),
    );
}

/// Disable caching on streamed and rendered responses.
pub(crate) fn apply_no_cache(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
}

/// Human-readable uptime for `/status`, e.g. `2d 5h 1m 9s`.
pub(crate) fn readable_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 || !parts.is_empty() {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 || !parts.is_empty() {
        parts.push(format!("{minutes}m"));
    }
    parts.push(format!("{seconds}s"));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readable_uptime() {
        assert_eq!(readable_uptime(Duration::from_secs(0)), "0s");
        assert_eq!(readable_uptime(Duration::from_secs(59)), "59s");
        assert_eq!(readable_uptime(Duration::from_secs(61)), "1m 1s");
        assert_eq!(readable_uptime(Duration::from_secs(3_600)), "1h 0m 0s");
        assert_eq!(
            readable_uptime(Duration::from_secs(90_061)),
            "1d 1h 1m 1s"
        );
    }

    #[test]
    fn test_cors_preamble_is_complete() {
        let mut headers = HeaderMap::new();
        apply_cors(&mut headers);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_METHODS],
            "GET, HEAD, OPTIONS"
        );
        assert_eq!(
            headers[header::ACCESS_CONTROL_EXPOSE_HEADERS],
            "Content-Length, Content-Range, Content-Disposition"
        );
    }
}
